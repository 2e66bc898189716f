//! Lexer for the `<<name>>` placeholder syntax shared by variable
//! `value` templates and command-group command templates. Hand
//! rolled rather than regex-based: the token set is trivial (an
//! identifier bracketed by `<<`/`>>`) and a manual scanner makes the
//! "non-overlapping, first-appearance order" rule in §4.1 explicit
//! rather than relying on regex iteration order.

/// One token of a parsed template: either literal text (passed
/// through to the formatter unchanged, including any `{}`-style
/// positional specifiers it contains) or a reference to another
/// variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Literal(String),
    Reference(String),
}

/// Splits `template` into a sequence of `Token`s. `<<name>>` is a
/// reference only when `name` is a non-empty run of characters other
/// than `<`, `>` and whitespace; anything else (an unmatched `<<`, an
/// empty `<<>>`) is passed through as literal text.
pub fn tokenize(template: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' && i + 1 < bytes.len() && bytes[i + 1] == b'<' {
            if let Some(end) = find_close(template, i + 2) {
                let name = &template[i + 2..end];
                if is_valid_name(name) {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::Reference(name.to_string()));
                    i = end + 2;
                    continue;
                }
            }
        }
        // Not a reference: consume one character (by byte, then
        // catch up to the next UTF-8 boundary) as literal.
        let ch_len = utf8_len(bytes[i]);
        literal.push_str(&template[i..i + ch_len]);
        i += ch_len;
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

fn utf8_len(first_byte: u8) -> usize {
    if first_byte & 0b1000_0000 == 0 {
        1
    } else if first_byte & 0b1110_0000 == 0b1100_0000 {
        2
    } else if first_byte & 0b1111_0000 == 0b1110_0000 {
        3
    } else {
        4
    }
}

fn find_close(template: &str, from: usize) -> Option<usize> {
    template[from..].find(">>").map(|offset| from + offset)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['<', '>']) && !name.contains(char::is_whitespace)
}

/// Collects the set of variable names referenced by `template`, in
/// first-appearance order, without duplicates. This is the order
/// §4.2 requires for building the Cartesian product of a compound
/// variable's direct references.
pub fn references_of(template: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for token in tokenize(template) {
        if let Token::Reference(name) = token {
            if seen.insert(name.clone()) {
                out.push(name);
            }
        }
    }
    out
}

/// Substitutes each reference in `template` with the corresponding
/// entry of `bindings` (by name), leaving literal text untouched.
/// Every name returned by `references_of` must be present in
/// `bindings`, or this panics — callers are expected to have
/// validated references at construction time (see `DeclError`).
pub fn substitute(template: &str, bindings: &std::collections::HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    for token in tokenize(template) {
        match token {
            Token::Literal(s) => out.push_str(&s),
            Token::Reference(name) => {
                let value = bindings
                    .get(&name)
                    .unwrap_or_else(|| panic!("unbound reference <<{name}>> in template"));
                out.push_str(value);
            }
        }
    }
    out
}

/// Counts positional format specifiers (`{}`, `{:s}`, `{:03d}`, …) in
/// the literal portions of `template` — used to validate that a base
/// variable's template has at least one specifier when base values
/// exist (§4.1).
pub fn count_positional_specifiers(template: &str) -> usize {
    let mut count = 0;
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                i += 2;
                continue;
            }
            if let Some(close) = template[i..].find('}') {
                count += 1;
                i += close + 1;
                continue;
            }
        }
        i += 1;
    }
    count
}

/// Applies the first positional format specifier found in `template`
/// to `value`, returning `template` unchanged if none is found.
/// Supports the subset of Python-style specifiers this engine's
/// templates actually use: `{}`/`{:s}` (pass through), `{:d}`/
/// `{:03d}` (integer, optionally zero-padded to a width), and
/// `{:f}`/`{:.2f}` (float, optionally with fixed precision).
pub fn apply_format(template: &str, value: &str) -> String {
    if let Some((start, end)) = find_format_spec(template) {
        let spec = &template[start + 1..end];
        let formatted = format_spec(spec, value);
        let mut out = String::with_capacity(template.len());
        out.push_str(&template[..start]);
        out.push_str(&formatted);
        out.push_str(&template[end + 1..]);
        out
    } else {
        template.to_string()
    }
}

fn find_format_spec(template: &str) -> Option<(usize, usize)> {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                i += 2;
                continue;
            }
            if let Some(rel) = template[i..].find('}') {
                return Some((i, i + rel));
            }
        }
        i += 1;
    }
    None
}

fn format_spec(spec: &str, value: &str) -> String {
    let spec = spec.strip_prefix(':').unwrap_or(spec);
    if spec.is_empty() || spec == "s" {
        return value.to_string();
    }
    if let Some(width_spec) = spec.strip_suffix('d') {
        let Ok(n) = value.parse::<i64>() else {
            return value.to_string();
        };
        if let Some(width_str) = width_spec.strip_prefix('0') {
            if let Ok(width) = width_str.parse::<usize>() {
                return format!("{n:0width$}");
            }
        }
        if let Ok(width) = width_spec.parse::<usize>() {
            if width > 0 {
                return format!("{n:width$}");
            }
        }
        return n.to_string();
    }
    if let Some(prec_spec) = spec.strip_suffix('f') {
        let Ok(f) = value.parse::<f64>() else {
            return value.to_string();
        };
        if let Some(prec_str) = prec_spec.strip_prefix('.') {
            if let Ok(prec) = prec_str.parse::<usize>() {
                return format!("{f:.prec$}");
            }
        }
        return f.to_string();
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_tokenize_plain() {
        assert_eq!(
            tokenize("postProcess <<f>>"),
            vec![
                Token::Literal("postProcess ".to_string()),
                Token::Reference("f".to_string()),
            ]
        );
    }

    #[test]
    fn t_references_of_dedup_order() {
        assert_eq!(
            references_of("<<base>>_<<base>>_<<inc>>"),
            vec!["base".to_string(), "inc".to_string()]
        );
    }

    #[test]
    fn t_references_of_none() {
        assert_eq!(references_of("{:s}"), Vec::<String>::new());
    }

    #[test]
    fn t_substitute_repeated_reference_same_value() {
        let mut bindings = std::collections::HashMap::new();
        bindings.insert("base".to_string(), "x".to_string());
        bindings.insert("inc".to_string(), "020".to_string());
        assert_eq!(
            substitute("out/<<base>>_inc<<inc>>.txt", &bindings),
            "out/x_inc020.txt"
        );
    }

    #[test]
    fn t_unmatched_open_is_literal() {
        assert_eq!(
            tokenize("a << b"),
            vec![Token::Literal("a << b".to_string())]
        );
    }

    #[test]
    fn t_count_positional_specifiers() {
        assert_eq!(count_positional_specifiers("{:s}"), 1);
        assert_eq!(count_positional_specifiers("out/<<base>>_inc{:03d}.txt"), 1);
        assert_eq!(count_positional_specifiers("no specifiers here"), 0);
        assert_eq!(count_positional_specifiers("literal {{escaped}} brace"), 0);
    }

    #[test]
    fn t_apply_format_zero_padded_int() {
        assert_eq!(apply_format("inc{:03d}.txt", "20"), "inc020.txt");
        assert_eq!(apply_format("inc{:03d}.txt", "40"), "inc040.txt");
    }

    #[test]
    fn t_apply_format_string_passthrough() {
        assert_eq!(apply_format("{:s}", "hello"), "hello");
    }
}
