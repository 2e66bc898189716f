//! The variable resolver (§4.2). Phase A walks the variable DAG in
//! reverse-topological order and computes, for each variable, a
//! *row matrix*: one row per element of the Cartesian product of its
//! transitive references (outermost = first-appearance reference,
//! innermost = the variable's own data), each row binding every
//! variable name involved to its row-specific string value. This is
//! exactly the "value matrix" §4.2 describes for Phase B, just
//! computed once and shared between both phases — Phase B differs
//! only in *when* it runs (after an upstream file-regex scan makes
//! previously deferred variables available) and in that it writes
//! the matrix out to per-variable value files rather than keeping it
//! in memory.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

use crate::{
    error::ResolveError,
    template,
    variable::{OwnValues, Variable},
};

pub type Row = HashMap<String, String>;

pub struct Resolver<'a> {
    variables: &'a HashMap<String, Variable>,
    working_dir: &'a Path,
}

impl<'a> Resolver<'a> {
    pub fn new(variables: &'a HashMap<String, Variable>, working_dir: &'a Path) -> Self {
        Self {
            variables,
            working_dir,
        }
    }

    /// Resolves a single variable's row matrix. `Ok(None)` means the
    /// variable (or one of its transitive references) is deferred:
    /// a file-regex scan whose directory does not exist yet.
    pub fn resolve(&self, name: &str) -> Result<Option<Vec<Row>>, ResolveError> {
        let mut memo = HashMap::new();
        let mut stack = HashSet::new();
        self.resolve_rows(name, &mut memo, &mut stack)
    }

    /// Resolves several top-level names (e.g. all variables a
    /// command group's templates reference directly) into one
    /// combined row matrix. Names that share a transitive ancestor
    /// are expected — the shared ancestor's column is simply
    /// recomputed consistently each time since resolution is a pure
    /// function of the DAG, so merging rows is safe as long as the
    /// names given don't both depend on a *file-regex* variable
    /// re-scanned between calls (callers resolve all names from one
    /// `Resolver` instance within a single submit/runtime pass to
    /// avoid that).
    pub fn resolve_many(&self, names: &[String]) -> Result<Option<Vec<Row>>, ResolveError> {
        let mut memo = HashMap::new();
        let mut combo: Vec<Row> = vec![Row::new()];
        let mut any_deferred = false;
        for name in names {
            match self.resolve_rows(name, &mut memo, &mut HashSet::new())? {
                Some(rows) => combo = cartesian_merge(combo, &rows),
                None => any_deferred = true,
            }
        }
        if any_deferred {
            return Ok(None);
        }
        Ok(Some(combo))
    }

    fn resolve_rows(
        &self,
        name: &str,
        memo: &mut HashMap<String, Option<Vec<Row>>>,
        stack: &mut HashSet<String>,
    ) -> Result<Option<Vec<Row>>, ResolveError> {
        if let Some(cached) = memo.get(name) {
            return Ok(cached.clone());
        }
        if !stack.insert(name.to_string()) {
            return Err(ResolveError::CyclicReference(name.to_string()));
        }
        let var = self
            .variables
            .get(name)
            .ok_or_else(|| ResolveError::UndefinedVariable(name.to_string()))?;

        let refs = var.references();
        let mut combo: Vec<Row> = vec![Row::new()];
        let mut deferred = false;
        for r in &refs {
            if !self.variables.contains_key(r) {
                stack.remove(name);
                return Err(ResolveError::UndefinedVariable(r.clone()));
            }
            match self.resolve_rows(r, memo, stack)? {
                Some(ref_rows) => combo = cartesian_merge(combo, &ref_rows),
                None => deferred = true,
            }
        }
        stack.remove(name);

        if deferred {
            memo.insert(name.to_string(), None);
            return Ok(None);
        }

        let own = var.own_values(self.working_dir)?;
        let result = match own {
            OwnValues::Deferred => None,
            OwnValues::None => Some(
                combo
                    .into_iter()
                    .map(|mut row| {
                        let substituted = template::substitute(&var.value, &row);
                        row.insert(name.to_string(), substituted);
                        row
                    })
                    .collect(),
            ),
            OwnValues::Values(values) => {
                if values.is_empty() {
                    memo.insert(name.to_string(), None);
                    return Err(ResolveError::ZeroLengthBase(name.to_string()));
                }
                let mut rows = Vec::with_capacity(combo.len() * values.len());
                for row in &combo {
                    let substituted = template::substitute(&var.value, row);
                    for v in &values {
                        let mut new_row = row.clone();
                        let formatted = template::apply_format(&substituted, v);
                        new_row.insert(name.to_string(), formatted);
                        rows.push(new_row);
                    }
                }
                Some(rows)
            }
        };
        memo.insert(name.to_string(), result.clone());
        Ok(result)
    }
}

/// Cartesian product where `existing` varies slower (outer) and
/// `next` varies faster (inner) — the order §4.2's worked example
/// (S2) requires.
fn cartesian_merge(existing: Vec<Row>, next: &[Row]) -> Vec<Row> {
    let mut out = Vec::with_capacity(existing.len() * next.len());
    for e in &existing {
        for n in next {
            let mut merged = e.clone();
            merged.extend(n.clone());
            out.push(merged);
        }
    }
    out
}

/// The length a variable would resolve to, without materializing
/// the full matrix — `deferred` for a not-yet-scannable file-regex
/// variable or a transitive reference to one.
pub fn length(
    variables: &HashMap<String, Variable>,
    working_dir: &Path,
    name: &str,
) -> Result<Option<usize>, ResolveError> {
    let resolver = Resolver::new(variables, working_dir);
    Ok(resolver.resolve(name)?.map(|rows| rows.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: Vec<(&str, Variable)>) -> HashMap<String, Variable> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn t_s1_single_base_variable() {
        let variables = vars(vec![(
            "f",
            Variable::new("f", "{:s}").with_data(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
                "e".to_string(),
            ]),
        )]);
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(&variables, dir.path());
        let rows = resolver.resolve("f").unwrap().unwrap();
        let values: Vec<_> = rows.iter().map(|r| r["f"].clone()).collect();
        assert_eq!(values, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn t_s2_compound_variable() {
        let variables = vars(vec![
            (
                "base",
                Variable::new("base", "{:s}")
                    .with_data(vec!["x".to_string(), "y".to_string()]),
            ),
            (
                "file",
                Variable::new("file", "out/<<base>>_inc{:03d}.txt")
                    .with_data(vec!["20".to_string(), "40".to_string()]),
            ),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(&variables, dir.path());
        let rows = resolver.resolve("file").unwrap().unwrap();
        let files: Vec<_> = rows.iter().map(|r| r["file"].clone()).collect();
        let bases: Vec<_> = rows.iter().map(|r| r["base"].clone()).collect();
        assert_eq!(
            files,
            vec![
                "out/x_inc020.txt",
                "out/x_inc040.txt",
                "out/y_inc020.txt",
                "out/y_inc040.txt",
            ]
        );
        assert_eq!(bases, vec!["x", "x", "y", "y"]);
    }

    #[test]
    fn t_cyclic_reference_rejected() {
        let variables = vars(vec![
            ("a", Variable::new("a", "<<b>>")),
            ("b", Variable::new("b", "<<a>>")),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(&variables, dir.path());
        let err = resolver.resolve("a").unwrap_err();
        assert!(matches!(err, ResolveError::CyclicReference(_)));
    }

    #[test]
    fn t_undefined_reference_rejected() {
        let variables = vars(vec![("a", Variable::new("a", "<<missing>>"))]);
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(&variables, dir.path());
        let err = resolver.resolve("a").unwrap_err();
        assert!(matches!(err, ResolveError::UndefinedVariable(_)));
    }

    #[test]
    fn t_zero_length_base_is_fatal() {
        let variables = vars(vec![("a", Variable::new("a", "{:s}").with_data(vec![]))]);
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(&variables, dir.path());
        let err = resolver.resolve("a").unwrap_err();
        assert!(matches!(err, ResolveError::ZeroLengthBase(_)));
    }

    #[test]
    fn t_s4_deferred_file_regex() {
        use crate::variable::{FileRegexDef, VariableType};
        let variables = vars(vec![(
            "found",
            Variable::new("found", "{:s}").with_file_regex(FileRegexDef {
                pattern: r"out_(\d+)\.txt".to_string(),
                group: 1,
                type_tag: VariableType::Int,
                subset: None,
            }),
        )]);
        let dir = tempfile::tempdir().unwrap();
        let missing_dir = dir.path().join("not-yet-populated");
        let resolver = Resolver::new(&variables, &missing_dir);
        assert_eq!(resolver.resolve("found").unwrap(), None);
    }
}
