//! The variable model: typed representation, dependency extraction
//! and value-space enumeration (§4.1).
//!
//! A `Variable` is declared with a `value` format template and at
//! most one of `data` (a literal list) or `file_regex` (a scan
//! rule); declaring neither means the variable is sourced purely by
//! substituting other variables' values into its template.

use std::path::Path;

use regex::Regex;
use walkdir::WalkDir;

use crate::{error::ResolveError, template};

/// The cast applied to a file-regex variable's matched capture group
/// before it becomes a candidate base value. A closed enum rather
/// than reflection, matching how typed custom parameters are checked
/// elsewhere in this codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Int,
    Float,
    Bool,
}

impl VariableType {
    fn as_str(self) -> &'static str {
        match self {
            VariableType::String => "string",
            VariableType::Int => "int",
            VariableType::Float => "float",
            VariableType::Bool => "bool",
        }
    }

    fn accepts(self, value: &str) -> bool {
        match self {
            VariableType::String => true,
            VariableType::Int => value.parse::<i64>().is_ok(),
            VariableType::Float => value.parse::<f64>().is_ok(),
            VariableType::Bool => matches!(value, "true" | "false" | "0" | "1"),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRegexDef {
    pub pattern: String,
    pub group: usize,
    #[serde(rename = "type")]
    pub type_tag: VariableType,
    /// If given, only matched values contained in this set are kept.
    #[serde(default)]
    pub subset: Option<Vec<String>>,
}

impl FileRegexDef {
    /// Scans `working_dir` for files matching `pattern`, returning
    /// the sorted, deduplicated capture-group values that pass the
    /// type and subset filters. Returns `Ok(None)` — deferred — when
    /// `working_dir` does not exist yet, per §4.2's rule that a
    /// file-regex variable is deferred until its directory appears.
    fn scan(&self, name: &str, working_dir: &Path) -> Result<Option<Vec<String>>, ResolveError> {
        if !working_dir.is_dir() {
            return Ok(None);
        }
        let re = Regex::new(&self.pattern).map_err(|error| ResolveError::InvalidPattern {
            name: name.to_string(),
            pattern: self.pattern.clone(),
            error,
        })?;
        let mut values = Vec::new();
        for entry in WalkDir::new(working_dir) {
            let entry = entry.map_err(|err| ResolveError::FileRegexScan {
                name: name.to_string(),
                dir: working_dir.to_owned(),
                error: err
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walkdir error")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(caps) = re.captures(&file_name) else {
                continue;
            };
            let Some(m) = caps.get(self.group) else {
                continue;
            };
            let raw = m.as_str();
            if !self.type_tag.accepts(raw) {
                return Err(ResolveError::TypeCast {
                    name: name.to_string(),
                    file: file_name,
                    group: self.group,
                    type_tag: self.type_tag.as_str(),
                    value: raw.to_string(),
                });
            }
            if let Some(subset) = &self.subset {
                if !subset.iter().any(|s| s == raw) {
                    continue;
                }
            }
            values.push(raw.to_string());
        }
        values.sort();
        values.dedup();
        Ok(Some(values))
    }
}

fn default_template() -> String {
    "{:s}".to_string()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Variable {
    #[serde(skip)]
    pub name: String,

    #[serde(default = "default_template")]
    pub value: String,

    #[serde(default)]
    pub data: Option<Vec<String>>,

    #[serde(default)]
    pub file_regex: Option<FileRegexDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Base,
    Compound,
}

/// This variable's own contribution to the value product, distinct
/// from values pulled in via `<<name>>` references to other
/// variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnValues {
    /// Neither `data` nor `file_regex` was declared: this variable
    /// is sourced purely by substituting its references.
    None,
    /// `data`, or a `file_regex` scan that has already completed.
    Values(Vec<String>),
    /// A `file_regex` scan whose working directory does not exist
    /// yet.
    Deferred,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            data: None,
            file_regex: None,
        }
    }

    pub fn with_data(mut self, data: Vec<String>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_file_regex(mut self, def: FileRegexDef) -> Self {
        self.file_regex = Some(def);
        self
    }

    /// Variable names this variable's template refers to, in
    /// first-appearance order, without duplicates.
    pub fn references(&self) -> Vec<String> {
        template::references_of(&self.value)
    }

    pub fn classify(&self) -> Classification {
        if self.references().is_empty() {
            Classification::Base
        } else {
            Classification::Compound
        }
    }

    pub fn own_values(&self, working_dir: &Path) -> Result<OwnValues, ResolveError> {
        match (&self.data, &self.file_regex) {
            (Some(values), None) => Ok(OwnValues::Values(values.clone())),
            (None, Some(def)) => match def.scan(&self.name, working_dir)? {
                Some(values) => Ok(OwnValues::Values(values)),
                None => Ok(OwnValues::Deferred),
            },
            (None, None) => Ok(OwnValues::None),
            (Some(_), Some(_)) => unreachable!(
                "declaration parsing rejects variables declaring both data and file_regex"
            ),
        }
    }

    /// Construction-time validation (§4.1, §7 declaration errors):
    /// at most one of `data`/`file_regex`; the template must carry a
    /// positional specifier precisely when this variable has its own
    /// base values to format (own data, or a non-deferred scan).
    pub fn validate_shape(&self) -> Result<(), ResolveError> {
        if self.data.is_some() && self.file_regex.is_some() {
            return Err(ResolveError::UnknownTemplateReference {
                template: self.value.clone(),
                name: self.name.clone(),
            });
        }
        let specifier_count = template::count_positional_specifiers(&self.value);
        let has_own_data = matches!(self.data.as_ref(), Some(v) if !v.is_empty())
            || self.file_regex.is_some();
        if has_own_data && specifier_count == 0 {
            return Err(ResolveError::UnknownTemplateReference {
                template: self.value.clone(),
                name: self.name.clone(),
            });
        }
        if !has_own_data && self.file_regex.is_none() && specifier_count > 0 {
            return Err(ResolveError::UnknownTemplateReference {
                template: self.value.clone(),
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_classify_base_vs_compound() {
        let base = Variable::new("f", "{:s}").with_data(vec!["a".to_string()]);
        assert_eq!(base.classify(), Classification::Base);

        let compound = Variable::new("file", "out/<<base>>_inc{:03d}.txt").with_data(vec![
            "20".to_string(),
            "40".to_string(),
        ]);
        assert_eq!(compound.classify(), Classification::Compound);
        assert_eq!(compound.references(), vec!["base".to_string()]);
    }

    #[test]
    fn t_file_regex_deferred_when_dir_missing() {
        let v = Variable::new("v", "{:s}").with_file_regex(FileRegexDef {
            pattern: r"out_(\d+)\.txt".to_string(),
            group: 1,
            type_tag: VariableType::Int,
            subset: None,
        });
        let result = v.own_values(Path::new("/nonexistent/dir/for/test")).unwrap();
        assert_eq!(result, OwnValues::Deferred);
    }

    #[test]
    fn t_file_regex_scans_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out_2.txt"), b"").unwrap();
        std::fs::write(dir.path().join("out_10.txt"), b"").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), b"").unwrap();
        let v = Variable::new("v", "{:s}").with_file_regex(FileRegexDef {
            pattern: r"out_(\d+)\.txt".to_string(),
            group: 1,
            type_tag: VariableType::Int,
            subset: None,
        });
        let values = v.own_values(dir.path()).unwrap();
        assert_eq!(
            values,
            OwnValues::Values(vec!["10".to_string(), "2".to_string()])
        );
    }

    #[test]
    fn t_validate_shape_rejects_missing_specifier() {
        let v = Variable::new("f", "no specifier").with_data(vec!["a".to_string()]);
        assert!(v.validate_shape().is_err());
    }

    #[test]
    fn t_validate_shape_accepts_template_only() {
        let v = Variable::new("file", "out/<<base>>.txt");
        assert!(v.validate_shape().is_ok());
    }
}
