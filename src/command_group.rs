//! The command-group model (§4.3): templated commands, channel
//! placement, and the three-level inheritance of scheduler options,
//! working directory, modules, and the `job_array` flag. Pure model
//! — no I/O, no store access.

use std::path::PathBuf;

use crate::template;

/// An `options`/`directory`/`modules`/`job_array` override at one
/// level of the inheritance chain. Any field left `None`/empty falls
/// through to the next-less-specific level, the same
/// `.or_else(fallback).unwrap_or(default)` chaining used for job
/// knobs elsewhere in this codebase.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionsOverride {
    pub options: Option<serde_json::Value>,
    pub directory: Option<PathBuf>,
    pub modules: Option<Vec<String>>,
    pub job_array: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub options: serde_json::Value,
    pub directory: Option<PathBuf>,
    pub modules: Vec<String>,
    pub job_array: bool,
}

impl OptionsOverride {
    /// Resolves one field against `less_specific`, in order from
    /// most to least specific (e.g. `[call_site, command_group,
    /// profile]`).
    pub fn complete(levels: &[&OptionsOverride]) -> ResolvedOptions {
        let options = levels
            .iter()
            .find_map(|l| l.options.clone())
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let directory = levels.iter().find_map(|l| l.directory.clone());
        let modules = levels
            .iter()
            .find_map(|l| l.modules.clone())
            .unwrap_or_default();
        let job_array = levels.iter().find_map(|l| l.job_array).unwrap_or(false);
        ResolvedOptions {
            options,
            directory,
            modules,
            job_array,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandGroup {
    /// Position within the workflow's declared command-group list;
    /// also the tie-breaker for declaration order.
    pub index: usize,
    pub exec_order: u32,
    pub sub_order: u32,
    pub commands: Vec<String>,
    #[serde(default)]
    pub overrides: OptionsOverride,
    #[serde(default)]
    pub parallel_variables: bool,
    pub profile_name: Option<String>,
    pub profile_order: Option<u32>,
}

impl CommandGroup {
    /// Variable names referenced across all of this group's command
    /// templates, deduplicated, in first-appearance order (first
    /// command, then the next, etc).
    pub fn referenced_variables(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for command in &self.commands {
            for name in template::references_of(command) {
                if seen.insert(name.clone()) {
                    out.push(name);
                }
            }
        }
        out
    }

    pub fn resolve_options<'a>(
        &'a self,
        profile_default: &'a OptionsOverride,
        call_site: Option<&'a OptionsOverride>,
    ) -> ResolvedOptions {
        let empty = OptionsOverride::default();
        let call_site = call_site.unwrap_or(&empty);
        OptionsOverride::complete(&[call_site, &self.overrides, profile_default])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(commands: Vec<&str>) -> CommandGroup {
        CommandGroup {
            index: 0,
            exec_order: 0,
            sub_order: 0,
            commands: commands.into_iter().map(str::to_string).collect(),
            overrides: OptionsOverride::default(),
            parallel_variables: false,
            profile_name: None,
            profile_order: None,
        }
    }

    #[test]
    fn t_referenced_variables_dedup_across_commands() {
        let g = group(vec!["postProcess <<f>>", "archive <<f>> <<g>>"]);
        assert_eq!(
            g.referenced_variables(),
            vec!["f".to_string(), "g".to_string()]
        );
    }

    #[test]
    fn t_three_level_precedence() {
        let mut g = group(vec!["run"]);
        g.overrides.job_array = Some(true);
        let profile_default = OptionsOverride {
            modules: Some(vec!["gcc".to_string()]),
            job_array: Some(false),
            ..Default::default()
        };
        let call_site = OptionsOverride {
            directory: Some(PathBuf::from("/tmp/call-site")),
            ..Default::default()
        };
        let resolved = g.resolve_options(&profile_default, Some(&call_site));
        // call-site wins for directory, group wins for job_array,
        // profile default is the only source for modules.
        assert_eq!(resolved.directory, Some(PathBuf::from("/tmp/call-site")));
        assert!(resolved.job_array);
        assert_eq!(resolved.modules, vec!["gcc".to_string()]);
    }
}
