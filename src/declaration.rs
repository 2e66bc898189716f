//! The parsed input declaration (§6): the normalized document a
//! profile compiles down to before it reaches `make_workflow`.
//! Profile-file parsing and cross-profile inheritance are an external
//! boundary (§1) — this module only defines the shape serde decodes
//! into, and the declaration-time validation (§7, taxonomy #1) that
//! turns it into the `CommandGroup`/`Variable` pair a `WorkflowRecord`
//! owns.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::PathBuf,
};

use crate::{
    command_group::{CommandGroup, OptionsOverride},
    error::{DeclError, ResolveError},
    variable::Variable,
};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ParallelDecl {
    #[serde(default)]
    pub variables: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandGroupDecl {
    pub commands: Vec<String>,
    #[serde(default)]
    pub exec_order: Option<u32>,
    #[serde(default)]
    pub sub_order: Option<u32>,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub modules: Option<Vec<String>>,
    #[serde(default)]
    pub job_array: Option<bool>,
    #[serde(default)]
    pub parallel: Option<ParallelDecl>,
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub profile_order: Option<u32>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDecl {
    pub profile: String,
    pub command_groups: Vec<CommandGroupDecl>,
    #[serde(default)]
    pub variables: HashMap<String, Variable>,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub modules: Option<Vec<String>>,
    #[serde(default)]
    pub job_array: Option<bool>,
    #[serde(default)]
    pub profile_order: Option<u32>,
    #[serde(default)]
    pub profile_name: Option<String>,
}

impl WorkflowDecl {
    /// Normalizes and validates this declaration, returning the
    /// parts `Store::insert_workflow` wants plus the profile-level
    /// `OptionsOverride` defaults for the three-level inheritance
    /// chain (§4.3).
    pub fn into_parts(
        self,
    ) -> Result<(Vec<CommandGroup>, HashMap<String, Variable>, OptionsOverride), DeclError> {
        let command_groups: Vec<CommandGroup> = self
            .command_groups
            .into_iter()
            .enumerate()
            .map(|(index, g)| CommandGroup {
                index,
                exec_order: g.exec_order.unwrap_or(0),
                sub_order: g.sub_order.unwrap_or(0),
                commands: g.commands,
                overrides: OptionsOverride {
                    options: g.options,
                    directory: g.directory,
                    modules: g.modules,
                    job_array: g.job_array,
                },
                parallel_variables: g.parallel.map(|p| p.variables).unwrap_or(false),
                profile_name: g.profile_name,
                profile_order: g.profile_order,
            })
            .collect();

        let mut variables = self.variables;
        for (name, var) in variables.iter_mut() {
            var.name = name.clone();
        }

        for var in variables.values() {
            var.validate_shape()?;
            for referenced in var.references() {
                if !variables.contains_key(&referenced) {
                    return Err(DeclError::Resolve(ResolveError::UndefinedVariable(
                        referenced,
                    )));
                }
            }
        }
        detect_cycles(&variables)?;

        for group in &command_groups {
            for name in group.referenced_variables() {
                if !variables.contains_key(&name) {
                    return Err(DeclError::Resolve(ResolveError::UndefinedVariable(name)));
                }
            }
        }
        validate_channel_topology(&command_groups)?;

        let profile_defaults = OptionsOverride {
            options: self.options,
            directory: self.directory,
            modules: self.modules,
            job_array: self.job_array,
        };

        Ok((command_groups, variables, profile_defaults))
    }
}

fn detect_cycles(variables: &HashMap<String, Variable>) -> Result<(), DeclError> {
    fn visit(
        name: &str,
        variables: &HashMap<String, Variable>,
        visiting: &mut HashSet<String>,
        done: &mut HashSet<String>,
    ) -> Result<(), DeclError> {
        if done.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(DeclError::Resolve(ResolveError::CyclicReference(
                name.to_string(),
            )));
        }
        if let Some(var) = variables.get(name) {
            for reference in var.references() {
                visit(&reference, variables, visiting, done)?;
            }
        }
        visiting.remove(name);
        done.insert(name.to_string());
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for name in variables.keys() {
        visit(name, variables, &mut visiting, &mut done)?;
    }
    Ok(())
}

/// The shape-only half of §4.4's channel rules: within one
/// `exec_order`, the declared `sub_order` set must be contiguous
/// starting at 0 (spec.md:35, SPEC_FULL.md:41), and the set at a later
/// `exec_order` must be a subset of the previous one's — a channel may
/// merge or continue but never reappear after vanishing. Task-count-
/// dependent checks (range bounds, `C₀` match) happen later, in the
/// channel scheduler, once variable lengths are known.
fn validate_channel_topology(groups: &[CommandGroup]) -> Result<(), DeclError> {
    let mut by_exec: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
    for g in groups {
        by_exec.entry(g.exec_order).or_default().insert(g.sub_order);
    }
    let mut parents: Option<BTreeSet<u32>> = None;
    for (exec_order, subs) in &by_exec {
        if !subs.iter().copied().eq(0..subs.len() as u32) {
            return Err(DeclError::IllegalChannelSplit(format!(
                "exec_order {exec_order} declares non-contiguous sub_order set {subs:?}; \
                 sub_order must run 0..{}",
                subs.len()
            )));
        }
        if let Some(parents) = &parents {
            if !subs.is_subset(parents) {
                return Err(DeclError::IllegalChannelSplit(format!(
                    "channels {subs:?} are not a subset of the prior exec_order's channels {parents:?}"
                )));
            }
        }
        parents = Some(subs.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(command_groups: Vec<CommandGroupDecl>, variables: HashMap<String, Variable>) -> WorkflowDecl {
        WorkflowDecl {
            profile: "test".to_string(),
            command_groups,
            variables,
            options: None,
            directory: None,
            modules: None,
            job_array: None,
            profile_order: None,
            profile_name: None,
        }
    }

    fn group(commands: Vec<&str>, exec_order: u32, sub_order: u32) -> CommandGroupDecl {
        CommandGroupDecl {
            commands: commands.into_iter().map(String::from).collect(),
            exec_order: Some(exec_order),
            sub_order: Some(sub_order),
            options: None,
            directory: None,
            modules: None,
            job_array: None,
            parallel: None,
            profile_name: None,
            profile_order: None,
        }
    }

    #[test]
    fn t_s1_single_base_variable_round_trips() {
        let mut variables = HashMap::new();
        variables.insert(
            "f".to_string(),
            Variable::new("f", "{:s}").with_data(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
                "e".to_string(),
            ]),
        );
        let d = decl(vec![group(vec!["postProcess <<f>>"], 0, 0)], variables);
        let (groups, variables, _) = d.into_parts().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].referenced_variables(), vec!["f".to_string()]);
        assert_eq!(variables["f"].name, "f");
    }

    #[test]
    fn t_undefined_variable_rejected() {
        let d = decl(vec![group(vec!["run <<missing>>"], 0, 0)], HashMap::new());
        let err = d.into_parts().unwrap_err();
        assert!(matches!(
            err,
            DeclError::Resolve(ResolveError::UndefinedVariable(_))
        ));
    }

    #[test]
    fn t_illegal_channel_split_rejected() {
        let d = decl(
            vec![group(vec!["a"], 0, 0), group(vec!["b"], 1, 5)],
            HashMap::new(),
        );
        let err = d.into_parts().unwrap_err();
        assert!(matches!(err, DeclError::IllegalChannelSplit(_)));
    }

    #[test]
    fn t_non_contiguous_sub_order_rejected() {
        let d = decl(
            vec![group(vec!["a"], 0, 0), group(vec!["b"], 0, 2)],
            HashMap::new(),
        );
        let err = d.into_parts().unwrap_err();
        assert!(matches!(err, DeclError::IllegalChannelSplit(_)));
    }

    #[test]
    fn t_cyclic_variable_rejected() {
        let mut variables = HashMap::new();
        variables.insert("a".to_string(), Variable::new("a", "<<b>>"));
        variables.insert("b".to_string(), Variable::new("b", "<<a>>"));
        let d = decl(vec![], variables);
        let err = d.into_parts().unwrap_err();
        assert!(matches!(
            err,
            DeclError::Resolve(ResolveError::CyclicReference(_))
        ));
    }
}
