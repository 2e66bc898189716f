use std::{collections::HashMap, path::PathBuf, time::SystemTime};

use crate::{
    command_group::{CommandGroup, OptionsOverride},
    error::StoreError,
    ids::WorkflowId,
    variable::Variable,
};

use super::Store;

/// The persisted Workflow root aggregate (§3). Immutable once
/// written — command groups and variables never change after
/// `make_workflow` returns.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub created_at: SystemTime,
    pub working_dir: PathBuf,
    pub command_groups: Vec<CommandGroup>,
    pub variables: HashMap<String, Variable>,
    /// The profile-level `options`/`directory`/`modules`/`job_array`
    /// defaults (§4.3's least-specific inheritance level).
    #[serde(default)]
    pub profile_defaults: OptionsOverride,
}

impl Store {
    /// Persists a new workflow and returns its id. Always mints a
    /// fresh `WorkflowId`; serializing concurrent calls against the
    /// same `working_dir` is the caller's job — `Controller::make_workflow`
    /// does this with a working-directory lock before calling in.
    pub fn insert_workflow(
        &self,
        working_dir: PathBuf,
        command_groups: Vec<CommandGroup>,
        variables: HashMap<String, Variable>,
        created_at: SystemTime,
    ) -> Result<WorkflowId, StoreError> {
        self.insert_workflow_with_defaults(
            working_dir,
            command_groups,
            variables,
            OptionsOverride::default(),
            created_at,
        )
    }

    pub fn insert_workflow_with_defaults(
        &self,
        working_dir: PathBuf,
        command_groups: Vec<CommandGroup>,
        variables: HashMap<String, Variable>,
        profile_defaults: OptionsOverride,
        created_at: SystemTime,
    ) -> Result<WorkflowId, StoreError> {
        let id = WorkflowId::new();
        let record = WorkflowRecord {
            id,
            created_at,
            working_dir,
            command_groups,
            variables,
            profile_defaults,
        };
        self.workflows.insert(&id, &record, true)?;
        Ok(id)
    }

    pub fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, StoreError> {
        self.workflows
            .get(&id)?
            .ok_or_else(|| StoreError::NoSuchWorkflow(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_group::OptionsOverride;

    fn sample_group() -> CommandGroup {
        CommandGroup {
            index: 0,
            exec_order: 0,
            sub_order: 0,
            commands: vec!["run <<f>>".to_string()],
            overrides: OptionsOverride::default(),
            parallel_variables: false,
            profile_name: None,
            profile_order: None,
        }
    }

    #[test]
    fn t_insert_and_get_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_all(dir.path().join("store")).unwrap();
        let id = store
            .insert_workflow(
                dir.path().join("work"),
                vec![sample_group()],
                HashMap::new(),
                SystemTime::now(),
            )
            .unwrap();
        let record = store.get_workflow(id).unwrap();
        assert_eq!(record.command_groups.len(), 1);
    }

    #[test]
    fn t_missing_workflow_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create_all(dir.path().join("store")).unwrap();
        let err = store.get_workflow(WorkflowId::new()).unwrap_err();
        assert!(matches!(err, StoreError::NoSuchWorkflow(_)));
    }
}
