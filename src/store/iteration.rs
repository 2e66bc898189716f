use std::time::SystemTime;

use crate::{
    error::StoreError,
    ids::{IterationId, WorkflowId},
    key_val_fs::key_val::{KeyVal, KeyValConfig},
};

use super::Store;

/// One re-run of a workflow's skeleton (§3, §9). Per the resolved
/// open question, an iteration gets its own task rows but shares the
/// owning workflow's command groups and variable definitions
/// unchanged — there is nothing else for this record to own.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IterationRecord {
    pub id: IterationId,
    pub workflow_id: WorkflowId,
    pub sequence: u32,
    pub created_at: SystemTime,
}

impl Store {
    pub fn iterations(
        &self,
        workflow_id: WorkflowId,
        create: bool,
    ) -> Result<KeyVal<IterationId, IterationRecord>, StoreError> {
        Ok(KeyVal::open(
            self.iterations_dir(workflow_id),
            KeyValConfig {
                create_dir_if_not_exists: create,
                ..Default::default()
            },
        )?)
    }

    pub fn create_iteration(
        &self,
        workflow_id: WorkflowId,
        created_at: SystemTime,
    ) -> Result<IterationRecord, StoreError> {
        let iterations = self.iterations(workflow_id, true)?;
        let sequence = iterations.sorted_keys(false, None)?.len() as u32;
        let id = IterationId::new();
        let record = IterationRecord {
            id,
            workflow_id,
            sequence,
            created_at,
        };
        iterations.insert(&id, &record, true)?;
        Ok(record)
    }

    pub fn get_iteration(
        &self,
        workflow_id: WorkflowId,
        iteration_id: IterationId,
    ) -> Result<IterationRecord, StoreError> {
        self.iterations(workflow_id, false)?
            .get(&iteration_id)?
            .ok_or_else(|| StoreError::NoSuchWorkflow(iteration_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store(dir: &std::path::Path) -> Store {
        Store::create_all(dir.join("store")).unwrap()
    }

    fn workflow(store: &Store) -> WorkflowId {
        store
            .insert_workflow(
                std::path::PathBuf::from("/tmp/wd"),
                vec![],
                HashMap::new(),
                SystemTime::now(),
            )
            .unwrap()
    }

    #[test]
    fn t_iteration_sequence_increments() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let first = store.create_iteration(wf, SystemTime::now()).unwrap();
        let second = store.create_iteration(wf, SystemTime::now()).unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn t_iteration_tasks_independent_of_base_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let iteration = store.create_iteration(wf, SystemTime::now()).unwrap();

        let base_tasks = store.create_tasks(wf, None, 0, &[0, 1]).unwrap();
        let iter_tasks = store
            .create_tasks(wf, Some(iteration.id), 0, &[0, 1])
            .unwrap();

        assert_ne!(base_tasks, iter_tasks);
        for id in &iter_tasks {
            assert_eq!(store.get_task(wf, *id).unwrap().iteration_id, Some(iteration.id));
        }
        for id in &base_tasks {
            assert_eq!(store.get_task(wf, *id).unwrap().iteration_id, None);
        }
    }
}
