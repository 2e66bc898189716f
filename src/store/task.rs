use std::{collections::HashMap, time::SystemTime};

use crate::{
    error::StoreError,
    ids::{IterationId, TaskId, WorkflowId},
    key_val_fs::key_val::{KeyVal, KeyValConfig},
};

use super::Store;

/// Task state machine (§3): `Pending -> Submitted -> Running ->
/// (Complete | Failed)`. `Complete`/`Failed` are terminal; `archived`
/// (on `TaskRecord`, not part of this enum) is an orthogonal tag
/// applied after a task reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TaskStatus {
    Pending,
    Submitted,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// `None` for a workflow's base run; `Some` ties this row to the
    /// iteration that created it (§9: new task rows per iteration,
    /// shared command-group rows — the command group itself is still
    /// looked up from the owning `WorkflowRecord`).
    pub iteration_id: Option<IterationId>,
    pub command_group_index: usize,
    pub task_index: usize,
    pub scheduler_task_id: Option<String>,
    pub status: TaskStatus,
    pub start: Option<SystemTime>,
    pub end: Option<SystemTime>,
    pub exit_status: Option<i32>,
    pub cancellation_reason: Option<String>,
    pub archived: bool,
}

impl Store {
    pub fn tasks(
        &self,
        workflow_id: WorkflowId,
        create: bool,
    ) -> Result<KeyVal<TaskId, TaskRecord>, StoreError> {
        Ok(KeyVal::open(
            self.tasks_dir(workflow_id),
            KeyValConfig {
                create_dir_if_not_exists: create,
                ..Default::default()
            },
        )?)
    }

    /// Creates one `Pending` task row per entry in `task_indices`,
    /// the way the channel scheduler's selected indices for a
    /// command group become concrete task rows at submission time.
    /// Idempotent per `(iteration_id, command_group_index,
    /// task_index)`: an entry that already has a row returns that
    /// row's id instead of minting a duplicate, so a retried
    /// `submit_workflow` call never double-creates tasks for a group
    /// it already dispatched (§7 taxonomy #4, §8 uniqueness).
    pub fn create_tasks(
        &self,
        workflow_id: WorkflowId,
        iteration_id: Option<IterationId>,
        command_group_index: usize,
        task_indices: &[usize],
    ) -> Result<Vec<TaskId>, StoreError> {
        let tasks = self.tasks(workflow_id, true)?;
        let mut existing: HashMap<usize, TaskId> = HashMap::new();
        for key in tasks.sorted_keys(false, None)? {
            let record = tasks
                .get(&key)?
                .ok_or_else(|| StoreError::NoSuchTask(key.to_string()))?;
            if record.iteration_id == iteration_id && record.command_group_index == command_group_index {
                existing.insert(record.task_index, record.id);
            }
        }
        task_indices
            .iter()
            .map(|&task_index| {
                if let Some(&id) = existing.get(&task_index) {
                    return Ok(id);
                }
                let id = TaskId::new();
                let record = TaskRecord {
                    id,
                    iteration_id,
                    command_group_index,
                    task_index,
                    scheduler_task_id: None,
                    status: TaskStatus::Pending,
                    start: None,
                    end: None,
                    exit_status: None,
                    cancellation_reason: None,
                    archived: false,
                };
                tasks.insert(&id, &record, true)?;
                Ok(id)
            })
            .collect()
    }

    pub fn get_task(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
    ) -> Result<TaskRecord, StoreError> {
        self.tasks(workflow_id, false)?
            .get(&task_id)?
            .ok_or_else(|| StoreError::NoSuchTask(task_id.to_string()))
    }

    pub fn set_task_submitted(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        scheduler_task_id: String,
    ) -> Result<(), StoreError> {
        let tasks = self.tasks(workflow_id, false)?;
        let mut record = tasks
            .get(&task_id)?
            .ok_or_else(|| StoreError::NoSuchTask(task_id.to_string()))?;
        if record.status == TaskStatus::Pending {
            record.status = TaskStatus::Submitted;
            record.scheduler_task_id = Some(scheduler_task_id);
            tasks.insert(&task_id, &record, false)?;
        }
        Ok(())
    }

    /// Idempotent with respect to retries keyed by `(task_id,
    /// "start")` (§4.5): a second call with the same or a later
    /// timestamp after the first succeeded is a no-op. Concurrent
    /// calls against *different* tasks never block each other beyond
    /// the table's brief per-write critical section (S5); concurrent
    /// calls racing on the *same* task may non-deterministically pick
    /// either timestamp, which idempotent retries of one caller never
    /// trigger in practice.
    pub fn set_task_start(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        timestamp: SystemTime,
    ) -> Result<(), StoreError> {
        let tasks = self.tasks(workflow_id, false)?;
        let mut record = tasks
            .get(&task_id)?
            .ok_or_else(|| StoreError::NoSuchTask(task_id.to_string()))?;
        if record.start.is_none() {
            record.start = Some(timestamp);
            if !record.status.is_terminal() {
                record.status = TaskStatus::Running;
            }
            tasks.insert(&task_id, &record, false)?;
        }
        Ok(())
    }

    /// Idempotent with respect to retries keyed by `(task_id,
    /// "end")`, mirroring `set_task_start`.
    pub fn set_task_end(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        timestamp: SystemTime,
        exit_status: i32,
    ) -> Result<(), StoreError> {
        let tasks = self.tasks(workflow_id, false)?;
        let mut record = tasks
            .get(&task_id)?
            .ok_or_else(|| StoreError::NoSuchTask(task_id.to_string()))?;
        if record.end.is_none() {
            record.end = Some(timestamp);
            record.exit_status = Some(exit_status);
            record.status = if exit_status == 0 {
                TaskStatus::Complete
            } else {
                TaskStatus::Failed
            };
            tasks.insert(&task_id, &record, false)?;
        }
        Ok(())
    }

    /// `kill` semantics for one task (§5, S6): a terminal task is
    /// untouched; a task still `Pending`/`Submitted` (no start
    /// recorded) becomes `Failed` with `reason` and no start
    /// timestamp; a `Running` task becomes `Failed` with its end
    /// timestamp recorded.
    pub fn cancel_task(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        reason: String,
        now: SystemTime,
    ) -> Result<(), StoreError> {
        let tasks = self.tasks(workflow_id, false)?;
        let mut record = tasks
            .get(&task_id)?
            .ok_or_else(|| StoreError::NoSuchTask(task_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        if record.status == TaskStatus::Running {
            record.end = Some(now);
        } else {
            record.cancellation_reason = Some(reason);
        }
        record.status = TaskStatus::Failed;
        tasks.insert(&task_id, &record, false)?;
        Ok(())
    }

    pub fn mark_archived(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
    ) -> Result<(), StoreError> {
        let tasks = self.tasks(workflow_id, false)?;
        let mut record = tasks
            .get(&task_id)?
            .ok_or_else(|| StoreError::NoSuchTask(task_id.to_string()))?;
        record.archived = true;
        tasks.insert(&task_id, &record, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store(dir: &std::path::Path) -> Store {
        Store::create_all(dir.join("store")).unwrap()
    }

    fn workflow(store: &Store) -> WorkflowId {
        store
            .insert_workflow(
                std::path::PathBuf::from("/tmp/wd"),
                vec![],
                Default::default(),
                SystemTime::now(),
            )
            .unwrap()
    }

    #[test]
    fn t_set_task_start_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let [task_id] = store.create_tasks(wf, None, 0, &[0]).unwrap()[..] else {
            panic!()
        };
        let t1 = SystemTime::now();
        store.set_task_start(wf, task_id, t1).unwrap();
        let t2 = t1 + Duration::from_secs(5);
        store.set_task_start(wf, task_id, t2).unwrap();
        let record = store.get_task(wf, task_id).unwrap();
        assert_eq!(record.start, Some(t1));
        assert_eq!(record.status, TaskStatus::Running);
    }

    #[test]
    fn t_create_tasks_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let first = store.create_tasks(wf, None, 0, &[0, 1, 2]).unwrap();
        let second = store.create_tasks(wf, None, 0, &[1, 2, 3]).unwrap();
        assert_eq!(first[1], second[0]);
        assert_eq!(first[2], second[1]);
        assert_ne!(second[2], first[0]);
        let tasks = store.tasks(wf, false).unwrap();
        assert_eq!(tasks.sorted_keys(false, None).unwrap().len(), 4);
    }

    #[test]
    fn t_s6_kill_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let ids = store.create_tasks(wf, None, 0, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();

        // 3 complete
        for &id in &ids[0..3] {
            store.set_task_start(wf, id, SystemTime::now()).unwrap();
            store.set_task_end(wf, id, SystemTime::now(), 0).unwrap();
        }
        // 4 running
        for &id in &ids[3..7] {
            store.set_task_start(wf, id, SystemTime::now()).unwrap();
        }
        // 3 pending: left untouched

        let now = SystemTime::now();
        for &id in &ids {
            store
                .cancel_task(wf, id, "cancelled by user".to_string(), now)
                .unwrap();
        }

        for &id in &ids[0..3] {
            assert_eq!(store.get_task(wf, id).unwrap().status, TaskStatus::Complete);
        }
        for &id in &ids[3..7] {
            let record = store.get_task(wf, id).unwrap();
            assert_eq!(record.status, TaskStatus::Failed);
            assert!(record.end.is_some());
        }
        for &id in &ids[7..10] {
            let record = store.get_task(wf, id).unwrap();
            assert_eq!(record.status, TaskStatus::Failed);
            assert!(record.start.is_none());
            assert!(record.cancellation_reason.is_some());
        }
    }

    #[test]
    fn t_s5_many_concurrent_task_ends_no_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store(dir.path()));
        let wf = workflow(&store);
        let indices: Vec<usize> = (0..40).collect();
        let ids = store.create_tasks(wf, None, 0, &indices).unwrap();

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.set_task_start(wf, id, SystemTime::now()).unwrap();
                    store.set_task_end(wf, id, SystemTime::now(), 0).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let tasks = store.tasks(wf, false).unwrap();
        for key in tasks.sorted_keys(false, None).unwrap() {
            let record = tasks.get(&key).unwrap().unwrap();
            assert_eq!(record.status, TaskStatus::Complete);
        }
    }
}
