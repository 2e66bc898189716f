use std::time::SystemTime;

use run_git::path_util::AppendToPath;

use crate::{
    error::StoreError,
    ids::{TaskId, WorkflowId},
    key_val_fs::{
        as_key::AsKey,
        key_val::{KeyVal, KeyValConfig},
    },
    lockable_file::StandaloneExclusiveFileLock,
};

use super::Store;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("archive operation already in progress for task {0}")]
    AlreadyInProgress(String),

    #[error("locking archive marker for task {task_id}: {error}")]
    Lock {
        task_id: String,
        error: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ArchiveStatus {
    InProgress,
    Complete,
    Failed,
}

/// One task's at-most-one-active archive attempt (§3). The advisory
/// lock file backing this lives alongside the record, since the
/// archive bridge that does the actual copying may run as a separate
/// process from the one that started the operation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArchiveRecord {
    pub task_id: TaskId,
    pub status: ArchiveStatus,
    pub destination: Option<String>,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
    pub error: Option<String>,
}

/// Held by the caller for the duration of an archive attempt;
/// dropping it releases the advisory lock, letting a future attempt
/// for the same task proceed once `end_archive` has recorded a
/// terminal outcome.
pub struct ArchiveHandle {
    _lock: StandaloneExclusiveFileLock,
}

impl Store {
    pub fn archive_records(
        &self,
        workflow_id: WorkflowId,
        create: bool,
    ) -> Result<KeyVal<TaskId, ArchiveRecord>, StoreError> {
        Ok(KeyVal::open(
            self.archive_dir(workflow_id),
            KeyValConfig {
                create_dir_if_not_exists: create,
                ..Default::default()
            },
        )?)
    }

    fn archive_lock_path(&self, workflow_id: WorkflowId, task_id: TaskId) -> std::path::PathBuf {
        (&self.archive_dir(workflow_id)).append(format!(
            "{}.lock",
            task_id.verified_as_filename_str()
        ))
    }

    pub fn start_archive(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        destination: Option<String>,
        now: SystemTime,
    ) -> Result<ArchiveHandle, ArchiveError> {
        let lock_path = self.archive_lock_path(workflow_id, task_id);
        std::fs::create_dir_all(lock_path.parent().expect("archive dir has a parent")).map_err(
            |error| ArchiveError::Lock {
                task_id: task_id.to_string(),
                error,
            },
        )?;
        if !lock_path.exists() {
            std::fs::File::create(&lock_path).map_err(|error| ArchiveError::Lock {
                task_id: task_id.to_string(),
                error,
            })?;
        }
        let lock = StandaloneExclusiveFileLock::try_lock_path(&lock_path, || {
            format!("archive operation already running for task {task_id}")
        })
        .map_err(|_| ArchiveError::AlreadyInProgress(task_id.to_string()))?;

        let records = self.archive_records(workflow_id, true)?;
        let record = ArchiveRecord {
            task_id,
            status: ArchiveStatus::InProgress,
            destination,
            start: now,
            end: None,
            error: None,
        };
        records.insert(&task_id, &record, false)?;
        Ok(ArchiveHandle { _lock: lock })
    }

    pub fn end_archive(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        now: SystemTime,
        result: Result<(), String>,
    ) -> Result<(), StoreError> {
        let records = self.archive_records(workflow_id, false)?;
        let mut record = records
            .get(&task_id)?
            .ok_or_else(|| StoreError::NoSuchTask(task_id.to_string()))?;
        record.end = Some(now);
        match result {
            Ok(()) => record.status = ArchiveStatus::Complete,
            Err(error) => {
                record.status = ArchiveStatus::Failed;
                record.error = Some(error);
            }
        }
        records.insert(&task_id, &record, false)?;
        Ok(())
    }

    pub fn get_archive_record(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
    ) -> Result<Option<ArchiveRecord>, StoreError> {
        self.archive_records(workflow_id, false)?.get(&task_id)
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
    fn t_second_start_rejected_while_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let [task_id] = store.create_tasks(wf, None, 0, &[0]).unwrap()[..] else {
            panic!()
        };

        let _handle = store
            .start_archive(wf, task_id, Some("s3://bucket/dir".to_string()), SystemTime::now())
            .unwrap();

        let err = store
            .start_archive(wf, task_id, None, SystemTime::now())
            .unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyInProgress(_)));
    }

    #[test]
    fn t_start_end_records_outcome_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let [task_id] = store.create_tasks(wf, None, 0, &[0]).unwrap()[..] else {
            panic!()
        };

        let handle = store
            .start_archive(wf, task_id, None, SystemTime::now())
            .unwrap();
        store
            .end_archive(wf, task_id, SystemTime::now(), Ok(()))
            .unwrap();
        drop(handle);

        let record = store.get_archive_record(wf, task_id).unwrap().unwrap();
        assert_eq!(record.status, ArchiveStatus::Complete);

        // Lock released: a fresh attempt succeeds.
        let _second = store
            .start_archive(wf, task_id, None, SystemTime::now())
            .unwrap();
    }
}
