use std::time::SystemTime;

use crate::{
    channel::{ScheduledGroup, TaskRange},
    error::StoreError,
    ids::{SubmissionId, WorkflowId},
    key_val_fs::key_val::{KeyVal, KeyValConfig},
};

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DispatchStatus {
    Pending,
    Dispatched,
}

/// One scheduled jobscript's dispatch state within a submission. Kept
/// `Pending` until the scheduler bridge confirms acceptance, so a
/// retried `submit` after a partial dispatch failure (§4.7, §7) can
/// tell which groups still need to go out.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GroupDispatch {
    pub scheduled: ScheduledGroup,
    pub status: DispatchStatus,
    pub scheduler_handle: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmissionRecord {
    pub id: SubmissionId,
    pub workflow_id: WorkflowId,
    pub created_at: SystemTime,
    pub ranges: Option<Vec<TaskRange>>,
    pub groups: Vec<GroupDispatch>,
}

impl Store {
    pub fn submissions(
        &self,
        workflow_id: WorkflowId,
        create: bool,
    ) -> Result<KeyVal<SubmissionId, SubmissionRecord>, StoreError> {
        Ok(KeyVal::open(
            self.submissions_dir(workflow_id),
            KeyValConfig {
                create_dir_if_not_exists: create,
                ..Default::default()
            },
        )?)
    }

    /// Records a new submission with every scheduled group `Pending`.
    /// The caller dispatches groups afterwards and reports each one
    /// via `mark_group_dispatched`.
    pub fn create_submission(
        &self,
        workflow_id: WorkflowId,
        ranges: Option<Vec<TaskRange>>,
        scheduled: Vec<ScheduledGroup>,
        created_at: SystemTime,
    ) -> Result<SubmissionId, StoreError> {
        let submissions = self.submissions(workflow_id, true)?;
        let id = SubmissionId::new();
        let record = SubmissionRecord {
            id,
            workflow_id,
            created_at,
            ranges,
            groups: scheduled
                .into_iter()
                .map(|scheduled| GroupDispatch {
                    scheduled,
                    status: DispatchStatus::Pending,
                    scheduler_handle: None,
                })
                .collect(),
        };
        submissions.insert(&id, &record, true)?;
        Ok(id)
    }

    pub fn get_submission(
        &self,
        workflow_id: WorkflowId,
        submission_id: SubmissionId,
    ) -> Result<SubmissionRecord, StoreError> {
        self.submissions(workflow_id, false)?
            .get(&submission_id)?
            .ok_or_else(|| StoreError::NoSuchSubmission(submission_id.to_string()))
    }

    /// Idempotent: marking an already-`Dispatched` group dispatched
    /// again (e.g. a retried bridge call) keeps the first handle.
    pub fn mark_group_dispatched(
        &self,
        workflow_id: WorkflowId,
        submission_id: SubmissionId,
        group_index: usize,
        scheduler_handle: String,
    ) -> Result<(), StoreError> {
        let submissions = self.submissions(workflow_id, false)?;
        let mut record = submissions
            .get(&submission_id)?
            .ok_or_else(|| StoreError::NoSuchSubmission(submission_id.to_string()))?;
        if let Some(group) = record
            .groups
            .iter_mut()
            .find(|g| g.scheduled.group_index == group_index)
        {
            if group.status == DispatchStatus::Pending {
                group.status = DispatchStatus::Dispatched;
                group.scheduler_handle = Some(scheduler_handle);
                submissions.insert(&submission_id, &record, false)?;
            }
        }
        Ok(())
    }

    /// Groups left `Pending` after a partial dispatch failure — what
    /// a retried `submit` on the same submission still needs to send.
    pub fn pending_groups(
        &self,
        workflow_id: WorkflowId,
        submission_id: SubmissionId,
    ) -> Result<Vec<ScheduledGroup>, StoreError> {
        Ok(self
            .get_submission(workflow_id, submission_id)?
            .groups
            .into_iter()
            .filter(|g| g.status == DispatchStatus::Pending)
            .map(|g| g.scheduled)
            .collect())
    }

    /// Finds an existing submission for `workflow_id` made with the
    /// same `ranges` that still has pending groups, so a retried
    /// `submit_workflow` call resumes it instead of minting a second,
    /// independent submission (§7 taxonomy #4, §8 uniqueness). `None`
    /// if no submissions exist yet (including a workflow that has
    /// never been submitted) or none match.
    pub fn find_resumable_submission(
        &self,
        workflow_id: WorkflowId,
        ranges: &Option<Vec<TaskRange>>,
    ) -> Result<Option<SubmissionId>, StoreError> {
        let submissions = match self.submissions(workflow_id, false) {
            Ok(submissions) => submissions,
            Err(StoreError::KeyVal(crate::key_val_fs::key_val::KeyValError::SchemaMissing {
                ..
            })) => return Ok(None),
            Err(error) => return Err(error),
        };
        for key in submissions.sorted_keys(false, None)? {
            let record = submissions
                .get(&key)?
                .ok_or_else(|| StoreError::NoSuchSubmission(key.to_string()))?;
            if &record.ranges == ranges
                && record
                    .groups
                    .iter()
                    .any(|g| g.status == DispatchStatus::Pending)
            {
                return Ok(Some(record.id));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

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

    fn scheduled(group_index: usize) -> ScheduledGroup {
        ScheduledGroup {
            group_index,
            channel: 0,
            task_indices: vec![0, 1, 2],
            depends_on: BTreeSet::new(),
        }
    }

    #[test]
    fn t_partial_dispatch_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let wf = workflow(&store);
        let submission_id = store
            .create_submission(
                wf,
                None,
                vec![scheduled(0), scheduled(1)],
                SystemTime::now(),
            )
            .unwrap();

        store
            .mark_group_dispatched(wf, submission_id, 0, "job.123".to_string())
            .unwrap();

        let pending = store.pending_groups(wf, submission_id).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].group_index, 1);

        // Retrying a dispatch for an already-dispatched group keeps
        // the original handle.
        store
            .mark_group_dispatched(wf, submission_id, 0, "job.456".to_string())
            .unwrap();
        let record = store.get_submission(wf, submission_id).unwrap();
        assert_eq!(
            record.groups[0].scheduler_handle,
            Some("job.123".to_string())
        );
    }
}
