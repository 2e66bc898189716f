//! The workflow store (§4.5): a filesystem-backed persistent schema
//! for workflows, tasks, submissions, iterations and archive
//! operations. Each entity kind is a `KeyVal` table (one file per
//! row), scoped under the store root the way `key_val_fs` tables are
//! scoped elsewhere in this codebase; per-workflow tables (tasks,
//! submissions, iterations, archive operations) live under a
//! subdirectory named after the owning workflow id, giving
//! "cascade delete from workflow" for free — removing a workflow's
//! subtree removes everything it owns.
//!
//! Command groups and variable definitions are embedded directly in
//! the `WorkflowRecord` rather than split into their own tables: per
//! §3 they "are created with their workflow and never mutated", so
//! there is no row-level concurrency to gain from splitting them out,
//! and loading a workflow always wants all of them at once anyway.

pub mod archive;
pub mod iteration;
pub mod migrate;
pub mod submission;
pub mod task;
pub mod workflow;

use std::path::{Path, PathBuf};

use run_git::path_util::AppendToPath;

use crate::{
    error::StoreError,
    ids::WorkflowId,
    key_val_fs::{
        as_key::AsKey,
        key_val::{KeyVal, KeyValConfig},
    },
};

pub use workflow::WorkflowRecord;

pub const SCHEMA_VERSION: u32 = 1;

pub struct Store {
    root: PathBuf,
    pub workflows: KeyVal<WorkflowId, WorkflowRecord>,
}

impl Store {
    /// Opens the store, creating its top-level schema if absent.
    /// Per §4.5, only `make`/`submit` are allowed to do this; other
    /// callers use `open_existing`.
    pub fn create_all(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_owned();
        std::fs::create_dir_all(&root).map_err(|error| {
            StoreError::KeyVal(crate::key_val_fs::key_val::KeyValError::CreateDir {
                base_dir: root.clone(),
                error,
            })
        })?;
        migrate::write_schema_version(&root)?;
        let workflows = KeyVal::open(
            workflows_dir(&root),
            KeyValConfig {
                create_dir_if_not_exists: true,
                ..Default::default()
            },
        )?;
        Ok(Self { root, workflows })
    }

    /// Opens the store, failing with `StoreError::NotInitialized` if
    /// the schema is absent.
    pub fn open_existing(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_owned();
        if !root.is_dir() {
            return Err(StoreError::NotInitialized { path: root });
        }
        migrate::check_schema_version(&root)?;
        let workflows = KeyVal::open(
            workflows_dir(&root),
            KeyValConfig {
                create_dir_if_not_exists: false,
                ..Default::default()
            },
        )?;
        Ok(Self { root, workflows })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_subdir(&self, table: &str, workflow_id: WorkflowId) -> PathBuf {
        (&self.root)
            .append(table)
            .append(workflow_id.verified_as_filename_str().into_owned())
    }

    pub(crate) fn tasks_dir(&self, workflow_id: WorkflowId) -> PathBuf {
        self.workflow_subdir("tasks", workflow_id)
    }

    pub(crate) fn submissions_dir(&self, workflow_id: WorkflowId) -> PathBuf {
        self.workflow_subdir("submissions", workflow_id)
    }

    pub(crate) fn iterations_dir(&self, workflow_id: WorkflowId) -> PathBuf {
        self.workflow_subdir("iterations", workflow_id)
    }

    pub(crate) fn archive_dir(&self, workflow_id: WorkflowId) -> PathBuf {
        self.workflow_subdir("archive", workflow_id)
    }
}

fn workflows_dir(root: &Path) -> PathBuf {
    root.append("workflows")
}
