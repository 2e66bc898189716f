//! The scheduler/archive bridge boundary (§1, §9): the core never
//! speaks to a particular scheduler or remote archive target
//! directly. A bridge translates an abstract `Jobscript` into
//! whatever dispatch mechanism is actually configured and reports
//! back an opaque handle the submission controller persists.

use std::{path::Path, process::Command};

use crate::{error::SchedulerBridgeError, jobscript::Jobscript};

pub trait SchedulerBridge {
    /// Dispatches one jobscript, holding for the given prior
    /// scheduler handles, and returns an opaque handle of its own.
    fn dispatch(
        &self,
        jobscript: &Jobscript,
        script_path: &Path,
        holds: &[String],
    ) -> Result<String, SchedulerBridgeError>;

    fn cancel(&self, handle: &str) -> Result<(), SchedulerBridgeError>;
}

pub trait ArchiveBridge {
    fn archive(&self, working_dir: &Path, destination: &str) -> Result<(), SchedulerBridgeError>;
}

/// Runs jobscripts as direct child processes on the local host, the
/// default when no cluster scheduler is configured. Holds have no
/// native analogue for direct execution, so `dispatch` just runs the
/// script synchronously; a controller relying on real inter-group
/// ordering should not use this bridge for multi-exec_order
/// workflows.
pub struct LocalDirectBridge;

impl SchedulerBridge for LocalDirectBridge {
    fn dispatch(
        &self,
        _jobscript: &Jobscript,
        script_path: &Path,
        _holds: &[String],
    ) -> Result<String, SchedulerBridgeError> {
        let status = Command::new("sh").arg(script_path).status()?;
        Ok(format!("local:{}", status.code().unwrap_or(-1)))
    }

    fn cancel(&self, _handle: &str) -> Result<(), SchedulerBridgeError> {
        Ok(())
    }
}

/// The archive subsystem's null implementation (§9): configured
/// absence, not a silent success. Every call reports `NotConfigured`
/// so a caller can record the failure on the `ArchiveOperation` row
/// without it ever touching task state.
pub struct NullArchiveBridge;

impl ArchiveBridge for NullArchiveBridge {
    fn archive(&self, _working_dir: &Path, _destination: &str) -> Result<(), SchedulerBridgeError> {
        Err(SchedulerBridgeError::NotConfigured {
            bridge: "null-archive",
            reason: "no archive bridge configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_null_archive_bridge_reports_not_configured() {
        let bridge = NullArchiveBridge;
        let err = bridge
            .archive(Path::new("/tmp"), "s3://bucket/dir")
            .unwrap_err();
        assert!(matches!(err, SchedulerBridgeError::NotConfigured { .. }));
    }

    #[test]
    fn t_local_direct_bridge_runs_script() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("group-0.sh");
        std::fs::write(&script_path, "#!/bin/sh\nexit 0\n").unwrap();
        let jobscript = Jobscript {
            header: crate::jobscript::JobscriptHeader {
                working_dir: None,
                modules: Vec::new(),
                scheduler_options: serde_json::json!({}),
                job_array: false,
                array_len: 1,
            },
            body: crate::jobscript::JobscriptBody {
                command_group_index: 0,
                variable_file_names: Vec::new(),
                parallel_variables: false,
            },
            variable_dir: dir.path().to_owned(),
        };
        let bridge = LocalDirectBridge;
        let handle = bridge.dispatch(&jobscript, &script_path, &[]).unwrap();
        assert_eq!(handle, "local:0");
    }
}
