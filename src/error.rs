//! Typed error enums for the store, resolver and declaration layers.
//! Everything above these layers (the controller, the CLI) deals in
//! `anyhow::Result` with `ctx!`-attached context; these typed enums
//! exist at the seams where callers need to match on failure kind
//! (e.g. the CLI deciding on an exit code, or the scheduler bridge
//! reporting a submission failure distinctly from a store failure).

use std::path::PathBuf;

use crate::key_val_fs::key_val::KeyValError;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("underlying key/value store error: {0}")]
    KeyVal(#[from] KeyValError),

    #[error("workflow {0} does not exist")]
    NoSuchWorkflow(String),

    #[error("task {0} does not exist")]
    NoSuchTask(String),

    #[error("submission {0} does not exist")]
    NoSuchSubmission(String),

    #[error("store at {path:?} has not been initialized (run `make` first)")]
    NotInitialized { path: PathBuf },

    #[error("invalid task state transition: {task_id} is {from:?}, cannot become {to:?}")]
    InvalidTransition {
        task_id: String,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("variable {0:?} is not defined")]
    UndefinedVariable(String),

    #[error("variable {0:?} references itself, directly or indirectly")]
    CyclicReference(String),

    #[error("variable {name:?} has length {length}, but variable {other:?} bound to the same \
              iteration index has length {other_length}")]
    LengthMismatch {
        name: String,
        length: usize,
        other: String,
        other_length: usize,
    },

    #[error("template {template:?} references undefined variable {name:?}")]
    UnknownTemplateReference { template: String, name: String },

    #[error("scanning file-regex variable {name:?} at {dir:?}: {error}")]
    FileRegexScan {
        name: String,
        dir: PathBuf,
        error: std::io::Error,
    },

    #[error("file-regex variable {name:?} has an invalid pattern {pattern:?}: {error}")]
    InvalidPattern {
        name: String,
        pattern: String,
        error: regex::Error,
    },

    #[error("file-regex variable {name:?} matched file {file:?} but group {group} did not \
              parse as {type_tag}: {value:?}")]
    TypeCast {
        name: String,
        file: String,
        group: usize,
        type_tag: &'static str,
        value: String,
    },

    #[error("variable {0:?} has zero resolved base values but is referenced by a command group \
              (would produce zero tasks)")]
    ZeroLengthBase(String),
}

#[derive(thiserror::Error, Debug)]
pub enum DeclError {
    #[error("decoding workflow declaration: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("command group {0:?} is referenced but not declared")]
    UnknownCommandGroup(String),

    #[error("command group {0:?} declares a channel split: sub_order decreased across \
              exec_order boundary without a matching merge")]
    IllegalChannelSplit(String),

    #[error("{0}")]
    Resolve(#[from] ResolveError),
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerBridgeError {
    #[error("scheduler bridge {bridge} rejected submission: {reason}")]
    Rejected { bridge: &'static str, reason: String },

    #[error("archive bridge {bridge} is not configured: {reason}")]
    NotConfigured { bridge: &'static str, reason: String },

    #[error("archive operation already in progress for {0:?}")]
    AlreadyArchiving(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
