//! Newtype identifiers wrapping `TimeKey` so each entity kind gets
//! its own file-name encoding and can't be mixed up at the type
//! level. None of these ids carry their owning workflow — every
//! per-workflow table lives under its own subdirectory
//! (`Store::tasks_dir`/`submissions_dir`/etc.), so a bare `TaskId` (or
//! any other id here) only addresses a row once paired with the
//! `WorkflowId` used to open that subdirectory.

use std::{borrow::Cow, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::key_val_fs::{as_key::AsKey, queue::TimeKey};

macro_rules! time_key_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub TimeKey);

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl AsKey for $name {
            fn as_filename_str(&self) -> Cow<'_, str> {
                self.0.as_filename_str()
            }

            fn try_from_filename_str(file_name: &str) -> Option<Self> {
                TimeKey::try_from_filename_str(file_name).map($name)
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(TimeKey::now())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

time_key_id!(WorkflowId);
time_key_id!(SubmissionId);
time_key_id!(IterationId);
time_key_id!(TaskId);
time_key_id!(CommandGroupId);
