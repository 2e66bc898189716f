//! A FIFO-ish queue built on top of `KeyVal`, keyed by a monotonic
//! `TimeKey` (nanoseconds since epoch + pid + process-local counter).
//! Used wherever the store needs a creation-ordered id: workflows,
//! submissions, iterations, tasks.

use std::{
    borrow::Cow,
    fmt::Display,
    fs::File,
    path::Path,
    sync::atomic::AtomicU64,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use genawaiter::rc::Gen;
use serde::{de::DeserializeOwned, Serialize};

use crate::lockable_file::{ExclusiveFileLock, SharedFileLock};

use super::{
    as_key::AsKey,
    key_val::{Entry, KeyVal, KeyValConfig, KeyValError},
};

fn next_id() -> u64 {
    static IDS: AtomicU64 = AtomicU64::new(0);
    // Relaxed: each thread still gets a unique id even if the
    // ordering across threads doesn't match wall-clock order.
    IDS.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeKey {
    /// Nanoseconds since UNIX_EPOCH
    nanos: u128,
    pid: u32,
    id: u64,
}

fn datetime_from_nanoseconds(nanos: u128) -> DateTime<Utc> {
    let secs = (nanos / 1_000_000_000) as u64;
    let nanos = (nanos % 1_000_000_000) as u32;
    let system_time = UNIX_EPOCH + Duration::new(secs, nanos);
    system_time.into()
}

impl Display for TimeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self { nanos, pid, id } = self;
        let t = datetime_from_nanoseconds(*nanos);
        write!(f, "{t} ({pid}-{id})")
    }
}

impl TimeKey {
    /// Possibly panics if the system clock is outside the range
    /// representable as duration by `std::time`.
    pub fn now() -> Self {
        let time = SystemTime::now();
        let t = time
            .duration_since(UNIX_EPOCH)
            .expect("now is never out of range");
        let nanos: u128 = t.as_nanos();
        let pid = std::process::id();
        let id = next_id();
        Self { nanos, pid, id }
    }
}

impl AsKey for TimeKey {
    fn as_filename_str(&self) -> Cow<'_, str> {
        let Self { nanos, pid, id } = self;
        format!("{nanos}-{pid}-{id}").into()
    }

    fn try_from_filename_str(file_name: &str) -> Option<Self> {
        let (nanos, pid_id) = file_name.split_once('-')?;
        let (pid, id) = pid_id.split_once('-')?;
        let nanos: u128 = nanos.parse().ok()?;
        let pid: u32 = pid.parse().ok()?;
        let id: u64 = id.parse().ok()?;
        Some(Self { nanos, pid, id })
    }
}

pub struct Queue<V: DeserializeOwned + Serialize>(KeyVal<TimeKey, V>);

impl<V: DeserializeOwned + Serialize + 'static> Queue<V> {
    pub fn open(base_dir: impl AsRef<Path>, config: KeyValConfig) -> Result<Self, KeyValError> {
        Ok(Queue(KeyVal::open(base_dir, config)?))
    }

    pub fn lock_exclusive(&self) -> Result<ExclusiveFileLock<'_, File>, KeyValError> {
        self.0.lock_exclusive()
    }
    pub fn lock_shared(&self) -> Result<SharedFileLock<'_, File>, KeyValError> {
        self.0.lock_shared()
    }

    /// Allocates a fresh `TimeKey` and inserts `val` under it,
    /// returning the key so the caller can keep referring to this
    /// entry (e.g. as a `WorkflowId`).
    pub fn push(&self, val: &V) -> Result<TimeKey, KeyValError> {
        let key = TimeKey::now();
        self.0.insert(&key, val, true)?;
        Ok(key)
    }

    pub fn get(&self, key: &TimeKey) -> Result<Option<V>, KeyValError> {
        self.0.get(key)
    }

    /// Get all entries in order of insertion according to hires
    /// system time (assumes correct clocks). The entries are
    /// collected at the time of this method call; entries appearing
    /// after this call are not included, and entries that disappear
    /// concurrently are silently skipped.
    pub fn sorted_entries<'s>(
        &'s self,
        wait_for_entries: bool,
    ) -> impl Iterator<Item = Result<Entry<'s, TimeKey, V>, KeyValError>> + use<'s, V> {
        Gen::new(|co| async move {
            match self.0.sorted_keys(wait_for_entries, None) {
                Ok(keys) => {
                    for key in keys {
                        match self.0.entry_opt(&key) {
                            Ok(Some(entry)) => co.yield_(Ok(entry)).await,
                            Ok(None) => {}
                            Err(error) => co.yield_(Err(error)).await,
                        }
                    }
                }
                Err(error) => {
                    co.yield_(Err(error)).await;
                }
            }
        })
        .into_iter()
    }
}
