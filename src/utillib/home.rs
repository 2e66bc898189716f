use std::path::PathBuf;

use anyhow::{anyhow, Result};

/// The current user's home directory, or an error if it can't be
/// determined (no `HOME` env var and no passwd entry).
pub fn home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("cannot determine home directory: HOME is not set"))
}
