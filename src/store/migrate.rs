//! Schema initialization and version stamping. There is only one
//! schema version so far; this module exists so a future
//! incompatible change has somewhere to register an upgrade path as
//! on-disk formats evolve.

use std::path::Path;

use crate::error::StoreError;

use super::SCHEMA_VERSION;

fn version_file(root: &Path) -> std::path::PathBuf {
    root.join(".schema-version")
}

pub fn write_schema_version(root: &Path) -> Result<(), StoreError> {
    let path = version_file(root);
    if !path.exists() {
        std::fs::write(&path, SCHEMA_VERSION.to_string()).map_err(|error| {
            StoreError::KeyVal(crate::key_val_fs::key_val::KeyValError::IO {
                base_dir: root.to_owned(),
                path: path.clone(),
                ctx: "writing schema version marker",
                error,
            })
        })?;
    }
    Ok(())
}

pub fn check_schema_version(root: &Path) -> Result<(), StoreError> {
    let path = version_file(root);
    if !path.is_file() {
        return Err(StoreError::NotInitialized {
            path: root.to_owned(),
        });
    }
    let s = std::fs::read_to_string(&path).map_err(|error| {
        StoreError::KeyVal(crate::key_val_fs::key_val::KeyValError::IO {
            base_dir: root.to_owned(),
            path: path.clone(),
            ctx: "reading schema version marker",
            error,
        })
    })?;
    let version: u32 = s
        .trim()
        .parse()
        .map_err(|_| StoreError::NotInitialized { path: root.to_owned() })?;
    if version != SCHEMA_VERSION {
        // No migrations registered yet; a future version bump adds a
        // dispatch to the appropriate upgrade routine here.
        return Err(StoreError::NotInitialized { path: root.to_owned() });
    }
    Ok(())
}
