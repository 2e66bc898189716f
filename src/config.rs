use std::path::PathBuf;

use anyhow::Result;
use kstring::KString;
use run_git::path_util::AppendToPath;

use crate::{load_config_file::LoadConfigFile, utillib::home::home_dir};

/// Configuration governing where the store lives on disk and how
/// generated file names are formatted. Loaded the same way as other
/// config files in this family: an explicit `--config` path wins, a
/// home-relative default is tried next, and compiled-in defaults
/// apply if neither exists.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// If not given, `~/.batchflow` is used unless the
    /// `BATCHFLOW_DATA_DIR` environment variable is set.
    data_dir: Option<PathBuf>,

    /// `format!`-style template used when naming generated profile
    /// files; passed through as-is, the store does not interpret it.
    #[serde(default = "default_profile_filename_format")]
    profile_filename_format: KString,
}

fn default_profile_filename_format() -> KString {
    "{task_id}.profile".into()
}

impl Config {
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.data_dir {
            Ok(path.clone())
        } else if let Some(path) = std::env::var_os("BATCHFLOW_DATA_DIR") {
            Ok(PathBuf::from(path))
        } else {
            let home = home_dir()?;
            Ok(home.append(".batchflow"))
        }
    }

    pub fn profile_filename_format(&self) -> &KString {
        &self.profile_filename_format
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            profile_filename_format: default_profile_filename_format(),
        }
    }
}

impl LoadConfigFile for Config {
    fn default_config_path() -> Result<Option<PathBuf>> {
        let home = home_dir()?;
        Ok(Some(home.append(".batchflow.rc")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_default_data_dir_env_override() {
        let config = Config::default();
        std::env::set_var("BATCHFLOW_DATA_DIR", "/tmp/batchflow-test-override");
        let dir = config.data_dir().unwrap();
        std::env::remove_var("BATCHFLOW_DATA_DIR");
        assert_eq!(dir, PathBuf::from("/tmp/batchflow-test-override"));
    }
}
