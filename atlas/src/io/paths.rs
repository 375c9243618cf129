//! Canonical on-disk layout under a data directory.

use std::path::PathBuf;

/// Default data directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = ".atlas";

/// All canonical paths within a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtlasPaths {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub runs_dir: PathBuf,
    pub knowledge_dir: PathBuf,
}

impl AtlasPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            config_path: data_dir.join("config.toml"),
            runs_dir: data_dir.join("runs"),
            knowledge_dir: data_dir.join("knowledge"),
            data_dir,
        }
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }
}
