use std::path::PathBuf;

use serde::Deserialize;

fn default_overlay_base() -> PathBuf {
    PathBuf::from("/tmp/.bvisor/sb")
}

fn default_symlink_root() -> PathBuf {
    PathBuf::from("/.b")
}

fn default_max_inflight() -> usize {
    8
}

/// Supervisor configuration, deserialized from JSON by the host wrapper.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Fixed sandbox uid (16 lowercase hex chars). Tests pin this to keep
    /// overlay paths deterministic; production leaves it unset.
    #[serde(default)]
    pub sandbox_uid: Option<String>,
    #[serde(default = "default_overlay_base")]
    pub overlay_base: PathBuf,
    #[serde(default = "default_symlink_root")]
    pub symlink_root: PathBuf,
    /// Sliding window of notifications handled in parallel.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_uid: None,
            overlay_base: default_overlay_base(),
            symlink_root: default_symlink_root(),
            max_inflight: default_max_inflight(),
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
