//! Node configuration, read from a JSON file.
//!
//! Every field is optional. Without a file the node keeps its data under the
//! system temp directory and bootstraps a single-member cluster.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Chat database file inside `db_path`.
pub const CHAT_DB_FILE: &str = "chats.redb";
/// Raft state directory inside `db_path` when `cluster_state_path` is unset.
pub const STATE_DIR: &str = "statemachine";

fn default_data_dir() -> PathBuf {
    std::env::temp_dir().join("raspchat")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Client-facing address, reported by `STATUS`. A bare `:port` means
    /// every interface.
    pub bind_address: String,
    /// Daily-rotated log file; logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
    pub db_path: PathBuf,
    /// Raft transport address. Peers must reach this node at exactly this
    /// address.
    pub cluster_bind_address: String,
    /// Existing members of the cluster this node belongs to. Empty means found
    /// a new cluster. Joining is manual: the node does not contact these
    /// peers, so an operator runs `JOIN <cluster_bind_address>` on the leader.
    pub cluster_peers: Vec<String>,
    pub cluster_state_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: ":8080".to_string(),
            log_file: None,
            db_path: default_data_dir(),
            cluster_bind_address: "127.0.0.1:5000".to_string(),
            cluster_peers: Vec::new(),
            cluster_state_path: None,
        }
    }
}

impl AppConfig {
    /// Loads `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// The client bind address with a bare `:port` expanded.
    pub fn client_bind_address(&self) -> String {
        if self.bind_address.starts_with(':') {
            format!("0.0.0.0{}", self.bind_address)
        } else {
            self.bind_address.clone()
        }
    }

    pub fn chat_db_path(&self) -> PathBuf {
        self.db_path.join(CHAT_DB_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.cluster_state_path
            .clone()
            .unwrap_or_else(|| self.db_path.join(STATE_DIR))
    }

    /// True when this node founds the cluster instead of waiting to be added.
    pub fn bootstrap(&self) -> bool {
        self.cluster_peers.is_empty()
    }

    /// Operator instructions for adding a non-founding node at `address`.
    pub fn join_hint(&self, address: &str) -> Option<String> {
        if self.bootstrap() {
            return None;
        }
        Some(format!(
            "run `JOIN {address}` on the leader among {}",
            self.cluster_peers.join(", ")
        ))
    }

    /// Creates the data, raft state and log directories.
    pub fn prepare_dirs(&self) -> Result<()> {
        let mut dirs = vec![self.db_path.clone(), self.state_path()];
        if let Some(parent) = self.log_file.as_deref().and_then(Path::parent) {
            dirs.push(parent.to_path_buf());
        }
        for dir in dirs.iter().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
