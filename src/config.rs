//! Configuration consumed from the process's external collaborators: a
//! socket path, allow-lists of peer user/group ids, and a default TTL.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/secmem.sock")
}

fn default_sweep_period_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: PathBuf,
    pub allowed_uids: HashSet<u32>,
    pub allowed_gids: HashSet<u32>,
    /// Seconds; `0` means "never expires unless a request overrides it".
    pub default_ttl_secs: u64,
    pub sweep_period_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            allowed_uids: HashSet::new(),
            allowed_gids: HashSet::new(),
            default_ttl_secs: 0,
            sweep_period_secs: default_sweep_period_secs(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read { path: path.to_path_buf(), source: e })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse { path: path.to_path_buf(), source: e })
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        if self.default_ttl_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.default_ttl_secs))
        }
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_period_secs.max(1))
    }

    /// ACL decision applied at accept time: each non-empty allow-list must
    /// contain the peer's corresponding id; an empty list imposes no
    /// restriction on that dimension.
    pub fn is_peer_allowed(&self, uid: u32, gid: u32) -> bool {
        let uid_ok = self.allowed_uids.is_empty() || self.allowed_uids.contains(&uid);
        let gid_ok = self.allowed_gids.is_empty() || self.allowed_gids.contains(&gid);
        uid_ok && gid_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_lists_permit_anyone() {
        let cfg = Config::default();
        assert!(cfg.is_peer_allowed(1000, 1000));
    }

    #[test]
    fn uid_allow_list_restricts() {
        let mut cfg = Config::default();
        cfg.allowed_uids.insert(1000);
        assert!(cfg.is_peer_allowed(1000, 5));
        assert!(!cfg.is_peer_allowed(1001, 5));
    }

    #[test]
    fn both_lists_must_pass_when_set() {
        let mut cfg = Config::default();
        cfg.allowed_uids.insert(1000);
        cfg.allowed_gids.insert(200);
        assert!(cfg.is_peer_allowed(1000, 200));
        assert!(!cfg.is_peer_allowed(1000, 999));
    }
}
