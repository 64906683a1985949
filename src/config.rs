//! Node configuration.
//!
//! Mirrors the host's `DatabaseConfig`/startup-banner pattern in `main.rs`, trimmed to exactly the
//! keys this core consumes. Loaded from a flat `key = value` file — no TOML crate remains in the
//! dependency set after the trim, and the host's own manifest never carried one either, so this
//! reads the same shape by hand instead of pulling one in for a dozen scalar fields.

use crate::error::{DbError, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `active.log` (every node) and `xa.log` (coordinator only).
    pub log_dir: PathBuf,
    /// Max bytes in an active log file before archival is triggered.
    pub target_log_size: u64,
    /// Idle poll interval for the background flusher, in seconds.
    pub log_clean_sleep_secs: u64,
    /// TCP listener port on every node.
    pub port_number: u16,
    /// Branching factor `k` of the broadcast spanning tree.
    pub max_neighbor_nodes: usize,
    /// Max rows batched per flush group in a DML executor.
    pub max_batch: usize,
    /// Prefetch request size for MDELETE scans.
    pub prefetch_request_size: usize,
    /// Pages requested in advance for MDELETE scans.
    pub pages_in_advance: usize,
    /// Device roots on this node.
    pub data_directories: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/log"),
            target_log_size: 64 * 1024 * 1024,
            log_clean_sleep_secs: 1,
            port_number: 5433,
            max_neighbor_nodes: 4,
            max_batch: 256,
            prefetch_request_size: 8,
            pages_in_advance: 4,
            data_directories: vec![PathBuf::from("./data/dev0")],
        }
    }
}

impl Config {
    /// Parses a flat `key = value` file, one setting per line, `#` comments allowed.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg = Config::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                DbError::Config(format!("{}:{}: expected `key = value`", path.display(), lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();
            cfg.apply(key, value)?;
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let parse_u64 = |v: &str| v.parse::<u64>().map_err(|e| DbError::Config(e.to_string()));
        let parse_usize = |v: &str| v.parse::<usize>().map_err(|e| DbError::Config(e.to_string()));

        match key {
            "log_dir" => self.log_dir = PathBuf::from(value),
            "target_log_size" => self.target_log_size = parse_u64(value)?,
            "log_clean_sleep_secs" => self.log_clean_sleep_secs = parse_u64(value)?,
            "port_number" => {
                self.port_number = value.parse().map_err(|e: std::num::ParseIntError| DbError::Config(e.to_string()))?
            }
            "max_neighbor_nodes" => self.max_neighbor_nodes = parse_usize(value)?,
            "max_batch" => self.max_batch = parse_usize(value)?,
            "prefetch_request_size" => self.prefetch_request_size = parse_usize(value)?,
            "pages_in_advance" => self.pages_in_advance = parse_usize(value)?,
            "data_directories" => {
                self.data_directories = value.split(',').map(|s| PathBuf::from(s.trim())).collect()
            }
            other => return Err(DbError::Config(format!("unknown config key `{other}`"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.max_neighbor_nodes > 0);
        assert!(!cfg.data_directories.is_empty());
    }

    #[test]
    fn loads_flat_key_value_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.conf");
        std::fs::write(
            &path,
            "# comment\nlog_dir = /tmp/rustydb/log\nport_number = 6000\ndata_directories = /d0, /d1\n",
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/rustydb/log"));
        assert_eq!(cfg.port_number, 6000);
        assert_eq!(cfg.data_directories, vec![PathBuf::from("/d0"), PathBuf::from("/d1")]);
    }
}
