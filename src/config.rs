use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a JSON config file; defaults apply without it.
pub const CONFIG_ENV_VAR: &str = "LINK_CHECKER_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Runtime settings. All intervals are whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between table reconciliations against the identifier store.
    pub table_update_cycle: u64,

    /// Blackout window for links whose last probe succeeded.
    pub good_recheck_min_interval: u64,

    /// Shorter blackout window for links whose last probe failed.
    pub bad_recheck_min_interval: u64,

    /// Minimum gap between consecutive probes of one owner's links.
    pub owner_revisit_min_interval: u64,

    /// Parallel probe workers per round.
    pub num_workers: usize,

    /// Maximum links loaded per owner per round.
    pub workset_owner_max_links: usize,

    /// Per-fetch timeout in seconds.
    pub check_timeout: u64,

    /// Literal User-Agent header value.
    pub user_agent: String,

    /// Maximum bytes of response body to retain.
    pub max_read: usize,

    /// Trailing-failure count at which a link becomes notification-worthy.
    /// Also sizes each row's verdict history.
    pub notification_threshold: usize,

    /// Minimum seconds between the oldest trailing failure and now before a
    /// link becomes notification-worthy.
    pub notification_min_span: u64,

    /// Directory holding the row store and logs.
    pub data_dir: String,

    /// JSONL export of the authoritative identifier store.
    pub source_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_update_cycle: 604_800,          // weekly
            good_recheck_min_interval: 2_592_000, // 30 days
            bad_recheck_min_interval: 172_800,    // 2 days
            owner_revisit_min_interval: 5,
            num_workers: 6,
            workset_owner_max_links: 500,
            check_timeout: 30,
            user_agent: "link-checker/0.1".to_string(),
            max_read: 10 * 1024 * 1024,
            notification_threshold: 7,
            notification_min_span: 2_592_000, // 30 days
            data_dir: "./data".to_string(),
            source_path: "./data/identifiers.jsonl".to_string(),
        }
    }
}

impl Config {
    /// Load from the file named by `LINK_CHECKER_CONFIG`, or defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load from a JSON file. Absent keys fall back to their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout)
    }

    pub fn owner_revisit_min_interval(&self) -> Duration {
        Duration::from_secs(self.owner_revisit_min_interval)
    }

    pub fn table_update_cycle(&self) -> Duration {
        Duration::from_secs(self.table_update_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.num_workers > 0);
        assert!(cfg.workset_owner_max_links > 0);
        assert!(cfg.bad_recheck_min_interval < cfg.good_recheck_min_interval);
        assert!(cfg.max_read > 0);
        assert!(cfg.notification_threshold > 0);
    }

    #[test]
    fn test_partial_file_overrides() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"num_workers": 12, "check_timeout": 5}}"#).unwrap();
        let cfg = Config::from_file(f.path()).unwrap();
        assert_eq!(cfg.num_workers, 12);
        assert_eq!(cfg.check_timeout, 5);
        // Untouched keys keep their defaults
        assert_eq!(cfg.workset_owner_max_links, 500);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        assert!(matches!(
            Config::from_file(f.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
