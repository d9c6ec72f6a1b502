//! YAML configuration file.
//!
//! ```yaml
//! address: "AA:BB:CC:DD:EE:FF"
//! scan_timeout: 10s
//! data_dir: data
//! monitor:
//!   interval: 1min
//!   duration: 2h
//!   persist: true
//! timeouts:
//!   response: 3s
//!   cells: 5s
//! ```

use crate::monitor::MonitorConfig;
use crate::tokio_async_client::Timeouts;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_FILE: &str = "b2500.yml";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot open config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Device address or name; the first B2500 found is used if absent.
    pub address: Option<String>,
    #[serde(default = "default_scan_timeout", with = "humantime_serde")]
    pub scan_timeout: Duration,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_scan_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: None,
            scan_timeout: default_scan_timeout(),
            data_dir: default_data_dir(),
            monitor: MonitorConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        log::debug!("Loading config file from {path:?}");
        let file = File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_reader(file).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the explicitly given file, else [`DEFAULT_FILE`] from the working
    /// directory if present, else returns the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, Error> {
        let default_file = Path::new(DEFAULT_FILE);
        match explicit {
            Some(path) => Self::from_file(path),
            None if default_file.exists() => Self::from_file(default_file),
            None => {
                log::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.monitor.interval, Duration::from_secs(60));
        assert_eq!(config.timeouts.cells, Duration::from_secs(5));
    }

    #[test]
    fn full_document() {
        let config: Config = serde_yaml::from_str(
            r#"
address: "AA:BB:CC:DD:EE:FF"
scan_timeout: 5s
data_dir: /var/lib/b2500
monitor:
  interval: 30s
  duration: 2h
  persist: false
timeouts:
  response: 4s
"#,
        )
        .unwrap();

        assert_eq!(config.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(config.scan_timeout, Duration::from_secs(5));
        assert_eq!(config.data_dir, Path::new("/var/lib/b2500"));
        assert_eq!(
            config.monitor,
            MonitorConfig {
                interval: Duration::from_secs(30),
                duration: Some(Duration::from_secs(7200)),
                persist: false,
            }
        );
        assert_eq!(config.timeouts.response, Duration::from_secs(4));
        assert_eq!(config.timeouts.cells, Duration::from_secs(5));
    }

    #[test]
    fn load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monitor:\n  interval: 10s").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.monitor.interval, Duration::from_secs(10));
    }

    #[test]
    fn load_errors() {
        assert_matches!(
            Config::load(Some(Path::new("/nonexistent/b2500.yml"))),
            Err(Error::Io { .. })
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "monitor: [").unwrap();
        assert_matches!(Config::load(Some(file.path())), Err(Error::Yaml { .. }));
    }
}
