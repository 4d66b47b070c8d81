//! # swkit Common
//!
//! Logging setup and configuration loading shared by the swkit crates.

use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Errors raised while loading configuration or setting up logging.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

/// Load a JSON configuration file into `T`.
///
/// Missing fields fall back to whatever `T`'s serde defaults say.
pub fn load_json_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;

    debug!(path = %path.display(), bytes = raw.len(), "Loaded config file");

    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        retries: u32,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".to_string(),
                retries: 3,
            }
        }
    }

    #[test]
    fn test_load_json_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "custom"}}"#).unwrap();

        let sample: Sample = load_json_config(file.path()).unwrap();
        assert_eq!(sample.name, "custom");
        assert_eq!(sample.retries, 3);
    }

    #[test]
    fn test_load_json_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<Sample, _> = load_json_config(dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_json_config_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let result: Result<Sample, _> = load_json_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
