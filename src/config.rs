use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;

/// Settings for a single run of a workflow.
///
/// Loaded from a JSON file, every field optional. Command line flags take
/// precedence over the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// `host:port` of a central scheduler. When unset, the graph runs locally.
    pub scheduler_host: Option<String>,
    /// Size of the local worker pool.
    pub workers: usize,
    /// Default `tracing` filter, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Root directory artifacts are stored under.
    pub storage: Utf8PathBuf,
    /// Where to write the audit report of a local run. The extension picks the
    /// format, see [`Audit::render_for`](crate::Audit::render_for).
    pub audit: Option<Utf8PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scheduler_host: None,
            workers: 1,
            log_level: String::from("info"),
            storage: Utf8PathBuf::from("."),
            audit: None,
        }
    }
}

impl RunConfig {
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_string(), e))?;
        let config: RunConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_string(), e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Workers);
        }

        self.log_level
            .parse::<LevelFilter>()
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, text: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("run.json")).unwrap();
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{ "workers": 4 }"#);

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.scheduler_host, None);
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();

        let path = write(&dir, r#"{ "workers": 0 }"#);
        assert!(matches!(RunConfig::load(&path), Err(ConfigError::Workers)));

        let path = write(&dir, r#"{ "log_level": "loud" }"#);
        assert!(matches!(RunConfig::load(&path), Err(ConfigError::LogLevel(level)) if level == "loud"));

        let path = write(&dir, r#"{ "colour": true }"#);
        assert!(matches!(RunConfig::load(&path), Err(ConfigError::Parse(..))));
    }

    #[test]
    fn test_missing_file() {
        let err = RunConfig::load(Utf8Path::new("/nonexistent/run.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(..)));
    }
}
