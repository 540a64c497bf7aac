//! TOML configuration with environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pipeline_dispatcher::{RetryPolicy, SchedulerConfig};
use pipeline_domain::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseSection,
    pub scheduler: SchedulerSection,
    pub retry: RetrySection,
    pub heartbeat: HeartbeatSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSection::default(),
            scheduler: SchedulerSection::default(),
            retry: RetrySection::default(),
            heartbeat: HeartbeatSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite://pipeline.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub sweep_interval_seconds: u64,
    pub batch_size: i64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 5,
            batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: i64,
    pub base_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_seconds: defaults.base_delay_seconds,
            max_delay_seconds: defaults.max_delay_seconds,
            jitter: defaults.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub timeout_seconds: u64,
    pub queued_timeout_seconds: u64,
    pub check_interval_seconds: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
            queued_timeout_seconds: 600,
            check_interval_seconds: 30,
        }
    }
}

impl AppConfig {
    /// Loads from a TOML file if one is given (or `pipeline.toml`
    /// exists), then applies `PIPELINE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> PipelineResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new("pipeline.toml");
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(url) = std::env::var("PIPELINE_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(interval) = std::env::var("PIPELINE_SWEEP_INTERVAL_SECONDS") {
            config.scheduler.sweep_interval_seconds = interval.parse().map_err(|_| {
                PipelineError::configuration(format!(
                    "PIPELINE_SWEEP_INTERVAL_SECONDS is not a number: {interval}"
                ))
            })?;
        }
        Ok(config)
    }

    fn from_file(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| {
            PipelineError::configuration(format!("cannot parse {}: {e}", path.display()))
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sweep_interval: Duration::from_secs(self.scheduler.sweep_interval_seconds),
            batch_size: self.scheduler.batch_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay_seconds: self.retry.base_delay_seconds,
            max_delay_seconds: self.retry.max_delay_seconds,
            jitter: self.retry.jitter,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.timeout_seconds)
    }

    pub fn queued_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat.queued_timeout_seconds)
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.check_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let config = AppConfig::default();
        assert_eq!(config.database.url, "sqlite://pipeline.db");
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"sqlite::memory:\"\n\n[retry]\nmax_attempts = 5"
        )
        .unwrap();
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.scheduler.sweep_interval_seconds, 5);
    }

    #[test]
    fn bad_toml_is_a_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database\nurl = 3").unwrap();
        assert!(AppConfig::from_file(file.path()).is_err());
    }
}
