//! Render queue configuration.

use std::time::Duration;

use render_core::RetentionPolicy;
use storage::{ArtifactStoreConfig, StorageError};
use transcoder::{TranscodeError, TranscoderConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid render config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transcoder(#[from] TranscodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderConfig {
    pub storage: ArtifactStoreConfig,
    pub transcoder: TranscoderConfig,
    /// Concurrency ceiling, fixed for the lifetime of the queue.
    pub max_concurrent: usize,
    pub retention: RetentionPolicy,
    /// How often the retention policy runs.
    pub housekeeping_interval: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            storage: ArtifactStoreConfig::default(),
            transcoder: TranscoderConfig::default(),
            max_concurrent: 2,
            retention: RetentionPolicy::default(),
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}

impl RenderConfig {
    /// Build a config from environment variables.
    ///
    /// - `RENDER_MAX_CONCURRENT` (default: 2, zero is rejected)
    /// - `RENDER_RETENTION_SECS` (default: 3600)
    /// - `RENDER_MAX_FINISHED_JOBS` (default: 1000)
    ///
    /// Storage and transcoder settings are read by their own crates.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self {
            storage: ArtifactStoreConfig::from_env()?,
            transcoder: TranscoderConfig::from_env()?,
            ..Self::default()
        };

        if let Some(n) = parse_env::<usize>("RENDER_MAX_CONCURRENT")? {
            cfg = cfg.with_max_concurrent(n).map_err(|_| {
                ConfigError::InvalidConfig("RENDER_MAX_CONCURRENT must be at least 1".to_string())
            })?;
        }
        if let Some(secs) = parse_env::<u64>("RENDER_RETENTION_SECS")? {
            cfg.retention.max_age = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env::<usize>("RENDER_MAX_FINISHED_JOBS")? {
            cfg.retention.max_finished_jobs = n;
        }

        Ok(cfg)
    }

    /// Set the concurrency ceiling. Zero is rejected.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Result<Self, ConfigError> {
        self.max_concurrent = max_concurrent;
        self.validate()?;
        Ok(self)
    }

    /// Check values that can be set directly on the struct.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var_name: &str) -> Result<Option<T>, ConfigError> {
    let v = match std::env::var(var_name) {
        Ok(v) => v,
        Err(std::env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(ConfigError::InvalidConfig(format!(
                "failed reading {var_name}: {e}"
            )));
        }
    };

    let trimmed = v.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidConfig(format!("invalid number for {var_name}={v}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RenderConfig::default();
        assert_eq!(cfg.max_concurrent, 2);
        assert_eq!(cfg.retention.max_age, Duration::from_secs(3600));
        assert_eq!(cfg.retention.max_finished_jobs, 1000);
        assert_eq!(cfg.storage.output_dir, std::path::PathBuf::from("./data/renders"));
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let err = RenderConfig::default().with_max_concurrent(0).unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        let cfg = RenderConfig::default().with_max_concurrent(3).unwrap();
        assert_eq!(cfg.max_concurrent, 3);
    }

    #[test]
    fn zero_ceiling_set_directly_fails_validation() {
        let cfg = RenderConfig {
            max_concurrent: 0,
            ..RenderConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
