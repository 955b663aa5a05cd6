use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono_tz::Tz;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;

use crate::pipeline::PipelineSettings;
use crate::schedule::RetryPolicy;
use crate::service::ServiceSettings;

/// Runtime settings: optional `SparkReports.toml`, then `SPARK_REPORTS__*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_timezone: Tz,
    pub storage_root: PathBuf,
    pub outbox_dir: PathBuf,
    pub fetch_timeout_secs: u64,
    pub render_timeout_secs: u64,
    pub delivery_timeout_secs: u64,
    pub download_ttl_secs: i64,
    pub retry_backoff_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub max_connections: u32,
    pub scheduler_poll_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<AppConfig, ConfigError> {
        Self::builder()?
            .add_source(ConfigFile::with_name("SparkReports").required(false))
            .add_source(Environment::with_prefix("SPARK_REPORTS").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("app_timezone", "UTC")?
            .set_default("storage_root", "./storage")?
            .set_default("outbox_dir", "./storage/outbox")?
            .set_default("fetch_timeout_secs", 120)?
            .set_default("render_timeout_secs", 60)?
            .set_default("delivery_timeout_secs", 60)?
            .set_default("download_ttl_secs", 86_400)?
            .set_default("retry_backoff_secs", 0)?
            .set_default("retry_backoff_max_secs", 3_600)?
            .set_default("max_connections", 5)?
            .set_default("scheduler_poll_secs", 60)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            fetch_timeout: StdDuration::from_secs(self.fetch_timeout_secs),
            render_timeout: StdDuration::from_secs(self.render_timeout_secs),
            timezone: self.app_timezone,
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            timezone: self.app_timezone,
            retry_policy: RetryPolicy::from_secs(self.retry_backoff_secs, self.retry_backoff_max_secs),
        }
    }

    pub fn delivery_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.delivery_timeout_secs)
    }

    pub fn download_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.download_ttl_secs)
    }

    pub fn scheduler_poll(&self) -> StdDuration {
        StdDuration::from_secs(self.scheduler_poll_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file_or_environment() {
        let config: AppConfig = AppConfig::builder()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.app_timezone, Tz::UTC);
        assert_eq!(config.storage_root, PathBuf::from("./storage"));
        assert_eq!(config.download_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.service_settings().retry_policy, RetryPolicy::Immediate);
        assert_eq!(config.pipeline_settings().fetch_timeout, StdDuration::from_secs(120));
    }

    #[test]
    fn overrides_replace_defaults() {
        let config: AppConfig = AppConfig::builder()
            .unwrap()
            .set_override("app_timezone", "America/Chicago")
            .unwrap()
            .set_override("retry_backoff_secs", 30)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.app_timezone, chrono_tz::America::Chicago);
        assert_eq!(
            config.service_settings().retry_policy,
            RetryPolicy::from_secs(30, 3600)
        );
    }
}
