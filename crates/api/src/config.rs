//! Process configuration, read once from the environment at startup.

use std::time::Duration;

use vantage_infra::pipeline::PipelineConfig;
use vantage_rules::Severity;

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is not valid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    /// Postgres stores when set; in-memory otherwise.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub pipeline: PipelineConfig,
    /// `None` disables card creation from new alerts.
    pub card_spawn_severity: Option<Severity>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            database_url: None,
            database_max_connections: 10,
            pipeline: PipelineConfig::default(),
            card_spawn_severity: Some(Severity::Warning),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`AppConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }

        match lookup("JWT_SECRET") {
            Some(secret) if !secret.is_empty() => config.jwt_secret = secret,
            _ => tracing::warn!("JWT_SECRET not set; using insecure dev default"),
        }

        config.database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());
        if let Some(n) = parse_var(&lookup, "DATABASE_MAX_CONNECTIONS")? {
            config.database_max_connections = n;
        }

        if let Some(size) = parse_var(&lookup, "PIPELINE_LINK_BATCH_SIZE")? {
            config.pipeline = config.pipeline.with_link_batch_size(size);
        }
        if let Some(iterations) = parse_var(&lookup, "PIPELINE_LINK_MAX_ITERATIONS")? {
            config.pipeline = config.pipeline.with_link_max_iterations(iterations);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "PIPELINE_TIME_BUDGET_SECS")? {
            config.pipeline = config.pipeline.with_time_budget(Duration::from_secs(secs));
        }

        if let Some(raw) = lookup("CARD_SPAWN_SEVERITY") {
            config.card_spawn_severity = match raw.trim() {
                "none" | "off" => None,
                other => Some(other.parse::<Severity>().map_err(|reason| ConfigError::Invalid {
                    name: "CARD_SPAWN_SEVERITY",
                    reason,
                })?),
            };
        }

        Ok(config)
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = secret.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_card_spawn_severity(mut self, severity: Option<Severity>) -> Self {
        self.card_spawn_severity = severity;
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.jwt_secret, DEV_JWT_SECRET);
        assert!(config.database_url.is_none());
        assert_eq!(config.pipeline.link_batch_size, 500);
        assert_eq!(config.card_spawn_severity, Some(Severity::Warning));
    }

    #[test]
    fn pipeline_limits_and_severity_are_read() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PIPELINE_LINK_BATCH_SIZE", "100"),
            ("PIPELINE_LINK_MAX_ITERATIONS", "3"),
            ("PIPELINE_TIME_BUDGET_SECS", "10"),
            ("CARD_SPAWN_SEVERITY", "critical"),
            ("DATABASE_URL", ""),
        ]))
        .unwrap();
        assert_eq!(config.pipeline.link_batch_size, 100);
        assert_eq!(config.pipeline.link_max_iterations, 3);
        assert_eq!(config.pipeline.time_budget, Duration::from_secs(10));
        assert_eq!(config.card_spawn_severity, Some(Severity::Critical));
        assert!(config.database_url.is_none());

        let off = AppConfig::from_lookup(lookup(&[("CARD_SPAWN_SEVERITY", "none")])).unwrap();
        assert_eq!(off.card_spawn_severity, None);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PIPELINE_LINK_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PIPELINE_LINK_BATCH_SIZE", .. }));
    }
}
