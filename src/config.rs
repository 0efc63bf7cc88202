use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

/// Reserved headroom for Capacity Admission (§4.7); timeouts elsewhere in
/// this struct are the knobs the heartbeat classifier and sweeper read.
#[derive(Debug, Clone, Deserialize)]
pub struct CapacityConfig {
    pub reserved_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub capacity: CapacityConfig,

    pub heartbeat_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub heartbeat_check_interval_secs: u64,
    pub tunnel_token_ttl_secs: u64,
    pub relay_probe_interval_secs: u64,
    pub token_reaper_interval_secs: u64,

    pub jwt_secret: String,
    pub internal_api_key: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Mirrors the teacher's layered-config pattern: typed defaults first, an
    /// optional TOML file second, environment variables (prefix
    /// `TUNNELHUB`, `__` separator) last and therefore highest priority.
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let builder = Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8080)?
            .set_default("environment", "development")?
            .set_default("database.url", "postgres://localhost/tunnelhub")?
            .set_default("database.max_connections", 10)?
            .set_default("cache.enabled", true)?
            .set_default("cache.redis_url", Option::<String>::None)?
            .set_default("capacity.reserved_pct", 20.0)?
            .set_default("heartbeat_timeout_secs", 30)?
            .set_default("idle_timeout_secs", 1800)?
            .set_default("heartbeat_check_interval_secs", 10)?
            .set_default("tunnel_token_ttl_secs", 3600)?
            .set_default("relay_probe_interval_secs", 15)?
            .set_default("token_reaper_interval_secs", 60)?
            .set_default("jwt_secret", "development-only-secret-change-me")?
            .set_default("internal_api_key", "development-only-key-change-me")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(std::path::Path::new(path)).required(false))
            .add_source(Environment::with_prefix("TUNNELHUB").separator("__"));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_secs as i64)
    }

    pub fn tunnel_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tunnel_token_ttl_secs as i64)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_with_defaults_when_no_file_or_env_present() {
        let config = AppConfig::load_from("config/does-not-exist.toml").expect("defaults alone must be sufficient");
        assert_eq!(config.port, 8080);
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.capacity.reserved_pct, 20.0);
    }
}
