use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub log_cache_ttl_seconds: u64,
    pub log_cache_capacity: u64,
}

/// Engine tunables. Window sizes count builds/days, delays are milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub recent_window: usize,
    pub chart_points: usize,
    pub trend_days: usize,
    pub builds_limit: usize,
    pub performance_limit: usize,
    pub coalesce_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_seconds: 30,
            log_cache_ttl_seconds: 300,
            log_cache_capacity: 256,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            recent_window: 100,
            chart_points: 20,
            trend_days: 14,
            builds_limit: 50,
            performance_limit: 10,
            coalesce_ms: 400,
            backoff_initial_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl DashboardConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

impl Config {
    /// Defaults, then `config.{toml,yaml,json}` if present, then `PULSE__*`
    /// variables, then `PULSE_API_BASE`.
    pub fn new() -> Result<Self, ConfigError> {
        let builder = with_defaults(ConfigLoader::builder())?
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("PULSE").separator("__"))
            .set_override_option("gateway.base_url", std::env::var("PULSE_API_BASE").ok())?;

        let cfg: Config = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.dashboard;
        if d.recent_window == 0
            || d.chart_points == 0
            || d.trend_days == 0
            || d.builds_limit == 0
            || d.performance_limit == 0
        {
            return Err(ConfigError::Message(
                "dashboard windows and limits must be positive".into(),
            ));
        }
        if d.coalesce_ms == 0 {
            return Err(ConfigError::Message("dashboard.coalesce_ms must be positive".into()));
        }
        if d.backoff_initial_ms == 0 || d.backoff_cap_ms < d.backoff_initial_ms {
            return Err(ConfigError::Message(format!(
                "backoff cap ({}ms) must be at least the initial delay ({}ms)",
                d.backoff_cap_ms, d.backoff_initial_ms
            )));
        }
        if url::Url::parse(&self.gateway.base_url).is_err() {
            return Err(ConfigError::Message(format!(
                "gateway.base_url is not a URL: {}",
                self.gateway.base_url
            )));
        }
        Ok(())
    }
}

type Builder = config::ConfigBuilder<config::builder::DefaultState>;

fn with_defaults(builder: Builder) -> Result<Builder, ConfigError> {
    let g = GatewayConfig::default();
    let d = DashboardConfig::default();
    builder
        .set_default("gateway.base_url", g.base_url)?
        .set_default("gateway.timeout_seconds", g.timeout_seconds as i64)?
        .set_default("gateway.log_cache_ttl_seconds", g.log_cache_ttl_seconds as i64)?
        .set_default("gateway.log_cache_capacity", g.log_cache_capacity as i64)?
        .set_default("dashboard.recent_window", d.recent_window as i64)?
        .set_default("dashboard.chart_points", d.chart_points as i64)?
        .set_default("dashboard.trend_days", d.trend_days as i64)?
        .set_default("dashboard.builds_limit", d.builds_limit as i64)?
        .set_default("dashboard.performance_limit", d.performance_limit as i64)?
        .set_default("dashboard.coalesce_ms", d.coalesce_ms as i64)?
        .set_default("dashboard.backoff_initial_ms", d.backoff_initial_ms as i64)?
        .set_default("dashboard.backoff_cap_ms", d.backoff_cap_ms as i64)
}
