use common::BridgeConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
    pub max_age: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the admission façade's HTTP API binds to.
    pub host: String,
    pub port: u16,
    /// Address the judge-worker TCP listener binds to.
    pub judge_bind_address: String,
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventConfig {
    /// HMAC-SHA512 key used to derive unguessable per-submission topic names (§4.5, §9).
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub bridge: BridgeConfig,
    pub event: EventConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.judge_bind_address", "0.0.0.0:9999")?
            .set_default("server.cors.allow_origins", Vec::<String>::new())?
            .set_default("server.cors.max_age", 600)?
            .set_default("bridge.handshake_timeout_secs", 15)?
            .set_default("bridge.idle_timeout_secs", 60)?
            .set_default("bridge.ack_timeout_secs", 20)?
            .set_default("bridge.ping_interval_secs", 10)?
            .set_default("bridge.update_rate_limit", 5)?
            .set_default("bridge.update_rate_window_ms", 500)?
            .set_default("bridge.ignore_problems_packet", false)?
            .set_default("bridge.max_frame_bytes", 16 * 1024 * 1024)?
            .set_default("bridge.trusted_proxies", Vec::<String>::new())?
            // Load from config/config.toml
            .add_source(File::with_name("config/config").required(false))
            // Override from environment (e.g., JUDGE__EVENT__SECRET)
            .add_source(Environment::with_prefix("JUDGE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
