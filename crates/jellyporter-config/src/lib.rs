pub mod config;
pub mod paths;

pub use config::{
    Config, ConfigError, EventsConfig, ServerConfig, WebhookConfig, DEFAULT_FULL_SYNC_INTERVAL_MINS,
    DEFAULT_METRICS_ADDR, DEFAULT_SYNC_INTERVAL_MINS,
};
pub use paths::config_path;
