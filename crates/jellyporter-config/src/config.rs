use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SYNC_INTERVAL_MINS: u32 = 5;
pub const DEFAULT_FULL_SYNC_INTERVAL_MINS: u32 = 60 * 6;
pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:8972";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no clients configured")]
    NoClients,
    #[error("client {name}: {reason}")]
    Client { name: String, reason: String },
    #[error("sync_interval_mins must be within [5, 1440) but is {0}")]
    SyncInterval(u32),
    #[error("full_sync_interval_mins must be within [30, 1440) but is {0}")]
    FullSyncInterval(u32),
    #[error("full_sync_interval_mins must be divisible by sync_interval_mins but is not")]
    IntervalMismatch,
    #[error("invalid listen address {0:?}, expected host:port")]
    ListenAddr(String),
    #[error("invalid webhook path {0:?}")]
    WebhookPath(String),
    #[error("webhook TLS requires both tls_cert_file and tls_key_file")]
    WebhookTls,
    #[error("could not read api_key_file {path}: {source}")]
    ApiKeyFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub clients: HashMap<String, ServerConfig>,

    #[serde(default)]
    pub events: Option<EventsConfig>,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_mins: u32,
    #[serde(default = "default_full_sync_interval")]
    pub full_sync_interval_mins: u32,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub user: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Resolve the API key, reading `api_key_file` when the inline key is not
    /// set. Validation guarantees one of the two is present.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }

        let path = self.api_key_file.clone().unwrap_or_default();
        let data = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::ApiKeyFile { path, source })?;
        Ok(data.trim().to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub addr: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
}

fn default_sync_interval() -> u32 {
    DEFAULT_SYNC_INTERVAL_MINS
}

fn default_full_sync_interval() -> u32 {
    DEFAULT_FULL_SYNC_INTERVAL_MINS
}

fn default_metrics_addr() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients.is_empty() {
            return Err(ConfigError::NoClients);
        }

        for (name, client) in &self.clients {
            validate_client(name, client)?;
        }

        if self.sync_interval_mins < 5 || self.sync_interval_mins >= 1440 {
            return Err(ConfigError::SyncInterval(self.sync_interval_mins));
        }

        if self.full_sync_interval_mins < 30 || self.full_sync_interval_mins >= 1440 {
            return Err(ConfigError::FullSyncInterval(self.full_sync_interval_mins));
        }

        if self.full_sync_interval_mins % self.sync_interval_mins != 0 {
            return Err(ConfigError::IntervalMismatch);
        }

        validate_listen_addr(&self.metrics_addr)?;

        if let Some(webhook) = self.events.as_ref().and_then(|e| e.webhook.as_ref()) {
            validate_listen_addr(&webhook.addr)?;

            if let Some(path) = &webhook.path {
                if path.len() <= 1 || !path.starts_with('/') {
                    return Err(ConfigError::WebhookPath(path.clone()));
                }
            }

            if webhook.tls_cert_file.is_some() != webhook.tls_key_file.is_some() {
                return Err(ConfigError::WebhookTls);
            }
        }

        Ok(())
    }
}

fn validate_client(name: &str, client: &ServerConfig) -> Result<(), ConfigError> {
    let err = |reason: String| ConfigError::Client {
        name: name.to_string(),
        reason,
    };

    let url = url::Url::parse(&client.url)
        .map_err(|e| err(format!("invalid url {:?}: {}", client.url, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(err(format!("url scheme must be http(s), got {}", url.scheme())));
    }

    if client.user.is_empty() || !client.user.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(err("user must be alphanumeric".to_string()));
    }

    match (&client.api_key, &client.api_key_file) {
        (None, None) => return Err(err("either api_key or api_key_file must be set".to_string())),
        (Some(_), Some(_)) => {
            return Err(err("api_key and api_key_file are mutually exclusive".to_string()))
        }
        (Some(key), None) => {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(err("api_key must be alphanumeric".to_string()));
            }
        }
        (None, Some(_)) => {}
    }

    Ok(())
}

fn validate_listen_addr(addr: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::ListenAddr(addr.to_string());

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_yaml() -> &'static str {
        r#"
database:
  path: /var/lib/jellyporter/db.sqlite
clients:
  dd:
    url: https://jellyfin.example.com
    user: alice
    api_key: abc123
"#
    }

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = parse(minimal_yaml());
        assert_eq!(cfg.sync_interval_mins, 5);
        assert_eq!(cfg.full_sync_interval_mins, 360);
        assert_eq!(cfg.metrics_addr, DEFAULT_METRICS_ADDR);
        assert!(cfg.metrics_path.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_empty_clients() {
        let cfg = parse("database:\n  path: /tmp/db.sqlite\n");
        assert!(matches!(cfg.validate(), Err(ConfigError::NoClients)));
    }

    #[test]
    fn rejects_non_http_url() {
        let mut cfg = parse(minimal_yaml());
        cfg.clients.get_mut("dd").unwrap().url = "ftp://example.com".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Client { .. })));
    }

    #[test]
    fn rejects_non_alphanumeric_user() {
        let mut cfg = parse(minimal_yaml());
        cfg.clients.get_mut("dd").unwrap().user = "al ice".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Client { .. })));
    }

    #[test]
    fn rejects_missing_api_key() {
        let mut cfg = parse(minimal_yaml());
        cfg.clients.get_mut("dd").unwrap().api_key = None;
        assert!(matches!(cfg.validate(), Err(ConfigError::Client { .. })));
    }

    #[test]
    fn rejects_indivisible_intervals() {
        let mut cfg = parse(minimal_yaml());
        cfg.sync_interval_mins = 7;
        cfg.full_sync_interval_mins = 360;
        assert!(matches!(cfg.validate(), Err(ConfigError::IntervalMismatch)));
    }

    #[test]
    fn rejects_out_of_range_intervals() {
        let mut cfg = parse(minimal_yaml());
        cfg.sync_interval_mins = 2;
        assert!(matches!(cfg.validate(), Err(ConfigError::SyncInterval(2))));

        let mut cfg = parse(minimal_yaml());
        cfg.full_sync_interval_mins = 1500;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::FullSyncInterval(1500))
        ));
    }

    #[test]
    fn rejects_bad_metrics_addr() {
        let mut cfg = parse(minimal_yaml());
        cfg.metrics_addr = "no-port".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::ListenAddr(_))));
    }

    #[test]
    fn webhook_validation() {
        let yaml = format!(
            "{}events:\n  webhook:\n    addr: 127.0.0.1:8080\n    path: /hooks/sync\n",
            minimal_yaml()
        );
        parse(&yaml).validate().unwrap();

        let mut cfg = parse(&yaml);
        cfg.events.as_mut().unwrap().webhook.as_mut().unwrap().path = Some("x".to_string());
        assert!(matches!(cfg.validate(), Err(ConfigError::WebhookPath(_))));

        let mut cfg = parse(&yaml);
        cfg.events
            .as_mut()
            .unwrap()
            .webhook
            .as_mut()
            .unwrap()
            .tls_cert_file = Some(PathBuf::from("/tmp/cert.pem"));
        assert!(matches!(cfg.validate(), Err(ConfigError::WebhookTls)));
    }

    #[test]
    fn api_key_file_is_read_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "s3cret42").unwrap();

        let client = ServerConfig {
            url: "http://localhost:8096".to_string(),
            user: "alice".to_string(),
            api_key: None,
            api_key_file: Some(file.path().to_path_buf()),
        };
        assert_eq!(client.api_key().unwrap(), "s3cret42");
    }
}
