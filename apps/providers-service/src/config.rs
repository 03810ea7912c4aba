//! Service configuration: defaults, then an optional YAML file, then CLI flags
//! and environment variables.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use imp_rpc::{BreakerSettings, RetryPolicy, RpcSettings};
use imp_telemetry::LogSettings;
use serde::Deserialize;

use crate::dispatcher::{DispatchSettings, PanicPolicy};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
    #[error("missing required config key `{0}`")]
    Missing(&'static str),
    #[error("invalid config key `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Overrides taken from the command line or the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(long = "config-file", env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
    #[arg(long = "service-id", env = "SERVICE_ID")]
    pub service_id: Option<String>,
    #[arg(long = "http-addr", env = "SERVICE_HTTP_ADDR")]
    pub http_addr: Option<SocketAddr>,
    /// Message broker URL (nats:// or tls://)
    #[arg(long = "broker-url", env = "PUBSUB_BROKER_URL")]
    pub broker_url: Option<String>,
    #[arg(long = "consul-addr", env = "CONSUL_ADDR")]
    pub consul_addr: Option<String>,
    #[arg(long = "log-level", env = "LOG_LEVEL")]
    pub log_level: Option<String>,
    #[arg(long = "log-json", env = "LOG_JSON")]
    pub log_json: Option<bool>,
    #[arg(long = "log-file", env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
    #[arg(long = "panic-policy", env = "DISPATCH_PANIC_POLICY", value_enum)]
    pub panic_policy: Option<PanicPolicy>,
    /// Comma-separated provider keys to host
    #[arg(long = "providers", env = "PROVIDERS", value_delimiter = ',')]
    pub providers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceSection {
    pub id: String,
    pub http_addr: SocketAddr,
    #[serde(deserialize_with = "duration::deserialize")]
    pub shutdown_grace: Duration,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PubSubSection {
    pub broker_url: String,
    /// Topic exchange the dispatcher queues bind to. Core NATS has no
    /// exchanges, so over NATS only the routing keys select messages.
    pub exchange: String,
}

impl Default for PubSubSection {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            exchange: imp_core::OUTBOUND_EXCHANGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiscoverySection {
    pub consul_addr: Option<String>,
    /// Static service name to base URL list.
    pub endpoints: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RpcSection {
    pub max_attempts: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub initial_backoff: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_backoff: Duration,
    pub failure_threshold: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub failure_window: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub open_duration: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub call_timeout: Duration,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RpcSection {
    pub fn settings(&self) -> RpcSettings {
        RpcSettings {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: self.initial_backoff,
                max_backoff: self.max_backoff,
            },
            breaker: BreakerSettings {
                failure_threshold: self.failure_threshold,
                failure_window: self.failure_window,
                open_duration: self.open_duration,
            },
            call_timeout: self.call_timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub service: ServiceSection,
    pub log: LogSettings,
    pub pubsub: PubSubSection,
    pub dispatch: DispatchSettings,
    pub discovery: DiscoverySection,
    pub rpc: RpcSection,
    pub providers: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service: ServiceSection::default(),
            log: LogSettings::default(),
            pubsub: PubSubSection::default(),
            dispatch: DispatchSettings::default(),
            discovery: DiscoverySection::default(),
            rpc: RpcSection::default(),
            providers: vec!["facebook".into(), "whatsapp".into()],
        }
    }
}

impl ServiceConfig {
    pub fn load(args: &ConfigArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_bw::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply(&mut self, args: &ConfigArgs) {
        if let Some(id) = &args.service_id {
            self.service.id = id.clone();
        }
        if let Some(addr) = args.http_addr {
            self.service.http_addr = addr;
        }
        if let Some(url) = &args.broker_url {
            self.pubsub.broker_url = url.clone();
        }
        if let Some(consul) = &args.consul_addr {
            self.discovery.consul_addr = Some(consul.clone());
        }
        if let Some(level) = &args.log_level {
            self.log.level = level.clone();
        }
        if let Some(json) = args.log_json {
            self.log.json = json;
        }
        if let Some(file) = &args.log_file {
            self.log.file = Some(file.clone());
        }
        if let Some(policy) = args.panic_policy {
            self.dispatch.panic_policy = policy;
        }
        if let Some(providers) = &args.providers {
            self.providers = providers.iter().map(|p| p.trim().to_string()).collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.id.trim().is_empty() {
            return Err(ConfigError::Missing("service.id"));
        }
        let url = self.pubsub.broker_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Missing("pubsub.broker_url"));
        }
        if !(url.starts_with("nats://") || url.starts_with("tls://")) {
            return Err(ConfigError::Invalid {
                key: "pubsub.broker_url",
                reason: format!("`{url}` must use the nats:// or tls:// scheme"),
            });
        }
        if self.pubsub.exchange.trim().is_empty() {
            return Err(ConfigError::Missing("pubsub.exchange"));
        }
        if self.providers.is_empty() {
            return Err(ConfigError::Missing("providers"));
        }
        let mut seen = HashSet::new();
        for key in &self.providers {
            if key.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "providers",
                    reason: "provider keys must not be empty".into(),
                });
            }
            if !seen.insert(key.as_str()) {
                return Err(ConfigError::Invalid {
                    key: "providers",
                    reason: format!("duplicate provider `{key}`"),
                });
            }
        }
        if self.dispatch.handler_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "dispatch.handler_timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.rpc.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "rpc.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.rpc.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "rpc.failure_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if matches!(&self.discovery.consul_addr, Some(addr) if addr.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                key: "discovery.consul_addr",
                reason: "must not be blank".into(),
            });
        }
        Ok(())
    }
}

/// Durations written as `250ms`, `2s`, `5m`, `1h`, or a bare number of seconds.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, unit) = raw.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration `{raw}`"))?;
        match unit.trim() {
            "ms" => Ok(Duration::from_millis(value)),
            "" | "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            other => Err(format!("unknown duration unit `{other}` in `{raw}`")),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
