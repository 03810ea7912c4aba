//! Resolution of a backend service name to live endpoints.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::DiscoveryError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub base_url: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url)
    }
}

/// Returns live endpoints in preference order; an empty list is an error.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, DiscoveryError>;
}

fn rotate(mut endpoints: Vec<Endpoint>, cursor: &AtomicUsize) -> Vec<Endpoint> {
    if endpoints.len() > 1 {
        let shift = cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        endpoints.rotate_left(shift);
    }
    endpoints
}

/// Fixed service map, rotated round-robin on every lookup.
#[derive(Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<Endpoint>>,
    cursor: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new<S, I, E>(services: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<E>)>,
        S: Into<String>,
        E: Into<String>,
    {
        Self {
            services: services
                .into_iter()
                .map(|(name, urls)| (name.into(), urls.into_iter().map(Endpoint::new).collect()))
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        match self.services.get(service) {
            Some(endpoints) if !endpoints.is_empty() => Ok(rotate(endpoints.clone(), &self.cursor)),
            _ => Err(DiscoveryError::NoEndpoints(service.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: ConsulNode,
    #[serde(rename = "Service")]
    service: ConsulService,
}

#[derive(Deserialize)]
struct ConsulNode {
    #[serde(rename = "Address", default)]
    address: String,
}

#[derive(Deserialize)]
struct ConsulService {
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
}

/// Consul health API lookup of passing instances.
pub struct ConsulDiscovery {
    http: reqwest::Client,
    base: String,
    cursor: AtomicUsize,
}

impl ConsulDiscovery {
    pub fn new(consul_addr: &str) -> Result<Self, DiscoveryError> {
        let base = if consul_addr.starts_with("http://") || consul_addr.starts_with("https://") {
            consul_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", consul_addr.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| DiscoveryError::Lookup {
                service: "consul".into(),
                source: err.into(),
            })?;
        Ok(Self {
            http,
            base,
            cursor: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Discovery for ConsulDiscovery {
    async fn resolve(&self, service: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        let lookup = |source: anyhow::Error| DiscoveryError::Lookup {
            service: service.to_string(),
            source,
        };
        let url = format!("{}/v1/health/service/{service}?passing=true", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| lookup(e.into()))?;
        if !response.status().is_success() {
            return Err(lookup(anyhow::anyhow!("consul returned {}", response.status())));
        }
        let entries: Vec<HealthEntry> = response.json().await.map_err(|e| lookup(e.into()))?;
        let endpoints: Vec<Endpoint> = entries
            .into_iter()
            .map(|entry| {
                let host = if entry.service.address.is_empty() {
                    entry.node.address
                } else {
                    entry.service.address
                };
                Endpoint::new(format!("http://{host}:{}", entry.service.port))
            })
            .collect();
        debug!(service, count = endpoints.len(), "resolved endpoints");
        if endpoints.is_empty() {
            return Err(DiscoveryError::NoEndpoints(service.to_string()));
        }
        Ok(rotate(endpoints, &self.cursor))
    }
}
