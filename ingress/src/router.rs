//! Ingress table
//!
//! Maps each configured hostname to the backend that serves it. Built once
//! at startup and only read afterwards.

use axum::http::uri::{Authority, PathAndQuery, Scheme, Uri};
use std::collections::HashMap;

use crate::config::Config;
use crate::error::{IngressError, Result};
use crate::mapping::HostMapping;

/// Forwarding target for one host: `http://localhost:<port>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    port: u16,
    authority: Authority,
}

impl Backend {
    pub fn new(port: u16) -> Result<Self> {
        let authority = format!("localhost:{}", port)
            .parse()
            .map_err(|e| IngressError::Config(format!("Invalid backend port {}: {}", port, e)))?;
        Ok(Self { port, authority })
    }

    /// Backend port on localhost
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Backend URI for an incoming path and query
    pub fn target_uri(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri> {
        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query.map(PathAndQuery::as_str).unwrap_or("/"))
            .build()
            .map_err(|e| IngressError::BackendUnavailable(format!("Invalid backend URI: {}", e)))
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http://{}", self.authority)
    }
}

/// Hostname to backend table
#[derive(Debug, Clone)]
pub struct IngressTable {
    backends: HashMap<String, Backend>,
    /// Hosts in configuration order
    hosts: Vec<String>,
}

impl IngressTable {
    /// Build the table from host mappings.
    ///
    /// A host listed twice is rejected with [`IngressError::DuplicateHost`].
    pub fn new(mappings: &[HostMapping]) -> Result<Self> {
        let mut backends = HashMap::with_capacity(mappings.len());
        let mut hosts = Vec::with_capacity(mappings.len());

        for mapping in mappings {
            if backends.contains_key(&mapping.host) {
                return Err(IngressError::DuplicateHost(mapping.host.clone()));
            }
            backends.insert(mapping.host.clone(), Backend::new(mapping.target_port)?);
            hosts.push(mapping.host.clone());
        }

        Ok(Self { backends, hosts })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.mappings)
    }

    /// Find the backend for an exact host value
    pub fn lookup(&self, host: &str) -> Option<&Backend> {
        self.backends.get(host)
    }

    /// Mapped hosts in configuration order
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
