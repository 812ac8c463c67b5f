//! Host mapping parser
//!
//! Host mappings are given as `"host1 port1,host2 port2,..."`. Each entry
//! maps a hostname to the local port of its backend.

use std::str::FromStr;

use crate::error::{IngressError, MappingFault, Result};

/// A routable hostname and the local port of its backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMapping {
    /// Hostname matched against the request `Host`
    pub host: String,
    /// Backend port on localhost
    pub target_port: u16,
}

impl HostMapping {
    pub fn new(host: impl Into<String>, target_port: u16) -> Self {
        Self {
            host: host.into(),
            target_port,
        }
    }
}

impl FromStr for HostMapping {
    type Err = MappingFault;

    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = text.split_once(' ').ok_or(MappingFault::MissingSeparator)?;
        if host.is_empty() {
            return Err(MappingFault::EmptyHost);
        }
        let target_port = port.parse().map_err(|_| MappingFault::InvalidPort)?;
        Ok(Self::new(host, target_port))
    }
}

/// Parse a comma separated list of host mappings.
///
/// Fails on the first malformed entry; no partial list is returned. An
/// empty string is one empty entry and therefore an error.
pub fn parse_mappings(text: &str) -> Result<Vec<HostMapping>> {
    text.split(',')
        .enumerate()
        .map(|(index, token)| {
            token
                .parse()
                .map_err(|reason| IngressError::MalformedMapping {
                    index,
                    token: token.to_string(),
                    reason,
                })
        })
        .collect()
}
