//! Configuration for the ingress
//!
//! [`Settings`] is read from `INGRESS_*` environment variables and turned
//! into a validated [`Config`]. Nothing past this module reads the
//! environment.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{IngressError, Result};
use crate::mapping::{parse_mappings, HostMapping};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Validated ingress configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Public hostname of the ingress itself
    pub domain: String,
    /// ACME account contact, required in production
    pub owner_email: Option<String>,
    /// Host mappings in configuration order
    pub mappings: Vec<HostMapping>,
    /// Certificate authority settings
    pub acme: AcmeConfig,
}

/// Certificate authority settings
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// ACME directory URL
    pub directory_url: String,
    /// On-disk certificate cache
    pub cert_dir: PathBuf,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            cert_dir: PathBuf::from("certs"),
        }
    }
}

impl Config {
    pub fn new(domain: impl Into<String>, mappings: Vec<HostMapping>) -> Self {
        Self {
            domain: domain.into(),
            owner_email: None,
            mappings,
            acme: AcmeConfig::default(),
        }
    }

    /// Owner email, or a configuration error when unset
    pub fn require_owner_email(&self) -> Result<&str> {
        self.owner_email
            .as_deref()
            .filter(|email| !email.is_empty())
            .ok_or_else(|| IngressError::Config("INGRESS_OWNER_EMAIL not set".to_string()))
    }
}

/// Raw settings as found in the environment
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    pub domain: Option<String>,
    pub hostmappings: Option<String>,
    pub owner_email: Option<String>,
    pub cert_dir: Option<PathBuf>,
    pub acme_directory: Option<String>,
    #[serde(default)]
    pub acme_staging: bool,
}

impl Settings {
    /// Load settings from `INGRESS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("INGRESS"))
    }

    /// Load settings from an environment source
    pub fn from_source(source: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| IngressError::Config(format!("Failed to read settings: {}", e)))
    }

    /// Validate the settings and parse the host mappings
    pub fn into_config(self) -> Result<Config> {
        let domain = non_empty(self.domain)
            .ok_or_else(|| IngressError::Config("INGRESS_DOMAIN not set".to_string()))?;
        let mappings_text = non_empty(self.hostmappings)
            .ok_or_else(|| IngressError::Config("INGRESS_HOSTMAPPINGS not set".to_string()))?;
        let mappings = parse_mappings(&mappings_text)?;

        let mut acme = AcmeConfig::default();
        if let Some(url) = non_empty(self.acme_directory) {
            acme.directory_url = url;
        } else if self.acme_staging {
            acme.directory_url = LETS_ENCRYPT_STAGING.to_string();
        }
        if let Some(dir) = self.cert_dir {
            acme.cert_dir = dir;
        }

        Ok(Config {
            domain,
            owner_email: non_empty(self.owner_email),
            mappings,
            acme,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
