//! ingress: host-based HTTP/HTTPS ingress with automatic TLS
//!
//! Routes each request by its `Host` header to a backend on
//! `localhost:<port>`. In production mode certificates for the ingress
//! domain and every mapped host are obtained from an ACME CA (HTTP-01)
//! and renewed automatically.
//!
//! # Configuration
//!
//! ```text
//! INGRESS_DOMAIN=ingress.example.com
//! INGRESS_HOSTMAPPINGS="app.example.com 3000,api.example.com 8081"
//! INGRESS_OWNER_EMAIL=admin@example.com   # production only
//! INGRESS_CERT_DIR=certs                  # optional
//! ```
//!
//! Hosts not listed in `INGRESS_HOSTMAPPINGS` get `403 Forbidden`.

pub mod acme;
pub mod config;
pub mod error;
pub mod mapping;
pub mod proxy;
pub mod router;
pub mod server;
pub mod tls;

pub use config::{Config, Settings};
pub use error::{IngressError, Result};
pub use mapping::{parse_mappings, HostMapping};
pub use proxy::Ingress;
pub use router::IngressTable;
pub use server::ProductionServer;
pub use tls::CertificateLifecycleManager;
