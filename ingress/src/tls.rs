//! TLS certificate lifecycle
//!
//! [`CertificateLifecycleManager`] keeps one certificate per allow-listed
//! host. Certificates come from the on-disk cache when still valid and
//! from the [`CertificateAuthority`] otherwise. The TLS handshake waits
//! for issuance when a host has no usable certificate yet.

use rustls::ServerConfig;
use rustls_pemfile::{certs, read_one, Item};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};
use tokio_rustls::{server::TlsStream, LazyConfigAcceptor};
use tracing::{debug, info, warn};

use crate::acme::{CertificateAuthority, CertificateStore, IssuedCertificate};
use crate::error::{IngressError, Result};

/// Renew certificates this long before they expire
pub const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Interval of the background renewal sweep
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Wait after a failed renewal before asking the CA again
pub const RENEWAL_RETRY_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Connections that send no ClientHello within this are dropped
pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// A certificate ready to be served
struct ActiveCertificate {
    server_config: Arc<ServerConfig>,
    not_after: SystemTime,
}

impl ActiveCertificate {
    fn from_issued(issued: &IssuedCertificate) -> Result<Self> {
        Ok(Self {
            server_config: Arc::new(build_server_config(issued)?),
            not_after: issued.not_after()?,
        })
    }

    fn is_valid(&self, now: SystemTime) -> bool {
        self.not_after > now
    }

    fn needs_renewal(&self, now: SystemTime, renew_before: Duration) -> bool {
        match self.not_after.checked_sub(renew_before) {
            Some(renew_at) => renew_at <= now,
            None => true,
        }
    }
}

/// Keeps certificates for the ingress domain and every mapped host
pub struct CertificateLifecycleManager {
    /// Hosts allowed to obtain certificates, domain first
    allow_list: Vec<String>,
    authority: Arc<dyn CertificateAuthority>,
    store: CertificateStore,
    active: RwLock<HashMap<String, Arc<ActiveCertificate>>>,
    /// Per-host issuance locks
    issuing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Earliest next renewal attempt after a failure
    retry_after: Mutex<HashMap<String, Instant>>,
    renew_before: Duration,
    retry_backoff: Duration,
    client_hello_timeout: Duration,
}

impl CertificateLifecycleManager {
    /// Create a manager for `domain` and the mapped `hosts`.
    ///
    /// Fails when `domain` is empty.
    pub fn new<'a>(
        domain: &str,
        hosts: impl IntoIterator<Item = &'a str>,
        authority: Arc<dyn CertificateAuthority>,
        store: CertificateStore,
    ) -> Result<Self> {
        if domain.is_empty() {
            return Err(IngressError::Config("domain not configured".to_string()));
        }

        let mut allow_list = vec![normalize_host(domain)];
        for host in hosts {
            let host = normalize_host(host);
            if !allow_list.contains(&host) {
                allow_list.push(host);
            }
        }

        Ok(Self {
            allow_list,
            authority,
            store,
            active: RwLock::new(HashMap::new()),
            issuing: Mutex::new(HashMap::new()),
            retry_after: Mutex::new(HashMap::new()),
            renew_before: RENEW_BEFORE,
            retry_backoff: RENEWAL_RETRY_BACKOFF,
            client_hello_timeout: CLIENT_HELLO_TIMEOUT,
        })
    }

    /// Override the renewal window
    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    /// Override the wait between failed renewals
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Override how long a new connection may take to send its ClientHello
    pub fn with_client_hello_timeout(mut self, timeout: Duration) -> Self {
        self.client_hello_timeout = timeout;
        self
    }

    pub fn allow_list(&self) -> &[String] {
        &self.allow_list
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.allow_list.iter().any(|allowed| *allowed == host)
    }

    /// Complete a TLS handshake, choosing the certificate by SNI.
    ///
    /// Hosts outside the allow-list, and handshakes without SNI, are
    /// refused before any certificate is sent.
    pub async fn accept<IO>(self: &Arc<Self>, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = tokio::time::timeout(self.client_hello_timeout, acceptor)
            .await
            .map_err(|_| IngressError::Tls("timed out waiting for ClientHello".to_string()))??;
        let server_name = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .ok_or_else(|| IngressError::Tls("client sent no server name".to_string()))?;

        let config = self.server_config(&server_name).await?;
        Ok(start.into_stream(config).await?)
    }

    /// TLS configuration serving the certificate for `server_name`
    pub async fn server_config(self: &Arc<Self>, server_name: &str) -> Result<Arc<ServerConfig>> {
        let host = normalize_host(server_name);
        if !self.is_allowed(&host) {
            debug!("Refusing certificate for {}", host);
            return Err(IngressError::AccessDenied { host });
        }

        if let Some(active) = self.usable(&host).await {
            return Ok(active.server_config.clone());
        }

        let lock = self.issuance_lock(&host).await;
        let _guard = lock.lock().await;

        // Another handshake may have obtained it while we waited
        if let Some(active) = self.usable(&host).await {
            return Ok(active.server_config.clone());
        }

        match self.store.load(&host) {
            Ok(Some(issued)) => match ActiveCertificate::from_issued(&issued) {
                Ok(active) if active.is_valid(SystemTime::now()) => {
                    debug!("Loaded cached certificate for {}", host);
                    let active = self.activate(&host, active).await;
                    self.renew_in_background(&host, &active);
                    return Ok(active.server_config.clone());
                }
                Ok(_) => info!("Cached certificate for {} has expired", host),
                Err(e) => warn!("Ignoring unusable cached certificate for {}: {}", host, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to read cached certificate for {}: {}", host, e),
        }

        let active = self.issue(&host).await?;
        Ok(active.server_config.clone())
    }

    /// Renew every allow-listed certificate inside the renewal window,
    /// including ones only cached on disk.
    ///
    /// Returns how many were renewed. Failures keep the current
    /// certificate.
    pub async fn renew_due(&self) -> usize {
        let now = SystemTime::now();
        let mut renewed = 0;
        for host in &self.allow_list {
            let Some(current) = self.current(host).await else {
                continue;
            };
            if !current.needs_renewal(now, self.renew_before) {
                continue;
            }

            match self.renew(host).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(e) => warn!("Certificate renewal for {} failed: {}", host, e),
            }
        }
        renewed
    }

    /// Background renewal sweep
    pub async fn run_renewal(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RENEWAL_CHECK_INTERVAL);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let renewed = self.renew_due().await;
            if renewed > 0 {
                info!("Renewed {} certificates", renewed);
            }
        }
    }

    /// Certificate held for `host`, in memory or else on disk
    async fn current(&self, host: &str) -> Option<Arc<ActiveCertificate>> {
        if let Some(active) = self.active.read().await.get(host).cloned() {
            return Some(active);
        }

        let lock = self.issuance_lock(host).await;
        let _guard = lock.try_lock().ok()?;
        match self.store.load(host) {
            Ok(Some(issued)) => match ActiveCertificate::from_issued(&issued) {
                Ok(active) => Some(self.activate(host, active).await),
                Err(e) => {
                    warn!("Ignoring unusable cached certificate for {}: {}", host, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read cached certificate for {}: {}", host, e);
                None
            }
        }
    }

    /// Certificate that is still valid, starting a renewal when due
    async fn usable(self: &Arc<Self>, host: &str) -> Option<Arc<ActiveCertificate>> {
        let active = self.active.read().await.get(host).cloned()?;
        if !active.is_valid(SystemTime::now()) {
            return None;
        }
        self.renew_in_background(host, &active);
        Some(active)
    }

    fn renew_in_background(self: &Arc<Self>, host: &str, active: &ActiveCertificate) {
        if !active.needs_renewal(SystemTime::now(), self.renew_before) {
            return;
        }

        let manager = self.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.renew(&host).await {
                warn!("Certificate renewal for {} failed: {}", host, e);
            }
        });
    }

    /// Returns false when a renewal or issuance is already in flight, or
    /// the last attempt failed less than the retry backoff ago
    async fn renew(&self, host: &str) -> Result<bool> {
        let lock = self.issuance_lock(host).await;
        let Ok(_guard) = lock.try_lock() else {
            return Ok(false);
        };
        if let Some(retry_at) = self.retry_after.lock().await.get(host) {
            if Instant::now() < *retry_at {
                debug!("Renewal for {} backing off after a failure", host);
                return Ok(false);
            }
        }

        let still_due = self
            .active
            .read()
            .await
            .get(host)
            .map_or(true, |cert| cert.needs_renewal(SystemTime::now(), self.renew_before));
        if !still_due {
            return Ok(false);
        }

        info!("Renewing certificate for {}", host);
        // Backoff is recorded before the issuance lock is released
        let result = self.issue(host).await;
        let mut retry_after = self.retry_after.lock().await;
        match result {
            Ok(_) => {
                retry_after.remove(host);
                Ok(true)
            }
            Err(e) => {
                retry_after.insert(host.to_string(), Instant::now() + self.retry_backoff);
                Err(e)
            }
        }
    }

    /// Obtain a fresh certificate; the caller holds the host's issuance lock
    async fn issue(&self, host: &str) -> Result<Arc<ActiveCertificate>> {
        let issued = self.authority.issue(host).await.map_err(|e| {
            warn!("Certificate issuance for {} failed: {}", host, e);
            e
        })?;
        let active = ActiveCertificate::from_issued(&issued).map_err(|e| {
            IngressError::CertificateIssuance {
                host: host.to_string(),
                reason: e.to_string(),
            }
        })?;

        if let Err(e) = self.store.save(host, &issued) {
            warn!("Failed to cache certificate for {}: {}", host, e);
        }
        info!("Certificate for {} issued", host);
        Ok(self.activate(host, active).await)
    }

    async fn activate(&self, host: &str, active: ActiveCertificate) -> Arc<ActiveCertificate> {
        let active = Arc::new(active);
        self.active
            .write()
            .await
            .insert(host.to_string(), active.clone());
        active
    }

    async fn issuance_lock(&self, host: &str) -> Arc<Mutex<()>> {
        let mut locks = self.issuing.lock().await;
        locks.entry(host.to_string()).or_default().clone()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Build a rustls server config for an issued certificate
fn build_server_config(issued: &IssuedCertificate) -> Result<ServerConfig> {
    let chain: Vec<rustls::Certificate> = certs(&mut issued.cert_chain_pem.as_bytes())
        .map_err(|e| IngressError::Tls(format!("Failed to read certificates: {}", e)))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    if chain.is_empty() {
        return Err(IngressError::Tls("No certificates found".to_string()));
    }

    let key = private_key(&issued.private_key_pem)?;

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| IngressError::Tls(format!("TLS config error: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

fn private_key(pem: &str) -> Result<rustls::PrivateKey> {
    let mut reader = pem.as_bytes();
    loop {
        let item = read_one(&mut reader)
            .map_err(|e| IngressError::Tls(format!("Failed to read private key: {}", e)))?;
        match item {
            Some(Item::PKCS8Key(key)) | Some(Item::RSAKey(key)) | Some(Item::ECKey(key)) => {
                return Ok(rustls::PrivateKey(key))
            }
            Some(_) => continue,
            None => return Err(IngressError::Tls("No private key found".to_string())),
        }
    }
}
