//! ACME (Let's Encrypt) certificate issuance
//!
//! Holds the HTTP-01 challenge store served on port 80, the on-disk
//! certificate cache, and the [`AcmeClient`] that drives orders through
//! `instant-acme`.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{IngressError, Result};

/// Pending HTTP-01 tokens and their key authorizations.
///
/// Written by [`AcmeClient`] while an order is open, read by the port 80
/// listener when the CA comes to validate.
#[derive(Default)]
pub struct AcmeChallengeStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl AcmeChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: &str, key_authorization: &str) {
        self.tokens
            .write()
            .await
            .insert(token.to_string(), key_authorization.to_string());
        debug!(token, "HTTP-01 token published");
    }

    pub async fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        if self.tokens.write().await.remove(token).is_some() {
            debug!(token, "HTTP-01 token withdrawn");
        }
    }
}

/// Router for the plaintext challenge listener.
///
/// Challenge tokens are answered from the store. Other `GET`/`HEAD`
/// requests are redirected to https; anything else gets 400.
pub fn challenge_router(store: Arc<AcmeChallengeStore>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/:token", get(challenge_handler))
        .fallback(redirect_to_https)
        .with_state(store)
}

async fn challenge_handler(
    State(store): State<Arc<AcmeChallengeStore>>,
    UrlPath(token): UrlPath<String>,
) -> Response {
    match store.key_authorization(&token).await {
        Some(authorization) => (
            [(header::CONTENT_TYPE, "text/plain")],
            authorization,
        )
            .into_response(),
        None => {
            debug!("Unknown ACME challenge token: {}", token);
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}

async fn redirect_to_https(req: Request<Body>) -> Response {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return (StatusCode::BAD_REQUEST, "Use HTTPS").into_response();
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("https://{}{}", host, path))],
    )
        .into_response()
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']')) =>
        {
            name
        }
        _ => host,
    }
}

/// A certificate chain and its private key, both PEM encoded
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub private_key_pem: String,
}

impl IssuedCertificate {
    /// Expiry of the leaf certificate
    pub fn not_after(&self) -> Result<SystemTime> {
        use x509_parser::prelude::*;

        for pem in Pem::iter_from_buffer(self.cert_chain_pem.as_bytes()).flatten() {
            if pem.label != "CERTIFICATE" {
                continue;
            }
            let (_, cert) = parse_x509_certificate(&pem.contents)
                .map_err(|e| IngressError::Tls(format!("Failed to parse certificate: {}", e)))?;
            let timestamp = cert.validity().not_after.timestamp();
            return Ok(UNIX_EPOCH + Duration::from_secs(timestamp.max(0) as u64));
        }

        Err(IngressError::Tls("No certificate found in chain".to_string()))
    }
}

/// Something that can obtain a certificate for a hostname
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn issue(&self, host: &str) -> Result<IssuedCertificate>;
}

/// Files holding one host's certificate: `<base>/certs/<host>/{cert,key}.pem`
#[derive(Debug, Clone)]
pub struct CertificateFiles {
    pub dir: PathBuf,
    pub chain: PathBuf,
    pub key: PathBuf,
}

impl CertificateFiles {
    pub fn new(base_dir: &Path, host: &str) -> Self {
        let dir = base_dir.join("certs").join(host);
        Self {
            chain: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            dir,
        }
    }

    /// Both the chain and the key are on disk
    pub fn present(&self) -> bool {
        self.chain.is_file() && self.key.is_file()
    }
}

/// On-disk certificate cache keyed by hostname
#[derive(Debug, Clone)]
pub struct CertificateStore {
    base_dir: PathBuf,
}

impl CertificateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn files(&self, host: &str) -> CertificateFiles {
        CertificateFiles::new(&self.base_dir, host)
    }

    /// Cached certificate for `host`, or `None` if nothing was stored
    pub fn load(&self, host: &str) -> Result<Option<IssuedCertificate>> {
        let files = self.files(host);
        if !files.present() {
            return Ok(None);
        }

        Ok(Some(IssuedCertificate {
            cert_chain_pem: read_pem(&files.chain)?,
            private_key_pem: read_pem(&files.key)?,
        }))
    }

    /// Persist `certificate` for `host`; the key file is owner-only
    pub fn save(&self, host: &str, certificate: &IssuedCertificate) -> Result<()> {
        let files = self.files(host);
        fs::create_dir_all(&files.dir)?;
        write_pem(&files.chain, &certificate.cert_chain_pem)?;
        write_pem(&files.key, &certificate.private_key_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&files.key, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Cached certificate for {} in {}", host, files.dir.display());
        Ok(())
    }
}

fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| IngressError::Tls(format!("Failed to read {}: {}", path.display(), e)))
}

fn write_pem(path: &Path, pem: &str) -> Result<()> {
    fs::write(path, pem)
        .map_err(|e| IngressError::Tls(format!("Failed to write {}: {}", path.display(), e)))
}

/// [`CertificateAuthority`] backed by an ACME directory, validating
/// hosts over HTTP-01
pub struct AcmeClient {
    directory_url: String,
    email: String,
    account_dir: PathBuf,
    challenge_store: Arc<AcmeChallengeStore>,
    /// Loaded or registered on first use
    account: Mutex<Option<Account>>,
    /// Upper bound for validation and signing
    timeout: Duration,
}

impl AcmeClient {
    pub fn new(
        directory_url: String,
        email: String,
        account_dir: PathBuf,
        challenge_store: Arc<AcmeChallengeStore>,
    ) -> Self {
        Self {
            directory_url,
            email,
            account_dir,
            challenge_store,
            account: Mutex::new(None),
            timeout: Duration::from_secs(300),
        }
    }

    /// Load the saved account or register a new one.
    ///
    /// Registration accepts the CA's terms of service.
    async fn account(&self) -> Result<Account> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let credentials_path = self.account_dir.join("credentials.json");
        let account = match self.load_account(&credentials_path).await {
            Ok(Some(account)) => {
                info!("Loaded existing ACME account");
                account
            }
            Ok(None) => self.register_account(&credentials_path).await?,
            Err(e) => {
                warn!("Failed to load ACME account, registering a new one: {}", e);
                self.register_account(&credentials_path).await?
            }
        };

        *guard = Some(account.clone());
        Ok(account)
    }

    async fn load_account(&self, path: &Path) -> Result<Option<Account>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        let credentials: AccountCredentials = serde_json::from_str(&contents)
            .map_err(|e| IngressError::Config(format!("Invalid ACME credentials: {}", e)))?;

        let account = Account::builder()?.from_credentials(credentials).await?;
        Ok(Some(account))
    }

    async fn register_account(&self, path: &Path) -> Result<Account> {
        let contact = format!("mailto:{}", self.email);
        let contacts = [contact.as_str()];
        let new_account = NewAccount {
            contact: &contacts,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::builder()?
            .create(&new_account, self.directory_url.clone(), None)
            .await?;

        fs::create_dir_all(&self.account_dir)?;
        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| IngressError::Config(format!("Failed to serialize credentials: {}", e)))?;
        fs::write(path, json)?;

        info!(
            directory = %self.directory_url,
            id = %account.id(),
            "Registered ACME account"
        );
        Ok(account)
    }

    /// Run one order for `host` through HTTP-01 validation and return
    /// the signed chain and its key
    async fn order_certificate(
        &self,
        host: &str,
        tokens: &mut Vec<String>,
    ) -> Result<IssuedCertificate> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;
                match authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(IngressError::CertificateIssuance {
                            host: host.to_string(),
                            reason: format!("unexpected authorization status {:?}", status),
                        })
                    }
                }

                let mut challenge = authz.challenge(ChallengeType::Http01).ok_or_else(|| {
                    IngressError::CertificateIssuance {
                        host: host.to_string(),
                        reason: "no HTTP-01 challenge offered".to_string(),
                    }
                })?;

                let key_authorization = challenge.key_authorization();
                let token = challenge.token.clone();
                self.challenge_store
                    .insert(&token, key_authorization.as_str())
                    .await;
                tokens.push(token);

                challenge.set_ready().await?;
            }
        }

        let retry = RetryPolicy::new().timeout(self.timeout);
        match order.poll_ready(&retry).await? {
            OrderStatus::Ready => {}
            status => {
                return Err(IngressError::CertificateIssuance {
                    host: host.to_string(),
                    reason: format!("order not ready: {:?}", status),
                })
            }
        }

        let private_key_pem = order.finalize().await?;
        let cert_chain_pem = order.poll_certificate(&retry).await?;

        Ok(IssuedCertificate {
            cert_chain_pem,
            private_key_pem,
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    async fn issue(&self, host: &str) -> Result<IssuedCertificate> {
        info!("Requesting ACME certificate for {}", host);

        let mut tokens = Vec::new();
        let result = self.order_certificate(host, &mut tokens).await;
        for token in &tokens {
            self.challenge_store.remove(token).await;
        }

        result.map_err(|e| match e {
            IngressError::CertificateIssuance { .. } => e,
            other => IngressError::CertificateIssuance {
                host: host.to_string(),
                reason: other.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn self_signed(host: &str) -> IssuedCertificate {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        IssuedCertificate {
            cert_chain_pem: cert.cert.pem(),
            private_key_pem: cert.key_pair.serialize_pem(),
        }
    }

    #[test]
    fn test_certificate_files_layout() {
        let files = CertificateFiles::new(Path::new("/var/lib/ingress"), "a.example");

        assert_eq!(files.dir, PathBuf::from("/var/lib/ingress/certs/a.example"));
        assert_eq!(files.chain, files.dir.join("cert.pem"));
        assert_eq!(files.key, files.dir.join("key.pem"));
        assert!(!files.present());
    }

    #[tokio::test]
    async fn test_tokens_withdrawn() {
        let store = AcmeChallengeStore::new();
        store.insert("tok", "tok.thumbprint").await;
        assert_eq!(store.key_authorization("tok").await.as_deref(), Some("tok.thumbprint"));

        store.remove("tok").await;
        assert!(store.key_authorization("tok").await.is_none());
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        assert!(store.load("a.example").unwrap().is_none());

        let issued = self_signed("a.example");
        store.save("a.example", &issued).unwrap();

        let loaded = store.load("a.example").unwrap().unwrap();
        assert_eq!(loaded.cert_chain_pem, issued.cert_chain_pem);
        assert_eq!(loaded.private_key_pem, issued.private_key_pem);
        assert!(store.load("b.example").unwrap().is_none());
    }

    #[test]
    fn test_not_after() {
        let mut params = rcgen::CertificateParams::new(vec!["a.example".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let issued = IssuedCertificate {
            cert_chain_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
        };
        assert_eq!(
            issued.not_after().unwrap(),
            UNIX_EPOCH + Duration::from_secs(1_609_459_200)
        );
    }

    #[test]
    fn test_not_after_without_certificate() {
        let issued = IssuedCertificate {
            cert_chain_pem: String::new(),
            private_key_pem: String::new(),
        };
        assert!(issued.not_after().is_err());
    }

    #[tokio::test]
    async fn test_challenge_router_serves_token() {
        let store = Arc::new(AcmeChallengeStore::new());
        store.insert("tok", "tok.thumbprint").await;
        let router = challenge_router(store);

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/tok")
            .header(header::HOST, "a.example")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"tok.thumbprint");

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/missing")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_challenge_router_redirects() {
        let router = challenge_router(Arc::new(AcmeChallengeStore::new()));

        let req = Request::builder()
            .uri("/login?next=%2F")
            .header(header::HOST, "a.example:80")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://a.example/login?next=%2F"
        );

        let req = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .header(header::HOST, "a.example")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.example:80"), "a.example");
        assert_eq!(strip_port("a.example"), "a.example");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
