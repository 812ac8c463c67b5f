//! Listener bootstrap
//!
//! Development mode serves the dispatcher over plain HTTP on one port.
//! Production mode runs the ACME challenge listener and the TLS listener
//! together; if either stops, the whole server stops.

use axum::{extract::ConnectInfo, http::Request, Router};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::acme::{challenge_router, AcmeChallengeStore, AcmeClient, CertificateStore};
use crate::config::Config;
use crate::error::{IngressError, Result};
use crate::proxy::{ForwardedProto, Ingress};
use crate::tls::CertificateLifecycleManager;

/// Plain HTTP listener used in development mode
pub const DEVELOPMENT_ADDR: &str = "0.0.0.0:8080";

/// ACME challenge listener
pub const CHALLENGE_ADDR: &str = "0.0.0.0:80";

/// TLS listener
pub const TLS_ADDR: &str = "0.0.0.0:443";

/// Bind a listener, reporting the address on failure
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| IngressError::ListenerBind {
            addr: addr.to_string(),
            source,
        })
}

/// Run the development listener on `addr`
pub async fn run_development(ingress: Arc<Ingress>, addr: &str) -> Result<()> {
    let listener = bind(addr).await?;
    info!("Starting ingress at {}", addr);
    log_routes(&ingress);
    serve_http(listener, ingress).await
}

/// Serve the dispatcher over plain HTTP
pub async fn serve_http(listener: TcpListener, ingress: Arc<Ingress>) -> Result<()> {
    let router = ingress.router(ForwardedProto::Http);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Serve ACME HTTP-01 challenges
pub async fn serve_challenges(listener: TcpListener, store: Arc<AcmeChallengeStore>) -> Result<()> {
    axum::serve(listener, challenge_router(store)).await?;
    Ok(())
}

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Serve the dispatcher over TLS, one task per connection.
///
/// Accept errors are logged and the loop carries on; only the caller
/// dropping the future stops it.
pub async fn serve_tls(
    listener: TcpListener,
    certificates: Arc<CertificateLifecycleManager>,
    router: Router,
) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TLS connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                continue;
            }
        };
        let certificates = certificates.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match certificates.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!("TLS handshake failed from {}: {}", peer, e);
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = service_fn(move |mut req: Request<Incoming>| {
                req.extensions_mut().insert(ConnectInfo(peer));
                router.clone().oneshot(req)
            });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!("Error serving connection from {}: {}", peer, e);
            }
        });
    }
}

/// Production server: ACME challenges on one listener, TLS on another
pub struct ProductionServer {
    ingress: Arc<Ingress>,
    certificates: Arc<CertificateLifecycleManager>,
    challenges: Arc<AcmeChallengeStore>,
}

impl ProductionServer {
    pub fn new(
        ingress: Arc<Ingress>,
        certificates: Arc<CertificateLifecycleManager>,
        challenges: Arc<AcmeChallengeStore>,
    ) -> Self {
        Self {
            ingress,
            certificates,
            challenges,
        }
    }

    /// Build the server with an ACME client for the configured CA.
    ///
    /// Fails without a domain or an owner email. Nothing is bound yet.
    pub fn from_config(config: &Config, ingress: Arc<Ingress>) -> Result<Self> {
        if config.domain.is_empty() {
            return Err(IngressError::Config("domain not configured".to_string()));
        }
        let email = config.require_owner_email()?;
        info!("ACME domain: {}", config.domain);

        let challenges = Arc::new(AcmeChallengeStore::new());
        let authority = AcmeClient::new(
            config.acme.directory_url.clone(),
            email.to_string(),
            config.acme.cert_dir.join("account"),
            challenges.clone(),
        );
        let certificates = CertificateLifecycleManager::new(
            &config.domain,
            ingress.table().hosts(),
            Arc::new(authority),
            CertificateStore::new(&config.acme.cert_dir),
        )?;

        Ok(Self::new(ingress, Arc::new(certificates), challenges))
    }

    pub fn certificates(&self) -> &Arc<CertificateLifecycleManager> {
        &self.certificates
    }

    /// Bind both listeners and serve until one of them fails
    pub async fn run(self, challenge_addr: &str, tls_addr: &str) -> Result<()> {
        let challenge_listener = bind(challenge_addr).await?;
        let tls_listener = bind(tls_addr).await?;

        info!("ACME challenges listening on {}", challenge_addr);
        info!("TLS listening on {}", tls_addr);
        info!("Certificate hosts: {:?}", self.certificates.allow_list());
        log_routes(&self.ingress);

        let router = self.ingress.router(ForwardedProto::Https);
        tokio::try_join!(
            serve_challenges(challenge_listener, self.challenges.clone()),
            serve_tls(tls_listener, self.certificates.clone(), router),
            async {
                self.certificates.clone().run_renewal().await;
                Ok::<(), IngressError>(())
            },
        )?;

        Ok(())
    }
}

fn log_routes(ingress: &Ingress) {
    if ingress.table().is_empty() {
        warn!("No routes configured, every request will be refused");
        return;
    }
    info!("Configured routes ({}):", ingress.table().len());
    for host in ingress.table().hosts() {
        if let Some(backend) = ingress.table().lookup(host) {
            info!("  {} -> {}", host, backend);
        }
    }
}
