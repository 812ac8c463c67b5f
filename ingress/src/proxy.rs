//! Request dispatcher
//!
//! Looks up the request host in the [`IngressTable`] and forwards the
//! request to the matched backend, or answers 403.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, Version},
    response::IntoResponse,
    Router,
};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::IngressError;
use crate::router::IngressTable;

/// HTTP client type for forwarding requests
type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Body>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that only apply to a single connection
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Scheme the client used to reach the ingress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedProto {
    Http,
    Https,
}

impl ForwardedProto {
    fn as_str(self) -> &'static str {
        match self {
            ForwardedProto::Http => "http",
            ForwardedProto::Https => "https",
        }
    }
}

/// Routing table plus the forwarding client shared by every request
pub struct Ingress {
    table: IngressTable,
    client: HttpClient,
}

#[derive(Clone)]
struct DispatchState {
    ingress: Arc<Ingress>,
    proto: ForwardedProto,
}

impl Ingress {
    pub fn new(table: IngressTable) -> Self {
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Self { table, client }
    }

    pub fn table(&self) -> &IngressTable {
        &self.table
    }

    /// Build the Axum router that dispatches every request
    pub fn router(self: &Arc<Self>, proto: ForwardedProto) -> Router {
        Router::new()
            .fallback(dispatch_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(DispatchState {
                ingress: self.clone(),
                proto,
            })
    }

    /// Forward a request to the backend mapped to its host.
    ///
    /// Unmapped hosts get 403 and backend failures get 502. Neither is
    /// retried.
    pub async fn dispatch(
        &self,
        req: Request<Body>,
        peer: Option<SocketAddr>,
        proto: ForwardedProto,
    ) -> Response<Body> {
        let host = request_host(&req);
        let Some(backend) = self.table.lookup(host) else {
            debug!("Rejecting unmapped host {:?}", host);
            return IngressError::AccessDenied {
                host: host.to_string(),
            }
            .into_response();
        };

        let uri = match backend.target_uri(req.uri().path_and_query()) {
            Ok(uri) => uri,
            Err(e) => return e.into_response(),
        };
        let original_host = HeaderValue::from_str(host).ok();
        debug!("Forwarding {} {} to {}", req.method(), host, uri);

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        remove_hop_by_hop(&mut parts.headers);

        if let Some(value) = original_host {
            parts.headers.insert(header::HOST, value.clone());
            parts.headers.insert(X_FORWARDED_HOST, value);
        }
        parts.headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(proto.as_str()),
        );
        if let Some(peer) = peer {
            append_forwarded_for(&mut parts.headers, peer);
        }

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                remove_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                warn!("Backend {} error: {}", backend, e);
                IngressError::BackendUnavailable(e.to_string()).into_response()
            }
        }
    }
}

async fn dispatch_handler(
    State(state): State<DispatchState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response<Body> {
    state
        .ingress
        .dispatch(req, peer.map(|ConnectInfo(addr)| addr), state.proto)
        .await
}

/// Host as presented by the client: the `Host` header, or the URI
/// authority for HTTP/2
fn request_host(req: &Request<Body>) -> &str {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .unwrap_or("")
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named by Connection are hop-by-hop as well
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
