//! Shared helpers for ingress integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, Response},
    Router,
};
use http_body_util::BodyExt;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use ingress::acme::{CertificateAuthority, IssuedCertificate};
use ingress::{HostMapping, Ingress, IngressTable};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Start `router` on an ephemeral localhost port and return the port
pub async fn spawn_backend(router: Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

/// Backend that reports what it received and tags its response
pub fn echo_backend(name: &'static str) -> Router {
    Router::new().fallback(move |method: Method, headers: HeaderMap, req: Request<Body>| async move {
        let uri = req.uri().to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let seen = |key: &str| {
            headers
                .get(key)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };

        Response::builder()
            .header("x-backend", name)
            .header(header::SET_COOKIE, "session=abc; Path=/")
            .body(Body::from(format!(
                "{} {} host={} proto={} forwarded-for={} body={}",
                method,
                uri,
                seen("host"),
                seen("x-forwarded-proto"),
                seen("x-forwarded-for"),
                String::from_utf8_lossy(&body)
            )))
            .unwrap()
    })
}

/// Start the ingress over plain HTTP on an ephemeral port
pub async fn spawn_ingress(mappings: &[HostMapping]) -> SocketAddr {
    let table = IngressTable::new(mappings).unwrap();
    let ingress = Arc::new(Ingress::new(table));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        ingress::server::serve_http(listener, ingress).await.unwrap();
    });
    addr
}

pub fn http_client() -> Client<HttpConnector, Body> {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Send a request to `addr` with the given `Host` header
pub async fn send(
    client: &Client<HttpConnector, Body>,
    addr: SocketAddr,
    method: Method,
    host: &str,
    path: &str,
    body: &'static str,
) -> Response<Body> {
    let req = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", addr, path))
        .header(header::HOST, host)
        .body(Body::from(body))
        .unwrap();
    let response = client.request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::new(body))
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Certificate authority backed by a throwaway local CA
pub struct TestCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    issued: AtomicUsize,
}

impl TestCa {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "ingress test CA");
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self {
            ca_cert,
            ca_key,
            issued: AtomicUsize::new(0),
        }
    }

    /// Root store trusting this CA
    pub fn root_store(&self) -> rustls::RootCertStore {
        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(&rustls::Certificate(self.ca_cert.der().to_vec()))
            .unwrap();
        roots
    }

    pub fn count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for TestCa {
    async fn issue(&self, host: &str) -> ingress::Result<IssuedCertificate> {
        self.issued.fetch_add(1, Ordering::SeqCst);

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        Ok(IssuedCertificate {
            cert_chain_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
        })
    }
}
