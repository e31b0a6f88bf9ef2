//! Authenticated channels to the coordinator.
//!
//! Both the HTTP client and the gRPC channel use mutual TLS with the single client certificate
//! from [`TlsFiles`]. Every request additionally carries a short-lived service-certificate token
//! signed with that certificate's key.

use std::sync::Arc;

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use http::header::{HeaderValue, AUTHORIZATION};
use http::uri::{PathAndQuery, Scheme, Uri};
use rustls_pemfile::Item;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Status;
use tracing::{debug, info};

use crate::config::TlsFiles;
use crate::UpgradeError;

const TOKEN_SCHEME: &str = "ServiceCert";

/// PEM material for the coordinator connection, checked to hold exactly one client certificate.
pub struct TlsMaterial {
    cert_pem: String,
    key_pem: String,
    ca_pem: String,
    cert_der: Vec<u8>,
    key_der: KeyDer,
}

enum KeyDer {
    Pkcs8(Vec<u8>),
    Sec1(Vec<u8>),
}

impl TlsMaterial {
    pub fn load(files: &TlsFiles) -> Result<Self, UpgradeError> {
        let read = |path: &std::path::Path| {
            std::fs::read_to_string(path).map_err(|e| UpgradeError::Tls(format!("reading {}: {}", path.display(), e)))
        };
        Self::from_pem(read(&files.cert)?, read(&files.key)?, read(&files.ca)?)
    }

    pub fn from_pem(cert_pem: String, key_pem: String, ca_pem: String) -> Result<Self, UpgradeError> {
        let mut certs = Vec::new();
        for item in rustls_pemfile::read_all(&mut cert_pem.as_bytes()) {
            if let Item::X509Certificate(cert) = item.map_err(|e| UpgradeError::Tls(format!("parsing client certificate: {}", e)))? {
                certs.push(cert.to_vec());
            }
        }
        if certs.len() != 1 {
            return Err(UpgradeError::Tls(format!(
                "TLS config has unexpected number of client certificates ({}, expected 1)",
                certs.len()
            )));
        }

        let mut key_der = None;
        for item in rustls_pemfile::read_all(&mut key_pem.as_bytes()) {
            match item.map_err(|e| UpgradeError::Tls(format!("parsing client key: {}", e)))? {
                Item::Pkcs8Key(k) => key_der = Some(KeyDer::Pkcs8(k.secret_pkcs8_der().to_vec())),
                Item::Sec1Key(k) => key_der = Some(KeyDer::Sec1(k.secret_sec1_der().to_vec())),
                _ => {}
            }
        }
        let key_der = key_der.ok_or_else(|| UpgradeError::Tls("no EC private key found for client certificate".into()))?;

        Ok(Self { cert_pem, key_pem, ca_pem, cert_der: certs.remove(0), key_der })
    }
}

/// Signs service-certificate tokens with the client certificate's key.
pub struct ServiceCertSigner {
    cert_der: Vec<u8>,
    key: EcdsaKeyPair,
    rng: SystemRandom,
}

impl ServiceCertSigner {
    fn new(material: &TlsMaterial) -> Result<Self, UpgradeError> {
        let key = match &material.key_der {
            KeyDer::Pkcs8(der) => EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, der),
            KeyDer::Sec1(der) => EcdsaKeyPair::from_private_key_der(&ECDSA_P256_SHA256_ASN1_SIGNING, der),
        }
        .map_err(|e| UpgradeError::Tls(format!("loading client key: {}", e)))?;
        Ok(Self { cert_der: material.cert_der.clone(), key, rng: SystemRandom::new() })
    }

    /// A token binding the certificate to the current time: `<payload>.<signature>`.
    pub fn token(&self) -> Result<String, UpgradeError> {
        let payload = serde_json::json!({
            "certificate": STANDARD.encode(&self.cert_der),
            "issuedAt": chrono::Utc::now().timestamp(),
        });
        let payload = serde_json::to_vec(&payload).map_err(|e| UpgradeError::Tls(e.to_string()))?;
        let signature = self
            .key
            .sign(&self.rng, &payload)
            .map_err(|_| UpgradeError::Tls("signing service certificate token".into()))?;
        Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), URL_SAFE_NO_PAD.encode(signature.as_ref())))
    }
}

/// Adds the service-certificate token to every outgoing gRPC call. Calls made after the
/// upgrade is cancelled fail without reaching the network.
#[derive(Clone)]
pub struct ServiceCertInterceptor {
    signer: Arc<ServiceCertSigner>,
    cancel: CancellationToken,
}

impl Interceptor for ServiceCertInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled("upgrade cancelled"));
        }
        let token = self.signer.token().map_err(|e| Status::unauthenticated(e.to_string()))?;
        let value: MetadataValue<Ascii> = format!("{} {}", TOKEN_SCHEME, token)
            .parse()
            .map_err(|_| Status::internal("service certificate token is not valid metadata"))?;
        req.metadata_mut().insert("authorization", value);
        Ok(req)
    }
}

pub type CoordinatorChannel = InterceptedService<Channel, ServiceCertInterceptor>;

pub struct Coordinator {
    endpoint: String,
    http: reqwest::Client,
    channel: Channel,
    signer: Arc<ServiceCertSigner>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Set up both channels. The gRPC channel connects lazily on first use.
    pub fn connect(endpoint: &str, tls: Option<&TlsFiles>, cancel: CancellationToken) -> Result<Self, UpgradeError> {
        let (host, _) = endpoint
            .rsplit_once(':')
            .filter(|(h, p)| !h.is_empty() && p.parse::<u16>().is_ok())
            .ok_or_else(|| UpgradeError::Coordinator(format!("parsing coordinator endpoint {:?}: expected host:port", endpoint)))?;
        let files = tls.ok_or_else(|| UpgradeError::Tls("no client certificate configured".into()))?;
        let material = TlsMaterial::load(files)?;
        let signer = Arc::new(ServiceCertSigner::new(&material)?);

        let identity = reqwest::Identity::from_pem(format!("{}\n{}", material.cert_pem, material.key_pem).as_bytes())
            .map_err(|e| UpgradeError::Tls(format!("client identity: {}", e)))?;
        let ca = reqwest::Certificate::from_pem(material.ca_pem.as_bytes())
            .map_err(|e| UpgradeError::Tls(format!("CA certificate: {}", e)))?;
        // HTTP/1 only: the gRPC channel is separate.
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .add_root_certificate(ca)
            .http1_only()
            .build()
            .map_err(|e| UpgradeError::Tls(format!("building HTTP client: {}", e)))?;

        let tls_config = ClientTlsConfig::new()
            .identity(Identity::from_pem(&material.cert_pem, &material.key_pem))
            .ca_certificate(Certificate::from_pem(&material.ca_pem))
            .domain_name(host);
        let channel = Channel::from_shared(format!("https://{}", endpoint))
            .map_err(|e| UpgradeError::Coordinator(e.to_string()))?
            .tls_config(tls_config)
            .map_err(|e| UpgradeError::Coordinator(format!("failed to initialize gRPC connection: {}", e)))?
            .connect_lazy();

        info!(endpoint, "coordinator channels configured");
        Ok(Self { endpoint: endpoint.to_string(), http, channel, signer, cancel })
    }

    pub fn grpc(&self) -> CoordinatorChannel {
        let interceptor = ServiceCertInterceptor { signer: Arc::clone(&self.signer), cancel: self.cancel.clone() };
        InterceptedService::new(self.channel.clone(), interceptor)
    }

    /// Send `req`, resolving a relative URI against the endpoint over HTTPS.
    pub async fn execute(&self, mut req: http::Request<Vec<u8>>) -> Result<reqwest::Response, UpgradeError> {
        *req.uri_mut() = resolve_uri(req.uri(), &self.endpoint)?;
        let token = self.signer.token()?;
        let value = HeaderValue::from_str(&format!("{} {}", TOKEN_SCHEME, token))
            .map_err(|e| UpgradeError::Tls(format!("service certificate token header: {}", e)))?;
        req.headers_mut().insert(AUTHORIZATION, value);
        debug!(method = %req.method(), uri = %req.uri(), "coordinator request");

        let req = reqwest::Request::try_from(req).map_err(UpgradeError::Http)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UpgradeError::Cancelled),
            res = self.http.execute(req) => res.map_err(UpgradeError::Http),
        }
    }
}

/// Fill in the `https` scheme and the coordinator endpoint for a relative URI.
pub fn resolve_uri(uri: &Uri, endpoint: &str) -> Result<Uri, UpgradeError> {
    let mut parts = uri.clone().into_parts();
    if parts.scheme.is_none() {
        parts.scheme = Some(Scheme::HTTPS);
    }
    if parts.authority.is_none() {
        parts.authority = Some(
            endpoint
                .parse()
                .map_err(|e| UpgradeError::Coordinator(format!("parsing coordinator endpoint {:?}: {}", endpoint, e)))?,
        );
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    Uri::from_parts(parts).map_err(|e| UpgradeError::Coordinator(format!("building request URI: {}", e)))
}
