//! In-memory certificate authority for TLS termination
//!
//! # Trust model
//!
//! The root is generated at startup, lives only in process memory and is
//! regenerated on every restart. Leaf certificates for endpoint hosts are
//! signed by it on demand. Clients of managed endpoints are expected to
//! have opted out of chain validation (or to trust the exported root),
//! and the frontend itself does not validate backend certificates when it
//! re-dials TLS. This is a development-mode trust decision, not a
//! production PKI.

use crate::error::FrontendError;
use chrono::{Datelike, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::sync::Arc;
use tracing::{debug, info};

/// ALPN protocols offered when terminating TLS
pub const SERVER_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

const ROOT_COMMON_NAME: &str = "vipgate root CA";
const VALIDITY_DAYS: i64 = 365;

/// A leaf certificate chain and its private key
pub struct IssuedCertificate {
    /// Leaf first, then the root
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

pub struct CertificateAuthority {
    root: Certificate,
    root_key: KeyPair,
    issued: DashMap<String, Arc<IssuedCertificate>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("issued", &self.issued.len())
            .finish()
    }
}

/// Set the validity window to start yesterday and last [`VALIDITY_DAYS`]
fn set_validity(params: &mut CertificateParams) {
    let start = Utc::now() - ChronoDuration::days(1);
    let end = start + ChronoDuration::days(VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

fn cert_error(context: &str, e: impl std::fmt::Display) -> FrontendError {
    FrontendError::Certificate(format!("{}: {}", context, e))
}

impl CertificateAuthority {
    /// Generate a fresh self-signed root
    pub fn generate() -> Result<Self, FrontendError> {
        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| cert_error("Failed to generate root key", e))?;

        let mut params =
            CertificateParams::new(Vec::<String>::new()).map_err(|e| cert_error("Invalid root parameters", e))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, ROOT_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "vipgate");
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params);

        let root = params
            .self_signed(&root_key)
            .map_err(|e| cert_error("Failed to self-sign root", e))?;

        info!(common_name = ROOT_COMMON_NAME, "Generated in-memory root certificate");

        Ok(Self {
            root,
            root_key,
            issued: DashMap::new(),
        })
    }

    /// PEM encoding of the root certificate
    pub fn root_pem(&self) -> String {
        self.root.pem()
    }

    /// Server-auth leaf for `common_name`, signed by the root and cached
    pub fn issue_certificate(&self, common_name: &str) -> Result<Arc<IssuedCertificate>, FrontendError> {
        let name = common_name.trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return Err(FrontendError::Certificate(
                "common name must not be empty".to_string(),
            ));
        }

        if let Some(existing) = self.issued.get(&name) {
            return Ok(Arc::clone(existing.value()));
        }

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| cert_error("Failed to generate leaf key", e))?;

        let mut params = CertificateParams::new(vec![name.clone()])
            .map_err(|e| cert_error("Invalid leaf parameters", e))?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.distinguished_name.push(DnType::CommonName, name.as_str());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params);

        let leaf = params
            .signed_by(&key, &self.root, &self.root_key)
            .map_err(|e| cert_error("Failed to sign leaf", e))?;

        let key_der = PrivateKeyDer::try_from(key.serialize_der())
            .map_err(|e| cert_error("Failed to serialize private key", e))?;

        let issued = Arc::new(IssuedCertificate {
            chain: vec![leaf.der().clone(), self.root.der().clone()],
            key: key_der,
        });

        debug!(common_name = %name, "Issued leaf certificate");
        self.issued.insert(name, Arc::clone(&issued));
        Ok(issued)
    }

    /// TLS acceptor configuration for `host`, advertising h2 and http/1.1
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, FrontendError> {
        let issued = self.issue_certificate(host)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(issued.chain.clone(), issued.key.clone_key())
            .map_err(|e| cert_error("TLS configuration error", e))?;
        config.alpn_protocols = SERVER_ALPN.iter().map(|p| p.to_vec()).collect();

        Ok(Arc::new(config))
    }
}

/// Client configuration for re-dialing TLS backends
///
/// Backend certificates are not validated (see the module docs); `alpn`
/// carries the protocol the client negotiated with us, if any.
pub fn backend_client_config(alpn: Option<&[u8]>) -> Arc<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    config.alpn_protocols = alpn.map(|p| vec![p.to_vec()]).unwrap_or_default();

    Arc::new(config)
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
