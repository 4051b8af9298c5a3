//! Trust-pinned TLS transports
//!
//! Builds the HTTP clients the session moves through, in order of trust:
//! an unauthenticated bootstrap client for fetching self-verifying evidence,
//! then a pinned client bound to the trust anchor that verification produced.
//! Pinning is either by certificate fingerprint (a custom rustls verifier
//! that accepts exactly one certificate) or by installing the enclave
//! certificate as the session's only root CA.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn cert_fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

fn install_provider() {
    // Succeeds once per process; later calls are no-ops.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Certificate verifier that accepts exactly one certificate, identified by
/// its SHA-256 fingerprint. Chain building, hostname checks, and expiry are
/// all bypassed: the attestation document already proved this exact
/// certificate belongs to the verified enclave.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned_sha256_hex: String,
    provider: CryptoProvider,
}

impl PinnedCertVerifier {
    pub fn new(pinned_sha256_hex: String) -> Self {
        Self {
            pinned_sha256_hex,
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fingerprint = cert_fingerprint(end_entity.as_ref());
        if fingerprint == self.pinned_sha256_hex {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: expected {}, got {fingerprint}",
                self.pinned_sha256_hex
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client pinned to a single certificate fingerprint. Every connection it
/// makes must present exactly the attested certificate.
pub fn pinned_client(fingerprint_hex: &str, timeout: Duration) -> Result<Client> {
    install_provider();
    let tls = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(
            fingerprint_hex.to_string(),
        )))
        .with_no_client_auth();

    Client::builder()
        .use_preconfigured_tls(tls)
        .timeout(timeout)
        .build()
        .map_err(Error::from)
}

/// Unauthenticated client used only to fetch attestation evidence.
///
/// Server certificate validation is disabled: the evidence it carries is
/// self-verifying (signed by the hardware root of trust and bound to the
/// presented certificate), so nothing fetched over this channel is trusted
/// until verification accepts it.
pub fn bootstrap_client(timeout: Duration) -> Result<Client> {
    install_provider();
    Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
        .map_err(Error::from)
}

fn webpki_tls_config() -> ClientConfig {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Webpki-validated client for talking to public endpoints (the attester's
/// key-set URL).
pub fn service_client(timeout: Duration) -> Result<Client> {
    install_provider();
    Client::builder()
        .use_preconfigured_tls(webpki_tls_config())
        .timeout(timeout)
        .build()
        .map_err(Error::from)
}

/// Webpki-validated client that enforces the expected enclave hostname.
///
/// With a dial override, connections for `hostname` are routed to `addr`
/// while TLS still validates the certificate against `hostname`; this is how
/// a session dials an IP yet holds the server to its attested name.
pub fn hostname_client(
    hostname: &str,
    dial_addr: Option<SocketAddr>,
    timeout: Duration,
) -> Result<Client> {
    install_provider();
    let mut builder = Client::builder()
        .use_preconfigured_tls(webpki_tls_config())
        .timeout(timeout);
    if let Some(addr) = dial_addr {
        builder = builder.resolve(hostname, addr);
    }
    builder.build().map_err(Error::from)
}

/// Client whose only trusted root is the attested enclave certificate, with
/// hostname validation against `hostname` and connections routed to `addr`.
pub fn ca_client(
    ca_der: &[u8],
    hostname: &str,
    dial_addr: SocketAddr,
    timeout: Duration,
) -> Result<Client> {
    install_provider();
    let root = reqwest::Certificate::from_der(ca_der)?;
    Client::builder()
        .add_root_certificate(root)
        .tls_built_in_root_certs(false)
        .resolve(hostname, dial_addr)
        .timeout(timeout)
        .build()
        .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P384_SHA384};

    fn test_cert_der() -> Vec<u8> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let params = CertificateParams::new(vec!["enclave.test".to_string()]).unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn test_fingerprint_known_vector() {
        // SHA-256 of the empty input.
        assert_eq!(
            cert_fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verifier_accepts_pinned_cert() {
        let der = test_cert_der();
        let verifier = PinnedCertVerifier::new(cert_fingerprint(&der));

        let cert = CertificateDer::from(der);
        let name = ServerName::try_from("enclave.test").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn test_verifier_rejects_other_cert() {
        let pinned = test_cert_der();
        let other = test_cert_der();
        let verifier = PinnedCertVerifier::new(cert_fingerprint(&pinned));

        let cert = CertificateDer::from(other);
        let name = ServerName::try_from("enclave.test").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_verifier_advertises_schemes() {
        let verifier = PinnedCertVerifier::new("00".repeat(32));
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn test_clients_build() {
        let timeout = Duration::from_secs(5);
        assert!(pinned_client(&"ab".repeat(32), timeout).is_ok());
        assert!(bootstrap_client(timeout).is_ok());
        assert!(service_client(timeout).is_ok());
        assert!(hostname_client("enclave.test", None, timeout).is_ok());
    }
}
