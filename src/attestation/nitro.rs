//! AWS Nitro Enclaves attestation verification
//!
//! Verifies COSE_Sign1-wrapped CBOR attestation documents. The flow:
//! 1. Decode the COSE_Sign1 envelope and the inner CBOR document (no trust yet)
//! 2. Pin the chain root: cabundle[0] must byte-equal the AWS Nitro root CA
//! 3. Walk the chain root → intermediates → signing certificate (ECDSA P-384)
//! 4. Verify the COSE_Sign1 signature under the signing certificate's key
//! 5. Compare PCR0 against the caller's expected measurement
//! 6. Bind the enclave's TLS certificate to the document via its user-data hash

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use coset::{CborSerializable, CoseSign1, TaggedCborSerializable};
use p384::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use super::types::{Pcr0, TrustAnchor, PCR0_SIZE};
use crate::error::{Error, Result};

/// AWS Nitro Enclaves root CA (Root-G1). Chains presented in attestation
/// documents must terminate at exactly this certificate.
///
/// To regenerate: download `https://aws-nitro-enclaves.amazonaws.com/AWS_NitroEnclaves_Root-G1.zip`
/// and extract `root.pem`.
const AWS_NITRO_ROOT_CERT_PEM: &str = r#"-----BEGIN CERTIFICATE-----
MIICETCCAZagAwIBAgIRAPkxdWgbkK/hHUbMtOTn+FYwCgYIKoZIzj0EAwMwSTEL
MAkGA1UEBhMCVVMxDzANBgNVBAoMBkFtYXpvbjEMMAoGA1UECwwDQVdTMRswGQYD
VQQDDBJhd3Mubml0cm8tZW5jbGF2ZXMwHhcNMTkxMDI4MTMyODA1WhcNNDkxMDI4
MTQyODA1WjBJMQswCQYDVQQGEwJVUzEPMA0GA1UECgwGQW1hem9uMQwwCgYDVQQL
DANBV1MxGzAZBgNVBAMMEmF3cy5uaXRyby1lbmNsYXZlczB2MBAGByqGSM49AgEG
BSuBBAAiA2IABPwCVOumCMHzaHDimtqQvkY4MpJzbolL//Zy2YlES1BR5TSksfbb
48C8WBoyt7F2Bw7eEtaaP+ohG2bnUs990d0JX28TcPQXCEPZ3BABIeTPYwEoCWZE
h8l5YoQwTcU/9KNCMEAwDwYDVR0TAQH/BAUwAwEB/zAdBgNVHQ4EFgQUkCW1DdkF
R+eWw5b6cp3PmanfS5YwDgYDVR0PAQH/BAQDAgGGMAoGCCqGSM49BAMDA2kAMGYC
MQCjfy+Rocm9Xue4YnwWmNJVA44fA0P5W2OpYow9OYCVRaEevL8uO1XYru5xtMPW
rfMCMQCi85sWBbJwKKXdS6BptQFuZbT73o/gBh1qUxl/nNr12UO8Yfwr6wPLb+6N
IwLz3/Y=
-----END CERTIFICATE-----"#;

fn pinned_root_der() -> Result<Vec<u8>> {
    let b64: String = AWS_NITRO_ROOT_CERT_PEM
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|_| Error::Tls("embedded root certificate failed to decode".into()))
}

/// Inner CBOR payload of an attestation document.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentPayload {
    pub module_id: String,
    pub digest: String,
    pub timestamp: u64,
    /// Measurement register index → hash. PCR0 is always present.
    pub pcrs: BTreeMap<u8, Vec<u8>>,
    /// DER certificate whose key signed the COSE envelope.
    pub certificate: Vec<u8>,
    /// DER chain, root first, ending at the issuer of `certificate`.
    pub cabundle: Vec<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

/// A structurally-decoded (but unverified) attestation document.
#[derive(Debug, Clone)]
pub struct NitroDocument {
    pub(crate) cose: CoseSign1,
    pub payload: DocumentPayload,
}

/// Decode the raw COSE_Sign1 bytes into a structured document.
///
/// Makes no trust decisions; any structural problem is `MalformedEvidence`,
/// distinct from a verification failure.
pub fn decode_document(raw: &[u8]) -> Result<NitroDocument> {
    // The NSM emits an untagged COSE_Sign1 array; some producers tag it (18).
    let cose = CoseSign1::from_tagged_slice(raw)
        .or_else(|_| CoseSign1::from_slice(raw))
        .map_err(|e| Error::MalformedEvidence(format!("invalid COSE_Sign1 envelope: {e}")))?;

    let payload_bytes = cose
        .payload
        .as_ref()
        .ok_or_else(|| Error::MalformedEvidence("COSE_Sign1 payload is missing".into()))?;

    let payload: DocumentPayload = ciborium::de::from_reader(payload_bytes.as_slice())
        .map_err(|e| Error::MalformedEvidence(format!("invalid attestation document CBOR: {e}")))?;

    if payload.digest != "SHA384" {
        return Err(Error::MalformedEvidence(format!(
            "unsupported digest algorithm: {}",
            payload.digest
        )));
    }
    if payload.timestamp == 0 {
        return Err(Error::MalformedEvidence("timestamp must be non-zero".into()));
    }
    if payload.cabundle.is_empty() {
        return Err(Error::MalformedEvidence("cabundle is empty".into()));
    }
    if !payload.pcrs.contains_key(&0) {
        return Err(Error::MalformedEvidence("PCR0 is missing".into()));
    }
    for (idx, value) in &payload.pcrs {
        if value.len() != 32 && value.len() != PCR0_SIZE && value.len() != 64 {
            return Err(Error::MalformedEvidence(format!(
                "PCR{idx} has invalid size: {} bytes",
                value.len()
            )));
        }
    }

    Ok(NitroDocument { cose, payload })
}

/// Verify a decoded document against the pinned AWS Nitro root of trust.
///
/// Pure over its inputs; returns the fingerprint anchor for the enclave
/// certificate on success.
pub fn verify_document(
    document: &NitroDocument,
    expected_pcr0: &Pcr0,
    enclave_cert_der: &[u8],
) -> Result<TrustAnchor> {
    verify_document_with_root(document, expected_pcr0, enclave_cert_der, &pinned_root_der()?)
}

/// Verification against a caller-supplied root certificate (DER).
///
/// Exists so tests can exercise the full chain walk with synthetic
/// certificates; production use goes through [`verify_document`].
pub fn verify_document_with_root(
    document: &NitroDocument,
    expected_pcr0: &Pcr0,
    enclave_cert_der: &[u8],
    root_der: &[u8],
) -> Result<TrustAnchor> {
    verify_signature_chain(document, root_der)?;
    verify_cose_signature(&document.cose, &document.payload.certificate)?;

    let pcr0 = document
        .payload
        .pcrs
        .get(&0)
        .ok_or_else(|| Error::MalformedEvidence("PCR0 is missing".into()))?;
    let expected = expected_pcr0.expected_bytes();
    if pcr0.as_slice() != expected {
        return Err(Error::InvalidPolicyHash {
            expected: hex::encode(expected),
            actual: hex::encode(pcr0),
        });
    }

    // The enclave proves ownership of its TLS certificate by embedding the
    // certificate's hash in the signed document's user-data field.
    let cert_hash = Sha256::digest(enclave_cert_der);
    match &document.payload.user_data {
        Some(bound) if bound.as_slice() == cert_hash.as_slice() => {}
        _ => return Err(Error::CertificateNotBound),
    }

    tracing::debug!(
        module_id = %document.payload.module_id,
        pcr_count = document.payload.pcrs.len(),
        "attestation document verified"
    );

    Ok(TrustAnchor::CertFingerprint {
        sha256_hex: hex::encode(cert_hash),
        cert_der: enclave_cert_der.to_vec(),
    })
}

/// Walk the certificate chain: cabundle[0] must equal the pinned root, each
/// cabundle entry must be signed by its predecessor, and the signing
/// certificate must be signed by the last cabundle entry.
fn verify_signature_chain(document: &NitroDocument, root_der: &[u8]) -> Result<()> {
    let cabundle = &document.payload.cabundle;

    if cabundle[0].as_slice() != root_der {
        return Err(Error::SignatureVerificationFailed(
            "certificate chain does not terminate at the pinned root of trust".into(),
        ));
    }

    let mut chain = Vec::with_capacity(cabundle.len() + 1);
    for der in cabundle {
        chain.push(parse_certificate(der)?);
    }
    chain.push(parse_certificate(&document.payload.certificate)?);

    let now = unix_now()?;
    for cert in &chain {
        verify_validity_window(cert, now)?;
    }

    for pair in chain.windows(2) {
        verify_issued(&pair[0], &pair[1])?;
    }

    Ok(())
}

fn parse_certificate(der: &[u8]) -> Result<Certificate> {
    Certificate::from_der(der)
        .map_err(|e| Error::MalformedEvidence(format!("invalid certificate in document: {e}")))
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::SignatureVerificationFailed("system clock before epoch".into()))?
        .as_secs())
}

fn verify_validity_window(cert: &Certificate, now: u64) -> Result<()> {
    let validity = &cert.tbs_certificate.validity;
    let not_before = validity.not_before.to_unix_duration().as_secs();
    let not_after = validity.not_after.to_unix_duration().as_secs();

    if now < not_before {
        return Err(Error::SignatureVerificationFailed(
            "chain certificate not yet valid".into(),
        ));
    }
    if now > not_after {
        return Err(Error::SignatureVerificationFailed(
            "chain certificate has expired".into(),
        ));
    }
    Ok(())
}

/// Check that `subject` carries a valid signature under `issuer`'s key.
fn verify_issued(issuer: &Certificate, subject: &Certificate) -> Result<()> {
    let issuer_key = extract_p384_key(issuer)?;

    let tbs = subject
        .tbs_certificate
        .to_der()
        .map_err(|e| Error::SignatureVerificationFailed(format!("TBS encode failed: {e}")))?;

    let sig_bytes = subject.signature.as_bytes().ok_or_else(|| {
        Error::SignatureVerificationFailed("certificate signature has unused bits".into())
    })?;
    let signature = Signature::from_der(sig_bytes).map_err(|e| {
        Error::SignatureVerificationFailed(format!("invalid certificate signature: {e}"))
    })?;

    issuer_key.verify(&tbs, &signature).map_err(|_| {
        Error::SignatureVerificationFailed("certificate not signed by its issuer".into())
    })
}

fn extract_p384_key(cert: &Certificate) -> Result<VerifyingKey> {
    let spki = &cert.tbs_certificate.subject_public_key_info;
    let key_bytes = spki.subject_public_key.as_bytes().ok_or_else(|| {
        Error::SignatureVerificationFailed("certificate public key has unused bits".into())
    })?;
    VerifyingKey::from_sec1_bytes(key_bytes)
        .map_err(|e| Error::SignatureVerificationFailed(format!("not a P-384 key: {e}")))
}

/// Verify the COSE_Sign1 signature under the signing certificate's key.
///
/// The NSM emits the signature as raw r‖s (96 bytes); DER-encoded ECDSA
/// signatures are accepted as well.
fn verify_cose_signature(cose: &CoseSign1, signing_cert_der: &[u8]) -> Result<()> {
    let cert = parse_certificate(signing_cert_der)?;
    let key = extract_p384_key(&cert)?;

    let signature = if cose.signature.len() == 96 {
        Signature::from_slice(&cose.signature)
    } else {
        Signature::from_der(&cose.signature)
    }
    .map_err(|e| Error::SignatureVerificationFailed(format!("invalid COSE signature: {e}")))?;

    let tbs = cose.tbs_data(b"");
    key.verify(&tbs, &signature)
        .map_err(|_| Error::SignatureVerificationFailed("COSE_Sign1 signature invalid".into()))
}
