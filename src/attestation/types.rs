//! Core types for attestation verification

use rand::RngCore;
use serde::Deserialize;

use super::nitro::NitroDocument;
use crate::error::{Error, Result};

/// Size of a PCR0 measurement in bytes (SHA-384 of the boot image).
pub const PCR0_SIZE: usize = 48;

/// Decoded attestation evidence, tagged by platform.
///
/// Produced by the platform codecs; no part of it is trusted until
/// [`crate::attestation::verify`] has accepted it against an
/// [`ExpectedPolicy`].
#[derive(Debug, Clone)]
pub enum AttestationEvidence {
    /// A COSE_Sign1-wrapped hardware attestation document plus the enclave's
    /// presented TLS certificate (DER), fetched separately.
    HardwareDocument {
        document: NitroDocument,
        enclave_cert_der: Vec<u8>,
    },

    /// A signed token from a cloud attestation service, together with the
    /// key set fetched from the attester's published key-set URL.
    ServiceToken { token: String, keys: KeySet },
}

/// Caller-supplied expectation the evidence must satisfy.
#[derive(Debug, Clone)]
pub enum ExpectedPolicy {
    /// Expected PCR0 measurement for the hardware-document platform.
    NitroPcr0(Pcr0),

    /// CCE policy document (base64) for the service-token platform; its
    /// SHA-256 digest must match the token's policy-hash claim. The
    /// attester host is the identity the token's key-set URL must match.
    MaaCcePolicy {
        document_b64: Vec<u8>,
        attester_host: String,
    },
}

impl ExpectedPolicy {
    pub fn nitro_pcr0(pcr0: Pcr0) -> Self {
        ExpectedPolicy::NitroPcr0(pcr0)
    }

    pub fn maa_cce_policy(document_b64: impl Into<Vec<u8>>, attester_host: impl Into<String>) -> Self {
        ExpectedPolicy::MaaCcePolicy {
            document_b64: document_b64.into(),
            attester_host: attester_host.into(),
        }
    }
}

/// Expected PCR0 value.
///
/// The all-zero expectation matches an enclave booted in debug mode and is
/// deliberately a separate variant: it can only be selected explicitly,
/// never by defaulting or by passing zeroed bytes through [`Pcr0::from_hex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pcr0 {
    Expected([u8; PCR0_SIZE]),

    /// Accept the 48-zero-byte PCR0 of a debug-mode enclave. Testing only.
    InsecureAllZero,
}

impl Pcr0 {
    pub fn new(value: [u8; PCR0_SIZE]) -> Self {
        Pcr0::Expected(value)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::MissingPolicyInput("hex-encoded PCR0 value"))?;
        let value: [u8; PCR0_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::MissingPolicyInput("48-byte PCR0 value"))?;
        Ok(Pcr0::Expected(value))
    }

    /// The measurement bytes this policy expects.
    pub fn expected_bytes(&self) -> [u8; PCR0_SIZE] {
        match self {
            Pcr0::Expected(v) => *v,
            Pcr0::InsecureAllZero => [0u8; PCR0_SIZE],
        }
    }
}

/// A single-use random value carried into the evidence request and checked
/// for exact equality in the returned claims.
///
/// Generated from the OS CSPRNG, fresh for every verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce([u8; 16]);

impl Nonce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Nonce(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Wire encoding: lowercase hex, as echoed back in the runtime claim.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// The verified identity a session is bound to. Immutable once produced.
#[derive(Debug, Clone)]
pub enum TrustAnchor {
    /// Fingerprint pinning: the live connection's certificate must hash to
    /// this value. The DER is carried so the binder can alternatively
    /// install the enclave certificate as the session's only root CA.
    CertFingerprint {
        sha256_hex: String,
        cert_der: Vec<u8>,
    },

    /// Trust derives from the signed claims of the named attester; the
    /// channel is bound by hostname validation against the expected enclave
    /// server name rather than a certificate hash.
    AttestedService { attester: String },

    /// Debug mode only. Never produced by verification.
    Unverified,
}

impl TrustAnchor {
    pub fn is_verified(&self) -> bool {
        !matches!(self, TrustAnchor::Unverified)
    }
}

/// Key set published by the attestation service at its `jku` URL.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySet {
    pub keys: Vec<JsonWebKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebKey {
    pub kid: String,
    #[serde(default)]
    pub x5c: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr0_from_hex() {
        let hex48 = "ab".repeat(PCR0_SIZE);
        let pcr0 = Pcr0::from_hex(&hex48).unwrap();
        assert_eq!(pcr0.expected_bytes(), [0xab; PCR0_SIZE]);
    }

    #[test]
    fn test_pcr0_from_hex_rejects_wrong_length() {
        assert!(Pcr0::from_hex("abcd").is_err());
        assert!(Pcr0::from_hex("not hex").is_err());
    }

    #[test]
    fn test_zeroed_hex_is_not_the_insecure_variant() {
        // Passing 48 zero bytes as an expected value stays an exact-match
        // expectation; only the explicit variant accepts a debug enclave.
        let zeros = Pcr0::from_hex(&"00".repeat(PCR0_SIZE)).unwrap();
        assert!(matches!(zeros, Pcr0::Expected(_)));
        assert_ne!(zeros, Pcr0::InsecureAllZero);
    }

    #[test]
    fn test_nonce_is_fresh_per_attempt() {
        let a = Nonce::generate();
        let b = Nonce::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), 32);
    }

    #[test]
    fn test_anchor_verified_flag() {
        assert!(!TrustAnchor::Unverified.is_verified());
        assert!(TrustAnchor::AttestedService {
            attester: "attest.example.net".into()
        }
        .is_verified());
    }
}
