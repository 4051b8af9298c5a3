//! Error types for attested sessions
//!
//! Every attestation rejection is terminal for its attempt and is surfaced
//! to the caller of session construction as a distinct variant, so callers
//! can tell "network unreachable" apart from "attestation rejected".

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("enclave transport unreachable: {0}")]
    TransportUnreachable(String),

    #[error("malformed attestation evidence: {0}")]
    MalformedEvidence(String),

    #[error("attestation signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("attestation token has expired")]
    ExpiredToken,

    #[error("attestation token issued by unexpected attester: expected {expected}, got {actual}")]
    WrongAttester { expected: String, actual: String },

    #[error("attestation report was not produced by an enclave (type: {0})")]
    NotAnEnclave(String),

    #[error("enclave host VM is not compliant (status: {0})")]
    NonCompliantVm(String),

    #[error("policy hash mismatch: expected {expected}, got {actual}")]
    InvalidPolicyHash { expected: String, actual: String },

    #[error("enclave certificate is not bound to the attestation document")]
    CertificateNotBound,

    #[error("nonce in attestation claims does not match the one issued for this attempt")]
    ReplayOrForgedNonce,

    #[error("enclave is running in debug mode")]
    DebugModeEnclave,

    #[error("missing required input: {0}")]
    MissingPolicyInput(&'static str),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
