//! Attested HTTP sessions for confidential-computing enclaves
//!
//! Before a [`SecureSession`] hands out its first request, it runs a
//! blocking handshake against the remote host:
//!
//! 1. **Acquire evidence** over an unauthenticated bootstrap channel. The
//!    evidence is self-verifying; nothing fetched here is trusted yet.
//! 2. **Verify** the evidence against the caller's [`ExpectedPolicy`]:
//!    - a COSE_Sign1 hardware attestation document is chain-verified to the
//!      pinned AWS Nitro root, its PCR0 measurement compared, and the
//!      enclave's TLS certificate checked against the signed user-data hash;
//!    - an attestation-service token is RS256-verified under the attester's
//!      published keys, with its `jku`, expiry, SEV-SNP claims, CCE policy
//!      digest, nonce, and debug flag all checked.
//! 3. **Bind** the channel to the resulting [`TrustAnchor`]: certificate
//!    fingerprint pinning, enclave-CA pinning, or attested-hostname
//!    validation.
//! 4. **Probe** the pinned channel once; only then is the session returned.
//!
//! Every failure is terminal for the attempt and surfaced as a typed
//! [`Error`]; there is no partially-attested session.
//!
//! ```ignore
//! use attested_session::{ExpectedPolicy, Pcr0, SessionConfig};
//!
//! let pcr0 = Pcr0::from_hex("...")?;
//! let session = SessionConfig::new("enclave.example.com")
//!     .policy(ExpectedPolicy::nitro_pcr0(pcr0))
//!     .connect()?;
//! let reply = session.post("/generate", &serde_json::json!({"input": "hi"}))?;
//! ```

pub mod attestation;
pub mod error;
pub mod session;
pub mod tls;

pub use attestation::{AttestationEvidence, ExpectedPolicy, Nonce, Pcr0, TrustAnchor, PCR0_SIZE};
pub use error::{Error, Result};
pub use session::{PinningMode, SecureSession, SessionConfig};
