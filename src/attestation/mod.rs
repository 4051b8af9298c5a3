//! Attestation evidence acquisition and verification
//!
//! Acquisition talks to the (not yet trusted) enclave host over a bootstrap
//! channel and assembles platform-tagged evidence; verification is a pure
//! function over that evidence and the caller's expected policy, and yields
//! the trust anchor the session binds its channel to.

pub mod maa;
pub mod nitro;
pub mod types;

pub use types::{
    AttestationEvidence, ExpectedPolicy, KeySet, Nonce, Pcr0, TrustAnchor, PCR0_SIZE,
};

use std::thread;

use base64::Engine;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::session::SessionConfig;
use crate::tls;

/// Endpoint the enclave serves its attestation document from.
const DOCUMENT_ENDPOINT: &str = "/attestation-document";
/// Endpoint the enclave serves its TLS certificate (DER) from.
const CERTIFICATE_ENDPOINT: &str = "/certificate";
/// Port and path of the in-VM relay that obtains tokens from the attester.
const TOKEN_RELAY_PORT: u16 = 8080;
const TOKEN_RELAY_PATH: &str = "/attest/maa";

/// Run the full attestation handshake for a session configuration: acquire
/// evidence for the configured platform, verify it, and return the anchor.
pub fn attest(config: &SessionConfig) -> Result<TrustAnchor> {
    let policy = config
        .policy
        .as_ref()
        .ok_or(Error::MissingPolicyInput("attestation policy"))?;
    let base = crate::session::base_url(&config.host)?;

    match policy {
        ExpectedPolicy::NitroPcr0(_) => {
            let client = tls::bootstrap_client(config.timeout)?;
            let raw = fetch_document(&client, &base, config)?;
            let enclave_cert_der = fetch_certificate(&client, &base, config)?;
            let document = nitro::decode_document(&raw)?;
            let evidence = AttestationEvidence::HardwareDocument {
                document,
                enclave_cert_der,
            };
            verify(&evidence, policy, None)
        }

        ExpectedPolicy::MaaCcePolicy { attester_host, .. } => {
            let nonce = Nonce::generate();
            let token = fetch_token(&base, attester_host, &nonce, config)?;

            // The attester identity check runs before the key-set fetch: a
            // token pointing at a foreign key host must not trigger any
            // request to that host.
            let header = maa::decode_header(&token)?;
            maa::check_attester(&header, attester_host)?;

            let keys = fetch_key_set(&header.jku, config)?;
            let evidence = AttestationEvidence::ServiceToken { token, keys };
            verify(&evidence, policy, Some(&nonce))
        }
    }
}

/// Verify evidence against a policy. Pure: no I/O, no clock beyond token
/// expiry, same inputs always produce the same outcome.
pub fn verify(
    evidence: &AttestationEvidence,
    policy: &ExpectedPolicy,
    nonce: Option<&Nonce>,
) -> Result<TrustAnchor> {
    match (evidence, policy) {
        (
            AttestationEvidence::HardwareDocument {
                document,
                enclave_cert_der,
            },
            ExpectedPolicy::NitroPcr0(pcr0),
        ) => nitro::verify_document(document, pcr0, enclave_cert_der),

        (
            AttestationEvidence::ServiceToken { token, keys },
            ExpectedPolicy::MaaCcePolicy {
                document_b64,
                attester_host,
            },
        ) => {
            let nonce = nonce.ok_or(Error::MissingPolicyInput("attestation nonce"))?;
            maa::verify_token(token, keys, document_b64, attester_host, nonce)
        }

        _ => Err(Error::MalformedEvidence(
            "evidence platform does not match the expected policy".into(),
        )),
    }
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::InvalidUrl(format!("{path}: {e}")))
}

fn fetch_document(client: &Client, base: &Url, config: &SessionConfig) -> Result<Vec<u8>> {
    let url = join(base, DOCUMENT_ENDPOINT)?;
    let response = send_with_retry(client.get(url), config)?;
    Ok(response.bytes()?.to_vec())
}

fn fetch_certificate(client: &Client, base: &Url, config: &SessionConfig) -> Result<Vec<u8>> {
    let url = join(base, CERTIFICATE_ENDPOINT)?;
    let response = send_with_retry(client.get(url), config)?;
    Ok(response.bytes()?.to_vec())
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Request a fresh token from the in-VM relay, carrying the nonce so the
/// attester echoes it back inside the signed claims.
fn fetch_token(
    base: &Url,
    attester_host: &str,
    nonce: &Nonce,
    config: &SessionConfig,
) -> Result<String> {
    let mut url = base.clone();
    url.set_port(Some(TOKEN_RELAY_PORT))
        .map_err(|_| Error::InvalidUrl(format!("{base} cannot carry a port")))?;
    url.set_path(TOKEN_RELAY_PATH);

    let runtime_data = base64::engine::general_purpose::STANDARD
        .encode(json!({ "nonce": nonce.to_hex() }).to_string());

    let client = tls::bootstrap_client(config.timeout)?;
    let request = client.post(url).json(&json!({
        "maa_endpoint": attester_host,
        "runtime_data": runtime_data,
    }));

    let response: TokenResponse = send_with_retry(request, config)?.json()?;
    Ok(response.token)
}

/// Fetch the attester's published key set from its (already attester-checked)
/// `jku` URL over a webpki-validated channel.
fn fetch_key_set(jku: &str, config: &SessionConfig) -> Result<KeySet> {
    let url = Url::parse(jku).map_err(|e| Error::InvalidUrl(format!("{jku}: {e}")))?;
    let client = tls::service_client(config.timeout)?;
    let keys = send_with_retry(client.get(url), config)?.json()?;
    Ok(keys)
}

/// Bounded retry with doubling backoff, for transport failures only.
///
/// A response with a non-success status is a definitive answer from the
/// host and fails immediately; only connection-level errors are retried.
fn send_with_retry(request: RequestBuilder, config: &SessionConfig) -> Result<Response> {
    let attempts = config.fetch_attempts.max(1);
    let mut delay = config.retry_base_delay;
    let mut last_err: Option<reqwest::Error> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            thread::sleep(delay);
            delay = delay.saturating_mul(2);
        }

        let req = request
            .try_clone()
            .ok_or_else(|| Error::InvalidUrl("evidence request is not replayable".into()))?;
        match req.send() {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                return Err(Error::TransportUnreachable(format!(
                    "evidence endpoint returned {}",
                    response.status()
                )))
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "evidence fetch attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(Error::TransportUnreachable(match last_err {
        Some(e) => e.to_string(),
        None => "no fetch attempts were made".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn service_token_evidence() -> AttestationEvidence {
        AttestationEvidence::ServiceToken {
            token: "not.a.token".to_string(),
            keys: KeySet { keys: vec![] },
        }
    }

    #[test]
    fn test_platform_mismatch_is_malformed() {
        let evidence = service_token_evidence();
        let policy = ExpectedPolicy::nitro_pcr0(Pcr0::Expected([0xaa; PCR0_SIZE]));
        let result = verify(&evidence, &policy, None);
        assert!(matches!(result, Err(Error::MalformedEvidence(_))));
    }

    #[test]
    fn test_service_token_requires_nonce() {
        let evidence = service_token_evidence();
        let policy =
            ExpectedPolicy::maa_cce_policy(b"cGxhY2Vob2xkZXI=".to_vec(), "attest.example.net");
        let result = verify(&evidence, &policy, None);
        assert!(matches!(result, Err(Error::MissingPolicyInput(_))));
    }

    #[test]
    fn test_retry_is_bounded_and_backs_off() {
        // Port 1 refuses connections immediately, so three attempts with a
        // 20ms base delay must sleep at least 20 + 40 ms between them.
        let config = SessionConfig::new("http://127.0.0.1:1")
            .fetch_attempts(3)
            .retry_base_delay(Duration::from_millis(20))
            .timeout(Duration::from_secs(2));

        let client = tls::bootstrap_client(config.timeout).unwrap();
        let url = Url::parse("http://127.0.0.1:1/attestation-document").unwrap();

        let start = Instant::now();
        let result = send_with_retry(client.get(url), &config);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::TransportUnreachable(_))));
        assert!(elapsed >= Duration::from_millis(60), "elapsed: {elapsed:?}");
    }

    #[test]
    fn test_attest_requires_policy() {
        let config = SessionConfig::new("enclave.example.com");
        let result = attest(&config);
        assert!(matches!(
            result,
            Err(Error::MissingPolicyInput("attestation policy"))
        ));
    }
}
