//! Cloud attestation-service token verification
//!
//! Verifies RS256 JWTs issued by an SEV-SNP attestation service. The flow:
//! 1. Decode the unverified header (base64url, padded to a multiple of 4)
//! 2. Short-circuit on the `jku` claim: it must name the expected attester's
//!    key-set URL before any key material is fetched or used
//! 3. Select the signing key by `kid` from the attester's published key set,
//!    taking the leaf of its `x5c` chain
//! 4. Verify signature and expiry, then check the attestation claims in a
//!    fixed order so the most specific failure is reported

use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use x509_cert::der::Decode;
use x509_cert::Certificate;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};

use super::types::{KeySet, Nonce, TrustAnchor};
use crate::error::{Error, Result};

/// Attestation type claimed by an SEV-SNP confidential VM.
const ATTESTATION_TYPE_SEV_SNP: &str = "sevsnpvm";
/// Compliance status of an Azure-style compliant utility VM.
const COMPLIANCE_AZURE_UVM: &str = "azure-compliant-uvm";

/// Unverified JWT header fields the verifier acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenHeader {
    pub kid: String,
    pub jku: String,
}

/// Decode the (unverified) header segment of a token.
///
/// The header is base64url without padding on the wire; it is padded back to
/// a multiple of four before decoding.
pub fn decode_header(token: &str) -> Result<TokenHeader> {
    let segment = token
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedEvidence("attestation token has no header".into()))?;

    let mut padded = segment.to_string();
    padded.push_str(&"=".repeat((4 - segment.len() % 4) % 4));

    let raw = base64::engine::general_purpose::URL_SAFE
        .decode(padded)
        .map_err(|e| Error::MalformedEvidence(format!("token header is not base64url: {e}")))?;

    serde_json::from_slice(&raw)
        .map_err(|e| Error::MalformedEvidence(format!("token header is not valid JSON: {e}")))
}

/// The key-set URL the expected attester publishes its signing keys at.
pub fn expected_jku(attester_host: &str) -> String {
    format!("https://{attester_host}/certs")
}

/// Reject a token whose `jku` does not name the expected attester.
///
/// Runs before the key set is fetched: a token pointing at a different key
/// host must not cause any request to that host.
pub fn check_attester(header: &TokenHeader, attester_host: &str) -> Result<()> {
    let expected = expected_jku(attester_host);
    if header.jku != expected {
        return Err(Error::WrongAttester {
            expected,
            actual: header.jku.clone(),
        });
    }
    Ok(())
}

/// Select the signing key named by `kid` and extract its RSA public key from
/// the leaf of the `x5c` chain.
fn select_key(keys: &KeySet, kid: &str) -> Result<DecodingKey> {
    let key = keys
        .keys
        .iter()
        .find(|k| k.kid == kid)
        .ok_or_else(|| {
            Error::SignatureVerificationFailed(format!("no key {kid} in attester key set"))
        })?;

    let leaf_b64 = key.x5c.first().ok_or_else(|| {
        Error::MalformedEvidence(format!("key {kid} has no x5c certificate chain"))
    })?;

    let leaf_der = base64::engine::general_purpose::STANDARD
        .decode(leaf_b64)
        .map_err(|e| Error::MalformedEvidence(format!("x5c entry is not base64: {e}")))?;

    let cert = Certificate::from_der(&leaf_der)
        .map_err(|e| Error::MalformedEvidence(format!("x5c entry is not a certificate: {e}")))?;

    let spki = &cert.tbs_certificate.subject_public_key_info;
    let rsa_der = spki.subject_public_key.as_bytes().ok_or_else(|| {
        Error::MalformedEvidence("x5c public key has unused bits".into())
    })?;

    Ok(DecodingKey::from_rsa_der(rsa_der))
}

/// SEV-SNP attestation claims checked by the verifier.
#[derive(Debug, Deserialize)]
struct MaaClaims {
    #[serde(rename = "x-ms-attestation-type")]
    attestation_type: String,

    #[serde(rename = "x-ms-compliance-status")]
    compliance_status: String,

    /// SHA-256 (hex) of the CCE policy document the VM was launched with.
    #[serde(rename = "x-ms-sevsnpvm-hostdata")]
    host_data: String,

    #[serde(rename = "x-ms-runtime")]
    runtime: RuntimeClaims,

    /// Emitted as a bool by current service versions, as a string by older
    /// ones; both spellings are accepted and truthiness rejected.
    #[serde(rename = "x-ms-sevsnpvm-is-debuggable")]
    is_debuggable: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RuntimeClaims {
    nonce: String,
}

/// SHA-256 hex digest of the decoded CCE policy document.
pub fn cce_policy_digest(policy_b64: &[u8]) -> Result<String> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(policy_b64)
        .map_err(|_| Error::MissingPolicyInput("base64-encoded CCE policy document"))?;
    Ok(hex::encode(Sha256::digest(decoded)))
}

/// Verify a service token end to end against the caller's expectations.
///
/// Pure over its inputs. On success the anchor carries the attester identity
/// the claims were signed under.
pub fn verify_token(
    token: &str,
    keys: &KeySet,
    policy_b64: &[u8],
    attester_host: &str,
    nonce: &Nonce,
) -> Result<TrustAnchor> {
    let header = decode_header(token)?;
    check_attester(&header, attester_host)?;

    let key = select_key(keys, &header.kid)?;
    let claims = verify_signed_claims(token, &key)?;
    check_claims(&claims, policy_b64, nonce)?;

    tracing::debug!(attester = %attester_host, "attestation token verified");

    Ok(TrustAnchor::AttestedService {
        attester: attester_host.to_string(),
    })
}

/// Signature and expiry check; returns the decoded claims on success.
fn verify_signed_claims(token: &str, key: &DecodingKey) -> Result<MaaClaims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_aud = false;

    let data = jsonwebtoken::decode::<MaaClaims>(token, key, &validation)
        .map_err(map_jwt_error)?;
    Ok(data.claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> Error {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => Error::ExpiredToken,
        ErrorKind::InvalidSignature => {
            Error::SignatureVerificationFailed("token signature invalid".into())
        }
        ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) | ErrorKind::InvalidToken => {
            Error::MalformedEvidence(format!("invalid attestation token: {err}"))
        }
        _ => Error::SignatureVerificationFailed(err.to_string()),
    }
}

/// Ordered claim checks over a signature-verified token.
fn check_claims(claims: &MaaClaims, policy_b64: &[u8], nonce: &Nonce) -> Result<()> {
    if claims.attestation_type != ATTESTATION_TYPE_SEV_SNP {
        return Err(Error::NotAnEnclave(claims.attestation_type.clone()));
    }

    if claims.compliance_status != COMPLIANCE_AZURE_UVM {
        return Err(Error::NonCompliantVm(claims.compliance_status.clone()));
    }

    let expected_digest = cce_policy_digest(policy_b64)?;
    if !claims.host_data.eq_ignore_ascii_case(&expected_digest) {
        return Err(Error::InvalidPolicyHash {
            expected: expected_digest,
            actual: claims.host_data.clone(),
        });
    }

    if claims.runtime.nonce != nonce.to_hex() {
        return Err(Error::ReplayOrForgedNonce);
    }

    let debuggable = match &claims.is_debuggable {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => s == "true",
        other => {
            return Err(Error::MalformedEvidence(format!(
                "unexpected is-debuggable claim: {other}"
            )))
        }
    };
    if debuggable {
        return Err(Error::DebugModeEnclave);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::types::JsonWebKey;
    use jsonwebtoken::{EncodingKey, Header};
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::RsaPrivateKey;
    use serde_json::json;
    use std::sync::OnceLock;
    use std::time::{SystemTime, UNIX_EPOCH};

    const TEST_ATTESTER: &str = "attest.example.net";
    const TEST_KID: &str = "test-signing-key";

    struct TestSigner {
        encoding_key: EncodingKey,
        key_set: KeySet,
    }

    fn signer() -> &'static TestSigner {
        static SIGNER: OnceLock<TestSigner> = OnceLock::new();
        SIGNER.get_or_init(|| {
            let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
            let pkcs1 = private.to_pkcs1_der().unwrap();
            let encoding_key = EncodingKey::from_rsa_der(pkcs1.as_bytes());

            // Wrap the public key in a self-signed certificate so key
            // selection exercises the x5c path.
            let pkcs8 = private.to_pkcs8_der().unwrap();
            let rcgen_key = rcgen::KeyPair::try_from(pkcs8.as_bytes()).unwrap();
            let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
            let cert = params.self_signed(&rcgen_key).unwrap();
            let x5c = base64::engine::general_purpose::STANDARD.encode(cert.der());

            // Sanity: the certificate's SPKI must match the signing key.
            let spki_cert = Certificate::from_der(cert.der()).unwrap();
            let spki_rsa = spki_cert
                .tbs_certificate
                .subject_public_key_info
                .subject_public_key
                .as_bytes()
                .unwrap();
            assert_eq!(
                spki_rsa,
                private.to_public_key().to_pkcs1_der().unwrap().as_bytes()
            );

            TestSigner {
                encoding_key,
                key_set: KeySet {
                    keys: vec![JsonWebKey {
                        kid: TEST_KID.to_string(),
                        x5c: vec![x5c],
                    }],
                },
            }
        })
    }

    fn policy() -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .encode(br#"{"allow_all": false}"#)
            .into_bytes()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn base_claims(nonce: &Nonce) -> serde_json::Value {
        json!({
            "x-ms-attestation-type": ATTESTATION_TYPE_SEV_SNP,
            "x-ms-compliance-status": COMPLIANCE_AZURE_UVM,
            "x-ms-sevsnpvm-hostdata": cce_policy_digest(&policy()).unwrap(),
            "x-ms-runtime": { "nonce": nonce.to_hex() },
            "x-ms-sevsnpvm-is-debuggable": false,
            "iat": now(),
            "exp": now() + 600,
        })
    }

    fn sign(claims: &serde_json::Value) -> String {
        sign_with_jku(claims, &expected_jku(TEST_ATTESTER))
    }

    fn sign_with_jku(claims: &serde_json::Value, jku: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(TEST_KID.to_string());
        header.jku = Some(jku.to_string());
        jsonwebtoken::encode(&header, claims, &signer().encoding_key).unwrap()
    }

    #[test]
    fn test_verify_valid_token() {
        let nonce = Nonce::generate();
        let token = sign(&base_claims(&nonce));

        let anchor =
            verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &nonce).unwrap();
        match anchor {
            TrustAnchor::AttestedService { attester } => assert_eq!(attester, TEST_ATTESTER),
            other => panic!("unexpected anchor: {other:?}"),
        }
    }

    #[test]
    fn test_header_decodes_without_padding() {
        let nonce = Nonce::generate();
        let token = sign(&base_claims(&nonce));

        let header = decode_header(&token).unwrap();
        assert_eq!(header.kid, TEST_KID);
        assert_eq!(header.jku, expected_jku(TEST_ATTESTER));
    }

    #[test]
    fn test_foreign_jku_rejected_before_key_use() {
        let nonce = Nonce::generate();
        let token = sign_with_jku(&base_claims(&nonce), "https://evil.example.com/certs");

        // An empty key set: the attester check must fire first, proving no
        // key material is consulted for a token pointing elsewhere.
        let empty = KeySet { keys: vec![] };
        let result = verify_token(&token, &empty, &policy(), TEST_ATTESTER, &nonce);
        assert!(matches!(result, Err(Error::WrongAttester { .. })));
    }

    #[test]
    fn test_expired_token_rejected() {
        let nonce = Nonce::generate();
        let mut claims = base_claims(&nonce);
        // Past the default 60s leeway.
        claims["exp"] = json!(now() - 300);
        let token = sign(&claims);

        let result = verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &nonce);
        assert!(matches!(result, Err(Error::ExpiredToken)));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let nonce = Nonce::generate();
        let mut token = sign(&base_claims(&nonce));
        let flipped = if token.ends_with('A') { 'B' } else { 'A' };
        token.pop();
        token.push(flipped);

        let result = verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &nonce);
        assert!(matches!(
            result,
            Err(Error::SignatureVerificationFailed(_))
        ));
    }

    #[test]
    fn test_unknown_kid_rejected() {
        let nonce = Nonce::generate();
        let token = sign(&base_claims(&nonce));

        let other_keys = KeySet {
            keys: vec![JsonWebKey {
                kid: "some-other-key".to_string(),
                x5c: signer().key_set.keys[0].x5c.clone(),
            }],
        };
        let result = verify_token(&token, &other_keys, &policy(), TEST_ATTESTER, &nonce);
        assert!(matches!(
            result,
            Err(Error::SignatureVerificationFailed(_))
        ));
    }

    #[test]
    fn test_non_enclave_report_rejected() {
        let nonce = Nonce::generate();
        let mut claims = base_claims(&nonce);
        claims["x-ms-attestation-type"] = json!("tdxvm");
        let token = sign(&claims);

        let result = verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &nonce);
        assert!(matches!(result, Err(Error::NotAnEnclave(t)) if t == "tdxvm"));
    }

    #[test]
    fn test_non_compliant_vm_rejected() {
        let nonce = Nonce::generate();
        let mut claims = base_claims(&nonce);
        claims["x-ms-compliance-status"] = json!("non-compliant");
        let token = sign(&claims);

        let result = verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &nonce);
        assert!(matches!(result, Err(Error::NonCompliantVm(_))));
    }

    #[test]
    fn test_policy_digest_mismatch_rejected() {
        let nonce = Nonce::generate();
        let token = sign(&base_claims(&nonce));

        let other_policy = base64::engine::general_purpose::STANDARD
            .encode(br#"{"allow_all": true}"#)
            .into_bytes();
        let result =
            verify_token(&token, &signer().key_set, &other_policy, TEST_ATTESTER, &nonce);
        assert!(matches!(result, Err(Error::InvalidPolicyHash { .. })));
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let nonce = Nonce::generate();
        let token = sign(&base_claims(&nonce));

        let fresh = Nonce::generate();
        let result = verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &fresh);
        assert!(matches!(result, Err(Error::ReplayOrForgedNonce)));
    }

    #[test]
    fn test_debuggable_enclave_rejected() {
        for debuggable in [json!(true), json!("true")] {
            let nonce = Nonce::generate();
            let mut claims = base_claims(&nonce);
            claims["x-ms-sevsnpvm-is-debuggable"] = debuggable;
            let token = sign(&claims);

            let result =
                verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &nonce);
            assert!(matches!(result, Err(Error::DebugModeEnclave)));
        }
    }

    #[test]
    fn test_string_false_debuggable_accepted() {
        let nonce = Nonce::generate();
        let mut claims = base_claims(&nonce);
        claims["x-ms-sevsnpvm-is-debuggable"] = json!("false");
        let token = sign(&claims);

        assert!(verify_token(&token, &signer().key_set, &policy(), TEST_ATTESTER, &nonce).is_ok());
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        assert!(matches!(
            decode_header(""),
            Err(Error::MalformedEvidence(_))
        ));
        assert!(matches!(
            decode_header("!!!not-base64!!!.payload.sig"),
            Err(Error::MalformedEvidence(_))
        ));
    }

    #[test]
    fn test_invalid_policy_input() {
        let nonce = Nonce::generate();
        let token = sign(&base_claims(&nonce));
        let result = verify_token(
            &token,
            &signer().key_set,
            b"\xff\xfe not base64",
            TEST_ATTESTER,
            &nonce,
        );
        assert!(matches!(result, Err(Error::MissingPolicyInput(_))));
    }
}
