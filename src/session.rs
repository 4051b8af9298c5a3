//! Attested session lifecycle
//!
//! A [`SecureSession`] is constructed by a blocking handshake: attest the
//! remote enclave, bind the HTTP channel to the resulting trust anchor, and
//! probe the pinned channel once before handing the session out. Every
//! request made through the session rides the pinned channel; there is no
//! way to reach the host through a session whose attestation failed.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, Url};
use serde::Serialize;

use crate::attestation::{self, ExpectedPolicy, TrustAnchor};
use crate::error::{Error, Result};
use crate::tls;

/// How the channel is bound to a certificate-fingerprint anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinningMode {
    /// Pin the exact certificate by SHA-256 fingerprint.
    #[default]
    Fingerprint,

    /// Install the attested enclave certificate as the session's only root
    /// CA and validate the configured server hostname against it.
    EnclaveCa,
}

/// Configuration for an attested session. Build one, then [`connect`].
///
/// [`connect`]: SessionConfig::connect
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) host: String,
    pub(crate) policy: Option<ExpectedPolicy>,
    pub(crate) server_hostname: Option<String>,
    pub(crate) pinning: PinningMode,
    pub(crate) debug_mode: bool,
    pub(crate) timeout: Duration,
    pub(crate) fetch_attempts: u32,
    pub(crate) retry_base_delay: Duration,
}

impl SessionConfig {
    /// `host` is the enclave address: a bare `host[:port]` (https assumed)
    /// or a full URL.
    pub fn new(host: impl Into<String>) -> Self {
        SessionConfig {
            host: host.into(),
            policy: None,
            server_hostname: None,
            pinning: PinningMode::default(),
            debug_mode: false,
            timeout: Duration::from_secs(10),
            fetch_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }

    /// The attestation policy the enclave's evidence must satisfy.
    pub fn policy(mut self, policy: ExpectedPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Hostname to validate the server certificate against when the binding
    /// mode needs one (CA pinning, or hostname binding with a dial override).
    pub fn server_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.server_hostname = Some(hostname.into());
        self
    }

    pub fn pinning(mut self, mode: PinningMode) -> Self {
        self.pinning = mode;
        self
    }

    /// Skip attestation entirely and hand out an unverified session.
    /// For local development against a non-enclave backend only.
    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempts for each evidence fetch before giving up. Minimum 1.
    pub fn fetch_attempts(mut self, attempts: u32) -> Self {
        self.fetch_attempts = attempts;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn connect(self) -> Result<SecureSession> {
        SecureSession::connect(self)
    }
}

/// An HTTP session whose every request is bound to an attested trust anchor.
pub struct SecureSession {
    base_url: Url,
    anchor: TrustAnchor,
    client: Client,
}

impl SecureSession {
    /// Blocking handshake: attest, bind, probe. Returns only once the
    /// pinned channel has completed an exchange with the enclave host.
    pub fn connect(config: SessionConfig) -> Result<Self> {
        if config.host.trim().is_empty() {
            return Err(Error::MissingPolicyInput("host address"));
        }
        let base = base_url(&config.host)?;

        if config.debug_mode {
            tracing::warn!(
                host = %config.host,
                "debug mode: attestation skipped, channel is NOT verified"
            );
            let session = SecureSession {
                base_url: base,
                anchor: TrustAnchor::Unverified,
                client: tls::bootstrap_client(config.timeout)?,
            };
            session.probe()?;
            return Ok(session);
        }

        let anchor = attestation::attest(&config)?;
        let (client, base_url) = bind(&config, &anchor, base)?;
        let session = SecureSession {
            base_url,
            anchor,
            client,
        };
        session.probe()?;
        Ok(session)
    }

    /// The trust anchor this session is bound to.
    pub fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// One round trip over the pinned channel. Any completed exchange counts
    /// as live, whatever the status; only a transport failure is an error.
    pub fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(self.base_url.clone())
            .send()
            .map_err(|e| Error::TransportUnreachable(e.to_string()))?;
        tracing::debug!(status = %response.status(), "liveness probe completed");
        Ok(())
    }

    /// A request builder for an endpoint relative to the session base URL,
    /// using the pinned client. The verb methods below cover the common
    /// cases; this is the escape hatch for headers, queries, and streaming.
    pub fn request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(endpoint)
            .map_err(|e| Error::InvalidUrl(format!("{endpoint}: {e}")))?;
        Ok(self.client.request(method, url))
    }

    pub fn get(&self, endpoint: &str) -> Result<Response> {
        Ok(self.request(Method::GET, endpoint)?.send()?)
    }

    pub fn head(&self, endpoint: &str) -> Result<Response> {
        Ok(self.request(Method::HEAD, endpoint)?.send()?)
    }

    pub fn delete(&self, endpoint: &str) -> Result<Response> {
        Ok(self.request(Method::DELETE, endpoint)?.send()?)
    }

    pub fn post<T: Serialize + ?Sized>(&self, endpoint: &str, json: &T) -> Result<Response> {
        Ok(self.request(Method::POST, endpoint)?.json(json).send()?)
    }

    pub fn put<T: Serialize + ?Sized>(&self, endpoint: &str, json: &T) -> Result<Response> {
        Ok(self.request(Method::PUT, endpoint)?.json(json).send()?)
    }

    pub fn patch<T: Serialize + ?Sized>(&self, endpoint: &str, json: &T) -> Result<Response> {
        Ok(self.request(Method::PATCH, endpoint)?.json(json).send()?)
    }

    /// Drop the session and its connection pool.
    pub fn close(self) {}
}

/// Bind the channel to the verified anchor, returning the pinned client and
/// the base URL requests should address (rewritten when the TLS hostname
/// differs from the dial address).
fn bind(config: &SessionConfig, anchor: &TrustAnchor, base: Url) -> Result<(Client, Url)> {
    match anchor {
        TrustAnchor::CertFingerprint {
            sha256_hex,
            cert_der,
        } => match config.pinning {
            PinningMode::Fingerprint => {
                Ok((tls::pinned_client(sha256_hex, config.timeout)?, base))
            }
            PinningMode::EnclaveCa => {
                let hostname = config
                    .server_hostname
                    .as_deref()
                    .ok_or(Error::MissingPolicyInput("server hostname for CA pinning"))?;
                let (url, addr) = rehost(&base, hostname)?;
                Ok((tls::ca_client(cert_der, hostname, addr, config.timeout)?, url))
            }
        },

        TrustAnchor::AttestedService { .. } => match config.server_hostname.as_deref() {
            Some(hostname) => {
                let (url, addr) = rehost(&base, hostname)?;
                Ok((
                    tls::hostname_client(hostname, Some(addr), config.timeout)?,
                    url,
                ))
            }
            // The configured host is already the name to hold the server to;
            // standard webpki validation enforces it.
            None => Ok((tls::service_client(config.timeout)?, base)),
        },

        // Verification never produces this; refuse to bind to it.
        TrustAnchor::Unverified => Err(Error::Tls(
            "cannot bind a channel to an unverified anchor".into(),
        )),
    }
}

/// Rewrite the base URL to carry the TLS hostname while resolving the
/// original host to a socket address for the dial override.
fn rehost(base: &Url, hostname: &str) -> Result<(Url, SocketAddr)> {
    let dial_host = base
        .host_str()
        .ok_or_else(|| Error::InvalidUrl(format!("{base} has no host")))?;
    let port = base.port_or_known_default().unwrap_or(443);

    let addr = (dial_host, port)
        .to_socket_addrs()
        .map_err(|e| Error::TransportUnreachable(format!("cannot resolve {dial_host}: {e}")))?
        .next()
        .ok_or_else(|| Error::TransportUnreachable(format!("no addresses for {dial_host}")))?;

    let mut url = base.clone();
    url.set_host(Some(hostname))
        .map_err(|e| Error::InvalidUrl(format!("{hostname}: {e}")))?;
    Ok((url, addr))
}

/// Normalize a host address into a base URL, assuming https when no scheme
/// is given.
pub(crate) fn base_url(host: &str) -> Result<Url> {
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    };
    Url::parse(&with_scheme).map_err(|e| Error::InvalidUrl(format!("{host}: {e}")))
}
