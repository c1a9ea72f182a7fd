// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stream configuration.

use core::fmt;
use core::time::Duration;
use std::path::PathBuf;
use std::sync::Arc;

/// Verdict of a pluggable certificate verifier.
#[derive(Debug, Clone)]
pub enum CertVerdict {
    /// The certificate is acceptable.
    ///
    /// When the verifier reports how long the certificate remains valid, a
    /// proactive reconnect is scheduled shortly before expiry.
    Trusted {
        /// Remaining validity, if the verifier determined it.
        expires_in: Option<Duration>,
    },
    /// The certificate is not acceptable; the message is reported through
    /// the `ssl_invalid_cert` event and the connection is aborted unless an
    /// event handler overrides the decision.
    Untrusted(String),
}

/// Pluggable certificate verification step.
///
/// Receives the expected peer identity and the peer certificate in DER form.
pub type CertVerifier = Arc<dyn Fn(&str, &[u8]) -> CertVerdict + Send + Sync>;

/// HTTP CONNECT proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy host name or address.
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Optional Basic-Auth username.
    pub username: Option<String>,
    /// Optional Basic-Auth password.
    pub password: Option<String>,
}

/// Configuration surface of an [`XmlStream`][`crate::XmlStream`].
///
/// The defaults mirror common client deployments: reconnect forever with
/// capped exponential backoff, STARTTLS allowed, a 30 second response
/// timeout and a whitespace keepalive every five minutes.
#[derive(Clone)]
pub struct StreamConfig {
    /// Domain to put in the stream header's `to` attribute and to verify
    /// the peer certificate against.
    pub domain: String,
    /// Explicit host to connect to instead of resolving `domain`.
    pub host: Option<String>,
    /// Port used with an explicit host or as SRV fallback.
    pub port: u16,
    /// DNS SRV service to query, e.g. `_xmpp-client._tcp`. `None` skips SRV
    /// resolution.
    pub srv_service: Option<String>,
    /// Default namespace declared on the stream header.
    pub default_ns: String,
    /// Namespace of the stream root element.
    pub stream_ns: String,
    /// Value for the header's `xml:lang`.
    pub lang: String,
    /// Wrap the socket in TLS before anything else (direct SSL).
    pub use_ssl: bool,
    /// Pass outgoing stanzas through the outgoing filter chains.
    pub use_filters: bool,
    /// Path to an additional CA bundle in PEM form.
    pub ca_certs: Option<PathBuf>,
    /// Client certificate with private key, PKCS#8 PEM.
    pub client_cert: Option<PathBuf>,
    /// Private key for [`Self::client_cert`].
    pub client_key: Option<PathBuf>,
    /// Optional HTTP CONNECT proxy to tunnel through.
    pub proxy: Option<ProxyConfig>,
    /// Reconnect automatically when the stream dies.
    pub auto_reconnect: bool,
    /// Upper bound on connection attempts; `None` keeps trying.
    pub max_attempts: Option<u32>,
    /// Ceiling for the reconnect backoff delay.
    pub reconnect_max_delay: Duration,
    /// How long `send_wait` waits for a matching reply.
    pub response_timeout: Duration,
    /// Bounded wait for the peer's closing tag during an orderly
    /// disconnect.
    pub disconnect_wait: Duration,
    /// Send a single space when the stream has been idle, keeping NAT
    /// mappings alive. Zero disables the keepalive.
    pub keepalive_interval: Duration,
    /// Prefer IPv6 addresses over IPv4 when both resolve.
    pub use_ipv6: bool,
    /// Number of event dispatch workers.
    pub dispatch_workers: usize,
    /// Mark the session started as soon as the peer's stream header
    /// arrives. Disable when a handshake (auth, binding) must complete
    /// first; the application then calls `mark_session_started` itself.
    pub auto_session: bool,
    /// Pluggable certificate verification; `None` leaves verification
    /// entirely to the TLS backend.
    pub cert_verifier: Option<CertVerifier>,
}

impl StreamConfig {
    /// Creates a configuration for the given domain with default settings.
    pub fn new(domain: impl Into<String>) -> StreamConfig {
        StreamConfig {
            domain: domain.into(),
            host: None,
            port: 5222,
            srv_service: Some("_xmpp-client._tcp".to_owned()),
            default_ns: "jabber:client".to_owned(),
            stream_ns: "http://etherx.jabber.org/streams".to_owned(),
            lang: "en".to_owned(),
            use_ssl: false,
            use_filters: true,
            ca_certs: None,
            client_cert: None,
            client_key: None,
            proxy: None,
            auto_reconnect: true,
            max_attempts: None,
            reconnect_max_delay: Duration::from_secs(600),
            response_timeout: Duration::from_secs(30),
            disconnect_wait: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(300),
            use_ipv6: true,
            dispatch_workers: 1,
            auto_session: true,
            cert_verifier: None,
        }
    }

    /// Sets an explicit host and port, bypassing SRV resolution.
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> StreamConfig {
        self.host = Some(host.into());
        self.port = port;
        self.srv_service = None;
        self
    }

    /// Disables automatic reconnection.
    pub fn without_reconnect(mut self) -> StreamConfig {
        self.auto_reconnect = false;
        self
    }
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("domain", &self.domain)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("proxy", &self.proxy.as_ref().map(|p| (&p.host, p.port)))
            .finish_non_exhaustive()
    }
}
