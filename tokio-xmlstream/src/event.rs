// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Named events raised by the engine.
//!
//! Events are addressed by plain string names so that applications can
//! define their own alongside the lifecycle events below.

use std::sync::Arc;

use stanza::Stanza;

use crate::error::Error;

/// A TCP (or TLS) connection was established and the stream header sent.
pub const CONNECTED: &str = "connected";
/// The socket was closed, orderly or not.
pub const DISCONNECTED: &str = "disconnected";
/// All connection attempts were used up.
pub const CONNECTION_FAILED: &str = "connection_failed";
/// The peer's stream header arrived.
pub const STREAM_START: &str = "stream_start";
/// The peer closed the stream with its footer.
pub const STREAM_END: &str = "stream_end";
/// The peer sent a `<stream:error>`; payload is the error stanza.
pub const STREAM_ERROR: &str = "stream_error";
/// A transport or parse error occurred; payload carries the error.
pub const SOCKET_ERROR: &str = "socket_error";
/// The session is ready; the send queue starts draining.
pub const SESSION_START: &str = "session_start";
/// The session ended together with its stream.
pub const SESSION_END: &str = "session_end";
/// An incoming stanza matched no registered handler.
pub const UNHANDLED_STANZA: &str = "unhandled_stanza";
/// TLS handshake completed; payload is the peer certificate in DER form.
pub const SSL_CERT: &str = "ssl_cert";
/// The verifier rejected the peer certificate. A handler may override the
/// decision by calling `override_cert` on the stream before returning.
pub const SSL_INVALID_CERT: &str = "ssl_invalid_cert";

/// Payload attached to a raised event.
#[derive(Debug, Clone, Default)]
pub enum EventData {
    /// No payload.
    #[default]
    Empty,
    /// A stanza, e.g. for [`STREAM_ERROR`] or [`UNHANDLED_STANZA`].
    Stanza(Stanza),
    /// A plain string.
    Text(String),
    /// An engine error, e.g. for [`SOCKET_ERROR`].
    Error(Arc<Error>),
    /// A DER-encoded certificate, for [`SSL_CERT`] and
    /// [`SSL_INVALID_CERT`].
    Certificate(Vec<u8>),
}

impl EventData {
    /// Returns the stanza payload, if any.
    pub fn stanza(&self) -> Option<&Stanza> {
        match self {
            EventData::Stanza(st) => Some(st),
            _ => None,
        }
    }
}
