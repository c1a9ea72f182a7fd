use hickory_resolver::{
    error::ResolveError as DnsResolveError, proto::error::ProtoError as DnsProtoError,
};
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::net::AddrParseError;

use crate::stream_error::StreamError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// TLS setup or handshake error
    Tls(native_tls::Error),
    /// The peer certificate was rejected by the verifier
    InvalidCertificate(String),
    /// HTTP CONNECT proxy refused the tunnel
    Proxy(String),
    /// Connection closed
    Disconnected,
    /// All connection attempts were used up
    ConnectionFailed,
    /// A response was not received in time
    Timeout,
    /// DNS protocol error
    Dns(DnsProtoError),
    /// DNS resolution error
    Resolve(DnsResolveError),
    /// DNS label conversion error, no details available from module
    /// `idna`
    Idna,
    /// Invalid IP/Port address
    Addr(AddrParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::InvalidCertificate(e) => write!(fmt, "invalid certificate: {}", e),
            Error::Proxy(e) => write!(fmt, "proxy error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::ConnectionFailed => write!(fmt, "connection failed"),
            Error::Timeout => write!(fmt, "timed out"),
            Error::Dns(e) => write!(fmt, "{:?}", e),
            Error::Resolve(e) => write!(fmt, "{:?}", e),
            Error::Idna => write!(fmt, "IDNA error"),
            Error::Addr(e) => write!(fmt, "wrong network address: {e}"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<native_tls::Error> for Error {
    fn from(e: native_tls::Error) -> Self {
        Error::Tls(e)
    }
}

impl From<idna::Errors> for Error {
    fn from(_e: idna::Errors) -> Self {
        Error::Idna
    }
}

impl From<DnsProtoError> for Error {
    fn from(e: DnsProtoError) -> Error {
        Error::Dns(e)
    }
}

impl From<DnsResolveError> for Error {
    fn from(e: DnsResolveError) -> Error {
        Error::Resolve(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Error {
        Error::Addr(e)
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Error {
        ProtocolError::Stream(e).into()
    }
}

/// Errors in the XML stream itself, as opposed to the transport below it.
#[derive(Debug)]
pub enum ProtocolError {
    /// The document root was not the expected stream header
    InvalidStreamHeader,
    /// Non-whitespace character data between stanzas
    TextAtStreamLevel,
    /// The peer reported a stream error; always fatal to the stream
    Stream(StreamError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::InvalidStreamHeader => write!(fmt, "invalid stream header"),
            ProtocolError::TextAtStreamLevel => {
                write!(fmt, "non-whitespace text at stream level")
            }
            ProtocolError::Stream(e) => write!(fmt, "stream error: {}", e),
        }
    }
}

impl StdError for ProtocolError {}
