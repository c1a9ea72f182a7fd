//! Asynchronous XML stream engine with asynchronous I/O using
//! [tokio](https://tokio.rs/).
//!
//! The engine drives one long-lived XML stream: it resolves and dials the
//! peer (SRV records, optional HTTP CONNECT proxy, direct SSL or a
//! mid-stream TLS upgrade), frames the byte stream into [`stanza::Stanza`]
//! trees, and routes them through filter chains to registered handlers on a
//! dispatch worker pool. Connection loss is survived with capped
//! exponential backoff.
//!
//! # Getting started
//!
//! Build a [`StreamConfig`] for your peer, create an [`XmlStream`] from it
//! inside a tokio runtime, register handlers and call
//! [`XmlStream::connect`]:
//!
//! ```no_run
//! use tokio_xmlstream::{Handler, Matcher, StreamConfig, XmlStream};
//!
//! # async fn run() {
//! let stream = XmlStream::new(StreamConfig::new("example.org"));
//! stream.register_handler(Handler::new(
//!     "pings",
//!     Matcher::Path("iq/ping".to_owned()),
//!     |_stream, ping| {
//!         println!("ping from {}", ping.get("from"));
//!         Ok(())
//!     },
//! ));
//! stream.connect();
//! stream.wait_until_stopped().await;
//! # }
//! ```

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub mod config;
pub mod connect;
mod dispatch;
pub mod event;
mod scheduler;
mod stream_error;
mod xmlstream;

/// Detailed error types
pub mod error;

pub use config::{CertVerdict, CertVerifier, ProxyConfig, StreamConfig};
pub use connect::{DnsConfig, Transport};
pub use dispatch::{EventCallback, FilterDirection, FilterFn, Handler, Matcher, StanzaCallback};
#[doc(inline)]
pub use error::{Error, ProtocolError};
pub use event::EventData;
pub use scheduler::ScheduleCallback;
pub use stream_error::{DefinedCondition, StreamError};
pub use xmlstream::{ConnectionState, ExceptionHandler, XmlStream};

// Re-export for building and inspecting stanzas.
pub use stanza;
