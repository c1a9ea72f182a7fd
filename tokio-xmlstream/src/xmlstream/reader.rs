// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use stanza::builder::element_from_start;
use stanza::{Stanza, TreeBuilder};

use crate::error::ProtocolError;

/// Stream-level parse results.
pub(super) enum StreamEvent {
    /// The peer's stream header; carries the header attributes.
    Header(Stanza),
    /// A completed direct child of the stream root.
    Stanza(Stanza),
    /// The stream root was closed by the peer.
    Footer,
}

/// Tracks stream framing on top of the raw parser events.
///
/// Depth 0 to 1 is the stream header; elements closing back at depth 1 are
/// stanzas; depth back to 0 is the footer. Whitespace between stanzas is
/// keepalive traffic and ignored, any other stream-level text is a protocol
/// violation.
pub(super) struct StreamReader {
    builder: TreeBuilder,
    header_seen: bool,
    stream_ns: String,
}

impl StreamReader {
    pub(super) fn new(stream_ns: &str) -> StreamReader {
        StreamReader {
            builder: TreeBuilder::new(),
            header_seen: false,
            stream_ns: stream_ns.to_owned(),
        }
    }

    /// Drops partial state, ready for a fresh stream header. Called after
    /// reconnects, stream restarts and TLS upgrades.
    pub(super) fn reset(&mut self) {
        self.builder.reset();
        self.header_seen = false;
    }

    pub(super) fn process(
        &mut self,
        event: rxml::Event,
    ) -> Result<Option<StreamEvent>, ProtocolError> {
        match event {
            rxml::Event::XmlDeclaration(_, _) => Ok(None),
            rxml::Event::StartElement(_, name, attrs) => {
                if !self.header_seen {
                    let header = element_from_start(name, attrs);
                    if header.namespace() != self.stream_ns || header.name() != "stream" {
                        return Err(ProtocolError::InvalidStreamHeader);
                    }
                    self.header_seen = true;
                    return Ok(Some(StreamEvent::Header(header)));
                }
                self.builder.start(name, attrs);
                Ok(None)
            }
            rxml::Event::Text(_, data) => {
                if self.builder.depth() == 0 {
                    if data.chars().all(char::is_whitespace) {
                        return Ok(None);
                    }
                    return Err(ProtocolError::TextAtStreamLevel);
                }
                self.builder.text(&data);
                Ok(None)
            }
            rxml::Event::EndElement(_) => {
                if self.builder.depth() == 0 {
                    return Ok(Some(StreamEvent::Footer));
                }
                Ok(self.builder.end().map(StreamEvent::Stanza))
            }
        }
    }
}
