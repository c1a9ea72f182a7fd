// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use futures::{ready, Stream};

use bytes::{Buf, BytesMut};

use tokio::io::{AsyncBufRead, AsyncWrite};

pin_project_lite::pin_project! {
    // Couples the incremental parser with a send buffer over one duplex
    // transport. The read side is a `Stream` of parser events; the write
    // side takes pre-serialised bytes, because stanzas and the handful of
    // literal stream framing strings are rendered before they get here.
    #[project = RawXmlStreamProj]
    pub(super) struct RawXmlStream<Io> {
        #[pin]
        parser: rxml::AsyncReader<Io>,

        // Serialised data waiting for the inner `Io`. Writes are driven by
        // `poll_flush`; `queue_send` only appends.
        tx_buffer: BytesMut,

        // Soft limit: `write_ready` reports false above this, letting the
        // worker drain before accepting more stanzas from the send queue.
        tx_buffer_high_water_mark: usize,
    }
}

impl<Io: AsyncBufRead + AsyncWrite> RawXmlStream<Io> {
    pub(super) fn new(io: Io) -> Self {
        Self {
            parser: rxml::AsyncReader::wrap(io, rxml::Parser::default()),
            tx_buffer: BytesMut::new(),
            tx_buffer_high_water_mark: 2048,
        }
    }

    /// Resets the parser to the beginning-of-document state.
    ///
    /// Used after a mid-stream TLS upgrade or stream restart: the peer will
    /// send a fresh XML declaration and stream header.
    pub(super) fn reset_state(self: Pin<&mut Self>) {
        let this = self.project();
        *this.parser.parser_pinned() = rxml::Parser::default();
    }

    /// Appends pre-serialised bytes to the send buffer.
    pub(super) fn queue_send(self: Pin<&mut Self>, bytes: &[u8]) {
        let this = self.project();
        this.tx_buffer.extend_from_slice(bytes);
    }

    /// Whether the send buffer is below its high water mark.
    pub(super) fn write_ready(&self) -> bool {
        self.tx_buffer.len() < self.tx_buffer_high_water_mark
    }

    /// Flushes the send buffer and the inner transport.
    pub(super) fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(this.progress_write(cx))?;
        this.parser.as_mut().inner_pinned().poll_flush(cx)
    }

    /// Flushes and shuts the inner transport down.
    pub(super) fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        ready!(this.progress_write(cx))?;
        this.parser.as_mut().inner_pinned().poll_shutdown(cx)
    }

    /// Recovers the transport, dropping parser state and any unsent bytes.
    pub(super) fn into_inner(self) -> Io {
        self.parser.into_inner().0
    }
}

impl<'x, Io: AsyncWrite> RawXmlStreamProj<'x, Io> {
    fn progress_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.tx_buffer.len() > 0 {
            let written = match ready!(self
                .parser
                .as_mut()
                .inner_pinned()
                .poll_write(cx, &self.tx_buffer))
            {
                Ok(v) => v,
                Err(e) => return Poll::Ready(Err(e)),
            };
            self.tx_buffer.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl<Io: AsyncBufRead> Stream for RawXmlStream<Io> {
    type Item = Result<rxml::Event, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            return Poll::Ready(
                match ready!(this.parser.as_mut().poll_read(cx)).transpose() {
                    // Skip the XML declaration, nobody wants to hear about that.
                    Some(Ok(rxml::Event::XmlDeclaration(_, _))) => continue,
                    other => other,
                },
            );
        }
    }
}
