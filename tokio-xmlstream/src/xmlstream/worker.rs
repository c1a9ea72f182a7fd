// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The socket worker.
//!
//! One task owns the whole connection lifecycle: resolving candidates,
//! dialling with backoff, the connected read/write loop, TLS upgrades and
//! orderly shutdown. The rest of the crate talks to it through the command
//! and send queues, so there is never more than one live socket per stream.

use core::pin::Pin;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::poll_fn;
use futures::StreamExt;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use stanza::escape;

use crate::config::{CertVerdict, StreamConfig};
use crate::connect::{self, proxy, tls, DnsConfig, Transport};
use crate::dispatch::FilterDirection;
use crate::error::Error;
use crate::event::{self, EventData};
use crate::stream_error::StreamError;

use super::raw::RawXmlStream;
use super::reader::{StreamEvent, StreamReader};
use super::{Command, ConnectionState, QueuedStanza, XmlStream};

type Conn = RawXmlStream<BufStream<Transport>>;

enum Next {
    Idle,
    Connect,
    Run(Conn),
}

/// What a backoff wait ended with.
enum WaitOutcome {
    Stop,
    DialNow,
    Activate(Transport),
}

pub(super) fn spawn(
    stream: XmlStream,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    send_rx: mpsc::UnboundedReceiver<QueuedStanza>,
    session_rx: watch::Receiver<bool>,
    stop_rx: watch::Receiver<bool>,
) {
    let reader = StreamReader::new(&stream.core.config.stream_ns);
    tokio::spawn(
        Worker {
            stream,
            cmd_rx,
            send_rx,
            session_rx,
            stop_rx,
            reader,
            delay: None,
            attempts_used: 0,
            candidates: VecDeque::new(),
        }
        .run(),
    );
}

struct Worker {
    stream: XmlStream,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    send_rx: mpsc::UnboundedReceiver<QueuedStanza>,
    session_rx: watch::Receiver<bool>,
    stop_rx: watch::Receiver<bool>,
    reader: StreamReader,
    // Backoff state, carried across consecutive failures and reset on
    // success or on a fresh connect request.
    delay: Option<core::time::Duration>,
    attempts_used: u32,
    candidates: VecDeque<SocketAddr>,
}

impl Worker {
    async fn run(mut self) {
        let mut next = Next::Idle;
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            next = match next {
                Next::Idle => match self.idle().await {
                    Some(next) => next,
                    None => break,
                },
                Next::Connect => match self.establish().await {
                    Some(conn) => Next::Run(conn),
                    None => Next::Idle,
                },
                Next::Run(conn) => self.run_connection(conn).await,
            };
        }
        log::debug!("stream worker exiting");
    }

    /// Waits for something to do while disconnected.
    async fn idle(&mut self) -> Option<Next> {
        loop {
            match self.cmd_rx.recv().await? {
                Command::Connect => {
                    self.reset_backoff();
                    return Some(Next::Connect);
                }
                Command::ConnectTransport(transport) => {
                    self.reset_backoff();
                    match self.activate(transport).await {
                        Ok(conn) => return Some(Next::Run(conn)),
                        Err(error) => {
                            // No address to redial for an injected transport.
                            log::error!("injected transport failed: {}", error);
                            self.stream
                                .event(event::SOCKET_ERROR, EventData::Error(Arc::new(error)));
                            if self.stream.is_connected() {
                                self.finish_disconnect();
                            }
                            return Some(Next::Idle);
                        }
                    }
                }
                Command::Disconnect { reconnect, .. } => {
                    if reconnect {
                        self.reset_backoff();
                        return Some(Next::Connect);
                    }
                    self.stream.signal_stop();
                    return Some(Next::Idle);
                }
                Command::StartTls | Command::Restart => {
                    log::warn!("not connected, ignoring stream command");
                }
                Command::SendRaw(_) => {
                    log::debug!("not connected, dropping raw data");
                }
            }
        }
    }

    fn reset_backoff(&mut self) {
        self.delay = None;
        self.attempts_used = 0;
        self.candidates.clear();
    }

    /// Dials until a connection comes up, the attempt budget runs out, or
    /// the engine is told to stop.
    async fn establish(&mut self) -> Option<Conn> {
        let config = self.stream.core.config.clone();
        loop {
            if *self.stop_rx.borrow() {
                return None;
            }
            let delay = connect::next_delay(self.delay, config.reconnect_max_delay);
            self.delay = Some(delay);
            if !delay.is_zero() {
                log::info!("waiting {:?} before connecting", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    outcome = self.watch_commands_while_waiting() => match outcome {
                        WaitOutcome::Stop => return None,
                        WaitOutcome::DialNow => self.reset_backoff(),
                        WaitOutcome::Activate(transport) => {
                            self.reset_backoff();
                            match self.activate(transport).await {
                                Ok(conn) => return Some(conn),
                                Err(error) => {
                                    log::error!("injected transport failed: {}", error);
                                    if self.stream.is_connected() {
                                        self.finish_disconnect();
                                    }
                                    self.stream.event(
                                        event::SOCKET_ERROR,
                                        EventData::Error(Arc::new(error)),
                                    );
                                }
                            }
                        }
                    }
                }
            }
            if let Some(max) = config.max_attempts {
                if self.attempts_used >= max {
                    log::error!("giving up after {} connection attempts", max);
                    self.stream.event(
                        event::CONNECTION_FAILED,
                        EventData::Error(Arc::new(Error::ConnectionFailed)),
                    );
                    return None;
                }
            }
            self.attempts_used += 1;
            match self.try_once(&config).await {
                Ok(conn) => {
                    self.reset_backoff();
                    return Some(conn);
                }
                Err(error) => {
                    log::warn!("connection attempt failed: {}", error);
                    if self.stream.is_connected() {
                        self.finish_disconnect();
                    }
                    self.stream
                        .event(event::SOCKET_ERROR, EventData::Error(Arc::new(error)));
                }
            }
        }
    }

    /// Consumes commands arriving during a backoff sleep. A connect request
    /// cuts the wait short instead of being swallowed by it.
    async fn watch_commands_while_waiting(&mut self) -> WaitOutcome {
        loop {
            match self.cmd_rx.recv().await {
                None => return WaitOutcome::Stop,
                Some(Command::Connect) => {
                    log::debug!("connect requested, skipping the remaining backoff");
                    return WaitOutcome::DialNow;
                }
                Some(Command::ConnectTransport(transport)) => {
                    return WaitOutcome::Activate(transport);
                }
                Some(Command::Disconnect { reconnect, .. }) => {
                    if reconnect {
                        return WaitOutcome::DialNow;
                    }
                    self.stream.signal_stop();
                    return WaitOutcome::Stop;
                }
                Some(Command::StartTls) | Some(Command::Restart) => {
                    log::warn!("not connected, ignoring stream command");
                }
                Some(Command::SendRaw(_)) => {
                    log::debug!("not connected, dropping raw data");
                }
            }
        }
    }

    async fn try_once(&mut self, config: &StreamConfig) -> Result<Conn, Error> {
        let socket = if let Some(proxy_config) = &config.proxy {
            let mut socket =
                TcpStream::connect((proxy_config.host.as_str(), proxy_config.port)).await?;
            let host = config.host.as_deref().unwrap_or(&config.domain);
            proxy::tunnel(&mut socket, host, config.port, proxy_config).await?;
            socket
        } else {
            let addr = self.next_candidate(config).await?;
            log::info!("connecting to {}", addr);
            TcpStream::connect(addr).await?
        };
        let transport: Transport = Box::new(socket);
        let transport = if config.use_ssl {
            self.secure(transport).await?
        } else {
            transport
        };
        self.activate(transport).await
    }

    /// Pops the next address to try, resolving a fresh candidate list only
    /// when the previous one is used up.
    async fn next_candidate(&mut self, config: &StreamConfig) -> Result<SocketAddr, Error> {
        if self.candidates.is_empty() {
            let dns = match (&config.host, &config.srv_service) {
                (Some(host), _) => DnsConfig::no_srv(host, config.port),
                (None, Some(srv)) => DnsConfig::srv(&config.domain, srv, config.port),
                (None, None) => DnsConfig::no_srv(&config.domain, config.port),
            };
            log::debug!("resolving {}", dns);
            self.candidates = dns.candidates(config.use_ipv6).await?.into();
        }
        self.candidates.pop_front().ok_or(Error::Disconnected)
    }

    /// TLS handshake plus the pluggable verification step, shared by direct
    /// SSL and the mid-stream upgrade.
    async fn secure(&mut self, transport: Transport) -> Result<Transport, Error> {
        let config = self.stream.core.config.clone();
        let (tls_stream, peer_der) = tls::wrap(transport, &config).await?;
        if let Some(der) = peer_der {
            self.stream
                .event(event::SSL_CERT, EventData::Certificate(der.clone()));
            if let Some(verifier) = &config.cert_verifier {
                match verifier(&config.domain, &der) {
                    CertVerdict::Trusted { expires_in } => {
                        if let Some(left) = expires_in {
                            // Reconnect when the certificate expires, picking
                            // up the replacement the server presents by then.
                            self.stream
                                .schedule("Certificate Expiration", left, false, |stream| {
                                    log::warn!("peer certificate expired, reconnecting");
                                    stream.reconnect();
                                    Ok(())
                                });
                        }
                    }
                    CertVerdict::Untrusted(reason) => {
                        self.stream.clear_cert_override();
                        self.stream.event_direct(
                            event::SSL_INVALID_CERT,
                            EventData::Certificate(der.clone()),
                        );
                        if self.stream.cert_override_requested() {
                            log::warn!("untrusted certificate accepted by handler: {}", reason);
                        } else {
                            return Err(Error::InvalidCertificate(reason));
                        }
                    }
                }
            }
        }
        Ok(Box::new(tls_stream))
    }

    /// Wraps a ready transport, announces the connection and opens our side
    /// of the stream. The `connected` event runs to completion before the
    /// header goes out.
    async fn activate(&mut self, transport: Transport) -> Result<Conn, Error> {
        let mut conn = RawXmlStream::new(BufStream::new(transport));
        self.reader.reset();
        self.stream.set_state(ConnectionState::Connected);
        self.stream.event_direct(event::CONNECTED, EventData::Empty);
        self.send_header(&mut conn).await?;
        Ok(conn)
    }

    async fn send_header(&mut self, conn: &mut Conn) -> Result<(), Error> {
        let config = &self.stream.core.config;
        let header = format!(
            "<stream:stream xmlns=\"{}\" xmlns:stream=\"{}\" to=\"{}\" xml:lang=\"{}\" version=\"1.0\">",
            escape(&config.default_ns),
            escape(&config.stream_ns),
            escape(&config.domain),
            escape(&config.lang),
        );
        log::debug!("SEND: {}", header);
        write_all(conn, header.as_bytes()).await
    }

    /// The connected loop. Returns what the worker should do next.
    async fn run_connection(&mut self, mut conn: Conn) -> Next {
        log::debug!("stream is up");
        loop {
            if *self.stop_rx.borrow() {
                return Next::Idle;
            }
            // Stanzas stay queued until the session gate opens; raw data
            // and commands are always serviced.
            let can_send = *self.session_rx.borrow() && conn.write_ready();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Next::Idle };
                    match cmd {
                        Command::Connect | Command::ConnectTransport(_) => {
                            log::warn!("already connected, ignoring connect request");
                        }
                        Command::SendRaw(data) => {
                            log::debug!("SEND: {}", data);
                            if let Err(e) = write_all(&mut conn, data.as_bytes()).await {
                                return self.fail(conn, e).await;
                            }
                        }
                        Command::Restart => {
                            log::debug!("restarting the stream");
                            Pin::new(&mut conn).reset_state();
                            self.reader.reset();
                            if let Err(e) = self.send_header(&mut conn).await {
                                return self.fail(conn, e).await;
                            }
                        }
                        Command::StartTls => match self.upgrade(conn).await {
                            Ok(new_conn) => conn = new_conn,
                            Err(e) => return self.fail_disconnected(e),
                        },
                        Command::Disconnect { reconnect, wait, send_close } => {
                            self.shutdown_conn(&mut conn, wait, send_close).await;
                            self.finish_disconnect();
                            if reconnect {
                                return Next::Connect;
                            }
                            self.stream.signal_stop();
                            return Next::Idle;
                        }
                    }
                }
                queued = self.send_rx.recv(), if can_send => {
                    let Some(queued) = queued else { return Next::Idle };
                    if let Err(e) = self.write_stanza(&mut conn, queued).await {
                        return self.fail(conn, e).await;
                    }
                }
                // Wakes the loop when the session gate opens so the guard
                // above is re-evaluated.
                _ = self.session_rx.changed() => {}
                item = StreamExt::next(&mut conn) => {
                    match item {
                        None => return self.fail(conn, Error::Disconnected).await,
                        Some(Err(e)) => return self.fail(conn, e.into()).await,
                        Some(Ok(xml_event)) => match self.reader.process(xml_event) {
                            Err(proto) => return self.fail(conn, proto.into()).await,
                            Ok(None) => {}
                            Ok(Some(stream_event)) => {
                                if let Some(next) =
                                    self.handle_stream_event(&mut conn, stream_event).await
                                {
                                    return next;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write_stanza(&mut self, conn: &mut Conn, queued: QueuedStanza) -> Result<(), Error> {
        let QueuedStanza { stanza, use_filters } = queued;
        let stanza = if use_filters {
            self.stream.apply_filters(FilterDirection::OutSync, stanza)
        } else {
            Some(stanza)
        };
        let Some(stanza) = stanza else {
            log::debug!("outgoing stanza dropped by filter");
            return Ok(());
        };
        let data = stanza.to_xml_string(&self.stream.core.config.default_ns);
        log::debug!("SEND: {}", data);
        write_all(conn, data.as_bytes()).await
    }

    async fn handle_stream_event(
        &mut self,
        conn: &mut Conn,
        stream_event: StreamEvent,
    ) -> Option<Next> {
        match stream_event {
            StreamEvent::Header(header) => {
                log::debug!(
                    "RECV stream header from {}",
                    header.attr("from").unwrap_or("peer")
                );
                self.stream
                    .event_direct(event::STREAM_START, EventData::Stanza(header));
                if self.stream.core.config.auto_session {
                    self.stream.mark_session_started();
                }
                None
            }
            StreamEvent::Stanza(stanza) => {
                if stanza.namespace() == self.stream.core.config.stream_ns
                    && stanza.name() == "error"
                {
                    let error = StreamError::from_stanza(&stanza);
                    log::error!("stream error from peer: {}", error);
                    self.stream
                        .event_direct(event::STREAM_ERROR, EventData::Stanza(stanza));
                    self.stream
                        .event(event::SOCKET_ERROR, EventData::Error(Arc::new(error.into())));
                    // The peer closes the stream after sending an error;
                    // mirror the close and let the reconnect policy decide.
                    self.shutdown_conn(conn, false, true).await;
                    self.finish_disconnect();
                    return Some(self.reconnect_or_stop());
                }
                log::debug!("RECV: {}", stanza);
                self.stream.dispatch_incoming(stanza);
                None
            }
            StreamEvent::Footer => {
                log::debug!("peer closed the stream");
                self.stream.event_direct(event::STREAM_END, EventData::Empty);
                let _ = write_all(conn, b"</stream:stream>").await;
                let _ = poll_fn(|cx| Pin::new(&mut *conn).poll_shutdown(cx)).await;
                self.finish_disconnect();
                Some(self.reconnect_or_stop())
            }
        }
    }

    /// Orderly close: optionally drain the send queue, send the footer and
    /// give the peer a bounded moment to mirror it.
    async fn shutdown_conn(&mut self, conn: &mut Conn, wait: bool, send_close: bool) {
        if wait {
            while let Ok(queued) = self.send_rx.try_recv() {
                if self.write_stanza(conn, queued).await.is_err() {
                    break;
                }
            }
        }
        if send_close {
            log::debug!("SEND: </stream:stream>");
            if write_all(conn, b"</stream:stream>").await.is_ok() {
                let reader = &mut self.reader;
                let stream = &self.stream;
                let wait_footer = async {
                    loop {
                        match StreamExt::next(&mut *conn).await {
                            None | Some(Err(_)) => break,
                            Some(Ok(xml_event)) => match reader.process(xml_event) {
                                Ok(Some(StreamEvent::Footer)) | Err(_) => break,
                                Ok(Some(StreamEvent::Stanza(stanza))) => {
                                    stream.dispatch_incoming(stanza)
                                }
                                _ => {}
                            },
                        }
                    }
                };
                let timeout = self.stream.core.config.disconnect_wait;
                let _ = tokio::time::timeout(timeout, wait_footer).await;
            }
        }
        let _ = poll_fn(|cx| Pin::new(&mut *conn).poll_shutdown(cx)).await;
    }

    /// Unplanned stream death with a live connection object.
    async fn fail(&mut self, mut conn: Conn, error: Error) -> Next {
        let _ = poll_fn(|cx| Pin::new(&mut conn).poll_shutdown(cx)).await;
        self.fail_disconnected(error)
    }

    /// Unplanned stream death after the connection is already gone.
    fn fail_disconnected(&mut self, error: Error) -> Next {
        log::error!("stream failed: {}", error);
        self.stream
            .event(event::SOCKET_ERROR, EventData::Error(Arc::new(error)));
        self.finish_disconnect();
        self.reconnect_or_stop()
    }

    fn reconnect_or_stop(&mut self) -> Next {
        if self.stream.core.config.auto_reconnect {
            Next::Connect
        } else {
            self.stream.signal_stop();
            Next::Idle
        }
    }

    fn finish_disconnect(&mut self) {
        if self.stream.close_session() {
            self.stream
                .event_direct(event::SESSION_END, EventData::Empty);
        }
        self.stream.set_state(ConnectionState::Disconnected);
        self.stream
            .event_direct(event::DISCONNECTED, EventData::Empty);
        self.reader.reset();
    }

    /// Mid-stream TLS upgrade: recover the raw transport, handshake, then
    /// restart the stream on the secured channel.
    async fn upgrade(&mut self, conn: Conn) -> Result<Conn, Error> {
        log::debug!("upgrading to TLS");
        // The peer must not send anything between accepting STARTTLS and
        // our handshake bytes, so dropping the read buffer here is safe.
        let transport = conn.into_inner().into_inner();
        let secured = self.secure(transport).await?;
        let mut conn = RawXmlStream::new(BufStream::new(secured));
        self.reader.reset();
        self.send_header(&mut conn).await?;
        Ok(conn)
    }
}

async fn write_all(conn: &mut Conn, bytes: &[u8]) -> Result<(), Error> {
    Pin::new(&mut *conn).queue_send(bytes);
    poll_fn(|cx| Pin::new(&mut *conn).poll_flush(cx)).await?;
    Ok(())
}
