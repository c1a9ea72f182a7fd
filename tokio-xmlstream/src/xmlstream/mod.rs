// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The stream handle and its background loops.
//!
//! [`XmlStream::new`] spawns four kinds of tasks: the socket worker (connect
//! loop, read loop and send-queue drain in one state machine), the
//! scheduler, and one or more dispatch workers. The handle itself is a
//! cheaply clonable facade over command and data channels; all connection
//! state is owned by the socket worker, so concurrent calls can never race
//! two connection attempts into existence.

use core::time::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, oneshot, watch};

use stanza::Stanza;

use crate::config::StreamConfig;
use crate::connect::Transport;
use crate::dispatch::{
    self, EventCallback, EventEntry, FilterDirection, FilterFn, Filters, Handler, Matcher,
    QueuedEvent,
};
use crate::error::Error;
use crate::event::{self, EventData};
use crate::scheduler::{self, SchedCommand, Task};

mod raw;
mod reader;
#[cfg(test)]
mod tests;
mod worker;

/// Connection state of a stream, observable via [`XmlStream::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live socket.
    Disconnected,
    /// A socket is established and the stream header has been sent.
    Connected,
}

/// Hook receiving errors returned by user callbacks.
pub type ExceptionHandler = Arc<dyn Fn(&XmlStream, Error) + Send + Sync>;

pub(crate) enum Command {
    Connect,
    ConnectTransport(Transport),
    Disconnect {
        reconnect: bool,
        wait: bool,
        send_close: bool,
    },
    StartTls,
    Restart,
    SendRaw(String),
}

pub(crate) struct QueuedStanza {
    pub(crate) stanza: Stanza,
    pub(crate) use_filters: bool,
}

pub(crate) struct Core {
    pub(crate) config: StreamConfig,
    handlers: StdMutex<Vec<Arc<Handler>>>,
    filters: StdMutex<Filters>,
    events: StdMutex<HashMap<String, Vec<Arc<EventEntry>>>>,
    event_tx: mpsc::UnboundedSender<QueuedEvent>,
    send_tx: mpsc::UnboundedSender<QueuedStanza>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    sched_tx: mpsc::UnboundedSender<SchedCommand>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<bool>,
    stop_tx: watch::Sender<bool>,
    cert_override: AtomicBool,
    exception_handler: StdMutex<Option<ExceptionHandler>>,
}

/// Handle to a running XML stream engine.
///
/// Clones share the same stream. Most methods only post to the worker's
/// queues and return immediately; observation happens through events and
/// the `wait_*` helpers.
#[derive(Clone)]
pub struct XmlStream {
    core: Arc<Core>,
}

impl XmlStream {
    /// Creates the engine and spawns its background tasks.
    ///
    /// Must be called within a tokio runtime. The stream starts out
    /// disconnected; call [`XmlStream::connect`].
    pub fn new(config: StreamConfig) -> XmlStream {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sched_tx, sched_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let keepalive = config.keepalive_interval;
        let dispatch_workers = config.dispatch_workers;
        let stream = XmlStream {
            core: Arc::new(Core {
                config,
                handlers: StdMutex::new(Vec::new()),
                filters: StdMutex::new(Filters::default()),
                events: StdMutex::new(HashMap::new()),
                event_tx,
                send_tx,
                cmd_tx,
                sched_tx,
                state_tx,
                session_tx,
                stop_tx,
                cert_override: AtomicBool::new(false),
                exception_handler: StdMutex::new(None),
            }),
        };

        tokio::spawn(scheduler::run(sched_rx, stream.core.event_tx.clone()));
        dispatch::spawn_workers(stream.clone(), event_rx, dispatch_workers);
        worker::spawn(stream.clone(), cmd_rx, send_rx, session_rx, stop_rx);

        if !keepalive.is_zero() {
            stream.schedule("Whitespace Keepalive", keepalive, true, |stream| {
                if stream.is_connected() && stream.session_started() {
                    stream.send_raw(" ");
                }
                Ok(())
            });
        }
        stream
    }

    /// Returns the configuration this stream runs with.
    pub fn config(&self) -> &StreamConfig {
        &self.core.config
    }

    // ---- connection lifecycle -------------------------------------------

    /// Asks the worker to establish a connection.
    ///
    /// Progress is reported through the `connected`, `socket_error` and
    /// `connection_failed` events.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Runs the stream over an externally established transport, skipping
    /// DNS, proxy and TLS setup. This is the injection point for tests and
    /// for exotic transports.
    pub fn connect_with(&self, transport: Transport) {
        self.command(Command::ConnectTransport(transport));
    }

    /// Closes the stream.
    ///
    /// With `wait`, the pending send queue is flushed first. Unless
    /// `send_close` is suppressed, the closing `</stream:stream>` footer is
    /// sent and the peer is given a moment to mirror it. With `reconnect`
    /// the worker dials again afterwards; otherwise the whole engine shuts
    /// down.
    pub fn disconnect(&self, reconnect: bool, wait: bool, send_close: bool) {
        self.command(Command::Disconnect {
            reconnect,
            wait,
            send_close,
        });
    }

    /// Orderly disconnect followed by a fresh connection attempt.
    pub fn reconnect(&self) {
        self.disconnect(true, true, true);
    }

    /// Orderly disconnect and engine shutdown.
    pub fn shutdown(&self) {
        self.disconnect(false, true, true);
    }

    /// Upgrades the live connection to TLS in place and restarts the
    /// stream on top of it.
    pub fn start_tls(&self) {
        self.command(Command::StartTls);
    }

    /// Resets the parser and resends the stream header over the existing
    /// connection.
    pub fn restart_stream(&self) {
        self.command(Command::Restart);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.core.state_tx.borrow()
    }

    /// Whether a socket is currently established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the session gate is open and the send queue draining.
    pub fn session_started(&self) -> bool {
        *self.core.session_tx.borrow()
    }

    /// Opens the session gate, releasing queued stanzas to the writer, and
    /// raises `session_start`.
    ///
    /// Called automatically on the peer's stream header when
    /// [`StreamConfig::auto_session`] is set; otherwise the application
    /// calls this once its handshake is done.
    pub fn mark_session_started(&self) {
        let was = self.core.session_tx.send_replace(true);
        if !was {
            self.event(event::SESSION_START, EventData::Empty);
        }
    }

    /// Waits until the stream reaches the given state.
    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut rx = self.core.state_tx.subscribe();
        // wait_for also checks the current value first.
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Waits until the session gate opens.
    pub async fn wait_for_session(&self) {
        let mut rx = self.core.session_tx.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }

    /// Waits for engine shutdown (a non-reconnecting disconnect).
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.core.stop_tx.subscribe();
        let _ = rx.wait_for(|s| *s).await;
    }

    // ---- sending --------------------------------------------------------

    /// Queues a stanza for sending, honouring
    /// [`StreamConfig::use_filters`].
    pub fn send(&self, stanza: Stanza) {
        self.send_with_filters(stanza, self.core.config.use_filters);
    }

    /// Queues a stanza for sending, with explicit control over the
    /// outgoing filter chains.
    pub fn send_with_filters(&self, stanza: Stanza, use_filters: bool) {
        let stanza = if use_filters {
            match self.apply_filters(FilterDirection::Out, stanza) {
                Some(stanza) => stanza,
                None => {
                    log::debug!("outgoing stanza dropped by filter");
                    return;
                }
            }
        } else {
            stanza
        };
        let _ = self.core.send_tx.send(QueuedStanza {
            stanza,
            use_filters,
        });
    }

    /// Writes raw data to the socket immediately, bypassing the send queue
    /// and the session gate. Meant for stream-initialisation data and
    /// keepalives; dropped with a log message when disconnected.
    pub fn send_raw(&self, data: impl Into<String>) {
        self.command(Command::SendRaw(data.into()));
    }

    /// Sends a stanza and waits for the first incoming stanza matching
    /// `matcher`, up to [`StreamConfig::response_timeout`].
    pub async fn send_wait(&self, stanza: Stanza, matcher: Matcher) -> Result<Stanza, Error> {
        use rand::Rng;
        let (tx, rx) = oneshot::channel();
        let slot = StdMutex::new(Some(tx));
        let name = format!("#send-wait-{:016x}", rand::thread_rng().gen::<u64>());
        self.register_handler(
            Handler::new(&name, matcher, move |_stream, response| {
                if let Some(tx) = slot.lock().unwrap().take() {
                    let _ = tx.send(response);
                }
                Ok(())
            })
            .once(),
        );
        self.send(stanza);
        match tokio::time::timeout(self.core.config.response_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.remove_handler(&name);
                Err(Error::Disconnected)
            }
            Err(_) => {
                self.remove_handler(&name);
                Err(Error::Timeout)
            }
        }
    }

    // ---- handlers, filters, events --------------------------------------

    /// Registers a stanza handler.
    pub fn register_handler(&self, handler: Handler) {
        self.core.handlers.lock().unwrap().push(Arc::new(handler));
    }

    /// Removes all handlers with the given name, reporting whether any
    /// existed.
    pub fn remove_handler(&self, name: &str) -> bool {
        let mut handlers = self.core.handlers.lock().unwrap();
        let before = handlers.len();
        handlers.retain(|h| h.name != name);
        handlers.len() != before
    }

    /// Adds a filter to one of the chains; `order` positions it within the
    /// chain, lower first, with unordered filters running last in
    /// registration order.
    pub fn add_filter(&self, direction: FilterDirection, filter: FilterFn, order: Option<i32>) {
        self.core
            .filters
            .lock()
            .unwrap()
            .chain_mut(direction)
            .add(filter, order);
    }

    /// Removes a previously added filter (compared by identity).
    pub fn del_filter(&self, direction: FilterDirection, filter: &FilterFn) -> bool {
        self.core
            .filters
            .lock()
            .unwrap()
            .chain_mut(direction)
            .remove(filter)
    }

    /// Subscribes `callback` to the named event.
    ///
    /// With `once` the subscription is dropped when first dispatched; with
    /// `threaded` the callback runs on its own OS thread instead of a
    /// dispatch worker.
    pub fn add_event_handler(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&XmlStream, EventData) -> Result<(), Error> + Send + Sync + 'static,
        once: bool,
        threaded: bool,
    ) {
        let entry = Arc::new(EventEntry {
            callback: Arc::new(callback) as EventCallback,
            once,
            threaded,
        });
        self.core
            .events
            .lock()
            .unwrap()
            .entry(name.into())
            .or_default()
            .push(entry);
    }

    /// Drops every subscription to the named event.
    pub fn del_event_handler(&self, name: &str) -> bool {
        self.core.events.lock().unwrap().remove(name).is_some()
    }

    /// Number of subscriptions to the named event.
    pub fn event_handled(&self, name: &str) -> usize {
        self.core
            .events
            .lock()
            .unwrap()
            .get(name)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Raises a named event asynchronously: every subscription is put on
    /// the event queue.
    pub fn event(&self, name: &str, data: EventData) {
        for entry in self.take_event_entries(name) {
            self.enqueue(QueuedEvent::Event {
                name: name.to_owned(),
                entry,
                data: data.clone(),
            });
        }
    }

    /// Raises a named event synchronously in the calling task, giving
    /// deterministic ordering relative to the caller's subsequent code.
    /// Used for lifecycle events.
    pub fn event_direct(&self, name: &str, data: EventData) {
        for entry in self.take_event_entries(name) {
            dispatch::invoke_event_entry(self, name, &entry, data.clone());
        }
    }

    // One-shot subscriptions leave the registry when dispatched (queued or
    // invoked), not when they finish running.
    fn take_event_entries(&self, name: &str) -> Vec<Arc<EventEntry>> {
        let mut events = self.core.events.lock().unwrap();
        let Some(list) = events.get_mut(name) else {
            return Vec::new();
        };
        let snapshot = list.clone();
        list.retain(|e| !e.once);
        if list.is_empty() {
            events.remove(name);
        }
        snapshot
    }

    // ---- scheduler ------------------------------------------------------

    /// Schedules a named task. Re-using a name cancels and replaces the
    /// pending instance.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        delay: Duration,
        repeat: bool,
        callback: impl Fn(&XmlStream) -> Result<(), Error> + Send + Sync + 'static,
    ) {
        let _ = self.core.sched_tx.send(SchedCommand::Add(Task {
            name: name.into(),
            delay,
            repeat,
            callback: Arc::new(callback),
        }));
    }

    /// Cancels a scheduled task; no-op if absent.
    pub fn cancel_schedule(&self, name: &str) {
        let _ = self
            .core
            .sched_tx
            .send(SchedCommand::Remove(name.to_owned()));
    }

    // ---- error reporting hooks ------------------------------------------

    /// Installs a hook receiving errors returned by callbacks.
    pub fn set_exception_handler(&self, handler: ExceptionHandler) {
        *self.core.exception_handler.lock().unwrap() = Some(handler);
    }

    /// Accepts the certificate currently being rejected. Only meaningful
    /// from within an `ssl_invalid_cert` event handler.
    pub fn override_cert(&self) {
        self.core.cert_override.store(true, Ordering::SeqCst);
    }

    pub(crate) fn report_callback_error(&self, error: Error) {
        let handler = self.core.exception_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(self, error),
            None => log::debug!("no exception handler installed for: {}", error),
        }
    }

    // ---- internals shared with the worker -------------------------------

    fn command(&self, command: Command) {
        if self.core.cmd_tx.send(command).is_err() {
            log::warn!("stream worker is gone, command dropped");
        }
    }

    pub(crate) fn enqueue(&self, item: QueuedEvent) {
        let _ = self.core.event_tx.send(item);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.core.state_tx.send_replace(state);
    }

    pub(crate) fn close_session(&self) -> bool {
        self.core.session_tx.send_replace(false)
    }

    pub(crate) fn cert_override_requested(&self) -> bool {
        self.core.cert_override.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_cert_override(&self) {
        self.core.cert_override.store(false, Ordering::SeqCst);
    }

    /// Signals global shutdown: scheduler, dispatch workers and the socket
    /// worker all exit.
    pub(crate) fn signal_stop(&self) {
        self.core.stop_tx.send_replace(true);
        let _ = self.core.sched_tx.send(SchedCommand::Quit);
        self.enqueue(QueuedEvent::Quit);
    }

    /// Runs a filter chain outside the registry lock.
    pub(crate) fn apply_filters(
        &self,
        direction: FilterDirection,
        stanza: Stanza,
    ) -> Option<Stanza> {
        let chain = self
            .core
            .filters
            .lock()
            .unwrap()
            .chain_mut(direction)
            .snapshot();
        let mut stanza = stanza;
        for filter in chain {
            stanza = filter(self, stanza)?;
        }
        Some(stanza)
    }

    /// Feeds a freshly parsed stanza through the incoming filter chain and
    /// the handler registry.
    pub(crate) fn dispatch_incoming(&self, stanza: Stanza) {
        let Some(stanza) = self.apply_filters(FilterDirection::In, stanza) else {
            log::debug!("incoming stanza dropped by filter");
            return;
        };
        let matched: Vec<Arc<Handler>> = {
            let mut handlers = self.core.handlers.lock().unwrap();
            let matched: Vec<_> = handlers
                .iter()
                .filter(|h| h.matcher.matches(&stanza))
                .cloned()
                .collect();
            // Disposable handlers leave the registry at queue time, not
            // when they finish running, so a burst of matching stanzas
            // cannot fire them twice.
            handlers.retain(|h| !(h.once && matched.iter().any(|m| Arc::ptr_eq(m, h))));
            matched
        };
        if matched.is_empty() {
            log::debug!("no handler matched <{}/>", stanza.name());
            self.event(event::UNHANDLED_STANZA, EventData::Stanza(stanza));
            return;
        }
        // With several matches every handler gets its own copy, so that
        // independently scheduled invocations cannot observe each other's
        // mutations.
        let mut stanza = stanza;
        let mut matched = matched.into_iter().peekable();
        while let Some(handler) = matched.next() {
            let payload = if matched.peek().is_some() {
                stanza.clone()
            } else {
                core::mem::take(&mut stanza)
            };
            if handler.instream {
                dispatch::invoke_handler(self, &handler, payload);
            } else {
                self.enqueue(QueuedEvent::Stanza {
                    handler,
                    stanza: payload,
                });
            }
        }
    }
}
