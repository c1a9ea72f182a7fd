// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The event queue and its worker pool.
//!
//! Everything that runs user code asynchronously goes through one shared
//! queue: matched stanza handlers, fired timers and named events. A
//! configurable number of workers drains the queue; callback failures and
//! panics are confined to the dispatch boundary and can never kill a
//! worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use stanza::Stanza;

use crate::error::Error;
use crate::event::EventData;
use crate::scheduler::ScheduleCallback;
use crate::XmlStream;

mod filter;
mod handler;

pub use filter::{FilterDirection, FilterFn};
pub(crate) use filter::Filters;
pub use handler::{Handler, Matcher, StanzaCallback};

/// Callback invoked when a named event fires.
pub type EventCallback = Arc<dyn Fn(&XmlStream, EventData) -> Result<(), Error> + Send + Sync>;

/// A registered subscription to a named event.
pub(crate) struct EventEntry {
    pub(crate) callback: EventCallback,
    pub(crate) once: bool,
    pub(crate) threaded: bool,
}

pub(crate) enum QueuedEvent {
    /// A stanza matched by a handler; carries its own (possibly copied)
    /// stanza instance.
    Stanza {
        handler: Arc<Handler>,
        stanza: Stanza,
    },
    /// A fired timer.
    Schedule {
        name: String,
        callback: ScheduleCallback,
    },
    /// A named event delivered to one subscription.
    Event {
        name: String,
        entry: Arc<EventEntry>,
        data: EventData,
    },
    /// Shut the workers down.
    Quit,
}

/// Runs a stanza handler callback, containing failures.
pub(crate) fn invoke_handler(stream: &XmlStream, handler: &Handler, stanza: Stanza) {
    let result = catch_unwind(AssertUnwindSafe(|| (handler.callback)(stream, stanza)));
    match result {
        Ok(Ok(())) => (),
        Ok(Err(e)) => {
            log::error!("handler '{}' failed: {}", handler.name, e);
            stream.report_callback_error(e);
        }
        Err(_) => log::error!("handler '{}' panicked", handler.name),
    }
}

/// Runs one event subscription, honouring its `threaded` flag.
pub(crate) fn invoke_event_entry(
    stream: &XmlStream,
    name: &str,
    entry: &Arc<EventEntry>,
    data: EventData,
) {
    if entry.threaded {
        let stream = stream.clone();
        let entry = entry.clone();
        let name = name.to_owned();
        std::thread::spawn(move || run_event_callback(&stream, &name, &entry, data));
    } else {
        run_event_callback(stream, name, entry, data);
    }
}

fn run_event_callback(stream: &XmlStream, name: &str, entry: &EventEntry, data: EventData) {
    let result = catch_unwind(AssertUnwindSafe(|| (entry.callback)(stream, data)));
    match result {
        Ok(Ok(())) => (),
        Ok(Err(e)) => {
            log::error!("event handler for '{}' failed: {}", name, e);
            stream.report_callback_error(e);
        }
        Err(_) => log::error!("event handler for '{}' panicked", name),
    }
}

fn run_schedule_callback(stream: &XmlStream, name: &str, callback: &ScheduleCallback) {
    let result = catch_unwind(AssertUnwindSafe(|| callback(stream)));
    match result {
        Ok(Ok(())) => (),
        Ok(Err(e)) => log::error!("scheduled task '{}' failed: {}", name, e),
        Err(_) => log::error!("scheduled task '{}' panicked", name),
    }
}

/// Spawns the dispatch worker pool over a single shared receiver.
pub(crate) fn spawn_workers(
    stream: XmlStream,
    queue: mpsc::UnboundedReceiver<QueuedEvent>,
    count: usize,
) {
    let queue = Arc::new(Mutex::new(queue));
    for id in 0..count.max(1) {
        let stream = stream.clone();
        let queue = queue.clone();
        tokio::spawn(worker_loop(id, stream, queue));
    }
}

async fn worker_loop(
    id: usize,
    stream: XmlStream,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<QueuedEvent>>>,
) {
    log::debug!("dispatch worker {} starting", id);
    loop {
        let item = { queue.lock().await.recv().await };
        match item {
            None => break,
            Some(QueuedEvent::Quit) => {
                // Wake the remaining workers too.
                stream.enqueue(QueuedEvent::Quit);
                break;
            }
            Some(QueuedEvent::Stanza { handler, stanza }) => {
                invoke_handler(&stream, &handler, stanza);
            }
            Some(QueuedEvent::Schedule { name, callback }) => {
                run_schedule_callback(&stream, &name, &callback);
            }
            Some(QueuedEvent::Event { name, entry, data }) => {
                invoke_event_entry(&stream, &name, &entry, data);
            }
        }
    }
    log::debug!("dispatch worker {} exiting", id);
}
