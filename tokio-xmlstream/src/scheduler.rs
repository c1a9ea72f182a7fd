// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The timer loop.
//!
//! Tasks are kept in a deadline-ordered heap; firing a task does not run its
//! callback here but enqueues it on the shared event queue, so slow
//! callbacks cannot delay other timers. Re-adding a name cancels the pending
//! instance: every registration gets a fresh generation number and stale
//! heap entries are dropped when they surface.

use core::time::Duration;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::dispatch::QueuedEvent;
use crate::error::Error;
use crate::XmlStream;

/// Callback invoked when a scheduled task fires.
pub type ScheduleCallback = Arc<dyn Fn(&XmlStream) -> Result<(), Error> + Send + Sync>;

pub(crate) struct Task {
    pub(crate) name: String,
    pub(crate) delay: Duration,
    pub(crate) repeat: bool,
    pub(crate) callback: ScheduleCallback,
}

pub(crate) enum SchedCommand {
    Add(Task),
    Remove(String),
    Quit,
}

struct Pending {
    deadline: Instant,
    generation: u64,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Pending) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Pending) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed so that the earliest deadline surfaces first in the
    // max-heap.
    fn cmp(&self, other: &Pending) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

pub(crate) async fn run(
    mut commands: mpsc::UnboundedReceiver<SchedCommand>,
    events: mpsc::UnboundedSender<QueuedEvent>,
) {
    let mut heap: BinaryHeap<Pending> = BinaryHeap::new();
    // Maps task name to the generation of its live registration; heap
    // entries with any other generation are cancelled leftovers.
    let mut live: HashMap<String, u64> = HashMap::new();
    let mut generation: u64 = 0;
    loop {
        let next_deadline = heap.peek().map(|p| p.deadline);
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(SchedCommand::Quit) => break,
                Some(SchedCommand::Add(task)) => {
                    generation += 1;
                    log::debug!("scheduling task '{}' in {:?}", task.name, task.delay);
                    live.insert(task.name.clone(), generation);
                    heap.push(Pending {
                        deadline: Instant::now() + task.delay,
                        generation,
                        task,
                    });
                }
                Some(SchedCommand::Remove(name)) => {
                    live.remove(&name);
                }
            },
            _ = sleep_until_or_forever(next_deadline) => {
                let now = Instant::now();
                while heap.peek().map(|p| p.deadline <= now).unwrap_or(false) {
                    let pending = match heap.pop() {
                        Some(p) => p,
                        None => break,
                    };
                    if live.get(&pending.task.name) != Some(&pending.generation) {
                        continue;
                    }
                    log::debug!("firing scheduled task '{}'", pending.task.name);
                    let sent = events.send(QueuedEvent::Schedule {
                        name: pending.task.name.clone(),
                        callback: pending.task.callback.clone(),
                    });
                    if sent.is_err() {
                        return;
                    }
                    if pending.task.repeat {
                        let deadline = now + pending.task.delay;
                        heap.push(Pending { deadline, ..pending });
                    } else {
                        live.remove(&pending.task.name);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ScheduleCallback {
        Arc::new(|_| Ok(()))
    }

    fn add(name: &str, secs: u64, repeat: bool) -> SchedCommand {
        SchedCommand::Add(Task {
            name: name.to_owned(),
            delay: Duration::from_secs(secs),
            repeat,
            callback: noop(),
        })
    }

    async fn recv_name(
        events: &mut mpsc::UnboundedReceiver<QueuedEvent>,
        within: Duration,
    ) -> Option<String> {
        match tokio::time::timeout(within, events.recv()).await {
            Ok(Some(QueuedEvent::Schedule { name, .. })) => Some(name),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn readding_a_name_cancels_the_previous_instance() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, event_tx));

        cmd_tx.send(add("t", 5, false)).unwrap();
        cmd_tx.send(add("t", 1, false)).unwrap();

        let started = Instant::now();
        let fired = recv_name(&mut event_rx, Duration::from_secs(30)).await;
        assert_eq!(fired.as_deref(), Some("t"));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The 5s registration must not fire as a second event.
        assert!(recv_name(&mut event_rx, Duration::from_secs(30)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_tasks_do_not_fire() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, event_tx));

        cmd_tx.send(add("gone", 3, false)).unwrap();
        cmd_tx.send(SchedCommand::Remove("gone".to_owned())).unwrap();
        assert!(recv_name(&mut event_rx, Duration::from_secs(30)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_fires_again() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx, event_tx));

        cmd_tx.send(add("tick", 2, true)).unwrap();
        for _ in 0..3 {
            let fired = recv_name(&mut event_rx, Duration::from_secs(30)).await;
            assert_eq!(fired.as_deref(), Some("tick"));
        }
        cmd_tx.send(SchedCommand::Remove("tick".to_owned())).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn quit_stops_the_loop() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(cmd_rx, event_tx));

        cmd_tx.send(add("late", 60, false)).unwrap();
        cmd_tx.send(SchedCommand::Quit).unwrap();
        handle.await.unwrap();
        assert!(event_rx.recv().await.is_none());
    }
}
