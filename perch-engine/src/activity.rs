//! Join/part/kick summaries.
//!
//! Busy channels produce a line per JOIN/PART/KICK. With summaries on, those
//! events are collected per channel for one window and then emitted as a
//! single line from `*`:
//!
//! `[activity] 2 joined (x, y); 1 left (x)`
//!
//! Each open batch has one tokio timer. The timer task and the reader task
//! both go through the same mutex, so a flush never races a record.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::event::{Event, EventSink, SYSTEM_SENDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Join,
    Part,
    Kick,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActivityKind::Join => "join",
            ActivityKind::Part => "part",
            ActivityKind::Kick => "kick",
        })
    }
}

struct Batch {
    id: u64,
    channel: String,
    joined: BTreeSet<String>,
    parted: BTreeSet<String>,
    kicked: BTreeSet<String>,
    timer: Option<AbortHandle>,
}

impl Batch {
    fn new(id: u64, channel: &str) -> Self {
        Self {
            id,
            channel: channel.to_string(),
            joined: BTreeSet::new(),
            parted: BTreeSet::new(),
            kicked: BTreeSet::new(),
            timer: None,
        }
    }

    fn summary(&self) -> Option<String> {
        let clauses: Vec<String> = [
            (&self.joined, "joined"),
            (&self.parted, "left"),
            (&self.kicked, "kicked"),
        ]
        .into_iter()
        .filter(|(nicks, _)| !nicks.is_empty())
        .map(|(nicks, verb)| {
            let names: Vec<&str> = nicks.iter().map(String::as_str).collect();
            format!("{} {verb} ({})", nicks.len(), names.join(", "))
        })
        .collect();

        if clauses.is_empty() {
            None
        } else {
            Some(format!("[activity] {}", clauses.join("; ")))
        }
    }
}

pub struct ActivityBatcher {
    sink: Arc<dyn EventSink>,
    batches: Mutex<HashMap<String, Batch>>,
    next_id: AtomicU64,
}

impl ActivityBatcher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            batches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add `nick` to the channel's open batch, opening one (and arming its
    /// timer) if needed.
    ///
    /// Without a tokio runtime on this thread no timer can be armed, and the
    /// batch is flushed right away instead of being lost.
    pub fn record(self: &Arc<Self>, channel: &str, kind: ActivityKind, nick: &str, window: Duration) {
        let key = channel.to_lowercase();
        let unarmed = {
            let mut batches = self.batches.lock();
            let batch = batches.entry(key.clone()).or_insert_with(|| {
                Batch::new(self.next_id.fetch_add(1, Ordering::Relaxed), channel)
            });
            batch.channel = channel.to_string();
            let set = match kind {
                ActivityKind::Join => &mut batch.joined,
                ActivityKind::Part => &mut batch.parted,
                ActivityKind::Kick => &mut batch.kicked,
            };
            set.insert(nick.to_string());

            if batch.timer.is_some() {
                false
            } else {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let batcher = Arc::clone(self);
                        let id = batch.id;
                        let timer_key = key.clone();
                        let task = runtime.spawn(async move {
                            tokio::time::sleep(window).await;
                            batcher.flush_batch(&timer_key, Some(id));
                        });
                        batch.timer = Some(task.abort_handle());
                        false
                    }
                    Err(_) => true,
                }
            }
        };

        if unarmed {
            tracing::debug!(channel, "no runtime for activity timer, flushing now");
            self.flush(channel);
        }
    }

    /// Emit and remove the channel's batch now.
    pub fn flush(&self, channel: &str) {
        self.flush_batch(&channel.to_lowercase(), None);
    }

    /// Remove the batch under `key` and emit its summary. With `only_id`, the
    /// batch is flushed only if it is still the one that timer was armed for.
    fn flush_batch(&self, key: &str, only_id: Option<u64>) {
        let batch = {
            let mut batches = self.batches.lock();
            let current = batches
                .get(key)
                .is_some_and(|batch| only_id.is_none_or(|id| id == batch.id));
            if current { batches.remove(key) } else { None }
        };
        let Some(batch) = batch else {
            return;
        };
        if let Some(timer) = &batch.timer {
            timer.abort();
        }
        if let Some(text) = batch.summary() {
            self.sink.emit(Event::message(batch.channel, SYSTEM_SENDER, text));
        }
    }

    /// Drop every batch without emitting anything and stop their timers.
    pub fn cancel_all(&self) {
        let drained: Vec<Batch> = self.batches.lock().drain().map(|(_, b)| b).collect();
        for batch in drained {
            if let Some(timer) = batch.timer {
                timer.abort();
            }
        }
    }

    /// Number of open batches.
    pub fn pending(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_armed(&self, channel: &str) -> bool {
        self.batches
            .lock()
            .get(&channel.to_lowercase())
            .is_some_and(|b| b.timer.is_some())
    }
}
