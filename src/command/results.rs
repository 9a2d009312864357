//! Result lookup with read-once marking and periodic eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, warn};

use super::CommandResult;

/// Published command results keyed by request id.
pub struct ResultStore {
    entries: Mutex<HashMap<String, CommandResult>>,
    max_alive: Duration,
}

impl ResultStore {
    pub fn new(max_alive: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_alive,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CommandResult>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, result: CommandResult) {
        let mut entries = self.entries();
        if entries.contains_key(&result.request_id) {
            warn!(
                "command-queue: result for {} published twice, keeping the latest",
                result.request_id
            );
        }
        entries.insert(result.request_id.clone(), result);
    }

    /// Retrieve a result without blocking.
    ///
    /// The returned copy carries the read flag as it was before this call;
    /// the stored entry is marked read.
    pub fn take(&self, request_id: &str) -> Option<CommandResult> {
        let mut entries = self.entries();
        let entry = entries.get_mut(request_id)?;
        let snapshot = entry.clone();
        entry.read = true;
        Some(snapshot)
    }

    /// Evict read entries and entries older than `max_alive`.
    pub fn sweep(&self, now: SystemTime) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, result| !result.read && result.age(now) <= self.max_alive);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Sweep every `interval` until `stop` is signalled or disconnected.
    pub(crate) fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        stop: Receiver<()>,
    ) -> std::io::Result<JoinHandle<()>> {
        let store = Arc::clone(self);
        thread::Builder::new()
            .name("command-sweeper".into())
            .spawn(move || loop {
                match stop.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let evicted = store.sweep(SystemTime::now());
                        if evicted > 0 {
                            debug!("command-queue: evicted {} result(s)", evicted);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
    }
}
