//! Buffered command intake with asynchronous dispatch.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use crossbeam_queue::SegQueue;
use log::{debug, error, info};

use super::results::ResultStore;
use super::{Command, CommandError, CommandHandler, CommandResult, CommandType, QueueSettings};

/// Unbounded, order-preserving command buffer drained by one dispatch thread.
///
/// Each drained command runs on its own thread, so a slow command never holds
/// up enqueueing or later drains. After [`shutdown`](Self::shutdown) new
/// commands are refused; everything accepted before it is still dispatched.
pub struct CommandQueue {
    buffer: Arc<SegQueue<Command>>,
    accepting: Mutex<bool>,
    wake_tx: Sender<()>,
    shutdown_tx: Option<Sender<()>>,
    sweeper_stop_tx: Option<Sender<()>>,
    results: Arc<ResultStore>,
    dispatcher: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl CommandQueue {
    /// Start the dispatch and sweep threads.
    pub fn start<H: CommandHandler>(handler: H, settings: QueueSettings) -> std::io::Result<Self> {
        let buffer = Arc::new(SegQueue::new());
        let results = Arc::new(ResultStore::new(settings.max_alive));
        // One pending wake is enough: every wake drains the whole buffer.
        let (wake_tx, wake_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let (sweeper_stop_tx, sweeper_stop_rx) = bounded(1);

        let dispatcher = Dispatcher {
            buffer: Arc::clone(&buffer),
            handler: Arc::new(handler),
            results: Arc::clone(&results),
            wake_rx,
            shutdown_rx,
        };
        let dispatcher = thread::Builder::new()
            .name("command-dispatch".into())
            .spawn(move || dispatcher.run())?;
        let sweeper = results.spawn_sweeper(settings.sweep_interval(), sweeper_stop_rx)?;

        Ok(Self {
            buffer,
            accepting: Mutex::new(true),
            wake_tx,
            shutdown_tx: Some(shutdown_tx),
            sweeper_stop_tx: Some(sweeper_stop_tx),
            results,
            dispatcher: Some(dispatcher),
            sweeper: Some(sweeper),
        })
    }

    fn accepting(&self) -> MutexGuard<'_, bool> {
        self.accepting.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buffer a command for dispatch, stamping its timestamp.
    ///
    /// Returns `false` when the queue is shutting down and the command was
    /// dropped.
    pub fn enqueue(&self, mut command: Command) -> bool {
        // Held across the push so shutdown cannot slip in between the check
        // and the final drain.
        let accepting = self.accepting();
        if !*accepting {
            debug!(
                "command-queue: dropping {} ({}) after shutdown",
                command.command_type, command.request_id
            );
            return false;
        }

        command.timestamp = SystemTime::now();
        debug!(
            "command-queue: enqueued {} ({})",
            command.command_type, command.request_id
        );
        self.buffer.push(command);
        drop(accepting);

        match self.wake_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                error!("command-queue: dispatcher is gone");
            }
        }
        true
    }

    /// Retrieve the result for `request_id` without blocking.
    ///
    /// The first retrieval returns the result with `read == false`; later
    /// ones return it with `read == true` until it is swept.
    pub fn take_result(&self, request_id: &str) -> Option<CommandResult> {
        self.results.take(request_id)
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Number of commands waiting to be drained.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Refuse new commands, dispatch what is buffered, and stop the threads.
    ///
    /// Commands already dispatched keep running and still publish results.
    pub fn shutdown(&mut self) {
        *self.accepting() = false;
        // Disconnecting wakes the dispatcher for its final drain.
        self.shutdown_tx = None;
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        self.sweeper_stop_tx = None;
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Dispatcher {
    buffer: Arc<SegQueue<Command>>,
    handler: Arc<dyn CommandHandler>,
    results: Arc<ResultStore>,
    wake_rx: Receiver<()>,
    shutdown_rx: Receiver<()>,
}

impl Dispatcher {
    fn run(self) {
        loop {
            select! {
                recv(self.wake_rx) -> _ => self.drain(),
                recv(self.shutdown_rx) -> _ => {
                    self.drain();
                    break;
                }
            }
        }
        info!("command-queue: dispatcher stopped");
    }

    fn drain(&self) {
        while let Some(command) = self.buffer.pop() {
            if command.command_type == CommandType::Undefined {
                debug!("command-queue: ignoring undefined command {}", command.request_id);
                continue;
            }
            self.dispatch(command);
        }
    }

    fn dispatch(&self, command: Command) {
        let handler = Arc::clone(&self.handler);
        let results = Arc::clone(&self.results);
        let request_id = command.request_id.clone();

        let spawned = thread::Builder::new()
            .name(format!("command-{}", command.command_type))
            .spawn(move || {
                let result = match handler.handle(&command) {
                    Ok(data) => CommandResult::success(&command.request_id, data),
                    Err(e) => {
                        info!(
                            "command-queue: {} ({}) failed: {}",
                            command.command_type, command.request_id, e
                        );
                        CommandResult::failure(&command.request_id, &e)
                    }
                };
                results.publish(result);
            });

        if let Err(e) = spawned {
            error!("command-queue: failed to spawn worker for {}: {}", request_id, e);
            self.results.publish(CommandResult::failure(
                request_id,
                &CommandError::internal(format!("dispatch failed: {}", e)),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(queue: &CommandQueue, request_id: &str) -> CommandResult {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(result) = queue.take_result(request_id) {
                return result;
            }
            assert!(Instant::now() < deadline, "no result for {}", request_id);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn echo(command: &Command) -> Result<Option<Value>, CommandError> {
        match command.command_type {
            CommandType::Reboot => Err(CommandError::conflict("busy")),
            other => Ok(Some(json!(other.as_str()))),
        }
    }

    #[test]
    fn test_each_command_publishes_one_result() {
        let queue = CommandQueue::start(echo, QueueSettings::default()).unwrap();
        assert!(queue.enqueue(Command::new("a", CommandType::GetStatus)));
        assert!(queue.enqueue(Command::new("b", CommandType::Reboot)));

        let a = wait_for(&queue, "a");
        assert!(!a.read);
        assert_eq!(a.data, Some(json!("get-status")));
        assert!(queue.take_result("a").unwrap().read);

        let b = wait_for(&queue, "b");
        assert!(b.is_error);
        assert_eq!(b.error_code, Some(CommandError::CONFLICT));
    }

    #[test]
    fn test_undefined_commands_are_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut queue = CommandQueue::start(
            move |_: &Command| -> Result<Option<Value>, CommandError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            },
            QueueSettings::default(),
        )
        .unwrap();

        queue.enqueue(Command::new("u", CommandType::Undefined));
        queue.enqueue(Command::new("s", CommandType::StopTracking));
        wait_for(&queue, "s");
        queue.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.take_result("u").is_none());
    }

    #[test]
    fn test_slow_command_does_not_block_others() {
        let queue = CommandQueue::start(
            |command: &Command| -> Result<Option<Value>, CommandError> {
                if command.request_id == "slow" {
                    thread::sleep(Duration::from_millis(500));
                }
                Ok(None)
            },
            QueueSettings::default(),
        )
        .unwrap();

        let started = Instant::now();
        queue.enqueue(Command::new("slow", CommandType::StartTracking));
        queue.enqueue(Command::new("fast", CommandType::GetStatus));
        wait_for(&queue, "fast");
        assert!(started.elapsed() < Duration::from_millis(400));
        wait_for(&queue, "slow");
    }

    #[test]
    fn test_enqueue_after_shutdown_is_dropped() {
        let mut queue = CommandQueue::start(echo, QueueSettings::default()).unwrap();
        for i in 0..50 {
            queue.enqueue(Command::new(format!("c{}", i), CommandType::GetStatus));
        }
        queue.shutdown();
        assert!(!queue.is_accepting());
        assert_eq!(queue.pending(), 0);

        assert!(!queue.enqueue(Command::new("late", CommandType::GetStatus)));
        for i in 0..50 {
            wait_for(&queue, &format!("c{}", i));
        }
        thread::sleep(Duration::from_millis(50));
        assert!(queue.take_result("late").is_none());
    }

    #[test]
    fn test_read_results_are_swept() {
        let settings = QueueSettings::default().with_cleanup_period(Duration::from_millis(40));
        let queue = CommandQueue::start(echo, settings).unwrap();
        queue.enqueue(Command::new("r", CommandType::GetStatus));
        wait_for(&queue, "r");

        thread::sleep(Duration::from_millis(150));
        assert!(queue.take_result("r").is_none());
    }
}
