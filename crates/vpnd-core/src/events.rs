//! Event Fan-out
//!
//! Delivers status, log and error events to every registered observer.
//!
//! Each observer owns an unbounded channel, so emitting never blocks and
//! never fails the caller. Callback observers run on their own delivery
//! thread inside a panic isolation boundary: a slow or panicking observer
//! only affects itself.

use crate::manager::StatusSnapshot;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error};

/// Events published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Connection status changed
    Status(StatusSnapshot),
    /// A log entry was appended (formatted line)
    Log(String),
    /// Something failed outside of a command response
    Error(String),
}

/// Registry of observers
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel observer
    ///
    /// Dropping the receiver unregisters it on the next emit.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.lock().push(tx);
        rx
    }

    /// Register a callback observer on a dedicated delivery thread
    ///
    /// The thread exits once the bus (and every clone of it) is dropped.
    pub fn observe<F>(&self, name: &str, mut observer: F) -> std::io::Result<thread::JoinHandle<()>>
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let rx = self.subscribe();
        let name = name.to_string();

        thread::Builder::new()
            .name(format!("observer-{}", name))
            .spawn(move || {
                debug!("Observer {} started", name);
                while let Ok(event) = rx.recv() {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| observer(&event)));
                    if let Err(panic_info) = result {
                        let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "Unknown panic".to_string()
                        };
                        error!("Observer {} panicked: {}", name, msg);
                    }
                }
                debug!("Observer {} stopped", name);
            })
    }

    /// Deliver an event to all live observers
    pub fn emit(&self, event: Event) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn emit_status(&self, status: StatusSnapshot) {
        self.emit(Event::Status(status));
    }

    pub fn emit_log(&self, line: String) {
        self.emit(Event::Log(line));
    }

    pub fn emit_error(&self, message: impl Into<String>) {
        self.emit(Event::Error(message.into()));
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Event>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
