//! Cancellable background tasks: one-shot delays and fixed-rate repeats.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Cancel {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl Cancel {
    /// Sleeps until `deadline`; returns `true` if cancelled first.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.signal.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.signal.notify_all();
    }
}

/// A task running on its own named thread until it finishes or is cancelled.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    cancel: Arc<Cancel>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Runs `task` once after `delay`, unless cancelled before then.
    pub fn delayed<F>(name: &str, delay: Duration, task: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = Arc::new(Cancel::default());
        let token = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(format!("tally-{name}"))
            .spawn(move || {
                if !token.sleep_until(Instant::now() + delay) {
                    task();
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            cancel,
            handle: Some(handle),
        })
    }

    /// Runs `task` every `interval` until cancelled.
    pub fn periodic<F>(name: &str, interval: Duration, mut task: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = Arc::new(Cancel::default());
        let token = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(format!("tally-{name}"))
            .spawn(move || {
                let mut next = Instant::now() + interval;
                while !token.sleep_until(next) {
                    task();
                    next += interval;
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            cancel,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the task and waits for a run in progress to finish.
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Scheduled task '{}' panicked", self.name);
            } else {
                debug!("Scheduled task '{}' stopped", self.name);
            }
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}
