//! Single-worker transaction executor.
//!
//! Every transaction submitted to a database runs on one dedicated thread,
//! strictly one at a time and in submission order. The embedded engine is not
//! safe under concurrent writers; funnelling writes through one worker
//! removes that hazard without a cross-process lock.
//!
//! The worker consults the [`AccessGate`] state for each job it dequeues:
//!
//! | State                 | Critical job        | Ordinary job            |
//! |-----------------------|---------------------|-------------------------|
//! | `Open`, `Closing`     | runs                | runs                    |
//! | `Patching`            | runs                | deferred, kept in order |
//! | `Closed`              | fails `Unavailable` | held for the next start |
//!
//! Deferred jobs run before anything still queued as soon as the state
//! allows. On shutdown, jobs that never started are handed back to the
//! caller so the next generation of the executor can run them.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::{
    connector::BackendConnector,
    error::{Result, StoreError},
    gate::AccessGate,
    sql::Dialect,
    state::DbState,
    work::{transaction::run_transaction, Transaction},
};

/// How often a worker holding deferred jobs re-reads the gate state.
const DEFERRED_RECHECK: Duration = Duration::from_millis(25);

/// A submitted transaction together with the channel that reports its outcome.
pub(crate) struct Job {
    transaction: Box<dyn Transaction>,
    critical: bool,
    reply: oneshot::Sender<Result<()>>,
}

impl Job {
    pub(crate) fn new(transaction: Box<dyn Transaction>) -> (Self, TransactionHandle) {
        let (reply, receiver) = oneshot::channel();
        let name = transaction.name().to_string();
        let critical = transaction.is_operation_critical();
        let job = Self {
            transaction,
            critical,
            reply,
        };
        (job, TransactionHandle { name, receiver })
    }

    pub(crate) fn name(&self) -> &str {
        self.transaction.name()
    }

    pub(crate) fn is_critical(&self) -> bool {
        self.critical
    }

    fn complete(self, result: Result<()>) {
        // The submitter may have dropped its handle; nobody is left to tell.
        let _ = self.reply.send(result);
    }

    pub(crate) fn fail(self, error: StoreError) {
        self.complete(Err(error));
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name())
            .field("critical", &self.critical)
            .finish()
    }
}

/// Outcome of a submitted transaction.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread. Dropping the handle does not cancel the transaction.
#[derive(Debug)]
pub struct TransactionHandle {
    name: String,
    receiver: oneshot::Receiver<Result<()>>,
}

impl TransactionHandle {
    /// A handle that has already failed with `error`.
    pub(crate) fn failed(name: impl Into<String>, error: StoreError) -> Self {
        let (reply, receiver) = oneshot::channel();
        let _ = reply.send(Err(error));
        Self {
            name: name.into(),
            receiver,
        }
    }

    /// Name of the transaction this handle reports on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks the current thread until the transaction has run.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime; `.await` the handle
    /// there instead.
    pub fn wait(self) -> Result<()> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(abandoned()))
    }
}

impl Future for TransactionHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(abandoned())))
    }
}

/// The job was dropped without running, which only happens when its database
/// is dropped while the job is parked for a later start.
fn abandoned() -> StoreError {
    StoreError::Unavailable {
        state: DbState::Closed,
    }
}

#[derive(Debug, Default)]
struct Queue {
    jobs: VecDeque<Job>,
    deferred: VecDeque<Job>,
    busy: bool,
    stopping: bool,
}

impl Queue {
    /// Nothing is running and nothing queued can run in `state`.
    fn is_settled(&self, state: DbState) -> bool {
        let deferred_runnable =
            !self.deferred.is_empty() && matches!(state, DbState::Open | DbState::Closing);
        !self.busy && self.jobs.is_empty() && !deferred_runnable
    }
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    changed: Condvar,
}

/// Queues work on an executor without owning it.
///
/// Submissions after the executor has stopped fail with
/// [`StoreError::Unavailable`].
#[derive(Debug, Clone)]
pub(crate) struct Submitter {
    shared: Arc<Shared>,
}

impl Submitter {
    pub(crate) fn submit(&self, transaction: Box<dyn Transaction>) -> TransactionHandle {
        let (job, handle) = Job::new(transaction);
        {
            let mut queue = self.shared.queue.lock();
            if queue.stopping {
                drop(queue);
                job.fail(StoreError::Unavailable {
                    state: DbState::Closing,
                });
                return handle;
            }
            queue.jobs.push_back(job);
        }
        self.shared.changed.notify_all();
        handle
    }
}

/// Serializing queue backed by one worker thread.
pub(crate) struct TransactionExecutor {
    shared: Arc<Shared>,
    gate: Arc<AccessGate>,
    worker: Option<JoinHandle<()>>,
    generation: u64,
}

impl TransactionExecutor {
    /// Starts a worker with `leftovers` queued ahead of any new submission.
    pub(crate) fn start(
        generation: u64,
        connector: Arc<dyn BackendConnector>,
        gate: Arc<AccessGate>,
        dialect: Dialect,
        leftovers: Vec<Job>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        if !leftovers.is_empty() {
            debug!(
                "Re-queuing {} transactions left over from the previous shutdown",
                leftovers.len()
            );
        }
        shared.queue.lock().jobs.extend(leftovers);

        let worker = {
            let shared = Arc::clone(&shared);
            let gate = Arc::clone(&gate);
            thread::Builder::new()
                .name(format!("tally-executor-{generation}"))
                .spawn(move || work(&shared, connector.as_ref(), &gate, dialect))
                .map_err(|e| StoreError::Fatal {
                    message: format!("Failed to start the transaction worker: {e}"),
                    remediation: None,
                    source: None,
                })?
        };

        Ok(Self {
            shared,
            gate,
            worker: Some(worker),
            generation,
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Queues `transaction` behind everything submitted before it.
    pub(crate) fn submit(&self, transaction: Box<dyn Transaction>) -> TransactionHandle {
        self.submitter().submit(transaction)
    }

    /// A cloneable handle for queueing work from other threads.
    pub(crate) fn submitter(&self) -> Submitter {
        Submitter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of jobs waiting to run, deferred ones included.
    pub(crate) fn pending(&self) -> usize {
        let queue = self.shared.queue.lock();
        queue.jobs.len() + queue.deferred.len()
    }

    /// Stops the worker and returns the jobs it never started.
    ///
    /// Queued work gets up to `grace` to drain. A job already running is
    /// always allowed to finish. Critical jobs are tied to the setup sequence
    /// that queued them, so they fail instead of being returned.
    pub(crate) fn shutdown(mut self, grace: Duration) -> Vec<Job> {
        let deadline = Instant::now() + grace;
        let stolen: Vec<Job> = {
            let mut guard = self.shared.queue.lock();
            while !guard.is_settled(self.gate.state()) {
                if self.shared.changed.wait_until(&mut guard, deadline).timed_out() {
                    break;
                }
            }
            let queue = &mut *guard;
            queue.stopping = true;
            queue.deferred.drain(..).chain(queue.jobs.drain(..)).collect()
        };
        self.shared.changed.notify_all();
        self.join_worker();

        let (critical, leftovers): (Vec<Job>, Vec<Job>) =
            stolen.into_iter().partition(Job::is_critical);
        for job in critical {
            job.fail(StoreError::Unavailable {
                state: self.gate.state(),
            });
        }
        if !leftovers.is_empty() {
            warn!(
                "{} queued transactions did not finish before shutdown; keeping them for the next start",
                leftovers.len()
            );
        }
        leftovers
    }

    fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            error!("Transaction worker {} panicked", self.generation);
        }
    }
}

impl Drop for TransactionExecutor {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        self.shared.queue.lock().stopping = true;
        self.shared.changed.notify_all();
        self.join_worker();
    }
}

fn work(shared: &Shared, connector: &dyn BackendConnector, gate: &AccessGate, dialect: Dialect) {
    while let Some(mut job) = next_job(shared, gate) {
        // A panicking transaction rolls back on unwind; the worker carries on
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_job(&mut job, connector, dialect)));
        let result = match outcome {
            Ok(result) => result.map_err(|e| e.escalate(job.critical)),
            Err(payload) => Err(panicked(job.name(), payload.as_ref())),
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                match e.remediation() {
                    Some(hint) => error!("Transaction '{}' failed fatally: {e}. {hint}", job.name()),
                    None => error!("Transaction '{}' failed fatally: {e}", job.name()),
                }
                gate.force_closed();
            } else {
                debug!("Transaction '{}' failed: {e}", job.name());
            }
        }
        job.complete(result);

        shared.queue.lock().busy = false;
        shared.changed.notify_all();
    }
    debug!("Transaction worker stopped");
}

fn run_job(job: &mut Job, connector: &dyn BackendConnector, dialect: Dialect) -> Result<()> {
    let mut connection = connector.borrow()?;
    run_transaction(&mut connection, dialect, job.transaction.as_mut())
}

fn panicked(name: &str, payload: &(dyn Any + Send)) -> StoreError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    StoreError::Fatal {
        message: format!("Transaction '{name}' panicked: {detail}"),
        remediation: Some(
            "A transaction panicked on the writer thread. Fix the transaction, then init() the database again."
                .to_string(),
        ),
        source: None,
    }
}

/// Blocks until a job may run, or returns `None` once the executor stops.
fn next_job(shared: &Shared, gate: &AccessGate) -> Option<Job> {
    let mut queue = shared.queue.lock();
    loop {
        if queue.stopping {
            return None;
        }

        let state = gate.state();
        let ordinary_allowed = matches!(state, DbState::Open | DbState::Closing);
        if ordinary_allowed {
            if let Some(job) = queue.deferred.pop_front() {
                queue.busy = true;
                return Some(job);
            }
        }

        if let Some(job) = queue.jobs.pop_front() {
            if ordinary_allowed || (job.critical && state == DbState::Patching) {
                queue.busy = true;
                return Some(job);
            }
            if job.critical {
                debug!("Rejecting setup transaction '{}': database is {state}", job.name());
                job.fail(StoreError::Unavailable { state });
            } else {
                debug!("Deferring transaction '{}' while database is {state}", job.name());
                queue.deferred.push_back(job);
                // A shutdown waiting for the queue to settle must re-check
                shared.changed.notify_all();
            }
            continue;
        }

        if queue.deferred.is_empty() {
            shared.changed.wait(&mut queue);
        } else {
            shared.changed.wait_for(&mut queue, DEFERRED_RECHECK);
        }
    }
}
