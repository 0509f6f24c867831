//! The database orchestrator.
//!
//! [`Database`] ties the other pieces together. It owns the backend
//! connector, the access gate with the lifecycle state, and the transaction
//! executor, and it drives the schema setup sequence on [`Database::init`]:
//!
//! ```text
//! init()   Closed ─▶ Patching ─(create tables, patches, open)─▶ Open
//! close()  Open ─▶ Closing ─(drain queue for shutdown grace)─▶ Closed
//! ```
//!
//! Reads run on the calling thread against a borrowed connection. Writes are
//! queued on the single worker and reported through a [`TransactionHandle`].
//!
//! # Example
//!
//! ```rust
//! use tally_store::{work::{row_count, transaction, Statement}, DatabaseBuilder, DbState};
//!
//! # fn example() -> tally_store::Result<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let db = DatabaseBuilder::new()
//!     .file(dir.path().join("tally.db"))
//!     .index_delay(None)
//!     .build()?;
//!
//! db.init()?;
//! assert_eq!(db.state(), DbState::Open);
//!
//! db.execute_transaction(transaction("add-server", |ctx| {
//!     ctx.execute(
//!         &Statement::new("INSERT INTO servers (uuid, name) VALUES (?1, ?2)")
//!             .bind("4b1e3d52-0000-4000-8000-000000000001".to_string())
//!             .bind("lobby".to_string()),
//!     )?;
//!     Ok(())
//! }))
//! .wait()?;
//!
//! let servers = db.query(&row_count(&tally_store::sql::Identifier::new("servers")?))?;
//! assert_eq!(servers, 1);
//! db.close()?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task;

use crate::{
    config::DatabaseConfig,
    connector::BackendConnector,
    error::{Result, StoreError},
    executor::{Job, TransactionExecutor, TransactionHandle},
    gate::AccessGate,
    patches::{applied_patches_query, AppliedPatch, Patch, PatchTransaction},
    schedule::ScheduledTask,
    schema::{CreateIndexesTransaction, CreateTablesTransaction},
    sql::{DbType, Dialect},
    state::DbState,
    work::{critical_transaction, Query, Transaction},
};

pub mod builder;


pub use builder::DatabaseBuilder;

/// One configured backend instance.
pub struct Database {
    config: DatabaseConfig,
    connector: Arc<dyn BackendConnector>,
    gate: Arc<AccessGate>,
    patches: Vec<Arc<dyn Patch>>,
    executor: Mutex<Option<TransactionExecutor>>,
    leftovers: Mutex<Vec<Job>>,
    tasks: Mutex<Vec<ScheduledTask>>,
    lifecycle: Mutex<()>,
    generation: AtomicU64,
}

impl Database {
    pub(crate) fn new(
        config: DatabaseConfig,
        connector: Arc<dyn BackendConnector>,
        patches: Vec<Arc<dyn Patch>>,
    ) -> Self {
        let gate = Arc::new(AccessGate::new(config.gate_timeout()));
        Self {
            config,
            connector,
            gate,
            patches,
            executor: Mutex::new(None),
            leftovers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DbState {
        self.gate.state()
    }

    /// Backend kind.
    pub fn kind(&self) -> DbType {
        self.connector.kind()
    }

    /// SQL dialect spoken by the backend.
    pub fn dialect(&self) -> Dialect {
        self.kind().dialect()
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Transactions waiting to run, including those parked for the next
    /// `init()`.
    pub fn pending_transactions(&self) -> usize {
        let queued = self
            .executor
            .lock()
            .as_ref()
            .map_or(0, TransactionExecutor::pending);
        queued + self.leftovers.lock().len()
    }

    /// Connects, brings the schema up to date and opens the database.
    ///
    /// Blocks until every setup transaction has run. Transactions left over
    /// from an earlier shutdown are queued again and run once the database
    /// is open.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connect`] when the backend cannot be reached and
    /// [`StoreError::Fatal`] when creating the tables or a patch fails. In
    /// both cases the database is left [`DbState::Closed`].
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime; use
    /// [`init_async`](Self::init_async) there.
    pub fn init(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let state = self.gate.state();
        if state != DbState::Closed {
            return Err(StoreError::Configuration {
                message: format!("init() requires a closed database, but it is {state}"),
            });
        }

        info!("Initializing {} database '{}'", self.kind(), self.connector.name());
        self.restart_executor()?;

        if !self.gate.transition(DbState::Closed, DbState::Patching) {
            return Err(StoreError::Unavailable {
                state: self.gate.state(),
            });
        }

        if let Err(e) = self.connector.connect() {
            error!("Failed to connect: {e}");
            self.abort_init();
            return Err(e);
        }

        let handles = self.submit_setup();
        let mut first_error = None;
        for handle in handles {
            let name = handle.name().to_string();
            match handle.wait() {
                Ok(()) => {}
                Err(e @ (StoreError::Fatal { .. } | StoreError::Connect { .. })) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => debug!("Setup transaction '{name}' did not run: {e}"),
            }
        }

        if self.gate.state() == DbState::Closed {
            self.abort_init();
            return Err(first_error.unwrap_or_else(|| StoreError::Fatal {
                message: "Initialization was aborted before the database opened".to_string(),
                remediation: None,
                source: None,
            }));
        }

        self.schedule_tasks();
        info!(
            "Database '{}' is open ({} patches checked)",
            self.connector.name(),
            self.patches.len()
        );
        Ok(())
    }

    /// [`init`](Self::init) for async callers.
    pub async fn init_async(self: &Arc<Self>) -> Result<()> {
        let db = Arc::clone(self);
        task::spawn_blocking(move || db.init())
            .await
            .map_err(join_error)?
    }

    /// Shuts the database down.
    ///
    /// Queued transactions get the configured shutdown grace to finish; a
    /// transaction already running is always allowed to complete. Whatever
    /// is still queued afterwards is kept and runs on the next
    /// [`init`](Self::init).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] after a complete shutdown when
    /// transactions had to be kept for the next start.
    pub fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let was_open = self.gate.transition(DbState::Open, DbState::Closing);

        for task in self.tasks.lock().drain(..) {
            task.cancel();
        }

        let grace = if was_open {
            self.config.shutdown_grace()
        } else {
            Duration::ZERO
        };
        self.park_executor(grace);

        self.connector.close();
        self.gate.force_closed();

        let pending = self.leftovers.lock().len();
        if was_open {
            info!("Database '{}' closed", self.connector.name());
        }
        if pending > 0 {
            warn!("{pending} transactions are waiting for the next init()");
            return Err(StoreError::ShutdownTimeout { pending });
        }
        Ok(())
    }

    /// [`close`](Self::close) for async callers.
    pub async fn close_async(self: &Arc<Self>) -> Result<()> {
        let db = Arc::clone(self);
        task::spawn_blocking(move || db.close())
            .await
            .map_err(join_error)?
    }

    /// Runs `query` on the calling thread.
    ///
    /// Waits at the access gate while the schema is being patched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the database is not open and
    /// [`StoreError::Operation`] when the query fails. Failures that leave
    /// the database unusable are escalated to [`StoreError::Fatal`] and close
    /// it.
    pub fn query<T, Q>(&self, query: &Q) -> Result<T>
    where
        Q: Query<T> + ?Sized,
    {
        self.gate.await_access(false)?;
        let connection = self.connector.borrow()?;
        query.run(&connection).map_err(|e| self.classify(e))
    }

    /// [`query`](Self::query) on the blocking thread pool, for async callers.
    pub async fn query_async<T, Q>(self: &Arc<Self>, query: Q) -> Result<T>
    where
        Q: Query<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        task::spawn_blocking(move || db.query(&query))
            .await
            .map_err(join_error)?
    }

    /// Queues `transaction` on the single writer.
    ///
    /// Never blocks. The handle resolves once the transaction has committed
    /// or failed; callers must not assume the write happened before that.
    pub fn execute_transaction<T>(&self, transaction: T) -> TransactionHandle
    where
        T: Transaction,
    {
        self.submit(Box::new(transaction))
    }

    /// Patches recorded as applied, in application order.
    pub fn applied_patches(&self) -> Result<Vec<AppliedPatch>> {
        self.query(&applied_patches_query())
    }

    fn submit(&self, transaction: Box<dyn Transaction>) -> TransactionHandle {
        let state = self.gate.state();
        if !transaction.is_operation_critical()
            && matches!(state, DbState::Closed | DbState::Closing)
        {
            return TransactionHandle::failed(transaction.name(), StoreError::Unavailable { state });
        }
        match self.executor.lock().as_ref() {
            Some(executor) => executor.submit(transaction),
            None => TransactionHandle::failed(transaction.name(), StoreError::Unavailable { state }),
        }
    }

    fn submit_setup(&self) -> Vec<TransactionHandle> {
        let mut handles = Vec::with_capacity(self.patches.len() + 2);
        handles.push(self.submit(Box::new(CreateTablesTransaction)));
        for patch in &self.patches {
            handles.push(self.submit(Box::new(PatchTransaction::new(Arc::clone(patch)))));
        }

        let gate = Arc::clone(&self.gate);
        handles.push(self.submit(Box::new(critical_transaction("open-database", move |_| {
            // A fatal failure may already have forced the database closed
            if !gate.transition(DbState::Patching, DbState::Open) {
                debug!("Database left patching before setup finished; staying {}", gate.state());
            }
            Ok(())
        }))));
        handles
    }

    /// Replaces the executor with a fresh one, carrying over unstarted jobs.
    fn restart_executor(&self) -> Result<()> {
        self.park_executor(Duration::ZERO);
        let leftovers = std::mem::take(&mut *self.leftovers.lock());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        match TransactionExecutor::start(
            generation,
            Arc::clone(&self.connector),
            Arc::clone(&self.gate),
            self.dialect(),
            leftovers,
        ) {
            Ok(executor) => {
                debug!("Started transaction executor {}", executor.generation());
                *self.executor.lock() = Some(executor);
                Ok(())
            }
            Err(e) => {
                error!("{e}");
                Err(e)
            }
        }
    }

    /// Stops the executor, keeping its unstarted jobs for the next start.
    fn park_executor(&self, grace: Duration) {
        let executor = self.executor.lock().take();
        if let Some(executor) = executor {
            let stolen = executor.shutdown(grace);
            self.leftovers.lock().extend(stolen);
        }
    }

    fn abort_init(&self) {
        self.gate.force_closed();
        self.park_executor(Duration::ZERO);
        self.connector.close();
    }

    fn schedule_tasks(&self) {
        let mut tasks = self.tasks.lock();

        if let Some(interval) = self.connector.keep_alive_interval() {
            let connector = Arc::clone(&self.connector);
            match ScheduledTask::periodic("keep-alive", interval, move || {
                if let Err(e) = connector.keep_alive() {
                    warn!("Keep-alive for '{}' failed: {e}", connector.name());
                }
            }) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Failed to schedule keep-alive: {e}"),
            }
        }

        if let Some(delay) = self.config.index_delay() {
            let Some(submitter) = self.executor.lock().as_ref().map(TransactionExecutor::submitter)
            else {
                return;
            };
            // The task only queues the work; blocking on the handle would keep
            // close() from joining the task while the job is held
            match ScheduledTask::delayed("create-indexes", delay, move || {
                let handle = submitter.submit(Box::new(CreateIndexesTransaction));
                debug!("Queued '{}'", handle.name());
            }) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Failed to schedule index creation: {e}"),
            }
        }
    }

    fn classify(&self, error: StoreError) -> StoreError {
        let error = error.escalate(false);
        if error.is_fatal() {
            match error.remediation() {
                Some(hint) => error!("Query failed fatally: {error}. {hint}"),
                None => error!("Query failed fatally: {error}"),
            }
            self.gate.force_closed();
        }
        error
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("kind", &self.kind())
            .field("connector", &self.connector.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let needs_close = self.gate.state() != DbState::Closed
            || self.executor.get_mut().is_some()
            || self.connector.is_connected();
        if needs_close {
            if let Err(e) = self.close() {
                warn!("Error while closing database on drop: {e}");
            }
        }
        let abandoned = self.leftovers.get_mut().len();
        if abandoned > 0 {
            warn!("Dropping {abandoned} transactions that never ran");
        }
    }
}

fn join_error(e: task::JoinError) -> StoreError {
    StoreError::Configuration {
        message: format!("Task join error: {e}"),
    }
}
