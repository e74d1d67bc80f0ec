//! Synchronization manager: the façade over every context worker
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SynchronizationManager                                         │
//! │  ├── registry: ContextId → Arc<ContextWorker>                   │
//! │  │   └── created lazily on the first task for a context         │
//! │  ├── status: StatusTable                                        │
//! │  │   └── Running / terminal state per submitted task            │
//! │  ├── discovery: missing nyms, servers and units                 │
//! │  │   └── rescanned by every Ready worker                        │
//! │  └── events: broadcast::Sender<WorkerEvent>                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let manager = SynchronizationManager::new(config, repository, transport)?;
//! let mut completions = manager.subscribe();
//!
//! let context = ContextId::new("alice", "notary");
//! let id = manager.start_task(&context, Task::DownloadNymbox);
//!
//! while let Ok(done) = completions.recv().await {
//!     if done.task_id == id {
//!         assert_eq!(manager.status(id), ThreadStatus::FinishedSuccess);
//!         break;
//!     }
//! }
//! manager.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Precondition, SyncError, SyncResult, TaskError};
use crate::events::{WorkerEvent, WorkerState};
use crate::operation::Transport;
use crate::repository::Repository;
use crate::scheduler::Completion;
use crate::status::{StatusTable, TaskCompletion, ThreadStatus};
use crate::task::{Task, TaskKind};
use crate::types::{AccountId, ContextId, MessageId, NymId, Payment, ServerId, TaskId, UnitId};
use crate::worker::{resolve_deposit_account, ContextWorker, DiscoveryQueues, WorkerDeps};

/// Whether a nym can message another through an endpoint right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Messagability {
    Ready,
    /// Sender is not a local nym
    MissingSender,
    /// Recipient credentials are unknown; a lookup was queued
    MissingRecipient,
    /// Endpoint contract is unknown; a lookup was queued
    MissingServer,
    /// Sender is not registered yet; a registration was queued
    Unregistered,
}

/// Whether a payment can be deposited in a context right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depositability {
    Ready,
    /// Amount is not positive or the unit is blank
    InvalidInstrument,
    /// Unit definition is unknown; a lookup was queued
    UnknownUnit,
    /// Nym is not registered yet; a registration was queued
    NotRegistered,
    /// No account of the payment's unit exists
    NoAccount,
    /// Several accounts match and none was named
    AccountNotSpecified,
    /// The named account cannot receive this payment
    WrongAccount,
}

/// Lazily populated map of context workers behind one lock
#[derive(Default)]
pub struct Registry {
    workers: Mutex<HashMap<ContextId, Arc<ContextWorker>>>,
}

impl Registry {
    pub fn get(&self, context: &ContextId) -> Option<Arc<ContextWorker>> {
        self.workers.lock().get(context).cloned()
    }

    /// Existing worker for `context`, or one built by `create`
    pub fn get_or_create(
        &self,
        context: &ContextId,
        create: impl FnOnce() -> ContextWorker,
    ) -> Arc<ContextWorker> {
        self.workers
            .lock()
            .entry(context.clone())
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<ContextWorker>> {
        self.workers.lock().values().cloned().collect()
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        let mut contexts: Vec<ContextId> = self.workers.lock().keys().cloned().collect();
        contexts.sort();
        contexts
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }
}

/// Entry point for submitting and observing synchronization tasks
pub struct SynchronizationManager {
    deps: WorkerDeps,
    registry: Registry,
    introduction_server: RwLock<Option<ServerId>>,
    runtime: Handle,
}

impl SynchronizationManager {
    /// Create a manager bound to the current tokio runtime
    pub fn new(
        config: SyncConfig,
        repository: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        let (events, _) = broadcast::channel(config.event_capacity);
        let introduction = config.introduction_server.clone();

        let manager = Self {
            deps: WorkerDeps {
                status: Arc::new(StatusTable::new(config.event_capacity)),
                config: Arc::new(config),
                repository,
                transport,
                discovery: Arc::new(DiscoveryQueues::new()),
                events,
                cancel: CancellationToken::new(),
            },
            registry: Registry::default(),
            introduction_server: RwLock::new(None),
            runtime,
        };

        if let Some(server) = introduction {
            manager.set_introduction_server(server);
        }
        info!("Synchronization manager started");
        Ok(manager)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.deps.config
    }

    /// False once shutdown has begun
    pub fn is_running(&self) -> bool {
        !self.deps.cancel.is_cancelled()
    }

    fn worker(&self, context: &ContextId) -> Arc<ContextWorker> {
        self.registry.get_or_create(context, || {
            ContextWorker::new(context.clone(), &self.deps, self.runtime.clone())
        })
    }

    /// Submit a task against a context.
    ///
    /// Returns [`TaskId::invalid`] when the context or payload is invalid,
    /// when an equal task is already queued, or after shutdown.
    pub fn start_task(&self, context: &ContextId, task: Task) -> TaskId {
        match self.try_start_task(context, task) {
            Ok(id) => id,
            Err(e) => {
                warn!(%context, error = %e, "Task rejected");
                TaskId::invalid()
            }
        }
    }

    /// [`start_task`](Self::start_task) with the rejection reason
    pub fn try_start_task(&self, context: &ContextId, task: Task) -> SyncResult<TaskId> {
        if !self.is_running() {
            return Err(SyncError::ShuttingDown);
        }
        if !context.is_valid() {
            return Err(SyncError::InvalidContext(context.to_string()));
        }
        task.validate()
            .map_err(|e| SyncError::InvalidTask(format!("{}: {}", task.kind(), e)))?;

        Ok(self.worker(context).submit(task))
    }

    /// Read and, when terminal, consume a task's status
    pub fn status(&self, id: TaskId) -> ThreadStatus {
        self.deps.status.status(id)
    }

    /// Message id delivered by a finished messaging task
    pub fn message_status(&self, id: TaskId) -> Option<MessageId> {
        self.deps.status.message_id(id)
    }

    /// Completion notifications of `(TaskId, success)`
    pub fn subscribe(&self) -> broadcast::Receiver<TaskCompletion> {
        self.deps.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.deps.events.subscribe()
    }

    /// Resolves the next time the context's worker goes idle
    pub fn context_idle(&self, context: &ContextId) -> Option<Completion> {
        self.registry.get(context).map(|worker| worker.idle())
    }

    pub fn worker_state(&self, context: &ContextId) -> Option<WorkerState> {
        self.registry.get(context).map(|worker| worker.state())
    }

    pub fn worker_handle(&self, context: &ContextId) -> Option<Arc<ContextWorker>> {
        self.registry.get(context)
    }

    pub fn pending_tasks(&self, context: &ContextId) -> Option<Vec<(TaskKind, usize)>> {
        self.registry.get(context).map(|worker| worker.pending())
    }

    /// Contexts that have a worker
    pub fn contexts(&self) -> Vec<ContextId> {
        self.registry.contexts()
    }

    /// Queue a nymbox download for every registered context and an account
    /// download for every known account
    pub fn refresh(&self) {
        if !self.is_running() {
            return;
        }
        let repository = &self.deps.repository;
        let mut queued = 0;
        for context in repository.registered_contexts() {
            if self.start_task(&context, Task::DownloadNymbox).is_valid() {
                queued += 1;
            }
        }
        for account in repository.all_accounts() {
            let task = Task::DownloadAccount {
                account: account.id.clone(),
            };
            if self.start_task(&account.context(), task).is_valid() {
                queued += 1;
            }
        }
        debug!(queued, "Refresh queued");
    }

    /// Ask every worker to look up a nym
    pub fn find_nym(&self, nym: &NymId) -> TaskId {
        if nym.is_empty() || self.deps.repository.nym(nym).is_some() {
            return TaskId::invalid();
        }
        self.discover(|discovery, id| discovery.nyms.push(id, nym.clone()))
    }

    pub fn find_server(&self, server: &ServerId) -> TaskId {
        if server.is_empty() || self.deps.repository.server_contract(server).is_some() {
            return TaskId::invalid();
        }
        self.discover(|discovery, id| discovery.servers.push(id, server.clone()))
    }

    pub fn find_unit_definition(&self, unit: &UnitId) -> TaskId {
        if unit.is_empty() || self.deps.repository.unit_definition(unit).is_some() {
            return TaskId::invalid();
        }
        self.discover(|discovery, id| discovery.units.push(id, unit.clone()))
    }

    fn discover(&self, push: impl FnOnce(&DiscoveryQueues, TaskId) -> bool) -> TaskId {
        if !self.is_running() {
            return TaskId::invalid();
        }
        let id = TaskId::new();
        if !push(&self.deps.discovery, id) {
            return TaskId::invalid();
        }
        self.deps.discovery.trigger_all();
        id
    }

    /// Register every local nym with `server` from now on
    pub fn set_introduction_server(&self, server: ServerId) {
        *self.introduction_server.write() = Some(server.clone());
        for nym in self.deps.repository.local_nyms() {
            let context = ContextId::new(nym, server.clone());
            self.start_task(&context, Task::RegisterNym { resync: false });
        }
        info!(%server, "Introduction server set");
    }

    pub fn introduction_server(&self) -> Option<ServerId> {
        self.introduction_server.read().clone()
    }

    /// Check whether `sender` can message `recipient` through `server`.
    ///
    /// Queues whatever lookup or registration would make it possible.
    pub fn can_message(
        &self,
        sender: &NymId,
        recipient: &NymId,
        server: &ServerId,
    ) -> Messagability {
        let repository = &self.deps.repository;
        if !repository.is_local(sender) {
            return Messagability::MissingSender;
        }
        if repository.nym(recipient).is_none() {
            self.find_nym(recipient);
            return Messagability::MissingRecipient;
        }
        if repository.server_contract(server).is_none() {
            self.find_server(server);
            return Messagability::MissingServer;
        }
        let context = ContextId::new(sender.clone(), server.clone());
        if !repository.consensus(&context).is_registered() {
            self.start_task(&context, Task::RegisterNym { resync: false });
            return Messagability::Unregistered;
        }
        Messagability::Ready
    }

    /// Check whether `payment` can be deposited in `context`
    pub fn can_deposit(
        &self,
        context: &ContextId,
        payment: &Payment,
        account: Option<&AccountId>,
    ) -> Depositability {
        if payment.unit.is_empty() || payment.amount <= 0 {
            return Depositability::InvalidInstrument;
        }
        let repository = &self.deps.repository;
        if repository.unit_definition(&payment.unit).is_none() {
            self.find_unit_definition(&payment.unit);
            return Depositability::UnknownUnit;
        }
        if !repository.consensus(context).is_registered() {
            self.start_task(context, Task::RegisterNym { resync: false });
            return Depositability::NotRegistered;
        }

        match resolve_deposit_account(repository.as_ref(), context, &payment.unit, account) {
            Ok(_) => Depositability::Ready,
            Err(TaskError::Precondition(Precondition::NoAccount(_))) => Depositability::NoAccount,
            Err(TaskError::Precondition(Precondition::AmbiguousAccount(_))) => {
                Depositability::AccountNotSpecified
            }
            Err(_) => Depositability::WrongAccount,
        }
    }

    /// Stop every worker, then report tasks that never finished as Shutdown
    pub async fn shutdown(&self) {
        info!(workers = self.registry.len(), "Shutting down synchronization manager");
        self.deps.cancel.cancel();

        for worker in self.registry.all() {
            worker.stop().await;
        }
        self.deps.discovery.clear_schedulers();

        let interrupted = self.deps.status.mark_shutdown();
        info!(interrupted, "Synchronization manager stopped");
    }
}

impl std::fmt::Debug for SynchronizationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizationManager")
            .field("workers", &self.registry.len())
            .field("running", &self.is_running())
            .finish()
    }
}
