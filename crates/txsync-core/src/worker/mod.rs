//! Per-context task worker
//!
//! ```text
//!  NeedServerContract ──contract known──► NeedRegistration ──registered──► Ready
//!         │  ▲                                  │  ▲                         │
//!         └──┘ discovery + contract_retry       └──┘ registration_retry      └─► cycle
//! ```
//!
//! A [`ContextWorker`] owns one [`Scheduler`] and one queue per
//! [`TaskKind`]. While bootstrapping, each pass advances the state machine.
//! Once Ready, each pass is one cycle: maintenance checks, a scan of the
//! global discovery queues, then every queue drained oldest-first in
//! [`TaskKind::CYCLE_ORDER`].
//!
//! Handlers live in the submodules and all report through the same
//! `Result<Option<MessageId>, TaskError>`; `Worker::settle` turns that into
//! a status transition or a requeue.

mod accounts;
mod backoff;
mod discovery;
mod messaging;
mod payments;

pub use backoff::Backoff;
pub use discovery::DiscoveryQueues;
pub(crate) use payments::resolve_deposit_account;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::config::SyncConfig;
use crate::error::TaskError;
use crate::events::{WorkerEvent, WorkerState};
use crate::operation::{run_operation, Operation, OperationRequest, Reply, Transport};
use crate::queue::TaskQueues;
use crate::repository::Repository;
use crate::scheduler::{Completion, Scheduler, StepFn};
use crate::status::StatusTable;
use crate::task::{Task, TaskKind};
use crate::types::{ContextId, MessageId, NymId, ServerId, TaskId, UnitId};

/// What a handler produced: an optional delivered message id
type HandlerResult = Result<Option<MessageId>, TaskError>;

/// Collaborators shared by every worker of a manager
#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub config: Arc<SyncConfig>,
    pub repository: Arc<dyn Repository>,
    pub transport: Arc<dyn Transport>,
    pub status: Arc<StatusTable>,
    pub discovery: Arc<DiscoveryQueues>,
    pub events: broadcast::Sender<WorkerEvent>,
    /// Parent of every worker's cancellation token
    pub cancel: CancellationToken,
}

/// How a popped task left the cycle
enum Settled {
    Done,
    Requeued,
    Stopped,
}

pub(crate) struct Worker {
    context: ContextId,
    config: Arc<SyncConfig>,
    repository: Arc<dyn Repository>,
    operation: Arc<dyn Operation>,
    status: Arc<StatusTable>,
    discovery: Arc<DiscoveryQueues>,
    events: broadcast::Sender<WorkerEvent>,
    queues: TaskQueues,
    state: Mutex<WorkerState>,
    cycle: AtomicU64,
    nym_backoff: Backoff<NymId>,
    server_backoff: Backoff<ServerId>,
    unit_backoff: Backoff<UnitId>,
    cancel: CancellationToken,
}

/// Handle to the worker serving one context
pub struct ContextWorker {
    worker: Arc<Worker>,
    scheduler: Scheduler,
}

impl ContextWorker {
    pub(crate) fn new(context: ContextId, deps: &WorkerDeps, runtime: Handle) -> Self {
        let operation = deps.transport.operation(&context);
        let cap = deps.config.max_backoff_multiplier;
        let worker = Arc::new(Worker {
            context: context.clone(),
            config: deps.config.clone(),
            repository: deps.repository.clone(),
            operation,
            status: deps.status.clone(),
            discovery: deps.discovery.clone(),
            events: deps.events.clone(),
            queues: TaskQueues::new(),
            state: Mutex::new(WorkerState::NeedServerContract),
            cycle: AtomicU64::new(0),
            nym_backoff: Backoff::new(cap),
            server_backoff: Backoff::new(cap),
            unit_backoff: Backoff::new(cap),
            cancel: deps.cancel.child_token(),
        });

        // The scheduler only holds a weak reference so the step closure does
        // not keep the worker alive.
        let weak = Arc::downgrade(&worker);
        let step: StepFn = Arc::new(move || {
            let weak = weak.clone();
            async move {
                let Some(worker) = weak.upgrade() else {
                    return false;
                };
                let span = info_span!("context_worker", context = %worker.context);
                worker.pass().instrument(span).await
            }
            .boxed()
        });
        let scheduler = Scheduler::new(context.to_string(), runtime, step);
        deps.discovery.register(scheduler.clone());

        debug!(%context, "Context worker created");
        Self { worker, scheduler }
    }

    pub fn context(&self) -> &ContextId {
        &self.worker.context
    }

    pub fn state(&self) -> WorkerState {
        *self.worker.state.lock()
    }

    /// Number of Ready cycles run so far
    pub fn cycles(&self) -> u64 {
        self.worker.cycle.load(Ordering::SeqCst)
    }

    /// Queue a task and wake the worker.
    ///
    /// Returns [`TaskId::invalid`] when an equal task is already pending.
    pub fn submit(&self, task: Task) -> TaskId {
        let id = TaskId::new();
        let kind = task.kind();

        // Registered before the push so a fast worker cannot finish an id
        // the table has not seen yet.
        self.worker.status.add_task(id);
        if !self.worker.queues.push(id, task) {
            self.worker.status.remove_task(id);
            debug!(context = %self.worker.context, %kind, "Equal task already queued");
            return TaskId::invalid();
        }

        trace!(context = %self.worker.context, task_id = %id, %kind, "Task queued");
        if !self.scheduler.trigger() {
            debug!(context = %self.worker.context, task_id = %id, "Worker stopped, task left queued");
        }
        id
    }

    /// Wake the worker without adding work
    pub fn trigger(&self) -> bool {
        self.scheduler.trigger()
    }

    /// Resolves the next time the worker goes idle
    pub fn idle(&self) -> Completion {
        self.scheduler.wait()
    }

    /// Pending task count per kind
    pub fn pending(&self) -> Vec<(TaskKind, usize)> {
        self.worker.queues.snapshot()
    }

    /// Backoff multiplier currently applied to an unresolved nym
    pub fn nym_backoff(&self, nym: &NymId) -> Option<u64> {
        self.worker.nym_backoff.multiplier(nym)
    }

    pub fn server_backoff(&self, server: &ServerId) -> Option<u64> {
        self.worker.server_backoff.multiplier(server)
    }

    pub fn unit_backoff(&self, unit: &UnitId) -> Option<u64> {
        self.worker.unit_backoff.multiplier(unit)
    }

    /// Cancel in-flight work and stop the scheduler
    pub fn stop(&self) -> Completion {
        self.worker.cancel.cancel();
        self.scheduler.stop()
    }
}

impl std::fmt::Debug for ContextWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWorker")
            .field("context", &self.worker.context)
            .field("state", &self.state())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Worker {
    fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// One scheduler pass. Returns `true` while more work remains.
    async fn pass(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.state() {
            WorkerState::NeedServerContract => self.need_server_contract().await,
            WorkerState::NeedRegistration => self.need_registration().await,
            WorkerState::Ready => self.run_cycle().await,
        }
    }

    fn advance(&self, to: WorkerState) {
        let from = {
            let mut state = self.state.lock();
            if *state >= to {
                return;
            }
            let from = *state;
            *state = to;
            from
        };
        info!(context = %self.context, %from, %to, "Worker state changed");
        let _ = self.events.send(WorkerEvent::StateChanged {
            context: self.context.clone(),
            from,
            to,
        });
    }

    /// Sleep unless cancelled. Returns `false` if cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(&self, request: OperationRequest) -> Result<Reply, TaskError> {
        run_operation(self.operation.as_ref(), request, &self.config, &self.cancel).await
    }

    /// Queue a follow-up task with a fresh id and no status entry
    fn schedule(&self, task: Task) -> bool {
        let kind = task.kind();
        let task_id = TaskId::new();
        if !self.queues.push(task_id, task) {
            trace!(context = %self.context, %kind, "Follow-up already queued");
            return false;
        }
        debug!(context = %self.context, %task_id, %kind, "Follow-up scheduled");
        let _ = self.events.send(WorkerEvent::TaskScheduled {
            context: self.context.clone(),
            task_id,
            kind,
        });
        true
    }

    async fn run_cycle(&self) -> bool {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(context = %self.context, cycle, "Cycle started");

        self.request_admin().await;
        self.check_revision();
        if cycle % self.config.name_check_interval == 0 {
            self.check_server_name().await;
        }
        self.scan_discovery(cycle).await;

        let mut requeued = false;
        for kind in TaskKind::CYCLE_ORDER {
            let queue = self.queues.queue(kind);
            // Entries pushed back during this cycle wait for the next one
            for _ in 0..queue.len() {
                if self.cancel.is_cancelled() {
                    return false;
                }
                let Some((id, task)) = queue.pop() else {
                    break;
                };
                let result = match AssertUnwindSafe(self.execute(&task, cycle))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        error!(
                            context = %self.context,
                            task_id = %id,
                            kind = %task.kind(),
                            "Task handler panicked"
                        );
                        Err(TaskError::Panicked)
                    }
                };
                match self.settle(id, task, result) {
                    Settled::Done => {}
                    Settled::Requeued => requeued = true,
                    Settled::Stopped => return false,
                }
            }
        }

        if self.cancel.is_cancelled() {
            return false;
        }
        let replenishing = self.replenish_numbers();
        let more = self.queues.pending() > 0;

        // A freshly queued number request waits out the requeue delay too
        if requeued || replenishing {
            return self.pause(self.config.requeue_delay()).await;
        }
        more
    }

    async fn execute(&self, task: &Task, cycle: u64) -> HandlerResult {
        match task {
            Task::RegisterNym { resync } => self.register_nym(*resync).await,
            Task::CheckNym { nym } => self.discover(nym, cycle).await,
            Task::DownloadContract { server } => self.discover(server, cycle).await,
            Task::DownloadUnitDefinition { unit } => self.discover(unit, cycle).await,
            Task::DownloadNymbox => self.download_nymbox().await,
            Task::DownloadAccount { account } => self.download_account(account).await,
            Task::RegisterAccount { unit, label } => self.register_account(unit, label).await,
            Task::IssueUnitDefinition {
                definition,
                label,
                advertise,
            } => {
                self.issue_unit_definition(definition, label, *advertise)
                    .await
            }
            Task::SendMessage { recipient, body } => self.send_message(recipient, body).await,
            Task::ConveyPayment { recipient, payment } => {
                self.convey_payment(recipient, payment).await
            }
            Task::SendCash { recipient, purse } => self.send_cash(recipient, purse).await,
            Task::SendCheque {
                account,
                recipient,
                amount,
                memo,
            } => self.send_cheque(account, recipient, *amount, memo).await,
            Task::DepositPayment { account, payment } => {
                self.deposit_payment(account.as_ref(), payment).await
            }
            Task::SendTransfer {
                source,
                destination,
                amount,
                memo,
            } => self.send_transfer(source, destination, *amount, memo).await,
            Task::ProcessInbox { account } => self.process_inbox(account).await,
            Task::PublishServerContract { server } => self.publish_server_contract(server).await,
            Task::PeerRequest { target, request } => self.peer_request(target, request).await,
            Task::PeerReply {
                target,
                reply,
                request,
            } => self.peer_reply(target, reply, request).await,
            Task::GetTransactionNumbers => self.get_transaction_numbers().await,
            Task::WithdrawCash { account, amount } => self.withdraw_cash(account, *amount).await,
            Task::DownloadMint { unit } => self.download_mint(unit).await,
        }
    }

    /// Apply the per-kind failure policy to a handler result
    fn settle(&self, id: TaskId, task: Task, result: HandlerResult) -> Settled {
        let kind = task.kind();
        match result {
            Ok(message) => {
                if let Some(message) = message {
                    self.status.set_message_id(id, message);
                }
                self.status.finish_task(id, true);
                Settled::Done
            }
            Err(TaskError::Shutdown) => {
                self.queues.push(id, task);
                Settled::Stopped
            }
            Err(TaskError::Precondition(precondition)) => {
                self.requeue(id, task, precondition.to_string())
            }
            Err(err @ TaskError::Deferred { .. }) => self.requeue(id, task, err.to_string()),
            Err(err) if kind == TaskKind::RegisterNym => self.requeue(id, task, err.to_string()),
            Err(err) => {
                if matches!(kind, TaskKind::DownloadNymbox | TaskKind::RegisterAccount) {
                    self.schedule(Task::RegisterNym { resync: false });
                }
                warn!(
                    context = %self.context,
                    task_id = %id,
                    %kind,
                    error = %err,
                    "Task failed"
                );
                self.status.finish_task(id, false);
                Settled::Done
            }
        }
    }

    fn requeue(&self, id: TaskId, task: Task, reason: String) -> Settled {
        let kind = task.kind();
        if !self.queues.push(id, task) {
            // An equal task was submitted meanwhile and will do the work
            debug!(context = %self.context, task_id = %id, %kind, "Requeue superseded");
            self.status.finish_task(id, false);
            return Settled::Done;
        }
        debug!(context = %self.context, task_id = %id, %kind, %reason, "Task requeued");
        let _ = self.events.send(WorkerEvent::TaskRequeued {
            context: self.context.clone(),
            task_id: id,
            kind,
            reason,
        });
        Settled::Requeued
    }

    async fn need_server_contract(&self) -> bool {
        if self.repository.server_contract(&self.context.server).is_some() {
            self.advance(WorkerState::NeedRegistration);
            return true;
        }

        debug!(context = %self.context, "Server contract unknown, asking other workers");
        self.discovery
            .servers
            .push(TaskId::new(), self.context.server.clone());
        self.discovery.trigger_all();
        self.pause(self.config.contract_retry()).await
    }

    async fn need_registration(&self) -> bool {
        if self.repository.consensus(&self.context).is_registered() {
            self.advance(WorkerState::Ready);
            return true;
        }

        match self.register(false).await {
            Ok(()) => {
                self.advance(WorkerState::Ready);
                true
            }
            Err(TaskError::Shutdown) => false,
            Err(err) => {
                warn!(context = %self.context, error = %err, "Registration failed, will retry");
                self.pause(self.config.registration_retry()).await
            }
        }
    }
}

/// Message id carried by a delivery reply, if any
fn delivered(reply: Reply) -> Option<MessageId> {
    match reply {
        Reply::Message(id) => Some(id),
        _ => None,
    }
}
