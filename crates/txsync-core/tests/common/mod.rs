//! Shared harness for integration tests: a scripted endpoint network
//!
//! [`MockTransport`] answers every request from an in-memory [`World`] of
//! published nyms, contracts and units. Individual requests can be made to
//! fail, drop, hang or panic by operation name.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use txsync_core::{
    AccountId, AccountRecord, ConsensusState, ContextId, InboxItem, MemoryRepository, MessageId,
    NymId, NymRecord, Operation, OperationRequest, OperationResult, Purse, Reply, Repository,
    ServerContract, ServerId, SyncConfig, SynchronizationManager, TaskCompletion, TaskId,
    Transport, UnitDefinition, UnitId, WorkerEvent,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What the remote side knows and how it misbehaves
#[derive(Default)]
pub struct World {
    nyms: Mutex<HashMap<NymId, NymRecord>>,
    servers: Mutex<HashMap<ServerId, ServerContract>>,
    units: Mutex<HashMap<UnitId, UnitDefinition>>,
    accounts: Mutex<HashMap<AccountId, (AccountRecord, Vec<InboxItem>)>>,
    /// Remaining rejections per operation name
    reject: Mutex<HashMap<&'static str, usize>>,
    /// Remaining dropped replies per operation name
    drop: Mutex<HashMap<&'static str, usize>>,
    /// Operation names whose replies never arrive
    hang: Mutex<HashSet<&'static str>>,
    /// Operation names whose replies panic the awaiting worker
    panic: Mutex<HashSet<&'static str>>,
    requests: Mutex<Vec<(ContextId, OperationRequest)>>,
    next_number: AtomicU64,
    next_id: AtomicU64,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_number: AtomicU64::new(100),
            ..Self::default()
        })
    }

    pub fn publish_nym(&self, id: &str, name: &str) {
        let id = NymId::new(id);
        self.nyms.lock().insert(
            id.clone(),
            NymRecord {
                id,
                name: name.to_string(),
                revision: 1,
            },
        );
    }

    pub fn publish_server(&self, id: &str, name: &str) {
        let contract = server_contract(id, name);
        self.publish_nym(contract.nym.as_str(), name);
        self.servers.lock().insert(contract.id.clone(), contract);
    }

    pub fn publish_unit(&self, id: &str) {
        let definition = unit_definition(id);
        self.units.lock().insert(definition.id.clone(), definition);
    }

    pub fn open_account(&self, record: AccountRecord, inbox: Vec<InboxItem>) {
        self.accounts.lock().insert(record.id.clone(), (record, inbox));
    }

    pub fn reject_next(&self, operation: &'static str, times: usize) {
        self.reject.lock().insert(operation, times);
    }

    pub fn drop_next(&self, operation: &'static str, times: usize) {
        self.drop.lock().insert(operation, times);
    }

    pub fn hang_on(&self, operation: &'static str) {
        self.hang.lock().insert(operation);
    }

    pub fn panic_on(&self, operation: &'static str) {
        self.panic.lock().insert(operation);
    }

    /// Every request started so far, in order
    pub fn requests(&self) -> Vec<(ContextId, OperationRequest)> {
        self.requests.lock().clone()
    }

    /// Names of the requests started so far, in order
    pub fn request_names(&self) -> Vec<&'static str> {
        self.requests
            .lock()
            .iter()
            .map(|(_, request)| request.name())
            .collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.request_names()
            .into_iter()
            .filter(|name| *name == operation)
            .count()
    }

    fn take(counter: &Mutex<HashMap<&'static str, usize>>, name: &'static str) -> bool {
        let mut counter = counter.lock();
        match counter.get_mut(name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn respond(&self, context: &ContextId, request: &OperationRequest) -> OperationResult {
        let name = request.name();
        if Self::take(&self.drop, name) {
            return OperationResult::not_sent();
        }
        if Self::take(&self.reject, name) {
            return OperationResult::rejected();
        }

        let reply = match request {
            OperationRequest::RegisterNym { .. } => Reply::Registered { request_number: 1 },
            OperationRequest::CheckNym { nym } => match self.nyms.lock().get(nym) {
                Some(record) => Reply::Nym(record.clone()),
                None => return OperationResult::rejected(),
            },
            OperationRequest::DownloadContract { server } => match self.servers.lock().get(server) {
                Some(contract) => Reply::ServerContract(contract.clone()),
                None => return OperationResult::rejected(),
            },
            OperationRequest::DownloadUnitDefinition { unit } => match self.units.lock().get(unit)
            {
                Some(definition) => Reply::UnitDefinition(definition.clone()),
                None => return OperationResult::rejected(),
            },
            OperationRequest::DownloadNymbox => Reply::Nymbox {
                requests: Vec::new(),
                replies: Vec::new(),
            },
            OperationRequest::DownloadAccount { account } => match self.accounts.lock().get(account) {
                Some((record, inbox)) => Reply::Account {
                    record: record.clone(),
                    inbox: inbox.clone(),
                },
                None => return OperationResult::rejected(),
            },
            OperationRequest::RegisterAccount { unit, label } => {
                let record = AccountRecord {
                    id: AccountId::new(self.next_id("acct")),
                    owner: context.nym.clone(),
                    server: context.server.clone(),
                    unit: unit.clone(),
                    label: label.clone(),
                    balance: 0,
                };
                self.open_account(record.clone(), Vec::new());
                Reply::Account {
                    record,
                    inbox: Vec::new(),
                }
            }
            OperationRequest::IssueUnitDefinition { definition, label } => {
                self.units
                    .lock()
                    .insert(definition.id.clone(), definition.clone());
                Reply::Account {
                    record: AccountRecord {
                        id: AccountId::new(self.next_id("issuer")),
                        owner: context.nym.clone(),
                        server: context.server.clone(),
                        unit: definition.id.clone(),
                        label: label.clone(),
                        balance: 0,
                    },
                    inbox: Vec::new(),
                }
            }
            OperationRequest::ProcessInbox { account, items, .. } => {
                if let Some((_, inbox)) = self.accounts.lock().get_mut(account) {
                    inbox.retain(|item| !items.contains(&item.id));
                }
                Reply::Empty
            }
            OperationRequest::SendMessage { .. }
            | OperationRequest::ConveyPayment { .. }
            | OperationRequest::SendCash { .. }
            | OperationRequest::SendCheque { .. }
            | OperationRequest::PeerRequest { .. }
            | OperationRequest::PeerReply { .. } => Reply::Message(MessageId::new(self.next_id("msg"))),
            OperationRequest::GetTransactionNumbers => {
                let first = self.next_number.fetch_add(5, Ordering::SeqCst);
                Reply::TransactionNumbers((first..first + 5).collect())
            }
            OperationRequest::WithdrawCash { amount, account, .. } => {
                let unit = self
                    .accounts
                    .lock()
                    .get(account)
                    .map(|(record, _)| record.unit.clone())
                    .unwrap_or_else(|| UnitId::new("unknown"));
                Reply::Purse(Purse {
                    unit,
                    amount: *amount,
                    tokens: vec![vec![1, 2, 3]],
                })
            }
            OperationRequest::RequestAdmin { .. } => Reply::Admin { granted: true },
            OperationRequest::DepositPayment { .. }
            | OperationRequest::SendTransfer { .. }
            | OperationRequest::PublishServerContract { .. }
            | OperationRequest::DownloadMint { .. } => Reply::Empty,
        };
        OperationResult::success(reply)
    }
}

/// One context's exchange slot against the [`World`]
pub struct MockOperation {
    context: ContextId,
    world: Arc<World>,
    current: Mutex<Option<OperationRequest>>,
}

impl Operation for MockOperation {
    fn start(&self, request: &OperationRequest) -> bool {
        let mut current = self.current.lock();
        if current.is_some() {
            return false;
        }
        self.world
            .requests
            .lock()
            .push((self.context.clone(), request.clone()));
        *current = Some(request.clone());
        true
    }

    fn wait(&self) -> BoxFuture<'_, OperationResult> {
        let Some(request) = self.current.lock().take() else {
            return async { OperationResult::not_sent() }.boxed();
        };
        if self.world.hang.lock().contains(request.name()) {
            return futures::future::pending().boxed();
        }
        let panics = self.world.panic.lock().contains(request.name());
        if panics {
            panic!("scripted failure in {}", request.name());
        }
        let result = self.world.respond(&self.context, &request);
        async move {
            tokio::task::yield_now().await;
            result
        }
        .boxed()
    }

    fn cancel(&self) {
        self.current.lock().take();
    }
}

pub struct MockTransport {
    world: Arc<World>,
}

impl MockTransport {
    pub fn new(world: Arc<World>) -> Arc<Self> {
        Arc::new(Self { world })
    }
}

impl Transport for MockTransport {
    fn operation(&self, context: &ContextId) -> Arc<dyn Operation> {
        Arc::new(MockOperation {
            context: context.clone(),
            world: self.world.clone(),
            current: Mutex::new(None),
        })
    }
}

pub fn server_contract(id: &str, name: &str) -> ServerContract {
    ServerContract {
        id: ServerId::new(id),
        nym: NymId::new(format!("{id}-nym")),
        name: name.to_string(),
    }
}

pub fn unit_definition(id: &str) -> UnitDefinition {
    UnitDefinition {
        id: UnitId::new(id),
        issuer: NymId::new("issuer"),
        name: id.to_string(),
        symbol: id.to_uppercase(),
    }
}

pub fn account(id: &str, owner: &str, server: &str, unit: &str, balance: i64) -> AccountRecord {
    AccountRecord {
        id: AccountId::new(id),
        owner: NymId::new(owner),
        server: ServerId::new(server),
        unit: UnitId::new(unit),
        label: String::new(),
        balance,
    }
}

pub struct Harness {
    pub world: Arc<World>,
    pub repository: Arc<MemoryRepository>,
    pub manager: SynchronizationManager,
    pub completions: broadcast::Receiver<TaskCompletion>,
    pub events: broadcast::Receiver<WorkerEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::fast())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self::with_repository(config, MemoryRepository::new())
    }

    pub fn with_repository(config: SyncConfig, repository: MemoryRepository) -> Self {
        let world = World::new();
        let repository = Arc::new(repository);
        let manager = SynchronizationManager::new(
            config,
            repository.clone(),
            MockTransport::new(world.clone()),
        )
        .unwrap();
        let completions = manager.subscribe();
        let events = manager.subscribe_events();
        Self {
            world,
            repository,
            manager,
            completions,
            events,
        }
    }

    /// Local nym known to both sides
    pub fn local_nym(&self, id: &str) {
        self.world.publish_nym(id, id);
        self.repository.add_local_nym(NymRecord {
            id: NymId::new(id),
            name: id.to_string(),
            revision: 1,
        });
    }

    /// Context whose contract is known and whose nym is already registered
    pub fn ready_context(&self, nym: &str, server: &str) -> ContextId {
        self.local_nym(nym);
        self.world.publish_server(server, server);
        self.repository
            .store_server_contract(server_contract(server, server));
        let context = ContextId::new(nym, server);
        self.repository.store_consensus(
            &context,
            ConsensusState {
                request_number: 1,
                published_revision: 1,
                ..ConsensusState::default()
            },
        );
        context
    }

    pub fn give_numbers(&self, context: &ContextId, numbers: impl IntoIterator<Item = u64>) {
        let mut consensus = self.repository.consensus(context);
        consensus.transaction_numbers.extend(numbers);
        self.repository.store_consensus(context, consensus);
    }

    /// Wait for the completion of `id`
    pub async fn completion(&mut self, id: TaskId) -> bool {
        assert!(id.is_valid(), "task was not accepted");
        let wait = async {
            loop {
                match self.completions.recv().await {
                    Ok(done) if done.task_id == id => return done.success,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("completion channel closed"),
                }
            }
        };
        tokio::time::timeout(TIMEOUT, wait)
            .await
            .expect("task did not complete in time")
    }

    /// Collect worker events until `stop` matches one
    pub async fn events_until(
        &mut self,
        mut stop: impl FnMut(&WorkerEvent) -> bool,
    ) -> Vec<WorkerEvent> {
        let mut seen = Vec::new();
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        let done = stop(&event);
                        seen.push(event);
                        if done {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(TIMEOUT, wait)
            .await
            .expect("event did not arrive in time");
        seen
    }

    /// Poll until `check` holds
    pub async fn eventually(&self, mut check: impl FnMut() -> bool) {
        let wait = async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(TIMEOUT, wait)
            .await
            .expect("condition not reached in time");
    }
}
