//! Resolution of unknown nyms, server contracts and unit definitions
//!
//! Ids reach a worker two ways: as explicit CheckNym / DownloadContract /
//! DownloadUnitDefinition tasks, or through the manager-wide
//! [`DiscoveryQueues`] that every Ready worker rescans each cycle. Both paths
//! share [`Lookup`] and the worker's [`Backoff`] maps.

use std::fmt;
use std::hash::Hash;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::{Backoff, HandlerResult, Worker};
use crate::error::{Precondition, TaskError};
use crate::operation::{OperationRequest, Reply};
use crate::queue::TaskQueue;
use crate::repository::Repository;
use crate::scheduler::Scheduler;
use crate::types::{NymId, ServerContract, ServerId, UnitId};

/// Manager-wide queues of ids nobody has resolved yet
#[derive(Default)]
pub struct DiscoveryQueues {
    pub(crate) nyms: TaskQueue<NymId>,
    pub(crate) servers: TaskQueue<ServerId>,
    pub(crate) units: TaskQueue<UnitId>,
    schedulers: RwLock<Vec<Scheduler>>,
}

impl DiscoveryQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, scheduler: Scheduler) {
        self.schedulers.write().push(scheduler);
    }

    /// Wake every worker so Ready ones rescan the queues
    pub(crate) fn trigger_all(&self) {
        for scheduler in self.schedulers.read().iter() {
            scheduler.trigger();
        }
    }

    pub(crate) fn clear_schedulers(&self) {
        self.schedulers.write().clear();
    }

    /// Number of ids waiting in each queue: nyms, servers, units
    pub fn pending(&self) -> (usize, usize, usize) {
        (self.nyms.len(), self.servers.len(), self.units.len())
    }
}

impl fmt::Debug for DiscoveryQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryQueues")
            .field("nyms", &self.nyms.len())
            .field("servers", &self.servers.len())
            .field("units", &self.units.len())
            .finish()
    }
}

/// An id that can be fetched from an endpoint and stored locally
pub(super) trait Lookup: Clone + Eq + Hash + PartialEq + fmt::Display + Send + Sync {
    fn known(&self, repository: &dyn Repository) -> bool;
    fn request(&self) -> OperationRequest;
    /// Store the record in `reply`. Returns `false` if the reply does not carry it.
    fn store(&self, repository: &dyn Repository, reply: Reply) -> bool;
    fn backoff(worker: &Worker) -> &Backoff<Self>;
    fn pending(queues: &DiscoveryQueues) -> &TaskQueue<Self>;
}

impl Lookup for NymId {
    fn known(&self, repository: &dyn Repository) -> bool {
        repository.nym(self).is_some()
    }

    fn request(&self) -> OperationRequest {
        OperationRequest::CheckNym { nym: self.clone() }
    }

    fn store(&self, repository: &dyn Repository, reply: Reply) -> bool {
        match reply {
            Reply::Nym(record) if record.id == *self => {
                repository.store_nym(record);
                true
            }
            _ => false,
        }
    }

    fn backoff(worker: &Worker) -> &Backoff<Self> {
        &worker.nym_backoff
    }

    fn pending(queues: &DiscoveryQueues) -> &TaskQueue<Self> {
        &queues.nyms
    }
}

impl Lookup for ServerId {
    fn known(&self, repository: &dyn Repository) -> bool {
        repository.server_contract(self).is_some()
    }

    fn request(&self) -> OperationRequest {
        OperationRequest::DownloadContract {
            server: self.clone(),
        }
    }

    fn store(&self, repository: &dyn Repository, reply: Reply) -> bool {
        match reply {
            Reply::ServerContract(contract) if contract.id == *self => {
                repository.store_server_contract(contract);
                true
            }
            _ => false,
        }
    }

    fn backoff(worker: &Worker) -> &Backoff<Self> {
        &worker.server_backoff
    }

    fn pending(queues: &DiscoveryQueues) -> &TaskQueue<Self> {
        &queues.servers
    }
}

impl Lookup for UnitId {
    fn known(&self, repository: &dyn Repository) -> bool {
        repository.unit_definition(self).is_some()
    }

    fn request(&self) -> OperationRequest {
        OperationRequest::DownloadUnitDefinition { unit: self.clone() }
    }

    fn store(&self, repository: &dyn Repository, reply: Reply) -> bool {
        match reply {
            Reply::UnitDefinition(definition) if definition.id == *self => {
                repository.store_unit_definition(definition);
                true
            }
            _ => false,
        }
    }

    fn backoff(worker: &Worker) -> &Backoff<Self> {
        &worker.unit_backoff
    }

    fn pending(queues: &DiscoveryQueues) -> &TaskQueue<Self> {
        &queues.units
    }
}

impl Worker {
    /// Handler for the three discovery task kinds
    pub(super) async fn discover<K: Lookup>(&self, id: &K, cycle: u64) -> HandlerResult {
        let backoff = K::backoff(self);
        if !backoff.is_due(id, cycle) {
            let multiplier = backoff.multiplier(id).unwrap_or(1);
            trace!(context = %self.context, %id, multiplier, "Lookup backing off");
            return Err(TaskError::Deferred { multiplier });
        }
        self.lookup(id).await.map(|_| None)
    }

    /// Fetch one id and keep the backoff map in step with the outcome
    pub(super) async fn lookup<K: Lookup>(&self, id: &K) -> Result<(), TaskError> {
        let request = id.request();
        let operation = request.name();
        let result = match self.run(request).await {
            Ok(reply) => {
                if id.store(self.repository.as_ref(), reply) {
                    Ok(())
                } else {
                    warn!(context = %self.context, %id, "Reply did not carry the requested record");
                    Err(TaskError::Rejected { operation })
                }
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                K::backoff(self).succeeded(id);
                self.resolved(id);
                debug!(context = %self.context, %id, "Resolved");
                Ok(())
            }
            Err(TaskError::Shutdown) => Err(TaskError::Shutdown),
            Err(err) => {
                let multiplier = K::backoff(self).failed(id);
                debug!(context = %self.context, %id, multiplier, error = %err, "Lookup failed");
                Err(err)
            }
        }
    }

    /// Finish every global discovery request for `id`
    fn resolved<K: Lookup>(&self, id: &K) {
        for task_id in K::pending(&self.discovery).cancel_by_value(id) {
            self.status.finish_task(task_id, true);
        }
    }

    pub(super) async fn scan_discovery(&self, cycle: u64) {
        self.scan::<NymId>(cycle).await;
        self.scan::<ServerId>(cycle).await;
        self.scan::<UnitId>(cycle).await;
    }

    async fn scan<K: Lookup>(&self, cycle: u64) {
        for (_, id) in K::pending(&self.discovery).copy() {
            if self.cancel.is_cancelled() {
                return;
            }
            let backoff = K::backoff(self);
            if id.known(self.repository.as_ref()) {
                backoff.succeeded(&id);
                self.resolved(&id);
                continue;
            }
            backoff.track(&id);
            if !backoff.is_due(&id, cycle) {
                continue;
            }
            let _ = self.lookup(&id).await;
        }
    }

    /// Resolve a nym before delivering to it
    pub(super) async fn ensure_nym(&self, nym: &NymId) -> Result<(), TaskError> {
        if nym.known(self.repository.as_ref()) {
            return Ok(());
        }
        match self.lookup(nym).await {
            Err(TaskError::Rejected { .. }) => {
                Err(TaskError::Missing(Precondition::UnknownNym(nym.clone())))
            }
            other => other,
        }
    }

    /// Resolve a unit definition before using it
    pub(super) async fn ensure_unit(&self, unit: &UnitId) -> Result<(), TaskError> {
        if unit.known(self.repository.as_ref()) {
            return Ok(());
        }
        match self.lookup(unit).await {
            Err(TaskError::Rejected { .. }) => {
                Err(TaskError::Missing(Precondition::UnknownUnit(unit.clone())))
            }
            other => other,
        }
    }

    /// Compare the endpoint's published name with the stored contract
    pub(super) async fn check_server_name(&self) {
        let Some(contract) = self.repository.server_contract(&self.context.server) else {
            return;
        };
        let request = OperationRequest::CheckNym {
            nym: contract.nym.clone(),
        };
        match self.run(request).await {
            Ok(Reply::Nym(record)) if record.id == contract.nym => {
                let name = record.name.clone();
                self.repository.store_nym(record);
                if name != contract.name {
                    info!(
                        context = %self.context,
                        old = %contract.name,
                        new = %name,
                        "Server name changed"
                    );
                    self.repository.store_server_contract(ServerContract { name, ..contract });
                }
            }
            Ok(_) => warn!(context = %self.context, "Unexpected reply to server nym check"),
            Err(err) => debug!(context = %self.context, error = %err, "Server name check failed"),
        }
    }
}
