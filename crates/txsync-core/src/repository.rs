//! Object repository consumed by the workers
//!
//! [`Repository`] is the seam between the synchronization engine and wherever
//! identities, contracts, accounts and consensus state live.
//! [`MemoryRepository`] keeps everything in process and, when built with
//! [`MemoryRepository::from_storage`], writes records through to redb.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::storage::{PeerBox, Storage};
use crate::types::{
    AccountId, AccountRecord, ConsensusState, ContextId, InboxItem, NymId, NymRecord, PeerReply,
    PeerRequest, Purse, ServerContract, ServerId, UnitDefinition, UnitId,
};

/// Load/store access to everything a worker reads or updates
pub trait Repository: Send + Sync {
    /// Nyms managed by this process
    fn local_nyms(&self) -> Vec<NymId>;
    fn is_local(&self, nym: &NymId) -> bool;
    fn nym(&self, id: &NymId) -> Option<NymRecord>;
    fn store_nym(&self, record: NymRecord);

    fn server_contract(&self, id: &ServerId) -> Option<ServerContract>;
    fn store_server_contract(&self, contract: ServerContract);
    fn unit_definition(&self, id: &UnitId) -> Option<UnitDefinition>;
    fn store_unit_definition(&self, definition: UnitDefinition);

    /// Consensus state of a context, default-created on first access
    fn consensus(&self, context: &ContextId) -> ConsensusState;
    fn store_consensus(&self, context: &ContextId, state: ConsensusState);
    /// Contexts whose nym has completed registration
    fn registered_contexts(&self) -> Vec<ContextId>;

    fn account(&self, id: &AccountId) -> Option<AccountRecord>;
    /// Accounts owned by the context's nym at the context's server
    fn accounts(&self, context: &ContextId) -> Vec<AccountRecord>;
    fn all_accounts(&self) -> Vec<AccountRecord>;
    fn store_account(&self, record: AccountRecord);
    fn inbox(&self, account: &AccountId) -> Vec<InboxItem>;
    fn store_inbox(&self, account: &AccountId, items: Vec<InboxItem>);

    fn has_mint(&self, server: &ServerId, unit: &UnitId) -> bool;
    fn store_mint(&self, server: &ServerId, unit: &UnitId);
    fn store_purse(&self, context: &ContextId, purse: Purse);
    fn purses(&self, context: &ContextId) -> Vec<Purse>;

    /// Record a unit the nym advertises as issuer
    fn add_claim(&self, nym: &NymId, unit: &UnitId);
    fn claims(&self, nym: &NymId) -> Vec<UnitId>;

    fn store_peer_request(&self, nym: &NymId, peer_box: PeerBox, request: PeerRequest);
    fn peer_requests(&self, nym: &NymId, peer_box: PeerBox) -> Vec<PeerRequest>;
    /// Refile a request. Returns `false` if it was not in `from`.
    fn move_peer_request(&self, nym: &NymId, id: &str, from: PeerBox, to: PeerBox) -> bool;
    fn store_peer_reply(&self, nym: &NymId, peer_box: PeerBox, reply: PeerReply);
    fn peer_replies(&self, nym: &NymId, peer_box: PeerBox) -> Vec<PeerReply>;
}

#[derive(Default)]
struct State {
    local: BTreeSet<NymId>,
    nyms: HashMap<NymId, NymRecord>,
    servers: HashMap<ServerId, ServerContract>,
    units: HashMap<UnitId, UnitDefinition>,
    consensus: HashMap<ContextId, ConsensusState>,
    accounts: HashMap<AccountId, AccountRecord>,
    inboxes: HashMap<AccountId, Vec<InboxItem>>,
    mints: HashSet<(ServerId, UnitId)>,
    purses: HashMap<ContextId, Vec<Purse>>,
    claims: HashMap<NymId, BTreeSet<UnitId>>,
    requests: HashMap<(NymId, PeerBox), Vec<PeerRequest>>,
    replies: HashMap<(NymId, PeerBox), Vec<PeerReply>>,
}

/// In-process repository guarded by a single lock
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
    storage: Option<Storage>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every persisted record and write later changes back to `storage`.
    ///
    /// Inboxes, mints, purses and claims are kept in memory only.
    pub fn from_storage(storage: Storage) -> SyncResult<Self> {
        let mut state = State::default();
        state.local = storage.list_local_nyms()?.into_iter().collect();
        for record in storage.list_nyms()? {
            state.nyms.insert(record.id.clone(), record);
        }
        for contract in storage.list_server_contracts()? {
            state.servers.insert(contract.id.clone(), contract);
        }
        for definition in storage.list_unit_definitions()? {
            state.units.insert(definition.id.clone(), definition);
        }
        for account in storage.list_accounts()? {
            state.accounts.insert(account.id.clone(), account);
        }
        for (context, consensus) in storage.list_consensus()? {
            state.consensus.insert(context, consensus);
        }
        for nym in state.local.clone() {
            for peer_box in [
                PeerBox::Incoming,
                PeerBox::Sent,
                PeerBox::Processed,
                PeerBox::Finished,
            ] {
                let requests = storage.load_peer_requests(&nym, peer_box)?;
                if !requests.is_empty() {
                    state.requests.insert((nym.clone(), peer_box), requests);
                }
                let replies = storage.load_peer_replies(&nym, peer_box)?;
                if !replies.is_empty() {
                    state.replies.insert((nym.clone(), peer_box), replies);
                }
            }
        }

        debug!(
            nyms = state.nyms.len(),
            accounts = state.accounts.len(),
            "Repository loaded from storage"
        );

        Ok(Self {
            state: RwLock::new(state),
            storage: Some(storage),
        })
    }

    /// Register a nym as local and store its credentials
    pub fn add_local_nym(&self, record: NymRecord) {
        let id = record.id.clone();
        self.state.write().local.insert(id.clone());
        self.persist("local nym", |s| s.save_local_nym(&id));
        self.store_nym(record);
    }

    fn persist(&self, what: &str, write: impl FnOnce(&Storage) -> SyncResult<()>) {
        if let Some(storage) = &self.storage {
            if let Err(e) = write(storage) {
                warn!(error = %e, "Failed to persist {}", what);
            }
        }
    }
}

impl Repository for MemoryRepository {
    fn local_nyms(&self) -> Vec<NymId> {
        self.state.read().local.iter().cloned().collect()
    }

    fn is_local(&self, nym: &NymId) -> bool {
        self.state.read().local.contains(nym)
    }

    fn nym(&self, id: &NymId) -> Option<NymRecord> {
        self.state.read().nyms.get(id).cloned()
    }

    fn store_nym(&self, record: NymRecord) {
        self.persist("nym", |s| s.save_nym(&record));
        self.state.write().nyms.insert(record.id.clone(), record);
    }

    fn server_contract(&self, id: &ServerId) -> Option<ServerContract> {
        self.state.read().servers.get(id).cloned()
    }

    fn store_server_contract(&self, contract: ServerContract) {
        self.persist("server contract", |s| s.save_server_contract(&contract));
        self.state.write().servers.insert(contract.id.clone(), contract);
    }

    fn unit_definition(&self, id: &UnitId) -> Option<UnitDefinition> {
        self.state.read().units.get(id).cloned()
    }

    fn store_unit_definition(&self, definition: UnitDefinition) {
        self.persist("unit definition", |s| s.save_unit_definition(&definition));
        self.state.write().units.insert(definition.id.clone(), definition);
    }

    fn consensus(&self, context: &ContextId) -> ConsensusState {
        if let Some(state) = self.state.read().consensus.get(context) {
            return state.clone();
        }
        self.state
            .write()
            .consensus
            .entry(context.clone())
            .or_default()
            .clone()
    }

    fn store_consensus(&self, context: &ContextId, state: ConsensusState) {
        self.persist("consensus", |s| s.save_consensus(context, &state));
        self.state.write().consensus.insert(context.clone(), state);
    }

    fn registered_contexts(&self) -> Vec<ContextId> {
        let mut contexts: Vec<ContextId> = self
            .state
            .read()
            .consensus
            .iter()
            .filter(|(_, state)| state.is_registered())
            .map(|(context, _)| context.clone())
            .collect();
        contexts.sort();
        contexts
    }

    fn account(&self, id: &AccountId) -> Option<AccountRecord> {
        self.state.read().accounts.get(id).cloned()
    }

    fn accounts(&self, context: &ContextId) -> Vec<AccountRecord> {
        let mut accounts: Vec<AccountRecord> = self
            .state
            .read()
            .accounts
            .values()
            .filter(|a| a.owner == context.nym && a.server == context.server)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    fn all_accounts(&self) -> Vec<AccountRecord> {
        let mut accounts: Vec<AccountRecord> =
            self.state.read().accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    fn store_account(&self, record: AccountRecord) {
        self.persist("account", |s| s.save_account(&record));
        self.state.write().accounts.insert(record.id.clone(), record);
    }

    fn inbox(&self, account: &AccountId) -> Vec<InboxItem> {
        self.state
            .read()
            .inboxes
            .get(account)
            .cloned()
            .unwrap_or_default()
    }

    fn store_inbox(&self, account: &AccountId, items: Vec<InboxItem>) {
        let mut state = self.state.write();
        if items.is_empty() {
            state.inboxes.remove(account);
        } else {
            state.inboxes.insert(account.clone(), items);
        }
    }

    fn has_mint(&self, server: &ServerId, unit: &UnitId) -> bool {
        self.state
            .read()
            .mints
            .contains(&(server.clone(), unit.clone()))
    }

    fn store_mint(&self, server: &ServerId, unit: &UnitId) {
        self.state
            .write()
            .mints
            .insert((server.clone(), unit.clone()));
    }

    fn store_purse(&self, context: &ContextId, purse: Purse) {
        self.state
            .write()
            .purses
            .entry(context.clone())
            .or_default()
            .push(purse);
    }

    fn purses(&self, context: &ContextId) -> Vec<Purse> {
        self.state
            .read()
            .purses
            .get(context)
            .cloned()
            .unwrap_or_default()
    }

    fn add_claim(&self, nym: &NymId, unit: &UnitId) {
        self.state
            .write()
            .claims
            .entry(nym.clone())
            .or_default()
            .insert(unit.clone());
    }

    fn claims(&self, nym: &NymId) -> Vec<UnitId> {
        self.state
            .read()
            .claims
            .get(nym)
            .map(|units| units.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn store_peer_request(&self, nym: &NymId, peer_box: PeerBox, request: PeerRequest) {
        self.persist("peer request", |s| {
            s.save_peer_request(nym, peer_box, &request)
        });
        let mut state = self.state.write();
        let requests = state.requests.entry((nym.clone(), peer_box)).or_default();
        requests.retain(|r| r.id != request.id);
        requests.push(request);
    }

    fn peer_requests(&self, nym: &NymId, peer_box: PeerBox) -> Vec<PeerRequest> {
        self.state
            .read()
            .requests
            .get(&(nym.clone(), peer_box))
            .cloned()
            .unwrap_or_default()
    }

    fn move_peer_request(&self, nym: &NymId, id: &str, from: PeerBox, to: PeerBox) -> bool {
        let request = {
            let mut state = self.state.write();
            let Some(requests) = state.requests.get_mut(&(nym.clone(), from)) else {
                return false;
            };
            let Some(index) = requests.iter().position(|r| r.id == id) else {
                return false;
            };
            requests.remove(index)
        };
        self.persist("peer request", |s| {
            s.delete_peer_request(nym, from, id).map(|_| ())
        });
        self.store_peer_request(nym, to, request);
        true
    }

    fn store_peer_reply(&self, nym: &NymId, peer_box: PeerBox, reply: PeerReply) {
        self.persist("peer reply", |s| s.save_peer_reply(nym, peer_box, &reply));
        let mut state = self.state.write();
        let replies = state.replies.entry((nym.clone(), peer_box)).or_default();
        replies.retain(|r| r.id != reply.id);
        replies.push(reply);
    }

    fn peer_replies(&self, nym: &NymId, peer_box: PeerBox) -> Vec<PeerReply> {
        self.state
            .read()
            .replies
            .get(&(nym.clone(), peer_box))
            .cloned()
            .unwrap_or_default()
    }
}
