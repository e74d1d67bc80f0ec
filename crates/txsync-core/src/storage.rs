//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Nym credentials, and which nyms are local
//! - Server contracts and unit definitions
//! - Accounts
//! - Consensus state per (nym, server) relationship
//! - Peer requests and replies, filed per nym into boxes

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::{
    AccountId, AccountRecord, ConsensusState, ContextId, NymId, NymRecord, PeerReply, PeerRequest,
    ServerContract, ServerId, UnitDefinition, UnitId,
};

// Table definitions
const NYMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("nyms");
const LOCAL_NYMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("local_nyms");
const SERVERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("server_contracts");
const UNITS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("unit_definitions");
const ACCOUNTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
const CONSENSUS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("consensus");
const PEER_REQUESTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peer_requests");
const PEER_REPLIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peer_replies");

/// Folder a peer request or reply is filed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerBox {
    /// Received, not yet answered
    Incoming,
    /// Sent by the local nym
    Sent,
    /// Answered by the local nym
    Processed,
    /// Answer received and acknowledged
    Finished,
}

impl PeerBox {
    fn as_str(self) -> &'static str {
        match self {
            PeerBox::Incoming => "incoming",
            PeerBox::Sent => "sent",
            PeerBox::Processed => "processed",
            PeerBox::Finished => "finished",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ConsensusRecord {
    context: ContextId,
    state: ConsensusState,
}

fn context_key(context: &ContextId) -> String {
    format!("{}|{}", context.nym.as_str(), context.server.as_str())
}

fn box_prefix(nym: &NymId, peer_box: PeerBox) -> String {
    format!("{}/{}/", nym.as_str(), peer_box.as_str())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, SyncError> {
    serde_json::from_slice(data).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(NYMS_TABLE)?;
            let _ = write_txn.open_table(LOCAL_NYMS_TABLE)?;
            let _ = write_txn.open_table(SERVERS_TABLE)?;
            let _ = write_txn.open_table(UNITS_TABLE)?;
            let _ = write_txn.open_table(ACCOUNTS_TABLE)?;
            let _ = write_txn.open_table(CONSENSUS_TABLE)?;
            let _ = write_txn.open_table(PEER_REQUESTS_TABLE)?;
            let _ = write_txn.open_table(PEER_REPLIES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), SyncError> {
        let data = encode(value)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;

        match table.get(key)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn remove(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(table)?;
            let existed = table.remove(key)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Every value whose key starts with `prefix` (all values for `""`)
    fn scan<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> Result<Vec<T>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let mut values = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            values.push(decode(value.value())?);
        }
        Ok(values)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Nym Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save published credentials, overwriting an older revision
    pub fn save_nym(&self, record: &NymRecord) -> Result<(), SyncError> {
        self.put(NYMS_TABLE, record.id.as_str(), record)
    }

    pub fn load_nym(&self, id: &NymId) -> Result<Option<NymRecord>, SyncError> {
        self.get(NYMS_TABLE, id.as_str())
    }

    pub fn list_nyms(&self) -> Result<Vec<NymRecord>, SyncError> {
        self.scan(NYMS_TABLE, "")
    }

    /// Mark a nym as managed by this process
    pub fn save_local_nym(&self, id: &NymId) -> Result<(), SyncError> {
        self.put(LOCAL_NYMS_TABLE, id.as_str(), id)
    }

    pub fn list_local_nyms(&self) -> Result<Vec<NymId>, SyncError> {
        self.scan(LOCAL_NYMS_TABLE, "")
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Contract Operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_server_contract(&self, contract: &ServerContract) -> Result<(), SyncError> {
        self.put(SERVERS_TABLE, contract.id.as_str(), contract)
    }

    pub fn load_server_contract(&self, id: &ServerId) -> Result<Option<ServerContract>, SyncError> {
        self.get(SERVERS_TABLE, id.as_str())
    }

    pub fn list_server_contracts(&self) -> Result<Vec<ServerContract>, SyncError> {
        self.scan(SERVERS_TABLE, "")
    }

    pub fn save_unit_definition(&self, definition: &UnitDefinition) -> Result<(), SyncError> {
        self.put(UNITS_TABLE, definition.id.as_str(), definition)
    }

    pub fn load_unit_definition(&self, id: &UnitId) -> Result<Option<UnitDefinition>, SyncError> {
        self.get(UNITS_TABLE, id.as_str())
    }

    pub fn list_unit_definitions(&self) -> Result<Vec<UnitDefinition>, SyncError> {
        self.scan(UNITS_TABLE, "")
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Account Operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_account(&self, account: &AccountRecord) -> Result<(), SyncError> {
        self.put(ACCOUNTS_TABLE, account.id.as_str(), account)
    }

    pub fn load_account(&self, id: &AccountId) -> Result<Option<AccountRecord>, SyncError> {
        self.get(ACCOUNTS_TABLE, id.as_str())
    }

    pub fn list_accounts(&self) -> Result<Vec<AccountRecord>, SyncError> {
        self.scan(ACCOUNTS_TABLE, "")
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Consensus Operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_consensus(
        &self,
        context: &ContextId,
        state: &ConsensusState,
    ) -> Result<(), SyncError> {
        let record = ConsensusRecord {
            context: context.clone(),
            state: state.clone(),
        };
        self.put(CONSENSUS_TABLE, &context_key(context), &record)
    }

    pub fn load_consensus(&self, context: &ContextId) -> Result<Option<ConsensusState>, SyncError> {
        let record: Option<ConsensusRecord> = self.get(CONSENSUS_TABLE, &context_key(context))?;
        Ok(record.map(|r| r.state))
    }

    pub fn list_consensus(&self) -> Result<Vec<(ContextId, ConsensusState)>, SyncError> {
        let records: Vec<ConsensusRecord> = self.scan(CONSENSUS_TABLE, "")?;
        Ok(records.into_iter().map(|r| (r.context, r.state)).collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peer Request Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// File a peer request in one of a nym's boxes
    pub fn save_peer_request(
        &self,
        nym: &NymId,
        peer_box: PeerBox,
        request: &PeerRequest,
    ) -> Result<(), SyncError> {
        let key = format!("{}{}", box_prefix(nym, peer_box), request.id);
        self.put(PEER_REQUESTS_TABLE, &key, request)
    }

    pub fn load_peer_requests(
        &self,
        nym: &NymId,
        peer_box: PeerBox,
    ) -> Result<Vec<PeerRequest>, SyncError> {
        self.scan(PEER_REQUESTS_TABLE, &box_prefix(nym, peer_box))
    }

    /// Returns `true` if the request was present
    pub fn delete_peer_request(
        &self,
        nym: &NymId,
        peer_box: PeerBox,
        id: &str,
    ) -> Result<bool, SyncError> {
        let key = format!("{}{}", box_prefix(nym, peer_box), id);
        self.remove(PEER_REQUESTS_TABLE, &key)
    }

    pub fn save_peer_reply(
        &self,
        nym: &NymId,
        peer_box: PeerBox,
        reply: &PeerReply,
    ) -> Result<(), SyncError> {
        let key = format!("{}{}", box_prefix(nym, peer_box), reply.id);
        self.put(PEER_REPLIES_TABLE, &key, reply)
    }

    pub fn load_peer_replies(
        &self,
        nym: &NymId,
        peer_box: PeerBox,
    ) -> Result<Vec<PeerReply>, SyncError> {
        self.scan(PEER_REPLIES_TABLE, &box_prefix(nym, peer_box))
    }
}
