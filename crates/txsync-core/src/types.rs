//! Core identifiers and records shared by the workers, the repository and storage

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an opaque identifier string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True if the identifier is blank
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a local or remote identity (nym)
    NymId,
    "nym"
);
string_id!(
    /// Identifier of a remote transaction-processing endpoint
    ServerId,
    "server"
);
string_id!(
    /// Identifier of an asset type (unit definition)
    UnitId,
    "unit"
);
string_id!(
    /// Identifier of an account held at an endpoint
    AccountId,
    "account"
);
string_id!(
    /// Identifier the endpoint assigns to a delivered message
    MessageId,
    "msg"
);

/// Unique identifier for a submitted task
///
/// Uses ULID for time-ordered unique identifiers. The nil ULID is reserved as
/// the sentinel returned when a submission is rejected or deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Ulid);

impl TaskId {
    /// Create a new TaskId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// The sentinel id: never assigned to a queued task
    pub const fn invalid() -> Self {
        Self(Ulid::nil())
    }

    /// False for the sentinel id
    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

/// The relationship between one local nym and one remote endpoint.
///
/// Exactly one worker exists per context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId {
    /// Local identity
    pub nym: NymId,
    /// Remote endpoint
    pub server: ServerId,
}

impl ContextId {
    pub fn new(nym: impl Into<NymId>, server: impl Into<ServerId>) -> Self {
        Self {
            nym: nym.into(),
            server: server.into(),
        }
    }

    /// Both halves must be non-empty for a worker to be spawned
    pub fn is_valid(&self) -> bool {
        !self.nym.is_empty() && !self.server.is_empty()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.nym.as_str(), self.server.as_str())
    }
}

/// Signed amount in the smallest unit of an asset type
pub type Amount = i64;

/// Published credentials of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NymRecord {
    pub id: NymId,
    /// Display name published by the identity
    pub name: String,
    /// Credential revision; bumps whenever the identity republishes
    pub revision: u64,
}

/// Contract describing a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContract {
    pub id: ServerId,
    /// The endpoint's own signing identity
    pub nym: NymId,
    /// Name last seen for the endpoint
    pub name: String,
}

/// Contract describing an asset type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub id: UnitId,
    pub issuer: NymId,
    pub name: String,
    pub symbol: String,
}

/// An account held by a local nym at an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub owner: NymId,
    pub server: ServerId,
    pub unit: UnitId,
    pub label: String,
    pub balance: Amount,
}

impl AccountRecord {
    /// The context this account is maintained through
    pub fn context(&self) -> ContextId {
        ContextId {
            nym: self.owner.clone(),
            server: self.server.clone(),
        }
    }
}

/// A pending entry in an account's inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: String,
    pub amount: Amount,
    pub memo: String,
}

/// Kind of a bearer-style payment instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentKind {
    Cheque,
    Voucher,
    Invoice,
}

/// A payment instrument exchanged between identities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub kind: PaymentKind,
    pub unit: UnitId,
    pub amount: Amount,
    pub memo: String,
}

/// Container of cash tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purse {
    pub unit: UnitId,
    pub amount: Amount,
    pub tokens: Vec<Vec<u8>>,
}

/// What a peer request asks the recipient for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRequestKind {
    Bailment,
    OutBailment,
    PendingBailment,
    ConnectionInfo,
    StoreSecret,
    VerificationOffer,
}

/// A request sent from one identity to another through an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub id: String,
    pub initiator: NymId,
    pub recipient: NymId,
    pub kind: PeerRequestKind,
    pub body: String,
}

/// An answer to a previously received peer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReply {
    pub id: String,
    /// Id of the request being answered
    pub request: String,
    pub body: String,
}

/// Persisted relationship state between one nym and one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    /// Zero until the nym has completed registration with the endpoint
    pub request_number: u64,
    /// Transaction numbers issued by the endpoint and not yet consumed
    pub transaction_numbers: BTreeSet<u64>,
    /// Whether the nym holds admin rights on the endpoint
    pub admin: bool,
    /// Nym revision last published to the endpoint
    pub published_revision: u64,
}

impl ConsensusState {
    /// True once the endpoint has accepted a registration
    pub fn is_registered(&self) -> bool {
        self.request_number > 0
    }

    /// Number of transaction numbers available for new ledger operations
    pub fn available_numbers(&self) -> usize {
        self.transaction_numbers.len()
    }

    /// Take the lowest available transaction number
    pub fn reserve_number(&mut self) -> Option<u64> {
        self.transaction_numbers.pop_first()
    }

    /// Return a reserved number that was never consumed by the endpoint
    pub fn recover_number(&mut self, number: u64) {
        self.transaction_numbers.insert(number);
    }
}
