//! Task payloads accepted by a context worker
//!
//! Every variant carries only what its handler needs. Tasks are immutable once
//! queued; two tasks with equal payloads are the same unit of work and are
//! deduplicated by the per-kind queue.

use serde::{Deserialize, Serialize};

use crate::types::{
    AccountId, Amount, NymId, Payment, PeerReply, PeerRequest, Purse, ServerId, UnitDefinition,
    UnitId,
};

/// A unit of work submitted against one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    /// Register (or re-register) the local nym with the endpoint
    RegisterNym { resync: bool },
    /// Download a nym's published credentials
    CheckNym { nym: NymId },
    /// Download an endpoint contract
    DownloadContract { server: ServerId },
    /// Download an asset type contract
    DownloadUnitDefinition { unit: UnitId },
    /// Fetch the nym's inbound message box
    DownloadNymbox,
    /// Refresh an account record and its inbox
    DownloadAccount { account: AccountId },
    /// Open a new account for an asset type
    RegisterAccount { unit: UnitId, label: String },
    /// Publish a new asset type and receive its issuer account
    IssueUnitDefinition {
        definition: UnitDefinition,
        label: String,
        /// Record the issued unit as a tradable claim on the nym
        advertise: bool,
    },
    SendMessage { recipient: NymId, body: String },
    ConveyPayment { recipient: NymId, payment: Payment },
    SendCash { recipient: NymId, purse: Purse },
    SendCheque {
        account: AccountId,
        recipient: NymId,
        amount: Amount,
        memo: String,
    },
    DepositPayment {
        /// Explicit destination; resolved from the payment's unit when absent
        account: Option<AccountId>,
        payment: Payment,
    },
    SendTransfer {
        source: AccountId,
        destination: AccountId,
        amount: Amount,
        memo: String,
    },
    /// Accept pending inbox entries of an account
    ProcessInbox { account: AccountId },
    /// Publish a locally known endpoint contract to this endpoint
    PublishServerContract { server: ServerId },
    PeerRequest { target: NymId, request: PeerRequest },
    PeerReply {
        target: NymId,
        reply: PeerReply,
        request: PeerRequest,
    },
    GetTransactionNumbers,
    WithdrawCash { account: AccountId, amount: Amount },
    DownloadMint { unit: UnitId },
}

/// Discriminant of [`Task`], one queue per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    RegisterNym,
    CheckNym,
    DownloadContract,
    DownloadUnitDefinition,
    DownloadNymbox,
    DownloadAccount,
    RegisterAccount,
    IssueUnitDefinition,
    SendMessage,
    ConveyPayment,
    SendCash,
    SendCheque,
    DepositPayment,
    SendTransfer,
    ProcessInbox,
    PublishServerContract,
    PeerRequest,
    PeerReply,
    GetTransactionNumbers,
    WithdrawCash,
    DownloadMint,
}

impl TaskKind {
    /// Every kind, in the order queues are drained within one cycle.
    ///
    /// Prerequisites come first: registration and discovery, then contract
    /// downloads, messaging, transaction-number maintenance, payments and
    /// finally account maintenance.
    pub const CYCLE_ORDER: [TaskKind; 21] = [
        TaskKind::RegisterNym,
        TaskKind::CheckNym,
        TaskKind::DownloadContract,
        TaskKind::DownloadUnitDefinition,
        TaskKind::DownloadMint,
        TaskKind::PublishServerContract,
        TaskKind::IssueUnitDefinition,
        TaskKind::DownloadNymbox,
        TaskKind::SendMessage,
        TaskKind::ConveyPayment,
        TaskKind::PeerRequest,
        TaskKind::PeerReply,
        TaskKind::GetTransactionNumbers,
        TaskKind::SendCheque,
        TaskKind::SendCash,
        TaskKind::WithdrawCash,
        TaskKind::SendTransfer,
        TaskKind::DepositPayment,
        TaskKind::RegisterAccount,
        TaskKind::DownloadAccount,
        TaskKind::ProcessInbox,
    ];

    pub const COUNT: usize = Self::CYCLE_ORDER.len();

    /// Stable slot of this kind in a queue bundle
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::RegisterNym => "register_nym",
            TaskKind::CheckNym => "check_nym",
            TaskKind::DownloadContract => "download_contract",
            TaskKind::DownloadUnitDefinition => "download_unit_definition",
            TaskKind::DownloadNymbox => "download_nymbox",
            TaskKind::DownloadAccount => "download_account",
            TaskKind::RegisterAccount => "register_account",
            TaskKind::IssueUnitDefinition => "issue_unit_definition",
            TaskKind::SendMessage => "send_message",
            TaskKind::ConveyPayment => "convey_payment",
            TaskKind::SendCash => "send_cash",
            TaskKind::SendCheque => "send_cheque",
            TaskKind::DepositPayment => "deposit_payment",
            TaskKind::SendTransfer => "send_transfer",
            TaskKind::ProcessInbox => "process_inbox",
            TaskKind::PublishServerContract => "publish_server_contract",
            TaskKind::PeerRequest => "peer_request",
            TaskKind::PeerReply => "peer_reply",
            TaskKind::GetTransactionNumbers => "get_transaction_numbers",
            TaskKind::WithdrawCash => "withdraw_cash",
            TaskKind::DownloadMint => "download_mint",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::RegisterNym { .. } => TaskKind::RegisterNym,
            Task::CheckNym { .. } => TaskKind::CheckNym,
            Task::DownloadContract { .. } => TaskKind::DownloadContract,
            Task::DownloadUnitDefinition { .. } => TaskKind::DownloadUnitDefinition,
            Task::DownloadNymbox => TaskKind::DownloadNymbox,
            Task::DownloadAccount { .. } => TaskKind::DownloadAccount,
            Task::RegisterAccount { .. } => TaskKind::RegisterAccount,
            Task::IssueUnitDefinition { .. } => TaskKind::IssueUnitDefinition,
            Task::SendMessage { .. } => TaskKind::SendMessage,
            Task::ConveyPayment { .. } => TaskKind::ConveyPayment,
            Task::SendCash { .. } => TaskKind::SendCash,
            Task::SendCheque { .. } => TaskKind::SendCheque,
            Task::DepositPayment { .. } => TaskKind::DepositPayment,
            Task::SendTransfer { .. } => TaskKind::SendTransfer,
            Task::ProcessInbox { .. } => TaskKind::ProcessInbox,
            Task::PublishServerContract { .. } => TaskKind::PublishServerContract,
            Task::PeerRequest { .. } => TaskKind::PeerRequest,
            Task::PeerReply { .. } => TaskKind::PeerReply,
            Task::GetTransactionNumbers => TaskKind::GetTransactionNumbers,
            Task::WithdrawCash { .. } => TaskKind::WithdrawCash,
            Task::DownloadMint { .. } => TaskKind::DownloadMint,
        }
    }

    /// Reject payloads with blank identifiers.
    ///
    /// Returns a description of the first blank field found.
    pub fn validate(&self) -> Result<(), String> {
        fn require(blank: bool, field: &str) -> Result<(), String> {
            if blank {
                Err(format!("{field} must not be empty"))
            } else {
                Ok(())
            }
        }

        match self {
            Task::RegisterNym { .. } | Task::DownloadNymbox | Task::GetTransactionNumbers => Ok(()),
            Task::CheckNym { nym } => require(nym.is_empty(), "nym"),
            Task::DownloadContract { server } | Task::PublishServerContract { server } => {
                require(server.is_empty(), "server")
            }
            Task::DownloadUnitDefinition { unit } | Task::DownloadMint { unit } => {
                require(unit.is_empty(), "unit")
            }
            Task::DownloadAccount { account } | Task::ProcessInbox { account } => {
                require(account.is_empty(), "account")
            }
            Task::RegisterAccount { unit, .. } => require(unit.is_empty(), "unit"),
            Task::IssueUnitDefinition { definition, .. } => {
                require(definition.id.is_empty(), "definition.id")
            }
            Task::SendMessage { recipient, .. }
            | Task::ConveyPayment { recipient, .. }
            | Task::SendCash { recipient, .. } => require(recipient.is_empty(), "recipient"),
            Task::SendCheque {
                account, recipient, ..
            } => {
                require(account.is_empty(), "account")?;
                require(recipient.is_empty(), "recipient")
            }
            Task::DepositPayment { account, payment } => {
                require(account.as_ref().is_some_and(|a| a.is_empty()), "account")?;
                require(payment.unit.is_empty(), "payment.unit")
            }
            Task::SendTransfer {
                source,
                destination,
                ..
            } => {
                require(source.is_empty(), "source")?;
                require(destination.is_empty(), "destination")
            }
            Task::PeerRequest { target, .. } | Task::PeerReply { target, .. } => {
                require(target.is_empty(), "target")
            }
            Task::WithdrawCash { account, .. } => require(account.is_empty(), "account"),
        }
    }
}
