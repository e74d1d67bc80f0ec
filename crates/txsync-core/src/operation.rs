//! Capability interface to the transport layer
//!
//! A worker never talks to the network itself. It hands an
//! [`OperationRequest`] to its [`Operation`] and awaits the
//! [`OperationResult`]. Every handler goes through [`run_operation`], which
//! owns the start-retry loop, the bounded resend policy and cancellation.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SyncConfig;
use crate::error::TaskError;
use crate::types::{
    AccountId, AccountRecord, Amount, ContextId, InboxItem, MessageId, NymId, NymRecord, Payment,
    PeerReply, PeerRequest, Purse, ServerContract, ServerId, UnitDefinition, UnitId,
};

/// One request/reply exchange with an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationRequest {
    RegisterNym {
        resync: bool,
    },
    CheckNym {
        nym: NymId,
    },
    DownloadContract {
        server: ServerId,
    },
    DownloadUnitDefinition {
        unit: UnitId,
    },
    DownloadNymbox,
    DownloadAccount {
        account: AccountId,
    },
    RegisterAccount {
        unit: UnitId,
        label: String,
    },
    IssueUnitDefinition {
        definition: UnitDefinition,
        label: String,
    },
    SendMessage {
        recipient: NymId,
        body: String,
    },
    ConveyPayment {
        recipient: NymId,
        payment: Payment,
    },
    SendCash {
        recipient: NymId,
        purse: Purse,
    },
    SendCheque {
        account: AccountId,
        recipient: NymId,
        amount: Amount,
        memo: String,
        transaction_number: u64,
    },
    DepositPayment {
        account: AccountId,
        payment: Payment,
    },
    SendTransfer {
        source: AccountId,
        destination: AccountId,
        amount: Amount,
        memo: String,
        transaction_number: u64,
    },
    ProcessInbox {
        account: AccountId,
        items: Vec<String>,
        transaction_number: u64,
    },
    PublishServerContract {
        contract: ServerContract,
    },
    PeerRequest {
        target: NymId,
        request: PeerRequest,
    },
    PeerReply {
        target: NymId,
        reply: PeerReply,
        request: PeerRequest,
    },
    GetTransactionNumbers,
    WithdrawCash {
        account: AccountId,
        amount: Amount,
        transaction_number: u64,
    },
    DownloadMint {
        unit: UnitId,
    },
    RequestAdmin {
        password: String,
    },
}

impl OperationRequest {
    pub fn name(&self) -> &'static str {
        match self {
            OperationRequest::RegisterNym { .. } => "register_nym",
            OperationRequest::CheckNym { .. } => "check_nym",
            OperationRequest::DownloadContract { .. } => "download_contract",
            OperationRequest::DownloadUnitDefinition { .. } => "download_unit_definition",
            OperationRequest::DownloadNymbox => "download_nymbox",
            OperationRequest::DownloadAccount { .. } => "download_account",
            OperationRequest::RegisterAccount { .. } => "register_account",
            OperationRequest::IssueUnitDefinition { .. } => "issue_unit_definition",
            OperationRequest::SendMessage { .. } => "send_message",
            OperationRequest::ConveyPayment { .. } => "convey_payment",
            OperationRequest::SendCash { .. } => "send_cash",
            OperationRequest::SendCheque { .. } => "send_cheque",
            OperationRequest::DepositPayment { .. } => "deposit_payment",
            OperationRequest::SendTransfer { .. } => "send_transfer",
            OperationRequest::ProcessInbox { .. } => "process_inbox",
            OperationRequest::PublishServerContract { .. } => "publish_server_contract",
            OperationRequest::PeerRequest { .. } => "peer_request",
            OperationRequest::PeerReply { .. } => "peer_reply",
            OperationRequest::GetTransactionNumbers => "get_transaction_numbers",
            OperationRequest::WithdrawCash { .. } => "withdraw_cash",
            OperationRequest::DownloadMint { .. } => "download_mint",
            OperationRequest::RequestAdmin { .. } => "request_admin",
        }
    }
}

/// Payload carried by a successful reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Success with nothing to report
    Empty,
    Registered {
        request_number: u64,
    },
    Nym(NymRecord),
    ServerContract(ServerContract),
    UnitDefinition(UnitDefinition),
    /// Peer traffic found in the nymbox
    Nymbox {
        requests: Vec<PeerRequest>,
        replies: Vec<PeerReply>,
    },
    Account {
        record: AccountRecord,
        inbox: Vec<InboxItem>,
    },
    /// Id the endpoint assigned to a delivered message or instrument
    Message(MessageId),
    TransactionNumbers(Vec<u64>),
    Purse(Purse),
    Admin {
        granted: bool,
    },
}

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// No reply arrived; safe to resend
    NotSent,
    /// The endpoint replied with a refusal
    RemoteRejected,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub status: OperationStatus,
    pub reply: Option<Reply>,
}

impl OperationResult {
    pub fn success(reply: Reply) -> Self {
        Self {
            status: OperationStatus::Success,
            reply: Some(reply),
        }
    }

    pub fn rejected() -> Self {
        Self {
            status: OperationStatus::RemoteRejected,
            reply: None,
        }
    }

    pub fn not_sent() -> Self {
        Self {
            status: OperationStatus::NotSent,
            reply: None,
        }
    }
}

/// A single in-flight exchange slot bound to one context
pub trait Operation: Send + Sync {
    /// Begin an exchange. Returns `false` while a previous exchange is busy.
    fn start(&self, request: &OperationRequest) -> bool;

    /// Resolves when the exchange begun by [`Operation::start`] completes
    fn wait(&self) -> BoxFuture<'_, OperationResult>;

    /// Abandon the current exchange
    fn cancel(&self) {}
}

/// Source of [`Operation`]s, one per context
pub trait Transport: Send + Sync {
    fn operation(&self, context: &ContextId) -> Arc<dyn Operation>;
}

/// Drive one request to a terminal result.
///
/// Starting is retried every `start_retry_ms` until `start_timeout_ms` after
/// the attempt began. A `NotSent` result is resent up to
/// `max_send_attempts` times in total. Cancellation aborts the exchange and
/// yields [`TaskError::Shutdown`].
pub async fn run_operation(
    operation: &dyn Operation,
    request: OperationRequest,
    config: &SyncConfig,
    cancel: &CancellationToken,
) -> Result<Reply, TaskError> {
    let name = request.name();
    let attempts = config.max_send_attempts.max(1);

    for attempt in 1..=attempts {
        let deadline = Instant::now() + config.start_timeout();
        let mut started = false;
        loop {
            if cancel.is_cancelled() {
                return Err(TaskError::Shutdown);
            }
            if operation.start(&request) {
                started = true;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Shutdown),
                _ = tokio::time::sleep(config.start_retry()) => {}
            }
        }

        if !started {
            warn!(operation = name, attempt, "Operation busy past deadline");
            continue;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                operation.cancel();
                return Err(TaskError::Shutdown);
            }
            result = operation.wait() => result,
        };

        match result.status {
            OperationStatus::Success => {
                trace!(operation = name, attempt, "Operation succeeded");
                return Ok(result.reply.unwrap_or(Reply::Empty));
            }
            OperationStatus::RemoteRejected => {
                debug!(operation = name, attempt, "Operation rejected by endpoint");
                return Err(TaskError::Rejected { operation: name });
            }
            OperationStatus::NotSent => {
                debug!(operation = name, attempt, "No reply, resending");
            }
        }
    }

    warn!(operation = name, attempts, "Operation failed after all attempts");
    Err(TaskError::Transport { attempts })
}
