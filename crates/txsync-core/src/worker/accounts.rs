//! Registration, nymbox and account maintenance

use tracing::{debug, info};

use super::{HandlerResult, Worker};
use crate::error::{Precondition, TaskError};
use crate::operation::{OperationRequest, Reply};
use crate::storage::PeerBox;
use crate::task::Task;
use crate::types::{AccountId, AccountRecord, InboxItem, UnitDefinition, UnitId};

impl Worker {
    /// Register the nym and record the endpoint's request counter
    pub(super) async fn register(&self, resync: bool) -> Result<(), TaskError> {
        let reply = self.run(OperationRequest::RegisterNym { resync }).await?;
        let Reply::Registered { request_number } = reply else {
            return Err(TaskError::Rejected {
                operation: "register_nym",
            });
        };

        let mut consensus = self.repository.consensus(&self.context);
        consensus.request_number = consensus.request_number.max(request_number).max(1);
        if let Some(nym) = self.repository.nym(&self.context.nym) {
            consensus.published_revision = nym.revision;
        }
        self.repository.store_consensus(&self.context, consensus);
        debug!(context = %self.context, resync, "Nym registered");
        Ok(())
    }

    pub(super) async fn register_nym(&self, resync: bool) -> HandlerResult {
        self.register(resync).await.map(|_| None)
    }

    pub(super) async fn download_nymbox(&self) -> HandlerResult {
        let reply = self.run(OperationRequest::DownloadNymbox).await?;
        let Reply::Nymbox { requests, replies } = reply else {
            return Ok(None);
        };

        let nym = &self.context.nym;
        for request in requests {
            debug!(context = %self.context, request = %request.id, "Peer request received");
            self.repository
                .store_peer_request(nym, PeerBox::Incoming, request);
        }
        for reply in replies {
            self.repository
                .move_peer_request(nym, &reply.request, PeerBox::Sent, PeerBox::Finished);
            self.repository.store_peer_reply(nym, PeerBox::Incoming, reply);
        }
        Ok(None)
    }

    pub(super) async fn register_account(&self, unit: &UnitId, label: &str) -> HandlerResult {
        self.ensure_unit(unit).await?;

        let request = OperationRequest::RegisterAccount {
            unit: unit.clone(),
            label: label.to_string(),
        };
        let Reply::Account { record, inbox } = self.run(request).await? else {
            return Err(TaskError::Rejected {
                operation: "register_account",
            });
        };

        info!(context = %self.context, account = %record.id, %unit, "Account registered");
        self.store_account(record, inbox);
        Ok(None)
    }

    pub(super) async fn issue_unit_definition(
        &self,
        definition: &UnitDefinition,
        label: &str,
        advertise: bool,
    ) -> HandlerResult {
        let request = OperationRequest::IssueUnitDefinition {
            definition: definition.clone(),
            label: label.to_string(),
        };
        let Reply::Account { record, inbox } = self.run(request).await? else {
            return Err(TaskError::Rejected {
                operation: "issue_unit_definition",
            });
        };

        self.repository.store_unit_definition(definition.clone());
        self.store_account(record, inbox);
        if advertise {
            self.repository.add_claim(&self.context.nym, &definition.id);
        }
        info!(context = %self.context, unit = %definition.id, advertise, "Unit definition issued");
        Ok(None)
    }

    pub(super) async fn download_account(&self, account: &AccountId) -> HandlerResult {
        self.local_account(account)?;

        let request = OperationRequest::DownloadAccount {
            account: account.clone(),
        };
        let Reply::Account { record, inbox } = self.run(request).await? else {
            return Err(TaskError::Rejected {
                operation: "download_account",
            });
        };

        if !inbox.is_empty() {
            self.schedule(Task::ProcessInbox {
                account: account.clone(),
            });
        }
        self.store_account(record, inbox);
        Ok(None)
    }

    /// Accept up to one batch of inbox entries.
    ///
    /// The transaction number is recovered if every attempt fails.
    pub(super) async fn process_inbox(&self, account: &AccountId) -> HandlerResult {
        let record = self.local_account(account)?;
        let inbox = self.repository.inbox(account);
        if inbox.is_empty() {
            return Ok(None);
        }

        let batch: Vec<InboxItem> = inbox
            .into_iter()
            .take(self.config.inbox_batch_limit)
            .collect();
        let items: Vec<String> = batch.iter().map(|item| item.id.clone()).collect();
        let balance = batch
            .iter()
            .try_fold(record.balance, |total, item| total.checked_add(item.amount))
            .ok_or_else(|| TaskError::BalanceOverflow(account.clone()))?;
        let number = self.reserve_number()?;

        let mut last = TaskError::Transport { attempts: 0 };
        for attempt in 1..=self.config.inbox_retries {
            let request = OperationRequest::ProcessInbox {
                account: account.clone(),
                items: items.clone(),
                transaction_number: number,
            };
            match self.run(request).await {
                Ok(_) => {
                    let remaining: Vec<InboxItem> = self
                        .repository
                        .inbox(account)
                        .into_iter()
                        .filter(|item| !items.contains(&item.id))
                        .collect();
                    let more = !remaining.is_empty();

                    self.repository.store_inbox(account, remaining);
                    self.repository.store_account(AccountRecord {
                        balance,
                        ..record
                    });
                    debug!(
                        context = %self.context,
                        %account,
                        accepted = items.len(),
                        more,
                        "Inbox processed"
                    );
                    if more {
                        self.schedule(Task::ProcessInbox {
                            account: account.clone(),
                        });
                    }
                    return Ok(None);
                }
                Err(TaskError::Shutdown) => {
                    self.recover_number(number);
                    return Err(TaskError::Shutdown);
                }
                Err(err) => {
                    debug!(context = %self.context, %account, attempt, error = %err, "Inbox attempt failed");
                    last = err;
                }
            }
        }

        self.recover_number(number);
        Err(last)
    }

    /// Account owned by this context, or a surfaced failure
    pub(super) fn local_account(&self, account: &AccountId) -> Result<AccountRecord, TaskError> {
        match self.repository.account(account) {
            Some(record) if record.context() == self.context => Ok(record),
            _ => Err(TaskError::Missing(Precondition::UnknownAccount(
                account.clone(),
            ))),
        }
    }

    fn store_account(&self, record: AccountRecord, inbox: Vec<InboxItem>) {
        let id = record.id.clone();
        self.repository.store_account(record);
        self.repository.store_inbox(&id, inbox);
    }

    /// Ask for admin rights when a password is configured for this endpoint
    pub(super) async fn request_admin(&self) {
        let Some(password) = self.config.admin_password(&self.context.server) else {
            return;
        };
        if self.repository.consensus(&self.context).admin {
            return;
        }

        let request = OperationRequest::RequestAdmin {
            password: password.to_string(),
        };
        match self.run(request).await {
            Ok(Reply::Admin { granted: true }) => {
                let mut consensus = self.repository.consensus(&self.context);
                consensus.admin = true;
                self.repository.store_consensus(&self.context, consensus);
                info!(context = %self.context, "Admin rights granted");
            }
            Ok(_) => debug!(context = %self.context, "Admin request not granted"),
            Err(err) => debug!(context = %self.context, error = %err, "Admin request failed"),
        }
    }

    /// Republish credentials the endpoint has an older revision of
    pub(super) fn check_revision(&self) {
        let Some(nym) = self.repository.nym(&self.context.nym) else {
            return;
        };
        let published = self.repository.consensus(&self.context).published_revision;
        if nym.revision > published {
            debug!(
                context = %self.context,
                revision = nym.revision,
                published,
                "Nym revision is newer than published"
            );
            self.schedule(Task::RegisterNym { resync: true });
        }
    }

    /// Fetch transaction numbers when accounts exist but none are left.
    ///
    /// Returns `true` if a number request was queued.
    pub(super) fn replenish_numbers(&self) -> bool {
        if self.repository.accounts(&self.context).is_empty()
            || self.repository.consensus(&self.context).available_numbers() > 0
        {
            return false;
        }
        let scheduled = self.schedule(Task::GetTransactionNumbers);
        if scheduled {
            debug!(context = %self.context, "Replenishing transaction numbers");
        }
        scheduled
    }
}
