//! Instruments, transfers, cash and transaction numbers

use tracing::{debug, info};

use super::{delivered, HandlerResult, Worker};
use crate::error::{Precondition, TaskError};
use crate::operation::{OperationRequest, Reply};
use crate::repository::Repository;
use crate::task::Task;
use crate::types::{AccountId, Amount, ContextId, NymId, Payment, UnitId};

/// Pick the local account a payment of `unit` should land in.
///
/// Without an explicit account the context must hold exactly one account of
/// that unit. Missing or ambiguous accounts are preconditions; an explicit
/// account of another unit or context is a surfaced failure.
pub(crate) fn resolve_deposit_account(
    repository: &dyn Repository,
    context: &ContextId,
    unit: &UnitId,
    explicit: Option<&AccountId>,
) -> Result<AccountId, TaskError> {
    if let Some(id) = explicit {
        return match repository.account(id) {
            None => Err(TaskError::Precondition(Precondition::UnknownAccount(
                id.clone(),
            ))),
            Some(record) if record.context() != *context || record.unit != *unit => {
                Err(TaskError::Missing(Precondition::NoAccount(unit.clone())))
            }
            Some(record) => Ok(record.id),
        };
    }

    let mut matching: Vec<AccountId> = repository
        .accounts(context)
        .into_iter()
        .filter(|account| account.unit == *unit)
        .map(|account| account.id)
        .collect();
    match matching.len() {
        0 => Err(TaskError::Precondition(Precondition::NoAccount(unit.clone()))),
        1 => Ok(matching.remove(0)),
        _ => Err(TaskError::Precondition(Precondition::AmbiguousAccount(
            unit.clone(),
        ))),
    }
}

impl Worker {
    /// Take a transaction number, asking the endpoint for more when empty
    pub(super) fn reserve_number(&self) -> Result<u64, TaskError> {
        let mut consensus = self.repository.consensus(&self.context);
        match consensus.reserve_number() {
            Some(number) => {
                self.repository.store_consensus(&self.context, consensus);
                Ok(number)
            }
            None => {
                self.schedule(Task::GetTransactionNumbers);
                Err(TaskError::Precondition(Precondition::TransactionNumber))
            }
        }
    }

    pub(super) fn recover_number(&self, number: u64) {
        let mut consensus = self.repository.consensus(&self.context);
        consensus.recover_number(number);
        self.repository.store_consensus(&self.context, consensus);
        debug!(context = %self.context, number, "Transaction number recovered");
    }

    pub(super) async fn get_transaction_numbers(&self) -> HandlerResult {
        let reply = self.run(OperationRequest::GetTransactionNumbers).await?;
        if let Reply::TransactionNumbers(numbers) = reply {
            let count = numbers.len();
            let mut consensus = self.repository.consensus(&self.context);
            consensus.transaction_numbers.extend(numbers);
            self.repository.store_consensus(&self.context, consensus);
            debug!(context = %self.context, count, "Transaction numbers received");
        }
        Ok(None)
    }

    pub(super) async fn send_cheque(
        &self,
        account: &AccountId,
        recipient: &NymId,
        amount: Amount,
        memo: &str,
    ) -> HandlerResult {
        self.local_account(account)?;
        self.ensure_nym(recipient).await?;
        let number = self.reserve_number()?;

        let request = OperationRequest::SendCheque {
            account: account.clone(),
            recipient: recipient.clone(),
            amount,
            memo: memo.to_string(),
            transaction_number: number,
        };
        match self.run(request).await {
            Ok(reply) => {
                info!(context = %self.context, %account, %recipient, amount, "Cheque sent");
                Ok(delivered(reply))
            }
            Err(err) => {
                self.recover_number(number);
                Err(err)
            }
        }
    }

    pub(super) async fn deposit_payment(
        &self,
        account: Option<&AccountId>,
        payment: &Payment,
    ) -> HandlerResult {
        let account = resolve_deposit_account(
            self.repository.as_ref(),
            &self.context,
            &payment.unit,
            account,
        )?;

        let request = OperationRequest::DepositPayment {
            account: account.clone(),
            payment: payment.clone(),
        };
        self.run(request).await?;
        info!(context = %self.context, %account, payment = %payment.id, "Payment deposited");
        Ok(None)
    }

    pub(super) async fn send_transfer(
        &self,
        source: &AccountId,
        destination: &AccountId,
        amount: Amount,
        memo: &str,
    ) -> HandlerResult {
        self.local_account(source)?;
        let number = self.reserve_number()?;

        let request = OperationRequest::SendTransfer {
            source: source.clone(),
            destination: destination.clone(),
            amount,
            memo: memo.to_string(),
            transaction_number: number,
        };
        match self.run(request).await {
            Ok(_) => {
                info!(context = %self.context, %source, %destination, amount, "Transfer sent");
                Ok(None)
            }
            Err(err) => {
                self.recover_number(number);
                Err(err)
            }
        }
    }

    pub(super) async fn withdraw_cash(&self, account: &AccountId, amount: Amount) -> HandlerResult {
        let record = self.local_account(account)?;
        if !self.repository.has_mint(&self.context.server, &record.unit) {
            self.schedule(Task::DownloadMint {
                unit: record.unit.clone(),
            });
            return Err(TaskError::Precondition(Precondition::MissingMint(
                record.unit,
            )));
        }
        let number = self.reserve_number()?;

        let request = OperationRequest::WithdrawCash {
            account: account.clone(),
            amount,
            transaction_number: number,
        };
        match self.run(request).await {
            Ok(Reply::Purse(purse)) => {
                debug!(context = %self.context, %account, amount = purse.amount, "Cash withdrawn");
                self.repository.store_purse(&self.context, purse);
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(err) => {
                self.recover_number(number);
                Err(err)
            }
        }
    }

    pub(super) async fn download_mint(&self, unit: &UnitId) -> HandlerResult {
        self.run(OperationRequest::DownloadMint { unit: unit.clone() })
            .await?;
        self.repository.store_mint(&self.context.server, unit);
        debug!(context = %self.context, %unit, "Mint downloaded");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use crate::types::{AccountRecord, ServerId};

    fn account(id: &str, owner: &str, unit: &str) -> AccountRecord {
        AccountRecord {
            id: AccountId::new(id),
            owner: NymId::new(owner),
            server: ServerId::new("notary"),
            unit: UnitId::new(unit),
            label: String::new(),
            balance: 0,
        }
    }

    #[test]
    fn test_single_matching_account_is_chosen() {
        let repo = MemoryRepository::new();
        repo.store_account(account("a1", "alice", "gold"));
        repo.store_account(account("a2", "alice", "silver"));
        let context = ContextId::new("alice", "notary");

        let resolved =
            resolve_deposit_account(&repo, &context, &UnitId::new("gold"), None).unwrap();
        assert_eq!(resolved, AccountId::new("a1"));
    }

    #[test]
    fn test_missing_and_ambiguous_are_preconditions() {
        let repo = MemoryRepository::new();
        let context = ContextId::new("alice", "notary");
        let gold = UnitId::new("gold");

        assert_eq!(
            resolve_deposit_account(&repo, &context, &gold, None),
            Err(TaskError::Precondition(Precondition::NoAccount(gold.clone())))
        );

        repo.store_account(account("a1", "alice", "gold"));
        repo.store_account(account("a2", "alice", "gold"));
        assert_eq!(
            resolve_deposit_account(&repo, &context, &gold, None),
            Err(TaskError::Precondition(Precondition::AmbiguousAccount(
                gold.clone()
            )))
        );
        assert_eq!(
            resolve_deposit_account(&repo, &context, &gold, Some(&AccountId::new("a2"))),
            Ok(AccountId::new("a2"))
        );
    }

    #[test]
    fn test_explicit_account_of_other_unit_is_surfaced() {
        let repo = MemoryRepository::new();
        repo.store_account(account("a1", "alice", "silver"));
        let context = ContextId::new("alice", "notary");
        let gold = UnitId::new("gold");

        assert_eq!(
            resolve_deposit_account(&repo, &context, &gold, Some(&AccountId::new("a1"))),
            Err(TaskError::Missing(Precondition::NoAccount(gold)))
        );
    }
}
