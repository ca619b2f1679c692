//! Funds transfer between two accounts.

use tracing::{info, instrument};

use bank_core::{Account, AccountId, Currency, Entry, LedgerError, LedgerResult, Transfer};

use crate::executor::Store;
use crate::queries::{CreateEntryParams, CreateTransferParams, Database, Queries};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Minor units; must be positive.
    pub amount: i64,
    /// When set, both accounts must hold this currency.
    pub currency: Option<Currency>,
}

impl TransferTxParams {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
            currency: None,
        }
    }

    pub fn in_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

impl<D: Database> Store<D> {
    /// Move `amount` from one account to the other.
    ///
    /// Creates the transfer record and one entry per side, then updates both
    /// balances. The whole operation is one atomic scope, re-run on retryable
    /// backend conflicts.
    #[instrument(
        skip(self),
        fields(
            from = %arg.from_account_id,
            to = %arg.to_account_id,
            amount = arg.amount
        ),
        err
    )]
    pub async fn transfer_tx(&self, arg: TransferTxParams) -> LedgerResult<TransferTxResult> {
        if arg.amount <= 0 {
            return Err(LedgerError::invalid_input(format!(
                "transfer amount must be positive, got {}",
                arg.amount
            )));
        }
        if arg.from_account_id == arg.to_account_id {
            return Err(LedgerError::invalid_input(
                "cannot transfer from an account to itself",
            ));
        }

        let result = self
            .exec_tx_with_retry(move |q| Box::pin(transfer(q, arg)))
            .await?;

        info!(
            transfer_id = %result.transfer.id,
            from_balance = result.from_account.balance,
            to_balance = result.to_account.balance,
            "transfer committed"
        );
        Ok(result)
    }
}

async fn transfer(q: &mut dyn Queries, arg: TransferTxParams) -> LedgerResult<TransferTxResult> {
    let from = q.get_account(arg.from_account_id).await?;
    let to = q.get_account(arg.to_account_id).await?;

    if from.currency != to.currency {
        return Err(LedgerError::invalid_input(format!(
            "currency mismatch: account {} is {}, account {} is {}",
            from.id, from.currency, to.id, to.currency
        )));
    }
    if let Some(expected) = arg.currency {
        if from.currency != expected {
            return Err(LedgerError::invalid_input(format!(
                "currency mismatch: accounts are {}, request is {}",
                from.currency, expected
            )));
        }
    }

    let transfer = q
        .create_transfer(CreateTransferParams {
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let from_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.from_account_id,
            amount: -arg.amount,
        })
        .await?;

    let to_entry = q
        .create_entry(CreateEntryParams {
            account_id: arg.to_account_id,
            amount: arg.amount,
        })
        .await?;

    let (from_account, to_account) = if arg.from_account_id < arg.to_account_id {
        add_money(q, arg.from_account_id, -arg.amount, arg.to_account_id, arg.amount).await?
    } else {
        let (to_account, from_account) =
            add_money(q, arg.to_account_id, arg.amount, arg.from_account_id, -arg.amount).await?;
        (from_account, to_account)
    };

    if from_account.balance < 0 {
        return Err(LedgerError::invalid_input(format!(
            "insufficient funds in account {}",
            from_account.id
        )));
    }

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Apply two balance changes, locking `account_id1` before `account_id2`.
///
/// LOCK ORDER: callers must pass the lower account id first. Every scope that
/// mutates two accounts takes their row locks in ascending id order, so two
/// transfers over the same pair (in either direction) queue on the lower id
/// instead of each holding one lock and waiting on the other.
async fn add_money(
    q: &mut dyn Queries,
    account_id1: AccountId,
    amount1: i64,
    account_id2: AccountId,
    amount2: i64,
) -> LedgerResult<(Account, Account)> {
    debug_assert!(account_id1 < account_id2);
    let account1 = q.add_account_balance(account_id1, amount1).await?;
    let account2 = q.add_account_balance(account_id2, amount2).await?;
    Ok((account1, account2))
}
