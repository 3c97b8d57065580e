//! Durable per-subject credit accounting.
//!
//! Backed by a single-file embedded store opened exclusively at process
//! start. Balances live in the `credits` table keyed by subject; top-up
//! idempotency is tracked in the `tokens` table keyed by
//! `{subject}/{token_id}`, mapping to the token's expiry. A given token id
//! adds to a subject's balance at most once over the lifetime of the
//! account, no matter how many times it is presented.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;

use crate::error::LedgerError;

/// Balance per subject.
const CREDITS: TableDefinition<&str, i64> = TableDefinition::new("credits");

/// Seen token ids, keyed `{subject}/{token_id}` -> expiry unix.
const TOKENS: TableDefinition<&str, u64> = TableDefinition::new("tokens");

/// Read-only view of an account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    #[serde(rename = "Credits")]
    pub credits: i64,
}

/// Handle to the credit ledger. Cheap to clone; all mutations serialize
/// through the store's single writer.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
}

impl Ledger {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let db = Database::create(path)?;
        // Create both tables up front so readers never race table creation.
        let txn = db.begin_write()?;
        {
            txn.open_table(CREDITS)?;
            txn.open_table(TOKENS)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Credit the subject's balance from a token grant, at most once per
    /// token id. Presenting the same token again is a no-op.
    pub fn top_up(
        &self,
        subject: &str,
        token_id: &str,
        expiry: u64,
        credits: i64,
    ) -> Result<(), LedgerError> {
        let txn = self.db.begin_write()?;
        {
            let mut tokens = txn.open_table(TOKENS)?;
            let key = format!("{subject}/{token_id}");
            let seen = tokens.get(key.as_str())?.is_some();
            if !seen {
                tokens.insert(key.as_str(), expiry)?;
                let mut balances = txn.open_table(CREDITS)?;
                let balance = balances.get(subject)?.map(|g| g.value()).unwrap_or(0);
                balances.insert(subject, balance + credits)?;
                tracing::info!(subject, token = token_id, credits, "Topped up account");
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Current balance for the subject; 0 when the subject is unknown.
    pub fn credits(&self, subject: &str) -> Result<i64, LedgerError> {
        let txn = self.db.begin_read()?;
        let balances = txn.open_table(CREDITS)?;
        Ok(balances.get(subject)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Debit the subject's balance. Refused with `NoCredits` when the
    /// balance is already at or below zero; a single debit may take the
    /// balance negative, which makes the *next* debit fail.
    pub fn record(&self, subject: &str, credits: i64) -> Result<(), LedgerError> {
        let txn = self.db.begin_write()?;
        {
            let mut balances = txn.open_table(CREDITS)?;
            let balance = balances.get(subject)?.map(|g| g.value()).unwrap_or(0);
            if balance <= 0 {
                return Err(LedgerError::NoCredits {
                    subject: subject.to_string(),
                });
            }
            balances.insert(subject, balance - credits)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Convenience read of the subject's account.
    pub fn inspect(&self, subject: &str) -> Result<AccountStatus, LedgerError> {
        Ok(AccountStatus {
            credits: self.credits(subject)?,
        })
    }
}
