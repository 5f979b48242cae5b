//! The transaction engine.
//!
//! Every balance change runs inside one storage transaction:
//!
//! 1. read `{balance, version}` for the (user, currency) pair, creating the
//!    row at zero if it does not exist yet
//! 2. compute the new balance and check solvency and the currency cap
//! 3. update the row predicated on the version read in step 1
//! 4. append the log entry
//!
//! A conditional update that touches no rows means another writer got
//! there first; the caller sees [`LedgerError::ConcurrentModification`]
//! and may retry. SQLite lock contention surfaces as the same error kind.

use std::time::Duration;

use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Balance, Currency, LeaderboardEntry, Receipt, Transaction, TransactionRequest, TransactionType,
    TransferReceipt, TransferRequest,
};
use crate::schema;

pub(crate) const TRANSACTION_COLUMNS: &str = "seq, id, user_id, currency_id, amount, \
    balance_before, balance_after, transaction_type, source, source_id, description, metadata, \
    created_at, created_by, rollback_of";

/// `source` stamped on reversal entries.
pub const ROLLBACK_SOURCE: &str = "admin_rollback";

/// Handle to the ledger tables. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply one credit or debit.
    pub async fn process_transaction(&self, request: TransactionRequest) -> LedgerResult<Receipt> {
        request.validate()?;

        let mut tx = self.pool.begin().await?;
        let receipt = apply(&mut tx, &request, None).await?;
        tx.commit().await?;

        tracing::debug!(
            transaction = %receipt.transaction_id,
            user = request.user_id,
            currency = %request.currency_id,
            amount = request.amount,
            kind = %request.transaction_type,
            "transaction committed"
        );
        Ok(receipt)
    }

    /// [`Ledger::process_transaction`], retried while the failure is a
    /// concurrent modification.
    pub async fn process_with_retry(
        &self,
        request: TransactionRequest,
        max_attempts: u32,
    ) -> LedgerResult<Receipt> {
        let mut attempt = 1;
        loop {
            match self.process_transaction(request.clone()).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::debug!(attempt, error = %e, "retrying transaction");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Append a reversal of `transaction_id`.
    ///
    /// The reversal passes the same solvency check as any debit, and is
    /// stamped `rollback_of` inside the same storage transaction. The UNIQUE
    /// index on `rollback_of` stops a racing second rollback from committing.
    pub async fn rollback(
        &self,
        transaction_id: &str,
        actor: Option<&str>,
        reason: &str,
    ) -> LedgerResult<Transaction> {
        if reason.trim().is_empty() {
            return Err(LedgerError::validation("reason", "must not be empty"));
        }

        let mut tx = self.pool.begin().await?;

        let original = fetch_transaction(&mut tx, transaction_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("transaction", transaction_id))?;
        if original.transaction_type == TransactionType::Rollback {
            return Err(LedgerError::NotReversible {
                id: original.id,
                reason: "rollback entries are final".to_string(),
            });
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM economy_transactions WHERE rollback_of = ?")
                .bind(&original.id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(LedgerError::AlreadyRolledBack(original.id));
        }

        let amount = original.amount.checked_neg().ok_or_else(|| LedgerError::NotReversible {
            id: original.id.clone(),
            reason: "amount cannot be negated".to_string(),
        })?;
        let request = TransactionRequest {
            user_id: original.user_id,
            currency_id: original.currency_id.clone(),
            amount,
            transaction_type: TransactionType::Rollback,
            source: ROLLBACK_SOURCE.to_string(),
            source_id: Some(original.id.clone()),
            description: Some(reason.to_string()),
            metadata: None,
            created_by: actor.map(str::to_string),
        };
        let receipt = apply(&mut tx, &request, Some(&original.id)).await?;
        let reversal = fetch_transaction(&mut tx, &receipt.transaction_id)
            .await?
            .ok_or_else(|| LedgerError::Internal("reversal vanished before commit".to_string()))?;
        tx.commit().await?;

        tracing::info!(
            transaction = %original.id,
            reversal = %reversal.id,
            actor = actor.unwrap_or("system"),
            "transaction rolled back"
        );
        Ok(reversal)
    }

    /// Debit the sender and credit the receiver atomically.
    pub async fn transfer(&self, request: TransferRequest) -> LedgerResult<TransferReceipt> {
        request.validate()?;

        let mut tx = self.pool.begin().await?;

        let currency = Currency::find(&mut *tx, &request.currency_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("currency", &request.currency_id))?;
        if !currency.transferable {
            return Err(LedgerError::validation(
                "currency_id",
                format!("{} is not transferable", currency.id),
            ));
        }

        let transfer_id = Uuid::new_v4().to_string();
        let leg = |user_id: i64, amount: i64, counterparty: i64| TransactionRequest {
            user_id,
            currency_id: request.currency_id.clone(),
            amount,
            transaction_type: TransactionType::Transfer,
            source: "transfer".to_string(),
            source_id: Some(transfer_id.clone()),
            description: request.description.clone(),
            metadata: Some(json!({ "counterparty": counterparty })),
            created_by: request.created_by.clone(),
        };

        let debit = apply(
            &mut tx,
            &leg(request.from_user_id, -request.amount, request.to_user_id),
            None,
        )
        .await?;
        let credit = apply(
            &mut tx,
            &leg(request.to_user_id, request.amount, request.from_user_id),
            None,
        )
        .await?;
        tx.commit().await?;

        tracing::debug!(
            transfer = %transfer_id,
            from = request.from_user_id,
            to = request.to_user_id,
            amount = request.amount,
            "transfer committed"
        );
        Ok(TransferReceipt {
            transfer_id,
            debit,
            credit,
        })
    }

    pub async fn transaction(&self, id: &str) -> LedgerResult<Transaction> {
        let mut conn = self.pool.acquire().await?;
        fetch_transaction(&mut conn, id)
            .await?
            .ok_or_else(|| LedgerError::not_found("transaction", id))
    }

    pub async fn balance(&self, user_id: i64, currency_id: &str) -> LedgerResult<Option<Balance>> {
        let balance = sqlx::query_as::<_, Balance>(
            "SELECT user_id, currency_id, balance, version, updated_at \
             FROM economy_user_balances WHERE user_id = ? AND currency_id = ?",
        )
        .bind(user_id)
        .bind(currency_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance)
    }

    /// Every balance a user holds, by currency.
    pub async fn balances(&self, user_id: i64) -> LedgerResult<Vec<Balance>> {
        let balances = sqlx::query_as::<_, Balance>(
            "SELECT user_id, currency_id, balance, version, updated_at \
             FROM economy_user_balances WHERE user_id = ? ORDER BY currency_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(balances)
    }

    /// Richest holders of a currency. Ties rank by user id.
    pub async fn leaderboard(
        &self,
        currency_id: &str,
        limit: u32,
    ) -> LedgerResult<Vec<LeaderboardEntry>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT user_id, balance FROM economy_user_balances \
             WHERE currency_id = ? AND balance > 0 \
             ORDER BY balance DESC, user_id ASC LIMIT ?",
        )
        .bind(currency_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, (user_id, balance))| LeaderboardEntry {
                rank: i + 1,
                user_id,
                balance,
            })
            .collect())
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(u64::from(attempt.min(20)) * 5)
}

async fn read_balance(
    conn: &mut SqliteConnection,
    user_id: i64,
    currency_id: &str,
) -> LedgerResult<Option<(i64, i64)>> {
    let row = sqlx::query_as::<_, (i64, i64)>(
        "SELECT balance, version FROM economy_user_balances WHERE user_id = ? AND currency_id = ?",
    )
    .bind(user_id)
    .bind(currency_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub(crate) async fn fetch_transaction(
    conn: &mut SqliteConnection,
    id: &str,
) -> LedgerResult<Option<Transaction>> {
    let transaction = sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM economy_transactions WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(transaction)
}

/// One balance step plus its log entry, on the caller's storage transaction.
async fn apply(
    conn: &mut SqliteConnection,
    request: &TransactionRequest,
    rollback_of: Option<&str>,
) -> LedgerResult<Receipt> {
    let user_id = request.user_id;
    let currency_id = request.currency_id.as_str();

    let (balance, version) = match read_balance(conn, user_id, currency_id).await? {
        Some(row) => row,
        None => {
            sqlx::query(
                "INSERT OR IGNORE INTO economy_user_balances \
                 (user_id, currency_id, balance, version, updated_at) VALUES (?, ?, 0, 1, ?)",
            )
            .bind(user_id)
            .bind(currency_id)
            .bind(schema::now())
            .execute(&mut *conn)
            .await?;
            read_balance(conn, user_id, currency_id)
                .await?
                .ok_or_else(|| LedgerError::Internal("balance row missing after insert".into()))?
        }
    };

    let new_balance = balance
        .checked_add(request.amount)
        .ok_or_else(|| LedgerError::validation("amount", "overflows the balance"))?;
    if new_balance < 0 {
        return Err(LedgerError::Insufficient {
            user_id,
            currency_id: currency_id.to_string(),
            available: balance,
            required: -request.amount,
        });
    }
    if let Some(currency) = Currency::find(&mut *conn, currency_id).await?
        && let Some(cap) = currency.cap()
        && new_balance > cap
    {
        return Err(LedgerError::validation(
            "amount",
            format!("balance would exceed the {currency_id} cap of {cap}"),
        ));
    }

    let now = schema::now();
    let updated = sqlx::query(
        "UPDATE economy_user_balances SET balance = ?, version = version + 1, updated_at = ? \
         WHERE user_id = ? AND currency_id = ? AND version = ?",
    )
    .bind(new_balance)
    .bind(&now)
    .bind(user_id)
    .bind(currency_id)
    .bind(version)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(LedgerError::ConcurrentModification {
            user_id,
            currency_id: currency_id.to_string(),
        });
    }

    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO economy_transactions (id, user_id, currency_id, amount, balance_before, \
         balance_after, transaction_type, source, source_id, description, metadata, created_at, \
         created_by, rollback_of) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(currency_id)
    .bind(request.amount)
    .bind(balance)
    .bind(new_balance)
    .bind(request.transaction_type.as_str())
    .bind(&request.source)
    .bind(&request.source_id)
    .bind(&request.description)
    .bind(request.metadata.as_ref().map(|m| m.to_string()))
    .bind(&now)
    .bind(&request.created_by)
    .bind(rollback_of)
    .execute(&mut *conn)
    .await;

    match (inserted, rollback_of) {
        (Ok(_), _) => Ok(Receipt {
            transaction_id: id,
            balance_before: balance,
            balance_after: new_balance,
            amount: request.amount,
        }),
        (Err(sqlx::Error::Database(db)), Some(original)) if db.is_unique_violation() => {
            Err(LedgerError::AlreadyRolledBack(original.to_string()))
        }
        (Err(e), _) => Err(e.into()),
    }
}
