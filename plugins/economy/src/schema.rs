//! Ledger tables.
//!
//! Exported through the module manifest so the host applies them on first
//! activation. Timestamps are stored as RFC 3339 text in UTC with
//! microsecond precision, which keeps lexicographic and chronological
//! order identical.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

pub const TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS economy_currencies (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        symbol TEXT NOT NULL DEFAULT '',
        decimal_places INTEGER NOT NULL DEFAULT 0 CHECK (decimal_places >= 0),
        transferable INTEGER NOT NULL DEFAULT 1,
        max_balance INTEGER NOT NULL DEFAULT -1,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS economy_user_balances (
        user_id INTEGER NOT NULL,
        currency_id TEXT NOT NULL,
        balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
        version INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, currency_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS economy_transactions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        user_id INTEGER NOT NULL,
        currency_id TEXT NOT NULL,
        amount INTEGER NOT NULL CHECK (amount <> 0),
        balance_before INTEGER NOT NULL,
        balance_after INTEGER NOT NULL CHECK (balance_after >= 0),
        transaction_type TEXT NOT NULL
            CHECK (transaction_type IN ('earn', 'spend', 'transfer', 'admin', 'rollback')),
        source TEXT NOT NULL,
        source_id TEXT,
        description TEXT,
        metadata TEXT,
        created_at TEXT NOT NULL,
        created_by TEXT,
        rollback_of TEXT
    )"#,
];

pub const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS economy_transactions_rollback_of ON economy_transactions (rollback_of)",
    "CREATE INDEX IF NOT EXISTS economy_transactions_user ON economy_transactions (user_id, currency_id)",
    "CREATE INDEX IF NOT EXISTS economy_transactions_created ON economy_transactions (created_at)",
    "CREATE INDEX IF NOT EXISTS economy_transactions_type ON economy_transactions (transaction_type)",
    "CREATE INDEX IF NOT EXISTS economy_balances_leaderboard ON economy_user_balances (currency_id, balance DESC)",
];

/// Create the tables directly. The host normally does this; tests and
/// embedders without a host call it themselves.
pub async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in TABLES.iter().chain(INDEXES) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Storage form of a timestamp.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        assert_eq!(timestamp(early), "2026-01-02T03:04:05.000000Z");
        assert!(timestamp(early) < timestamp(late));
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let pool = keystone_test_utils::memory_pool().await.unwrap();
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'economy_%'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 3);
    }
}
