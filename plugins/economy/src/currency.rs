//! Currency registry.

use sqlx::{Executor, Sqlite, SqlitePool};

use crate::error::{LedgerError, LedgerResult};
use crate::models::{Currency, NewCurrency};
use crate::schema;

const COLUMNS: &str = "id, name, symbol, decimal_places, transferable, max_balance, created_at";

impl Currency {
    /// Register a currency. An existing id is a conflict.
    pub async fn create(pool: &SqlitePool, input: NewCurrency) -> LedgerResult<Self> {
        input.validate()?;

        let result = sqlx::query_as::<_, Currency>(&format!(
            "INSERT INTO economy_currencies ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
        ))
        .bind(&input.id)
        .bind(&input.name)
        .bind(input.symbol.as_deref().unwrap_or(""))
        .bind(input.decimal_places.unwrap_or(0))
        .bind(input.transferable.unwrap_or(true))
        .bind(input.max_balance.unwrap_or(-1))
        .bind(schema::now())
        .fetch_one(pool)
        .await;

        match result {
            Ok(currency) => {
                tracing::info!(currency = %currency.id, "registered currency");
                Ok(currency)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(LedgerError::CurrencyExists(input.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register `input` unless a currency with its id exists. Returns whether
    /// a row was written.
    pub async fn ensure(pool: &SqlitePool, input: NewCurrency) -> LedgerResult<bool> {
        input.validate()?;
        let inserted = sqlx::query(&format!(
            "INSERT OR IGNORE INTO economy_currencies ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&input.id)
        .bind(&input.name)
        .bind(input.symbol.as_deref().unwrap_or(""))
        .bind(input.decimal_places.unwrap_or(0))
        .bind(input.transferable.unwrap_or(true))
        .bind(input.max_balance.unwrap_or(-1))
        .bind(schema::now())
        .execute(pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn find<'e, E>(executor: E, id: &str) -> LedgerResult<Option<Self>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let currency = sqlx::query_as::<_, Currency>(&format!(
            "SELECT {COLUMNS} FROM economy_currencies WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;
        Ok(currency)
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> LedgerResult<Self> {
        Self::find(pool, id)
            .await?
            .ok_or_else(|| LedgerError::not_found("currency", id))
    }

    pub async fn list(pool: &SqlitePool) -> LedgerResult<Vec<Self>> {
        let currencies = sqlx::query_as::<_, Currency>(&format!(
            "SELECT {COLUMNS} FROM economy_currencies ORDER BY id"
        ))
        .fetch_all(pool)
        .await?;
        Ok(currencies)
    }
}
