//! Ledger records and request types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::error::LedgerError;

/// Why a balance moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Earn,
    Spend,
    Transfer,
    Admin,
    Rollback,
}

impl TransactionType {
    pub const ALL: [Self; 5] = [
        Self::Earn,
        Self::Spend,
        Self::Transfer,
        Self::Admin,
        Self::Rollback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Spend => "spend",
            Self::Transfer => "transfer",
            Self::Admin => "admin",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Self::ALL.iter().map(|t| t.as_str()).collect();
                format!("must be one of {}", allowed.join(", "))
            })
    }
}

/// A registered currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Currency {
    pub id: String,
    pub name: String,
    pub symbol: String,

    /// Display hint only; amounts are always integers in the minor unit.
    pub decimal_places: i64,

    pub transferable: bool,

    /// Cap on any single balance; -1 means unbounded.
    pub max_balance: i64,

    pub created_at: DateTime<Utc>,
}

impl Currency {
    pub fn cap(&self) -> Option<i64> {
        (self.max_balance >= 0).then_some(self.max_balance)
    }
}

/// Input for registering a currency.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCurrency {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub decimal_places: Option<i64>,
    #[serde(default)]
    pub transferable: Option<bool>,
    #[serde(default)]
    pub max_balance: Option<i64>,
}

impl NewCurrency {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            symbol: None,
            decimal_places: None,
            transferable: None,
            max_balance: None,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut problems = Vec::new();
        if self.id.trim().is_empty() {
            problems.push("id: must not be empty".to_string());
        } else if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            problems.push("id: only letters, digits, '_' and '-' are allowed".to_string());
        }
        if self.name.trim().is_empty() {
            problems.push("name: must not be empty".to_string());
        }
        if self.decimal_places.is_some_and(|d| d < 0) {
            problems.push("decimal_places: must not be negative".to_string());
        }
        if self.max_balance.is_some_and(|m| m < -1) {
            problems.push("max_balance: must be -1 (unbounded) or at least 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::Validation(problems))
        }
    }
}

/// Per-(user, currency) balance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Balance {
    pub user_id: i64,
    pub currency_id: String,
    pub balance: i64,
    /// Optimistic-lock stamp; bumped on every update.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// An entry in the append-only transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Insertion sequence; orders the log in commit order.
    pub seq: i64,
    pub id: String,
    pub user_id: i64,
    pub currency_id: String,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub transaction_type: TransactionType,
    pub source: String,
    pub source_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub rollback_of: Option<String>,
}

impl<'r> FromRow<'r, SqliteRow> for Transaction {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("transaction_type")?;
        let transaction_type =
            kind.parse::<TransactionType>()
                .map_err(|e| sqlx::Error::ColumnDecode {
                    index: "transaction_type".to_string(),
                    source: e.into(),
                })?;
        let metadata: Option<String> = row.try_get("metadata")?;
        let metadata = metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "metadata".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            currency_id: row.try_get("currency_id")?,
            amount: row.try_get("amount")?,
            balance_before: row.try_get("balance_before")?,
            balance_after: row.try_get("balance_after")?,
            transaction_type,
            source: row.try_get("source")?,
            source_id: row.try_get("source_id")?,
            description: row.try_get("description")?,
            metadata,
            created_at: row.try_get("created_at")?,
            created_by: row.try_get("created_by")?,
            rollback_of: row.try_get("rollback_of")?,
        })
    }
}

/// A credit or debit to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub user_id: i64,
    pub currency_id: String,
    /// Signed amount in the currency's minor unit; never zero.
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub source: String,
    pub source_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub created_by: Option<String>,
}

impl TransactionRequest {
    pub fn new(
        user_id: i64,
        currency_id: impl Into<String>,
        amount: i64,
        transaction_type: TransactionType,
        source: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            currency_id: currency_id.into(),
            amount,
            transaction_type,
            source: source.into(),
            source_id: None,
            description: None,
            metadata: None,
            created_by: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut problems = Vec::new();
        self.collect_problems(&mut problems);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::Validation(problems))
        }
    }

    fn collect_problems(&self, problems: &mut Vec<String>) {
        if self.amount == 0 {
            problems.push("amount: must not be zero".to_string());
        }
        if self.currency_id.trim().is_empty() {
            problems.push("currency_id: must be a non-empty string".to_string());
        }
        if self.source.trim().is_empty() {
            problems.push("source: must be a non-empty string".to_string());
        }
    }

    /// Parse an untyped request body, reporting every offending field at
    /// once. `default_currency` fills in a missing `currency_id`.
    pub fn from_json(body: &Value, default_currency: Option<&str>) -> Result<Self, LedgerError> {
        let mut problems = Vec::new();

        let user_id = match body.get("user_id") {
            Some(Value::Number(n)) if n.is_i64() => n.as_i64(),
            Some(Value::String(s)) => match s.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    problems.push("user_id: must be an integer".to_string());
                    None
                }
            },
            _ => {
                problems.push("user_id: must be an integer".to_string());
                None
            }
        };

        let currency_id = match body.get("currency_id") {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => default_currency.unwrap_or_default().to_string(),
            Some(_) => {
                problems.push("currency_id: must be a non-empty string".to_string());
                String::new()
            }
        };

        let amount = match body.get("amount") {
            Some(Value::Number(n)) if n.is_i64() => n.as_i64(),
            _ => {
                problems.push("amount: must be an integer".to_string());
                None
            }
        };

        let transaction_type = match body.get("type").or_else(|| body.get("transaction_type")) {
            Some(Value::String(s)) => match s.parse::<TransactionType>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    problems.push(format!("type: {e}"));
                    None
                }
            },
            _ => {
                problems.push("type: is required".to_string());
                None
            }
        };

        let optional_string = |key: &str, problems: &mut Vec<String>| match body.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                problems.push(format!("{key}: must be a string"));
                None
            }
        };
        let source = optional_string("source", &mut problems).unwrap_or_else(|| "api".to_string());
        let source_id = optional_string("source_id", &mut problems);
        let description = optional_string("description", &mut problems);
        let metadata = body.get("metadata").filter(|m| !m.is_null()).cloned();

        let request = Self {
            user_id: user_id.unwrap_or_default(),
            currency_id,
            // Placeholder keeps the zero check from doubling the message.
            amount: amount.unwrap_or(1),
            transaction_type: transaction_type.unwrap_or(TransactionType::Admin),
            source,
            source_id,
            description,
            metadata,
            created_by: None,
        };
        request.collect_problems(&mut problems);
        problems.dedup();

        if problems.is_empty() {
            Ok(request)
        } else {
            Err(LedgerError::Validation(problems))
        }
    }
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_id: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub amount: i64,
}

/// Move funds between two users.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub from_user_id: i64,
    pub to_user_id: i64,
    pub currency_id: String,
    pub amount: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl TransferRequest {
    pub fn validate(&self) -> Result<(), LedgerError> {
        let mut problems = Vec::new();
        if self.amount <= 0 {
            problems.push("amount: must be positive".to_string());
        }
        if self.from_user_id == self.to_user_id {
            problems.push("to_user_id: must differ from from_user_id".to_string());
        }
        if self.currency_id.trim().is_empty() {
            problems.push("currency_id: must be a non-empty string".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::Validation(problems))
        }
    }
}

/// Both legs of a committed transfer. The legs share `transfer_id` as
/// their `source_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
    pub debit: Receipt,
    pub credit: Receipt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: i64,
    pub balance: i64,
}
