//! Filtered transaction listing.
//!
//! Filters compose into one `WHERE` clause built with SeaQuery. Every
//! user-supplied value leaves the builder as a bound parameter; the SQL
//! text only ever contains column names and placeholders.

use chrono::{DateTime, Utc};
use sea_query::{Cond, Expr, Iden, LikeExpr, Order, Query, SqliteQueryBuilder, Value, Values};
use serde::{Deserialize, Serialize};
use sqlx::Arguments;
use sqlx::sqlite::SqliteArguments;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::models::{Transaction, TransactionType};
use crate::schema;

/// Page size when the caller names none.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Iden, Clone, Copy)]
enum Transactions {
    #[iden = "economy_transactions"]
    Table,
    Seq,
    Id,
    UserId,
    CurrencyId,
    Amount,
    BalanceBefore,
    BalanceAfter,
    TransactionType,
    Source,
    SourceId,
    Description,
    Metadata,
    CreatedAt,
    CreatedBy,
    RollbackOf,
}

const COLUMNS: [Transactions; 15] = [
    Transactions::Seq,
    Transactions::Id,
    Transactions::UserId,
    Transactions::CurrencyId,
    Transactions::Amount,
    Transactions::BalanceBefore,
    Transactions::BalanceAfter,
    Transactions::TransactionType,
    Transactions::Source,
    Transactions::SourceId,
    Transactions::Description,
    Transactions::Metadata,
    Transactions::CreatedAt,
    Transactions::CreatedBy,
    Transactions::RollbackOf,
];

/// Predicates for [`Ledger::transactions`]. Unset fields do not filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionFilter {
    pub user_id: Option<i64>,
    pub currency_id: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    /// Substring of `description`.
    pub search: Option<String>,
    /// Only entries older than this sequence number (newest-first cursor).
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

impl TransactionFilter {
    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn currency(mut self, currency_id: impl Into<String>) -> Self {
        self.currency_id = Some(currency_id.into());
        self
    }

    pub fn kind(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn amount_between(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min_amount = min;
        self.max_amount = max;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    fn conditions(&self) -> Cond {
        Cond::all()
            .add_option(self.user_id.map(|id| Expr::col(Transactions::UserId).eq(id)))
            .add_option(
                self.currency_id
                    .clone()
                    .map(|id| Expr::col(Transactions::CurrencyId).eq(id)),
            )
            .add_option(
                self.transaction_type
                    .map(|t| Expr::col(Transactions::TransactionType).eq(t.as_str())),
            )
            .add_option(
                self.from
                    .map(|at| Expr::col(Transactions::CreatedAt).gte(schema::timestamp(at))),
            )
            .add_option(
                self.to
                    .map(|at| Expr::col(Transactions::CreatedAt).lt(schema::timestamp(at))),
            )
            .add_option(self.min_amount.map(|min| Expr::col(Transactions::Amount).gte(min)))
            .add_option(self.max_amount.map(|max| Expr::col(Transactions::Amount).lte(max)))
            .add_option(
                self.search
                    .as_deref()
                    .filter(|text| !text.is_empty())
                    .map(|text| {
                        let pattern = format!("%{}%", escape_like_wildcards(text));
                        Expr::col(Transactions::Description)
                            .like(LikeExpr::new(pattern).escape('\\'))
                    }),
            )
    }

    /// SELECT for one page plus the COUNT over all matches.
    fn build(&self, page_size: u32) -> ((String, Values), (String, Values)) {
        let mut select = Query::select();
        select
            .columns(COLUMNS)
            .from(Transactions::Table)
            .cond_where(self.conditions())
            .and_where_option(self.before.map(|seq| Expr::col(Transactions::Seq).lt(seq)))
            .order_by(Transactions::Seq, Order::Desc)
            .limit(u64::from(page_size));

        let mut count = Query::select();
        count
            .expr(Expr::col(Transactions::Seq).count())
            .from(Transactions::Table)
            .cond_where(self.conditions());

        (
            select.build(SqliteQueryBuilder),
            count.build(SqliteQueryBuilder),
        )
    }
}

/// One page of the log, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    /// Matches across all pages, ignoring the cursor.
    pub total: i64,
    /// Pass as `before` to fetch the next page.
    pub next_before: Option<i64>,
}

impl Ledger {
    /// List transactions matching `filter`. Page size is clamped to
    /// `1..=max_page_size`.
    pub async fn transactions(
        &self,
        filter: &TransactionFilter,
        max_page_size: u32,
    ) -> LedgerResult<TransactionPage> {
        let page_size = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, max_page_size.max(1));
        let ((select_sql, select_values), (count_sql, count_values)) = filter.build(page_size);

        let transactions =
            sqlx::query_as_with::<_, Transaction, _>(&select_sql, arguments(select_values)?)
                .fetch_all(self.pool())
                .await?;
        let total: i64 = sqlx::query_scalar_with(&count_sql, arguments(count_values)?)
            .fetch_one(self.pool())
            .await?;

        let next_before = (transactions.len() == page_size as usize)
            .then(|| transactions.last().map(|t| t.seq))
            .flatten();

        Ok(TransactionPage {
            transactions,
            total,
            next_before,
        })
    }
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn escape_like_wildcards(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Move SeaQuery's collected values into sqlx arguments.
fn arguments<'q>(values: Values) -> LedgerResult<SqliteArguments<'q>> {
    let mut args = SqliteArguments::default();
    for value in values.0 {
        let added = match value {
            Value::Bool(v) => args.add(v),
            Value::Int(v) => args.add(v),
            Value::BigInt(v) => args.add(v),
            Value::BigUnsigned(v) => args.add(v.map(|n| i64::try_from(n).unwrap_or(i64::MAX))),
            Value::String(v) => args.add(v.map(|s| *s)),
            other => {
                return Err(LedgerError::Internal(format!(
                    "unsupported query parameter {other:?}"
                )));
            }
        };
        added.map_err(|e| LedgerError::Internal(format!("failed to bind parameter: {e}")))?;
    }
    Ok(args)
}
