//! Read-only aggregates over the ledger.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::schema;

/// Width of a volume bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl Bucket {
    /// `strftime` pattern that labels the bucket a timestamp falls in.
    fn pattern(self) -> &'static str {
        match self {
            Self::Hour => "%Y-%m-%dT%H:00",
            Self::Day => "%Y-%m-%d",
            Self::Week => "%Y-W%W",
            Self::Month => "%Y-%m",
        }
    }
}

impl FromStr for Bucket {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(LedgerError::validation(
                "bucket",
                "must be one of hour, day, week, month",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VolumePoint {
    pub bucket: String,
    pub transactions: i64,
    /// Sum of positive amounts.
    pub credited: i64,
    /// Sum of negative amounts, as a positive number.
    pub debited: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FlowPoint {
    pub day: String,
    pub inflow: i64,
    pub outflow: i64,
    pub net: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WealthBucket {
    pub range: &'static str,
    pub holders: i64,
    pub total: i64,
}

/// Labels of the wealth distribution, in order. Bounds are inclusive.
pub const WEALTH_RANGES: [&str; 6] = ["0", "1-100", "101-500", "501-1000", "1001-5000", "5000+"];

impl Ledger {
    /// Transaction count and credited/debited totals per bucket over
    /// `[from, to)`.
    pub async fn volume(
        &self,
        currency_id: Option<&str>,
        bucket: Bucket,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<Vec<VolumePoint>> {
        let points = sqlx::query_as::<_, VolumePoint>(
            "SELECT strftime(?1, created_at) AS bucket, \
                    COUNT(*) AS transactions, \
                    COALESCE(SUM(CASE WHEN amount > 0 THEN amount ELSE 0 END), 0) AS credited, \
                    COALESCE(SUM(CASE WHEN amount < 0 THEN -amount ELSE 0 END), 0) AS debited \
             FROM economy_transactions \
             WHERE (?2 IS NULL OR currency_id = ?2) AND created_at >= ?3 AND created_at < ?4 \
             GROUP BY bucket ORDER BY bucket",
        )
        .bind(bucket.pattern())
        .bind(currency_id)
        .bind(schema::timestamp(from))
        .bind(schema::timestamp(to))
        .fetch_all(self.pool())
        .await?;
        Ok(points)
    }

    /// Inflow against outflow per day for the last `days` days.
    pub async fn currency_flow(&self, currency_id: &str, days: u32) -> LedgerResult<Vec<FlowPoint>> {
        let since = Utc::now() - Duration::days(i64::from(days.max(1)));
        let points = sqlx::query_as::<_, FlowPoint>(
            "SELECT strftime('%Y-%m-%d', created_at) AS day, \
                    COALESCE(SUM(CASE WHEN amount > 0 THEN amount ELSE 0 END), 0) AS inflow, \
                    COALESCE(SUM(CASE WHEN amount < 0 THEN -amount ELSE 0 END), 0) AS outflow, \
                    COALESCE(SUM(amount), 0) AS net \
             FROM economy_transactions \
             WHERE currency_id = ? AND created_at >= ? \
             GROUP BY day ORDER BY day",
        )
        .bind(currency_id)
        .bind(schema::timestamp(since))
        .fetch_all(self.pool())
        .await?;
        Ok(points)
    }

    /// Holder counts per fixed balance range. Every range is present, empty
    /// ones with zero holders.
    pub async fn wealth_distribution(&self, currency_id: &str) -> LedgerResult<Vec<WealthBucket>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT CASE \
                        WHEN balance = 0 THEN '0' \
                        WHEN balance <= 100 THEN '1-100' \
                        WHEN balance <= 500 THEN '101-500' \
                        WHEN balance <= 1000 THEN '501-1000' \
                        WHEN balance <= 5000 THEN '1001-5000' \
                        ELSE '5000+' \
                    END AS tier, \
                    COUNT(*) AS holders, \
                    COALESCE(SUM(balance), 0) AS total \
             FROM economy_user_balances WHERE currency_id = ? GROUP BY tier",
        )
        .bind(currency_id)
        .fetch_all(self.pool())
        .await?;

        Ok(WEALTH_RANGES
            .iter()
            .map(|&range| {
                let (holders, total) = rows
                    .iter()
                    .find(|(label, _, _)| label == range)
                    .map(|(_, holders, total)| (*holders, *total))
                    .unwrap_or((0, 0));
                WealthBucket {
                    range,
                    holders,
                    total,
                }
            })
            .collect())
    }
}
