//! Economy ledger plugin.
//!
//! A multi-currency ledger: per-(user, currency) balances under optimistic
//! locking, an append-only transaction log with rollbacks, transfers,
//! leaderboards, and read-only analytics.
//!
//! While active the plugin publishes its [`Ledger`] as the `ledger` service
//! (visible to other plugins as `economy.ledger`).

pub mod analytics;
pub mod currency;
pub mod error;
pub mod ledger;
pub mod models;
pub mod query;
pub mod routes;
pub mod schema;

use std::sync::Arc;

use async_trait::async_trait;
use keystone_sdk::{HandlerSet, HookError, HookSet, Plugin, PluginContext};
use serde_json::json;

pub use analytics::{Bucket, FlowPoint, VolumePoint, WealthBucket};
pub use error::{LedgerError, LedgerResult};
pub use ledger::Ledger;
pub use models::{
    Balance, Currency, LeaderboardEntry, NewCurrency, Receipt, Transaction, TransactionRequest,
    TransactionType, TransferReceipt, TransferRequest,
};
pub use query::{TransactionFilter, TransactionPage};

/// Name entry files use to select this module.
pub const MODULE_NAME: &str = "economy";

/// Service name of the [`Ledger`] in the plugin's service table.
pub const LEDGER_SERVICE: &str = "ledger";

/// Resolved plugin settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub default_currency: String,
    pub leaderboard_limit: u32,
    pub max_page_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_currency: "coins".to_string(),
            leaderboard_limit: 10,
            max_page_size: 100,
        }
    }
}

impl Settings {
    pub fn from_context(ctx: &PluginContext) -> Result<Self, HookError> {
        let defaults = Self::default();
        let positive = |key: &str, fallback: u32| -> Result<u32, HookError> {
            match ctx.setting::<i64>(key) {
                None => Ok(fallback),
                Some(n) if n > 0 => u32::try_from(n)
                    .map_err(|_| HookError::new(format!("{key} is out of range: {n}"))),
                Some(n) => Err(HookError::new(format!("{key} must be positive, got {n}"))),
            }
        };

        let default_currency = ctx
            .setting::<String>("default_currency")
            .unwrap_or(defaults.default_currency);
        if default_currency.trim().is_empty() {
            return Err(HookError::new("default_currency must not be empty"));
        }

        Ok(Self {
            default_currency,
            leaderboard_limit: positive("leaderboard_limit", defaults.leaderboard_limit)?,
            max_page_size: positive("max_page_size", defaults.max_page_size)?,
        })
    }
}

/// The plugin module. Holds no state; everything lives in the context.
#[derive(Debug, Default)]
pub struct EconomyPlugin;

impl EconomyPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for EconomyPlugin {
    /// Tables and indexes come from the compiled module so they always match
    /// the code that queries them.
    fn manifest(&self) -> Option<serde_json::Value> {
        Some(json!({
            "schemas": schema::TABLES,
            "indexes": schema::INDEXES,
        }))
    }

    fn hooks(&self) -> HookSet {
        HookSet {
            on_load: true,
            on_activate: true,
            on_deactivate: false,
        }
    }

    /// Reject unusable settings before anything is mounted.
    async fn on_load(&self, ctx: &PluginContext) -> Result<(), HookError> {
        let settings = Settings::from_context(ctx)?;
        tracing::debug!(plugin = %ctx.plugin_id(), ?settings, "economy settings resolved");
        Ok(())
    }

    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), HookError> {
        let settings = Settings::from_context(ctx)?;

        let mut default = NewCurrency::new(&settings.default_currency, &settings.default_currency);
        default.transferable = Some(true);
        let created = Currency::ensure(ctx.db(), default)
            .await
            .map_err(|e| HookError::new(format!("failed to register default currency: {e}")))?;
        if created {
            tracing::info!(currency = %settings.default_currency, "registered default currency");
        }

        ctx.services()
            .insert(LEDGER_SERVICE, Arc::new(Ledger::new(ctx.db().clone())));
        Ok(())
    }

    fn handlers(&self, ctx: &PluginContext) -> HandlerSet {
        // on_load has already rejected bad settings.
        let settings = Settings::from_context(ctx).unwrap_or_default();
        let api = routes::EconomyApi::new(
            ctx.plugin_id(),
            Ledger::new(ctx.db().clone()),
            settings,
            ctx.audit().clone(),
        );
        routes::handlers(api)
    }
}
