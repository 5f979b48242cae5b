//! HTTP handlers, mounted by the host under `/economy`.
//!
//! Handler names match the `handler_ref` values in `plugin.json`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use keystone_sdk::axum::{
    Extension, Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    routing::any,
};
use keystone_sdk::{ApiError, AuditRecord, AuditSink, HandlerSet, Principal};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Settings;
use crate::analytics::{Bucket, FlowPoint, VolumePoint, WealthBucket};
use crate::ledger::Ledger;
use crate::models::{
    Balance, Currency, LeaderboardEntry, NewCurrency, Receipt, Transaction, TransactionRequest,
    TransferReceipt, TransferRequest,
};
use crate::query::{TransactionFilter, TransactionPage};

type ApiResult<T> = Result<T, ApiError>;

/// Longest window the flow report covers.
const MAX_FLOW_DAYS: u32 = 366;

/// Shared handler state.
#[derive(Clone)]
pub struct EconomyApi {
    plugin_id: String,
    ledger: Ledger,
    settings: Settings,
    audit: Arc<dyn AuditSink>,
}

impl EconomyApi {
    pub fn new(
        plugin_id: impl Into<String>,
        ledger: Ledger,
        settings: Settings,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ledger,
            settings,
            audit,
        }
    }

    async fn audit(&self, action: &str, principal: &Principal, details: Value) {
        self.audit
            .record(AuditRecord::new(
                action,
                self.plugin_id.clone(),
                Some(principal.subject.clone()),
                details,
            ))
            .await;
    }
}

/// Every handler, keyed by handler reference.
pub fn handlers(api: EconomyApi) -> HandlerSet {
    let mut set = HandlerSet::new();
    let mut add = |name: &str, router| {
        set.insert(name.to_string(), router);
    };
    add("list_currencies", any(list_currencies).with_state(api.clone()));
    add("create_currency", any(create_currency).with_state(api.clone()));
    add("get_currency", any(get_currency).with_state(api.clone()));
    add("user_balances", any(user_balances).with_state(api.clone()));
    add(
        "process_transaction",
        any(process_transaction).with_state(api.clone()),
    );
    add("list_transactions", any(list_transactions).with_state(api.clone()));
    add("get_transaction", any(get_transaction).with_state(api.clone()));
    add(
        "rollback_transaction",
        any(rollback_transaction).with_state(api.clone()),
    );
    add("transfer", any(transfer).with_state(api.clone()));
    add("leaderboard", any(leaderboard).with_state(api.clone()));
    add("volume", any(volume).with_state(api.clone()));
    add("flow", any(flow).with_state(api.clone()));
    add("distribution", any(distribution).with_state(api));
    set
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::validation(e.body_text()))
}

fn params<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(value)| value)
        .map_err(|e| ApiError::validation(e.body_text()))
}

fn path<T>(path: Result<Path<T>, PathRejection>) -> ApiResult<T> {
    path.map(|Path(value)| value)
        .map_err(|e| ApiError::validation(e.body_text()))
}

// Currencies

async fn list_currencies(State(api): State<EconomyApi>) -> ApiResult<Json<Vec<Currency>>> {
    Ok(Json(Currency::list(api.ledger.pool()).await?))
}

async fn create_currency(
    State(api): State<EconomyApi>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<NewCurrency>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Currency>)> {
    let currency = Currency::create(api.ledger.pool(), body(payload)?).await?;
    api.audit(
        "economy.currency_create",
        &principal,
        json!({ "currency": currency.id, "maxBalance": currency.max_balance }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(currency)))
}

async fn get_currency(
    State(api): State<EconomyApi>,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Currency>> {
    Ok(Json(Currency::get(api.ledger.pool(), &path(id)?).await?))
}

// Balances

#[derive(Debug, Serialize)]
struct BalancesResponse {
    user_id: i64,
    balances: Vec<Balance>,
}

async fn user_balances(
    State(api): State<EconomyApi>,
    user_id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<BalancesResponse>> {
    let user_id = path(user_id)?;
    let balances = api.ledger.balances(user_id).await?;
    Ok(Json(BalancesResponse { user_id, balances }))
}

// Transactions

async fn process_transaction(
    State(api): State<EconomyApi>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Receipt>)> {
    let mut request =
        TransactionRequest::from_json(&body(payload)?, Some(&api.settings.default_currency))?;
    if request.created_by.is_none() {
        request.created_by = Some(principal.subject);
    }
    let receipt = api.ledger.process_transaction(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn list_transactions(
    State(api): State<EconomyApi>,
    filter: Result<Query<TransactionFilter>, QueryRejection>,
) -> ApiResult<Json<TransactionPage>> {
    let filter = params(filter)?;
    let page = api
        .ledger
        .transactions(&filter, api.settings.max_page_size)
        .await?;
    Ok(Json(page))
}

async fn get_transaction(
    State(api): State<EconomyApi>,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<Json<Transaction>> {
    Ok(Json(api.ledger.transaction(&path(id)?).await?))
}

#[derive(Debug, Deserialize)]
struct RollbackBody {
    reason: String,
}

async fn rollback_transaction(
    State(api): State<EconomyApi>,
    Extension(principal): Extension<Principal>,
    id: Result<Path<String>, PathRejection>,
    payload: Result<Json<RollbackBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    let id = path(id)?;
    let RollbackBody { reason } = body(payload)?;
    let reversal = api
        .ledger
        .rollback(&id, Some(&principal.subject), &reason)
        .await?;
    api.audit(
        "economy.rollback",
        &principal,
        json!({
            "transaction": id,
            "reversal": reversal.id,
            "amount": reversal.amount,
            "reason": reason,
        }),
    )
    .await;
    Ok((StatusCode::CREATED, Json(reversal)))
}

async fn transfer(
    State(api): State<EconomyApi>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TransferReceipt>)> {
    let mut request = body(payload)?;
    if request.created_by.is_none() {
        request.created_by = Some(principal.subject);
    }
    Ok((StatusCode::CREATED, Json(api.ledger.transfer(request).await?)))
}

// Leaderboard

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct LeaderboardResponse {
    currency_id: String,
    entries: Vec<LeaderboardEntry>,
}

async fn leaderboard(
    State(api): State<EconomyApi>,
    currency_id: Result<Path<String>, PathRejection>,
    query: Result<Query<LeaderboardQuery>, QueryRejection>,
) -> ApiResult<Json<LeaderboardResponse>> {
    let currency_id = path(currency_id)?;
    let limit = params(query)?
        .limit
        .unwrap_or(api.settings.leaderboard_limit)
        .clamp(1, api.settings.max_page_size.max(1));
    let entries = api.ledger.leaderboard(&currency_id, limit).await?;
    Ok(Json(LeaderboardResponse {
        currency_id,
        entries,
    }))
}

// Analytics

#[derive(Debug, Deserialize)]
struct VolumeQuery {
    currency_id: Option<String>,
    bucket: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn volume(
    State(api): State<EconomyApi>,
    query: Result<Query<VolumeQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<VolumePoint>>> {
    let query = params(query)?;
    let bucket = match query.bucket.as_deref() {
        Some(raw) => raw.parse::<Bucket>()?,
        None => Bucket::default(),
    };
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::days(30));
    if from >= to {
        return Err(ApiError::validation("from: must be earlier than to"));
    }
    let points = api
        .ledger
        .volume(query.currency_id.as_deref(), bucket, from, to)
        .await?;
    Ok(Json(points))
}

#[derive(Debug, Deserialize)]
struct FlowQuery {
    currency_id: Option<String>,
    days: Option<u32>,
}

async fn flow(
    State(api): State<EconomyApi>,
    query: Result<Query<FlowQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<FlowPoint>>> {
    let query = params(query)?;
    let currency_id = query
        .currency_id
        .unwrap_or_else(|| api.settings.default_currency.clone());
    let days = query.days.unwrap_or(30).clamp(1, MAX_FLOW_DAYS);
    Ok(Json(api.ledger.currency_flow(&currency_id, days).await?))
}

#[derive(Debug, Deserialize)]
struct DistributionQuery {
    currency_id: Option<String>,
}

async fn distribution(
    State(api): State<EconomyApi>,
    query: Result<Query<DistributionQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<WealthBucket>>> {
    let currency_id = params(query)?
        .currency_id
        .unwrap_or_else(|| api.settings.default_currency.clone());
    Ok(Json(api.ledger.wealth_distribution(&currency_id).await?))
}
