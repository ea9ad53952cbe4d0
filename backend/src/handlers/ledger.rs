//! HTTP handlers for ledger endpoints
//!
//! Each handler maps one request onto one `LedgerService` call.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use shared::{
    Batch, DocumentRef, HistoryFilter, MovementId, MovementPage, MovementType, Reservation,
    StockBalance, StockMovement, StockSummary,
};

use crate::error::AppResult;
use crate::middleware::TenantId;
use crate::services::{
    AdjustInput, BalanceDrift, IssueInput, RebuildReport, ReceiveInput, ReserveInput,
    TransferInput, TransferOutcome,
};
use crate::AppState;

// ============================================================================
// Catalog mirror
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterSkuInput {
    pub sku_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RegisterLocationInput {
    pub location_id: Uuid,
}

/// Publish a SKU from the catalog
pub async fn register_sku(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(input): Json<RegisterSkuInput>,
) -> AppResult<StatusCode> {
    state.ledger.register_sku(tenant_id, input.sku_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Publish a location from the catalog
pub async fn register_location(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(input): Json<RegisterLocationInput>,
) -> AppResult<StatusCode> {
    state
        .ledger
        .register_location(tenant_id, input.location_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Movements
// ============================================================================

/// Receive stock
pub async fn receive(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(input): Json<ReceiveInput>,
) -> AppResult<(StatusCode, Json<StockMovement>)> {
    let movement = state.ledger.receive(tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(movement)))
}

/// Issue stock under an allocation policy
pub async fn issue(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(input): Json<IssueInput>,
) -> AppResult<(StatusCode, Json<Vec<StockMovement>>)> {
    let movements = state.ledger.issue(tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(movements)))
}

pub async fn transfer(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(input): Json<TransferInput>,
) -> AppResult<(StatusCode, Json<TransferOutcome>)> {
    let outcome = state.ledger.transfer(tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn adjust(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(input): Json<AdjustInput>,
) -> AppResult<(StatusCode, Json<StockMovement>)> {
    let movement = state.ledger.adjust(tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(movement)))
}

// ============================================================================
// Reservations
// ============================================================================

pub async fn reserve(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Json(input): Json<ReserveInput>,
) -> AppResult<(StatusCode, Json<Reservation>)> {
    let reservation = state.ledger.reserve(tenant_id, input).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn get_reservation(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(reservation_id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let reservation = state
        .ledger
        .get_reservation(tenant_id, reservation_id)
        .await?;
    Ok(Json(reservation))
}

/// Convert a held reservation into sale movements
pub async fn commit_reservation(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(reservation_id): Path<Uuid>,
    Json(reference): Json<DocumentRef>,
) -> AppResult<Json<Vec<StockMovement>>> {
    let movements = state
        .ledger
        .commit_reservation(tenant_id, reservation_id, reference)
        .await?;
    Ok(Json(movements))
}

pub async fn release_reservation(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(reservation_id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let reservation = state.ledger.release(tenant_id, reservation_id).await?;
    Ok(Json(reservation))
}

// ============================================================================
// Queries
// ============================================================================

/// Query parameters naming one balance key
#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub batch_id: Option<Uuid>,
}

pub async fn get_balance(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Query(query): Query<BalanceQuery>,
) -> AppResult<Json<StockBalance>> {
    let balance = state
        .ledger
        .get_balance(tenant_id, query.sku_id, query.location_id, query.batch_id)
        .await?;
    Ok(Json(balance))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub sku_id: Uuid,
    pub location_id: Uuid,
}

pub async fn get_stock_summary(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Query(query): Query<SummaryQuery>,
) -> AppResult<Json<StockSummary>> {
    let summary = state
        .ledger
        .get_stock_summary(tenant_id, query.sku_id, query.location_id)
        .await?;
    Ok(Json(summary))
}

/// Query parameters for movement history
#[derive(Debug, Default, Deserialize)]
pub struct MovementQuery {
    pub sku_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub movement_type: Option<MovementType>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub occurred_from: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    pub cursor: Option<MovementId>,
    pub limit: Option<u32>,
}

impl MovementQuery {
    fn filter(&self) -> HistoryFilter {
        HistoryFilter {
            sku_id: self.sku_id,
            location_id: self.location_id,
            batch_id: self.batch_id,
            movement_type: self.movement_type,
            reference_type: self.reference_type.clone(),
            reference_id: self.reference_id.clone(),
            occurred_from: self.occurred_from,
            occurred_before: self.occurred_before,
        }
    }
}

pub async fn get_movement_history(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Query(query): Query<MovementQuery>,
) -> AppResult<Json<MovementPage>> {
    let page = state
        .ledger
        .get_movement_history(tenant_id, &query.filter(), query.cursor, query.limit)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct NearExpiryQuery {
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub within_days: Option<u32>,
}

/// Batches in stock that expire soon
pub async fn get_batches_near_expiry(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Query(query): Query<NearExpiryQuery>,
) -> AppResult<Json<Vec<Batch>>> {
    let within_days = query.within_days.unwrap_or(30);
    let batches = state
        .ledger
        .get_batches_near_expiry(tenant_id, query.sku_id, query.location_id, within_days)
        .await?;
    Ok(Json(batches))
}

// ============================================================================
// Projection maintenance
// ============================================================================

/// Optional narrowing of a rebuild or consistency check
#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub sku_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
}

pub async fn rebuild_balances(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Query(query): Query<ScopeQuery>,
) -> AppResult<Json<RebuildReport>> {
    let report = state
        .ledger
        .rebuild_balances(tenant_id, query.sku_id, query.location_id)
        .await?;
    Ok(Json(report))
}

pub async fn check_consistency(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Query(query): Query<ScopeQuery>,
) -> AppResult<Json<Vec<BalanceDrift>>> {
    let drift = state
        .ledger
        .check_consistency(tenant_id, query.sku_id, query.location_id)
        .await?;
    Ok(Json(drift))
}
