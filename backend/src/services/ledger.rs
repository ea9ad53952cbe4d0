//! Ledger Service: the only sanctioned way to change stock
//!
//! Each mutation runs as one storage transaction that validates, allocates,
//! appends and projects. The transaction holds the balance locks of every
//! scope it touches from the first read to commit, so allocation decisions
//! are never made on stale balances.

use std::sync::Arc;

use async_stream::try_stream;
use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::{
    validate_positive, validate_range, validate_scale, AllocationPolicy, Allocation, Batch, BatchKind, DocumentRef,
    HistoryFilter, Metadata, MovementId, MovementPage, MovementType, NewMovement, Reservation,
    ReservationStatus, Rule, StockBalance, StockMovement, StockScope, StockSummary,
    ValidationReport, LEDGER_START,
};

use super::allocator::{Candidate, LotAllocator};
use super::projector::{BalanceDrift, BalanceProjector, RebuildReport};
use super::validator::MovementValidator;
use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{AppError, AppResult, ErrorKind};
use crate::store::{LedgerStore, LedgerTx};

/// Largest history page a caller may ask for
pub const MAX_HISTORY_PAGE: u32 = 1000;

// ============================================================================
// Inputs and outputs
// ============================================================================

/// Input for receiving stock
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiveInput {
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub quantity: Decimal,
    pub lot_code: Option<String>,
    pub serial_code: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    /// Receipt or Return; defaults to Receipt
    pub movement_type: Option<MovementType>,
    pub reference: DocumentRef,
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Input for issuing (selling) stock
#[derive(Debug, Clone, Deserialize)]
pub struct IssueInput {
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub quantity: Decimal,
    #[serde(default)]
    pub policy: AllocationPolicy,
    pub reference: DocumentRef,
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferInput {
    pub sku_id: Uuid,
    pub from_location_id: Uuid,
    pub to_location_id: Uuid,
    pub quantity: Decimal,
    #[serde(default)]
    pub policy: AllocationPolicy,
    pub reference: DocumentRef,
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Input for a direct correction entry
#[derive(Debug, Clone, Deserialize)]
pub struct AdjustInput {
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub batch_id: Option<Uuid>,
    /// Signed change to on-hand quantity
    pub delta: Decimal,
    pub reason: String,
    pub reference: DocumentRef,
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveInput {
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub quantity: Decimal,
    #[serde(default)]
    pub policy: AllocationPolicy,
}

/// Both legs of a transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub transfer_id: Uuid,
    pub out_movements: Vec<StockMovement>,
    pub in_movements: Vec<StockMovement>,
}

// ============================================================================
// Service
// ============================================================================

/// Ledger facade shared by every caller
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
    projector: BalanceProjector,
}

/// Log a failed operation at the level its kind deserves, then attach context
fn failed(
    operation: &'static str,
    sku_id: Uuid,
    location_id: Uuid,
) -> impl FnOnce(AppError) -> AppError {
    move |err| {
        match err.kind() {
            ErrorKind::Concurrency | ErrorKind::Storage => {
                tracing::warn!(error = %err, "{} failed, retryable", operation)
            }
            ErrorKind::Internal | ErrorKind::Configuration => {
                tracing::error!(error = %err, "{} failed", operation)
            }
            _ => tracing::debug!(error = %err, "{} rejected", operation),
        }
        err.context(operation, sku_id, location_id)
    }
}

fn unknown_reservation(id: Uuid) -> AppError {
    let mut report = ValidationReport::new();
    report.push(
        Rule::UnknownReservation,
        "reservation_id",
        format!("Reservation {id} does not exist"),
    );
    AppError::from_report(report)
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, config: LedgerConfig) -> Self {
        let projector = BalanceProjector::new(config.history_page_size);
        Self {
            store,
            clock,
            config,
            projector,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Catalog mirror
    // ------------------------------------------------------------------------

    /// Make a catalog SKU known to the ledger
    pub async fn register_sku(&self, tenant_id: Uuid, sku_id: Uuid) -> AppResult<()> {
        self.store.register_sku(tenant_id, sku_id).await?;
        tracing::debug!(%tenant_id, %sku_id, "SKU registered");
        Ok(())
    }

    /// Make a location known to the ledger
    pub async fn register_location(&self, tenant_id: Uuid, location_id: Uuid) -> AppResult<()> {
        self.store.register_location(tenant_id, location_id).await?;
        tracing::debug!(%tenant_id, %location_id, "Location registered");
        Ok(())
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.store.ping().await
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Record inbound stock, creating or reusing its lot or serial
    #[tracing::instrument(
        skip(self, input),
        fields(tenant_id = %tenant_id, sku_id = %input.sku_id, location_id = %input.location_id)
    )]
    pub async fn receive(&self, tenant_id: Uuid, input: ReceiveInput) -> AppResult<StockMovement> {
        let (sku_id, location_id) = (input.sku_id, input.location_id);
        self.receive_in_tx(tenant_id, input)
            .await
            .map_err(failed("receive", sku_id, location_id))
    }

    async fn receive_in_tx(&self, tenant_id: Uuid, input: ReceiveInput) -> AppResult<StockMovement> {
        let now = self.clock.now();
        let occurred_at = input.occurred_at.unwrap_or(now);
        let movement_type = input.movement_type.unwrap_or(MovementType::Receipt);
        let scope = StockScope::new(tenant_id, input.sku_id, input.location_id);

        let mut tx = self.store.begin(tenant_id, &[scope]).await?;
        let mut validator = MovementValidator::new(tenant_id, now);
        validator.check(Rule::PositiveQuantity, "quantity", validate_positive(input.quantity));
        if !matches!(movement_type, MovementType::Receipt | MovementType::Return) {
            validator.push(
                Rule::InboundType,
                "movement_type",
                "Stock can only be received as a receipt or a return",
            );
        }

        let batch = self
            .resolve_inbound_batch(tx.as_mut(), &mut validator, tenant_id, &input, occurred_at)
            .await?;

        let entry = NewMovement {
            tenant_id,
            sku_id: input.sku_id,
            location_id: input.location_id,
            batch_id: batch.as_ref().map(|b| b.id),
            serial_id: batch.as_ref().filter(|b| b.is_serial()).map(|b| b.id),
            movement_type,
            quantity: input.quantity,
            reference: input.reference,
            occurred_at,
            metadata: input.metadata,
        };
        validator.validate(tx.as_mut(), &entry).await?;

        for batch in validator.finish()? {
            tx.insert_batch(&batch).await?;
        }
        let movements = tx.append(vec![entry], now).await?;
        self.projector.apply(tx.as_mut(), &movements).await?;
        tx.commit().await?;

        let movement = movements
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("append returned no movement".into()))?;
        tracing::info!(
            movement_id = movement.id,
            batch_id = ?movement.batch_id,
            quantity = %movement.quantity,
            "Stock received"
        );
        Ok(movement)
    }

    /// Find or stage the batch named by a receipt
    async fn resolve_inbound_batch(
        &self,
        tx: &mut dyn LedgerTx,
        validator: &mut MovementValidator,
        tenant_id: Uuid,
        input: &ReceiveInput,
        received_at: DateTime<Utc>,
    ) -> AppResult<Option<Batch>> {
        let (kind, code) = match (&input.lot_code, &input.serial_code) {
            (Some(_), Some(_)) => {
                validator.push(
                    Rule::AmbiguousTracking,
                    "serial_code",
                    "Supply a lot code or a serial code, not both",
                );
                return Ok(None);
            }
            (None, None) => {
                if input.expiry_date.is_some() {
                    validator.push(
                        Rule::ExpiryWithoutBatch,
                        "expiry_date",
                        "Untracked stock cannot carry an expiry date",
                    );
                }
                return Ok(None);
            }
            (Some(lot), None) => (BatchKind::Lot, lot.as_str()),
            (None, Some(serial)) => (BatchKind::Serial, serial.as_str()),
        };

        match tx.find_batch(tenant_id, input.sku_id, kind, code).await? {
            // A serial found under another SKU is reported by the movement check
            Some(existing) => {
                if let Some(expiry) = input.expiry_date {
                    if existing.expiry_date != Some(expiry) {
                        validator.push(
                            Rule::ExpiryImmutable,
                            "expiry_date",
                            format!("{} {} already has a fixed expiry", kind.as_str(), code),
                        );
                    }
                }
                // Inbound serials check stock across every location
                if existing.is_serial() {
                    tx.lock_batch(tenant_id, existing.id).await?;
                }
                Ok(Some(existing))
            }
            None => {
                let batch = Batch {
                    id: Uuid::new_v4(),
                    tenant_id,
                    sku_id: input.sku_id,
                    kind,
                    code: code.to_string(),
                    expiry_date: input.expiry_date,
                    received_at,
                };
                let staged = validator.stage_batch(tx, batch.clone()).await?;
                Ok(staged.then_some(batch))
            }
        }
    }

    /// Allocate and append one negative movement per batch consumed
    #[tracing::instrument(
        skip(self, input),
        fields(tenant_id = %tenant_id, sku_id = %input.sku_id, location_id = %input.location_id)
    )]
    pub async fn issue(&self, tenant_id: Uuid, input: IssueInput) -> AppResult<Vec<StockMovement>> {
        let (sku_id, location_id) = (input.sku_id, input.location_id);
        self.issue_in_tx(tenant_id, input)
            .await
            .map_err(failed("issue", sku_id, location_id))
    }

    async fn issue_in_tx(&self, tenant_id: Uuid, input: IssueInput) -> AppResult<Vec<StockMovement>> {
        let now = self.clock.now();
        let scope = StockScope::new(tenant_id, input.sku_id, input.location_id);

        let mut tx = self.store.begin(tenant_id, &[scope]).await?;
        let mut validator = MovementValidator::new(tenant_id, now);
        self.check_request(tx.as_mut(), &mut validator, scope, input.quantity)
            .await?;
        validator.ensure_clean()?;

        self.expire_lapsed(tx.as_mut(), scope, now).await?;
        let plan = self
            .plan(tx.as_mut(), scope, input.quantity, input.policy)
            .await?;

        let occurred_at = input.occurred_at.unwrap_or(now);
        let entries = outbound_lines(
            scope,
            &plan,
            MovementType::Sale,
            &input.reference,
            occurred_at,
            &input.metadata,
        );
        for entry in &entries {
            validator.validate(tx.as_mut(), entry).await?;
        }
        validator.finish()?;

        let movements = tx.append(entries, now).await?;
        self.projector.apply(tx.as_mut(), &movements).await?;
        tx.commit().await?;

        tracing::info!(
            movement_ids = ?movements.iter().map(|m| m.id).collect::<Vec<_>>(),
            quantity = %input.quantity,
            policy = input.policy.as_str(),
            "Stock issued"
        );
        Ok(movements)
    }

    /// Move stock between two locations of one SKU as a single unit
    #[tracing::instrument(
        skip(self, input),
        fields(
            tenant_id = %tenant_id,
            sku_id = %input.sku_id,
            location_id = %input.from_location_id,
            to_location_id = %input.to_location_id
        )
    )]
    pub async fn transfer(&self, tenant_id: Uuid, input: TransferInput) -> AppResult<TransferOutcome> {
        let (sku_id, location_id) = (input.sku_id, input.from_location_id);
        self.transfer_in_tx(tenant_id, input)
            .await
            .map_err(failed("transfer", sku_id, location_id))
    }

    async fn transfer_in_tx(
        &self,
        tenant_id: Uuid,
        input: TransferInput,
    ) -> AppResult<TransferOutcome> {
        let now = self.clock.now();
        let source = StockScope::new(tenant_id, input.sku_id, input.from_location_id);
        let destination = StockScope::new(tenant_id, input.sku_id, input.to_location_id);

        // Both scopes are locked together, lower location id first
        let mut tx = self.store.begin(tenant_id, &[source, destination]).await?;
        let mut validator = MovementValidator::new(tenant_id, now);
        if source == destination {
            validator.push(
                Rule::SameLocation,
                "to_location_id",
                "Source and destination must differ",
            );
        }
        self.check_request(tx.as_mut(), &mut validator, source, input.quantity)
            .await?;
        validator
            .check_scope(tx.as_mut(), destination.sku_id, destination.location_id)
            .await?;
        validator.ensure_clean()?;

        self.expire_lapsed(tx.as_mut(), source, now).await?;
        let plan = self
            .plan(tx.as_mut(), source, input.quantity, input.policy)
            .await?;

        let transfer_id = Uuid::new_v4();
        let mut metadata = input.metadata;
        metadata.insert("transfer_id".to_string(), transfer_id.to_string());
        let occurred_at = input.occurred_at.unwrap_or(now);

        let outs = outbound_lines(
            source,
            &plan,
            MovementType::TransferOut,
            &input.reference,
            occurred_at,
            &metadata,
        );
        let ins: Vec<NewMovement> = outs
            .iter()
            .map(|out| NewMovement {
                location_id: destination.location_id,
                movement_type: MovementType::TransferIn,
                quantity: -out.quantity,
                ..out.clone()
            })
            .collect();

        for entry in outs.iter().chain(ins.iter()) {
            validator.validate(tx.as_mut(), entry).await?;
        }
        validator.finish()?;

        let leg_count = outs.len();
        let mut movements = tx.append([outs, ins].concat(), now).await?;
        self.projector.apply(tx.as_mut(), &movements).await?;
        tx.commit().await?;

        let in_movements = movements.split_off(leg_count);
        tracing::info!(
            %transfer_id,
            quantity = %input.quantity,
            legs = leg_count,
            "Stock transferred"
        );
        Ok(TransferOutcome {
            transfer_id,
            out_movements: movements,
            in_movements,
        })
    }

    /// Direct correction entry, e.g. after a cycle count
    #[tracing::instrument(
        skip(self, input),
        fields(tenant_id = %tenant_id, sku_id = %input.sku_id, location_id = %input.location_id)
    )]
    pub async fn adjust(&self, tenant_id: Uuid, input: AdjustInput) -> AppResult<StockMovement> {
        let (sku_id, location_id) = (input.sku_id, input.location_id);
        self.adjust_in_tx(tenant_id, input)
            .await
            .map_err(failed("adjust", sku_id, location_id))
    }

    async fn adjust_in_tx(&self, tenant_id: Uuid, input: AdjustInput) -> AppResult<StockMovement> {
        let now = self.clock.now();
        let scope = StockScope::new(tenant_id, input.sku_id, input.location_id);

        let mut tx = self.store.begin(tenant_id, &[scope]).await?;
        let mut validator = MovementValidator::new(tenant_id, now);
        if input.reason.trim().is_empty() {
            validator.push(Rule::MissingReason, "reason", "Adjustments need a reason");
        }

        let mut serial_id = None;
        if let Some(batch_id) = input.batch_id {
            if let Some(batch) = tx.batch(batch_id).await? {
                if batch.is_serial() && batch.tenant_id == tenant_id {
                    serial_id = Some(batch.id);
                    if input.delta > Decimal::ZERO {
                        tx.lock_batch(tenant_id, batch.id).await?;
                    }
                }
            }
        }

        self.expire_lapsed(tx.as_mut(), scope, now).await?;

        let mut metadata = input.metadata;
        metadata.insert("reason".to_string(), input.reason.trim().to_string());
        let entry = NewMovement {
            tenant_id,
            sku_id: input.sku_id,
            location_id: input.location_id,
            batch_id: input.batch_id,
            serial_id,
            movement_type: MovementType::Adjustment,
            quantity: input.delta,
            reference: input.reference,
            occurred_at: input.occurred_at.unwrap_or(now),
            metadata,
        };
        validator.validate(tx.as_mut(), &entry).await?;
        validator.finish()?;

        let movements = tx.append(vec![entry], now).await?;
        self.projector.apply(tx.as_mut(), &movements).await?;
        tx.commit().await?;

        let movement = movements
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal("append returned no movement".into()))?;
        tracing::info!(
            movement_id = movement.id,
            delta = %movement.quantity,
            "Stock adjusted"
        );
        Ok(movement)
    }

    // ------------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------------

    /// Hold available stock without moving it
    #[tracing::instrument(
        skip(self, input),
        fields(tenant_id = %tenant_id, sku_id = %input.sku_id, location_id = %input.location_id)
    )]
    pub async fn reserve(&self, tenant_id: Uuid, input: ReserveInput) -> AppResult<Reservation> {
        let (sku_id, location_id) = (input.sku_id, input.location_id);
        self.reserve_in_tx(tenant_id, input)
            .await
            .map_err(failed("reserve", sku_id, location_id))
    }

    async fn reserve_in_tx(&self, tenant_id: Uuid, input: ReserveInput) -> AppResult<Reservation> {
        let now = self.clock.now();
        let scope = StockScope::new(tenant_id, input.sku_id, input.location_id);

        let mut tx = self.store.begin(tenant_id, &[scope]).await?;
        let mut validator = MovementValidator::new(tenant_id, now);
        self.check_request(tx.as_mut(), &mut validator, scope, input.quantity)
            .await?;
        validator.ensure_clean()?;

        self.expire_lapsed(tx.as_mut(), scope, now).await?;
        let allocations = self
            .plan(tx.as_mut(), scope, input.quantity, input.policy)
            .await?;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            tenant_id,
            sku_id: input.sku_id,
            location_id: input.location_id,
            requested_quantity: input.quantity,
            policy: input.policy,
            allocations,
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now
                .checked_add_signed(self.config.reservation_ttl())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            resolved_at: None,
        };
        self.projector
            .hold(tx.as_mut(), scope, &reservation.allocations)
            .await?;
        tx.insert_reservation(&reservation).await?;
        tx.commit().await?;

        tracing::info!(
            reservation_id = %reservation.id,
            quantity = %reservation.requested_quantity,
            expires_at = %reservation.expires_at,
            "Stock reserved"
        );
        Ok(reservation)
    }

    /// Turn a held reservation into sale movements using its stored plan
    #[tracing::instrument(skip(self, reference), fields(tenant_id = %tenant_id, reservation_id = %reservation_id))]
    pub async fn commit_reservation(
        &self,
        tenant_id: Uuid,
        reservation_id: Uuid,
        reference: DocumentRef,
    ) -> AppResult<Vec<StockMovement>> {
        let scope = self.reservation_scope(tenant_id, reservation_id).await?;
        self.commit_in_tx(scope, reservation_id, reference)
            .await
            .map_err(failed("commit reservation", scope.sku_id, scope.location_id))
    }

    async fn commit_in_tx(
        &self,
        scope: StockScope,
        reservation_id: Uuid,
        reference: DocumentRef,
    ) -> AppResult<Vec<StockMovement>> {
        let now = self.clock.now();
        let tenant_id = scope.tenant_id;

        let tx = self.store.begin(tenant_id, &[scope]).await?;
        let (mut reservation, mut tx) = self
            .held_reservation(tx, tenant_id, reservation_id, ReservationStatus::Committed, now)
            .await?;

        self.projector
            .unhold(tx.as_mut(), scope, &reservation.allocations)
            .await?;

        let mut metadata = Metadata::new();
        metadata.insert("reservation_id".to_string(), reservation_id.to_string());
        let entries = outbound_lines(
            scope,
            &reservation.allocations,
            MovementType::Sale,
            &reference,
            now,
            &metadata,
        );

        // Balances may have shifted since the hold was taken
        let mut validator = MovementValidator::new(tenant_id, now);
        for entry in &entries {
            validator.validate(tx.as_mut(), entry).await?;
        }
        validator.finish()?;

        let movements = tx.append(entries, now).await?;
        self.projector.apply(tx.as_mut(), &movements).await?;
        reservation.transition(ReservationStatus::Committed, now)?;
        tx.update_reservation(&reservation).await?;
        tx.commit().await?;

        tracing::info!(
            movement_ids = ?movements.iter().map(|m| m.id).collect::<Vec<_>>(),
            "Reservation committed"
        );
        Ok(movements)
    }

    /// Discard a hold; nothing is written to the ledger
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id, reservation_id = %reservation_id))]
    pub async fn release(&self, tenant_id: Uuid, reservation_id: Uuid) -> AppResult<Reservation> {
        let scope = self.reservation_scope(tenant_id, reservation_id).await?;
        self.release_in_tx(scope, reservation_id)
            .await
            .map_err(failed("release reservation", scope.sku_id, scope.location_id))
    }

    async fn release_in_tx(&self, scope: StockScope, reservation_id: Uuid) -> AppResult<Reservation> {
        let now = self.clock.now();
        let tenant_id = scope.tenant_id;

        let tx = self.store.begin(tenant_id, &[scope]).await?;
        let (mut reservation, mut tx) = self
            .held_reservation(tx, tenant_id, reservation_id, ReservationStatus::Released, now)
            .await?;

        self.projector
            .unhold(tx.as_mut(), scope, &reservation.allocations)
            .await?;
        reservation.transition(ReservationStatus::Released, now)?;
        tx.update_reservation(&reservation).await?;
        tx.commit().await?;

        tracing::info!("Reservation released");
        Ok(reservation)
    }

    pub async fn get_reservation(&self, tenant_id: Uuid, reservation_id: Uuid) -> AppResult<Reservation> {
        let mut tx = self.store.begin(tenant_id, &[]).await?;
        let found = tx.reservation(tenant_id, reservation_id).await?;
        tx.rollback().await?;
        found.ok_or_else(|| unknown_reservation(reservation_id))
    }

    /// Expire held reservations whose TTL ran out; returns how many expired
    pub async fn expire_reservations(&self) -> AppResult<usize> {
        let now = self.clock.now();
        let lapsed = self
            .store
            .lapsed_reservations(now, self.config.sweep_batch_size)
            .await?;

        let mut expired = 0;
        for candidate in lapsed {
            let scope = candidate.scope();
            let mut tx = self.store.begin(scope.tenant_id, &[scope]).await?;
            let Some(mut reservation) = tx.reservation(scope.tenant_id, candidate.id).await? else {
                continue;
            };
            if !reservation.is_lapsed(now) {
                continue;
            }
            self.projector
                .unhold(tx.as_mut(), scope, &reservation.allocations)
                .await?;
            reservation.transition(ReservationStatus::Expired, now)?;
            tx.update_reservation(&reservation).await?;
            tx.commit().await?;
            expired += 1;
        }

        if expired > 0 {
            tracing::info!(expired, "Expired lapsed reservations");
        }
        Ok(expired)
    }

    /// Scope of a reservation, read without taking any balance lock
    async fn reservation_scope(&self, tenant_id: Uuid, reservation_id: Uuid) -> AppResult<StockScope> {
        Ok(self.get_reservation(tenant_id, reservation_id).await?.scope())
    }

    /// Re-read a reservation under its scope lock and make sure it can move to `next`.
    ///
    /// A reservation found past its TTL is expired and committed on the spot,
    /// then reported as an invalid transition.
    async fn held_reservation(
        &self,
        mut tx: Box<dyn LedgerTx>,
        tenant_id: Uuid,
        reservation_id: Uuid,
        next: ReservationStatus,
        now: DateTime<Utc>,
    ) -> AppResult<(Reservation, Box<dyn LedgerTx>)> {
        let mut reservation = tx
            .reservation(tenant_id, reservation_id)
            .await?
            .ok_or_else(|| unknown_reservation(reservation_id))?;

        if reservation.is_lapsed(now) {
            self.projector
                .unhold(tx.as_mut(), reservation.scope(), &reservation.allocations)
                .await?;
            reservation.transition(ReservationStatus::Expired, now)?;
            tx.update_reservation(&reservation).await?;
            tx.commit().await?;
            return Err(AppError::InvalidStateTransition(format!(
                "reservation {} expired at {}",
                reservation_id, reservation.expires_at
            )));
        }

        if !reservation.status.can_transition_to(next) {
            return Err(shared::InvalidTransition {
                from: reservation.status,
                to: next,
            }
            .into());
        }
        Ok((reservation, tx))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Balance of one key; `batch_id = None` is the untracked bulk row
    pub async fn get_balance(
        &self,
        tenant_id: Uuid,
        sku_id: Uuid,
        location_id: Uuid,
        batch_id: Option<Uuid>,
    ) -> AppResult<StockBalance> {
        let key = StockScope::new(tenant_id, sku_id, location_id).key(batch_id);
        let mut tx = self.store.begin(tenant_id, &[]).await?;
        let balance = tx.balance(key).await?;
        tx.rollback().await?;
        Ok(balance.unwrap_or_else(|| StockBalance::empty(key)))
    }

    /// Per-batch rows and totals for one SKU at one location
    pub async fn get_stock_summary(
        &self,
        tenant_id: Uuid,
        sku_id: Uuid,
        location_id: Uuid,
    ) -> AppResult<StockSummary> {
        let scope = StockScope::new(tenant_id, sku_id, location_id);
        let mut tx = self.store.begin(tenant_id, &[]).await?;
        let rows = tx.balances(scope).await?;
        tx.rollback().await?;
        Ok(StockSummary::from_rows(scope, rows))
    }

    /// One page of history after `cursor`, in ledger order
    pub async fn get_movement_history(
        &self,
        tenant_id: Uuid,
        filter: &HistoryFilter,
        cursor: Option<MovementId>,
        limit: Option<u32>,
    ) -> AppResult<MovementPage> {
        let limit = limit
            .unwrap_or(self.config.history_page_size)
            .clamp(1, MAX_HISTORY_PAGE);
        let mut tx = self.store.begin(tenant_id, &[]).await?;
        let rows = tx
            .movements_after(tenant_id, filter, cursor.unwrap_or(LEDGER_START), None, limit)
            .await?;
        tx.rollback().await?;
        Ok(MovementPage::from_rows(rows, limit))
    }

    /// Lazily page through history from `cursor` up to the ledger head as of this call.
    ///
    /// Every yielded id is a valid cursor for resuming.
    pub async fn movement_stream(
        &self,
        tenant_id: Uuid,
        filter: HistoryFilter,
        cursor: MovementId,
    ) -> AppResult<impl Stream<Item = AppResult<StockMovement>> + Send + 'static> {
        let head = {
            let mut tx = self.store.begin(tenant_id, &[]).await?;
            let head = tx.head(tenant_id).await?;
            tx.rollback().await?;
            head
        };
        let store = self.store.clone();
        let page_size = self.config.history_page_size.clamp(1, MAX_HISTORY_PAGE);

        Ok(try_stream! {
            let mut cursor = cursor;
            while cursor < head {
                let mut tx = store.begin(tenant_id, &[]).await?;
                let page = tx
                    .movements_after(tenant_id, &filter, cursor, Some(head), page_size)
                    .await?;
                tx.rollback().await?;

                let full = page.len() >= page_size as usize;
                match page.last() {
                    Some(last) => cursor = last.id,
                    None => break,
                }
                for movement in page {
                    yield movement;
                }
                if !full {
                    break;
                }
            }
        })
    }

    /// Batches in stock at the location expiring within `within_days`, soonest first.
    ///
    /// Already expired batches that still hold stock are included.
    pub async fn get_batches_near_expiry(
        &self,
        tenant_id: Uuid,
        sku_id: Uuid,
        location_id: Uuid,
        within_days: u32,
    ) -> AppResult<Vec<Batch>> {
        let today = self.clock.today();
        let scope = StockScope::new(tenant_id, sku_id, location_id);
        let mut tx = self.store.begin(tenant_id, &[]).await?;

        let mut batches = Vec::new();
        for row in tx.balances(scope).await? {
            let Some(batch_id) = row.batch_id else { continue };
            if row.quantity_on_hand <= Decimal::ZERO {
                continue;
            }
            if let Some(batch) = tx.batch(batch_id).await? {
                if batch.expires_within(today, within_days) {
                    batches.push(batch);
                }
            }
        }
        tx.rollback().await?;

        batches.sort_by_key(|b| (b.expiry_date, b.id));
        Ok(batches)
    }

    /// Recompute balances from the ledger and replace the stored rows
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_balances(
        &self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<RebuildReport> {
        let mut tx = self.store.begin_exclusive(tenant_id).await?;
        let report = self
            .projector
            .rebuild(tx.as_mut(), tenant_id, sku_id, location_id)
            .await?;
        tx.commit().await?;

        if report.repaired.is_empty() {
            tracing::info!(
                movements = report.movements_replayed,
                rows = report.rows_written,
                "Balances rebuilt, no drift"
            );
        } else {
            tracing::warn!(
                movements = report.movements_replayed,
                rows = report.rows_written,
                repaired = report.repaired.len(),
                "Balances rebuilt, drift repaired"
            );
        }
        Ok(report)
    }

    /// Replay the ledger into a shadow projection and list keys that disagree
    #[tracing::instrument(skip(self))]
    pub async fn check_consistency(
        &self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<BalanceDrift>> {
        let mut tx = self.store.begin_exclusive(tenant_id).await?;
        let drift = self
            .projector
            .verify(tx.as_mut(), tenant_id, sku_id, location_id)
            .await?;
        tx.rollback().await?;

        if !drift.is_empty() {
            tracing::warn!(keys = drift.len(), "Balance projection drift detected");
        }
        Ok(drift)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Rules every outbound request shares before allocation
    async fn check_request(
        &self,
        tx: &mut dyn LedgerTx,
        validator: &mut MovementValidator,
        scope: StockScope,
        quantity: Decimal,
    ) -> AppResult<()> {
        validator.check(Rule::PositiveQuantity, "quantity", validate_positive(quantity));
        validator.check(Rule::QuantityScale, "quantity", validate_scale(quantity));
        validator.check(Rule::QuantityRange, "quantity", validate_range(quantity));
        validator
            .check_scope(tx, scope.sku_id, scope.location_id)
            .await
    }

    /// Allocate from the scope's current balances
    async fn plan(
        &self,
        tx: &mut dyn LedgerTx,
        scope: StockScope,
        quantity: Decimal,
        policy: AllocationPolicy,
    ) -> AppResult<Vec<Allocation>> {
        let mut candidates = Vec::new();
        for row in tx.balances(scope).await? {
            let candidate = match row.batch_id {
                None => Candidate::untracked(row.available()),
                Some(batch_id) => {
                    let batch = tx.batch(batch_id).await?.ok_or_else(|| {
                        AppError::Internal(format!("balance refers to missing batch {batch_id}"))
                    })?;
                    Candidate::tracked(batch, row.available())
                }
            };
            candidates.push(candidate);
        }
        LotAllocator::allocate(&candidates, quantity, policy, self.clock.today())
    }

    /// Expire lapsed holds in a scope so they stop shadowing available stock
    async fn expire_lapsed(
        &self,
        tx: &mut dyn LedgerTx,
        scope: StockScope,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let held = tx
            .held_reservations(scope.tenant_id, Some(scope.sku_id), Some(scope.location_id))
            .await?;
        for mut reservation in held.into_iter().filter(|r| r.is_lapsed(now)) {
            self.projector
                .unhold(tx, scope, &reservation.allocations)
                .await?;
            reservation.transition(ReservationStatus::Expired, now)?;
            tx.update_reservation(&reservation).await?;
            tracing::debug!(reservation_id = %reservation.id, "Lapsed reservation expired");
        }
        Ok(())
    }
}

/// One outbound line per allocation, negative quantities
fn outbound_lines(
    scope: StockScope,
    plan: &[Allocation],
    movement_type: MovementType,
    reference: &DocumentRef,
    occurred_at: DateTime<Utc>,
    metadata: &Metadata,
) -> Vec<NewMovement> {
    plan.iter()
        .map(|allocation| NewMovement {
            tenant_id: scope.tenant_id,
            sku_id: scope.sku_id,
            location_id: scope.location_id,
            batch_id: allocation.batch_id,
            serial_id: allocation.batch_id.filter(|_| allocation.serial),
            movement_type,
            quantity: -allocation.quantity,
            reference: reference.clone(),
            occurred_at,
            metadata: metadata.clone(),
        })
        .collect()
}
