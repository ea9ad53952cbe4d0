//! PostgreSQL ledger store
//!
//! Scope and tenant locks are transaction-scoped advisory locks, so they are
//! released by COMMIT or ROLLBACK and never outlive a crashed connection.
//! `lock_timeout` bounds every lock wait; a timeout surfaces as SQLSTATE
//! 55P03 and maps to a concurrency error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{types::Json, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use shared::{
    Allocation, AllocationPolicy, BalanceKey, Batch, BatchKind, HistoryFilter, Metadata,
    MovementId, MovementType, NewMovement, Reservation, ReservationStatus, Rule, StockBalance,
    StockMovement, StockScope, ValidationReport, LEDGER_START,
};

use super::{lock_order, tenant_lock_name, LedgerStore, LedgerTx, LockKey};
use crate::config::LedgerConfig;
use crate::error::{AppError, AppResult};

const MOVEMENT_COLUMNS: &str = "id, tenant_id, sku_id, location_id, batch_id, serial_id, \
     movement_type, quantity, reference_type, reference_id, occurred_at, recorded_at, metadata";

const BATCH_COLUMNS: &str = "id, tenant_id, sku_id, kind, code, expiry_date, received_at";

const BALANCE_COLUMNS: &str = "tenant_id, sku_id, location_id, batch_id, quantity_on_hand, \
     quantity_reserved, last_movement_id";

const RESERVATION_COLUMNS: &str = "id, tenant_id, sku_id, location_id, requested_quantity, \
     policy, allocations, status, created_at, expires_at, resolved_at";

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct MovementRow {
    id: i64,
    tenant_id: Uuid,
    sku_id: Uuid,
    location_id: Uuid,
    batch_id: Option<Uuid>,
    serial_id: Option<Uuid>,
    movement_type: String,
    quantity: Decimal,
    reference_type: String,
    reference_id: String,
    occurred_at: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
    metadata: Json<Metadata>,
}

impl TryFrom<MovementRow> for StockMovement {
    type Error = AppError;

    fn try_from(row: MovementRow) -> Result<Self, Self::Error> {
        let movement_type = MovementType::from_str(&row.movement_type).ok_or_else(|| {
            AppError::Internal(format!("unknown movement type {}", row.movement_type))
        })?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            sku_id: row.sku_id,
            location_id: row.location_id,
            batch_id: row.batch_id,
            serial_id: row.serial_id,
            movement_type,
            quantity: row.quantity.normalize(),
            reference_type: row.reference_type,
            reference_id: row.reference_id,
            occurred_at: row.occurred_at,
            recorded_at: row.recorded_at,
            metadata: row.metadata.0,
        })
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    id: Uuid,
    tenant_id: Uuid,
    sku_id: Uuid,
    kind: String,
    code: String,
    expiry_date: Option<NaiveDate>,
    received_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for Batch {
    type Error = AppError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        let kind = BatchKind::from_str(&row.kind)
            .ok_or_else(|| AppError::Internal(format!("unknown batch kind {}", row.kind)))?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            sku_id: row.sku_id,
            kind,
            code: row.code,
            expiry_date: row.expiry_date,
            received_at: row.received_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct BalanceRow {
    tenant_id: Uuid,
    sku_id: Uuid,
    location_id: Uuid,
    batch_id: Option<Uuid>,
    quantity_on_hand: Decimal,
    quantity_reserved: Decimal,
    last_movement_id: Option<i64>,
}

impl From<BalanceRow> for StockBalance {
    fn from(row: BalanceRow) -> Self {
        Self {
            tenant_id: row.tenant_id,
            sku_id: row.sku_id,
            location_id: row.location_id,
            batch_id: row.batch_id,
            quantity_on_hand: row.quantity_on_hand.normalize(),
            quantity_reserved: row.quantity_reserved.normalize(),
            last_movement_id: row.last_movement_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: Uuid,
    tenant_id: Uuid,
    sku_id: Uuid,
    location_id: Uuid,
    requested_quantity: Decimal,
    policy: String,
    allocations: Json<Vec<Allocation>>,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = AppError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let policy = AllocationPolicy::from_str(&row.policy)
            .ok_or_else(|| AppError::Internal(format!("unknown policy {}", row.policy)))?;
        let status = ReservationStatus::from_str(&row.status)
            .ok_or_else(|| AppError::Internal(format!("unknown status {}", row.status)))?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            sku_id: row.sku_id,
            location_id: row.location_id,
            requested_quantity: row.requested_quantity.normalize(),
            policy,
            allocations: row.allocations.0,
            status,
            created_at: row.created_at,
            expires_at: row.expires_at,
            resolved_at: row.resolved_at,
        })
    }
}

fn collect<R, T>(rows: Vec<R>) -> AppResult<Vec<T>>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ============================================================================
// Store
// ============================================================================

/// Ledger store backed by PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool, config: &LedgerConfig) -> Self {
        Self {
            pool,
            lock_timeout: config.lock_timeout(),
        }
    }

    async fn open(&self) -> AppResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters
        let sql = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis().max(1)
        );
        sqlx::query(&sql).execute(&mut *tx).await?;
        Ok(tx)
    }

    async fn register(
        &self,
        table: &'static str,
        field: &'static str,
        tenant_id: Uuid,
        id: Uuid,
    ) -> AppResult<()> {
        // A no-op update makes RETURNING report the existing owner
        let sql = format!(
            "INSERT INTO {table} (id, tenant_id) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id \
             RETURNING tenant_id"
        );
        let owner = sqlx::query_scalar::<_, Uuid>(&sql)
            .bind(id)
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        if owner != tenant_id {
            let mut report = ValidationReport::new();
            report.push(
                Rule::CrossTenantReference,
                field,
                "Already registered to another tenant",
            );
            return Err(AppError::from_report(report));
        }
        Ok(())
    }
}

async fn advisory_lock(
    tx: &mut Transaction<'static, Postgres>,
    name: String,
    shared: bool,
) -> AppResult<()> {
    let sql = if shared {
        "SELECT pg_advisory_xact_lock_shared(hashtextextended($1, 0))"
    } else {
        "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))"
    };
    sqlx::query(sql).bind(&name).execute(&mut **tx).await.map_err(|e| {
        let err = AppError::from(e);
        if matches!(err, AppError::Concurrency(_)) {
            tracing::warn!(lock = %name, "Lock wait timed out");
        }
        err
    })?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self, tenant_id: Uuid, scopes: &[StockScope]) -> AppResult<Box<dyn LedgerTx>> {
        let mut tx = self.open().await?;
        advisory_lock(&mut tx, tenant_lock_name(tenant_id), true).await?;
        for scope in lock_order(scopes) {
            advisory_lock(&mut tx, LockKey::Scope(scope).name(), false).await?;
        }
        Ok(Box::new(PgLedgerTx { tx, tenant_id }))
    }

    async fn begin_exclusive(&self, tenant_id: Uuid) -> AppResult<Box<dyn LedgerTx>> {
        let mut tx = self.open().await?;
        advisory_lock(&mut tx, tenant_lock_name(tenant_id), false).await?;
        Ok(Box::new(PgLedgerTx { tx, tenant_id }))
    }

    async fn register_sku(&self, tenant_id: Uuid, sku_id: Uuid) -> AppResult<()> {
        self.register("catalog_skus", "sku_id", tenant_id, sku_id)
            .await
    }

    async fn register_location(&self, tenant_id: Uuid, location_id: Uuid) -> AppResult<()> {
        self.register("catalog_locations", "location_id", tenant_id, location_id)
            .await
    }

    async fn lapsed_reservations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE status = 'held' AND expires_at <= $1 \
             ORDER BY expires_at, id LIMIT $2"
        );
        let rows = sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Transaction over [`PgLedgerStore`]; dropping it rolls back
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    tenant_id: Uuid,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn sku_tenant(&mut self, sku_id: Uuid) -> AppResult<Option<Uuid>> {
        let owner = sqlx::query_scalar::<_, Uuid>("SELECT tenant_id FROM catalog_skus WHERE id = $1")
            .bind(sku_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(owner)
    }

    async fn location_tenant(&mut self, location_id: Uuid) -> AppResult<Option<Uuid>> {
        let owner =
            sqlx::query_scalar::<_, Uuid>("SELECT tenant_id FROM catalog_locations WHERE id = $1")
                .bind(location_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(owner)
    }

    async fn batch(&mut self, batch_id: Uuid) -> AppResult<Option<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM stock_batches WHERE id = $1");
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(batch_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Batch::try_from)
            .transpose()
    }

    async fn find_batch(
        &mut self,
        tenant_id: Uuid,
        sku_id: Uuid,
        kind: BatchKind,
        code: &str,
    ) -> AppResult<Option<Batch>> {
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM stock_batches \
             WHERE tenant_id = $1 AND kind = $3 AND code = $4 \
               AND (kind = 'serial' OR sku_id = $2)"
        );
        sqlx::query_as::<_, BatchRow>(&sql)
            .bind(tenant_id)
            .bind(sku_id)
            .bind(kind.as_str())
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Batch::try_from)
            .transpose()
    }

    async fn insert_batch(&mut self, batch: &Batch) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_batches (id, tenant_id, sku_id, kind, code, expiry_date, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(batch.id)
        .bind(batch.tenant_id)
        .bind(batch.sku_id)
        .bind(batch.kind.as_str())
        .bind(&batch.code)
        .bind(batch.expiry_date)
        .bind(batch.received_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_batch(&mut self, tenant_id: Uuid, batch_id: Uuid) -> AppResult<()> {
        sqlx::query("SELECT id FROM stock_batches WHERE id = $1 AND tenant_id = $2 FOR UPDATE")
            .bind(batch_id)
            .bind(tenant_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn balances(&mut self, scope: StockScope) -> AppResult<Vec<StockBalance>> {
        self.balances_matching(scope.tenant_id, Some(scope.sku_id), Some(scope.location_id))
            .await
    }

    async fn balance(&mut self, key: BalanceKey) -> AppResult<Option<StockBalance>> {
        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM stock_balances \
             WHERE tenant_id = $1 AND sku_id = $2 AND location_id = $3 \
               AND batch_id IS NOT DISTINCT FROM $4"
        );
        let row = sqlx::query_as::<_, BalanceRow>(&sql)
            .bind(key.tenant_id)
            .bind(key.sku_id)
            .bind(key.location_id)
            .bind(key.batch_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(StockBalance::from))
    }

    async fn balances_matching(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<StockBalance>> {
        let sql = format!(
            "SELECT {BALANCE_COLUMNS} FROM stock_balances \
             WHERE tenant_id = $1 \
               AND ($2::uuid IS NULL OR sku_id = $2) \
               AND ($3::uuid IS NULL OR location_id = $3) \
             ORDER BY sku_id, location_id, batch_id NULLS FIRST"
        );
        let rows = sqlx::query_as::<_, BalanceRow>(&sql)
            .bind(tenant_id)
            .bind(sku_id)
            .bind(location_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(StockBalance::from).collect())
    }

    async fn batch_on_hand(&mut self, tenant_id: Uuid, batch_id: Uuid) -> AppResult<Decimal> {
        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(quantity_on_hand), 0) FROM stock_balances \
             WHERE tenant_id = $1 AND batch_id = $2",
        )
        .bind(tenant_id)
        .bind(batch_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(total.normalize())
    }

    async fn put_balance(&mut self, balance: &StockBalance) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_balances (
                tenant_id, sku_id, location_id, batch_id,
                quantity_on_hand, quantity_reserved, last_movement_id, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT ON CONSTRAINT stock_balances_key DO UPDATE SET
                quantity_on_hand = EXCLUDED.quantity_on_hand,
                quantity_reserved = EXCLUDED.quantity_reserved,
                last_movement_id = EXCLUDED.last_movement_id,
                updated_at = NOW()
            "#,
        )
        .bind(balance.tenant_id)
        .bind(balance.sku_id)
        .bind(balance.location_id)
        .bind(balance.batch_id)
        .bind(balance.quantity_on_hand)
        .bind(balance.quantity_reserved)
        .bind(balance.last_movement_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_balances(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM stock_balances \
             WHERE tenant_id = $1 \
               AND ($2::uuid IS NULL OR sku_id = $2) \
               AND ($3::uuid IS NULL OR location_id = $3)",
        )
        .bind(tenant_id)
        .bind(sku_id)
        .bind(location_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append(
        &mut self,
        entries: Vec<NewMovement>,
        recorded_at: DateTime<Utc>,
    ) -> AppResult<Vec<StockMovement>> {
        if entries.is_empty() {
            return Err(AppError::Internal("append requires at least one entry".into()));
        }
        if entries.iter().any(|e| e.tenant_id != self.tenant_id) {
            let mut report = ValidationReport::new();
            report.push(
                Rule::CrossTenantReference,
                "tenant_id",
                "Movement belongs to another tenant",
            );
            return Err(AppError::from_report(report));
        }

        // The head row stays locked until commit; concurrent appends of the
        // tenant queue here, so ids follow commit order without gaps
        let count = entries.len() as i64;
        let last_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO ledger_heads (tenant_id, last_id) VALUES ($1, $2) \
             ON CONFLICT (tenant_id) DO UPDATE SET last_id = ledger_heads.last_id + EXCLUDED.last_id \
             RETURNING last_id",
        )
        .bind(self.tenant_id)
        .bind(count)
        .fetch_one(&mut *self.tx)
        .await?;

        let sql = format!(
            "INSERT INTO stock_movements ( \
                 id, tenant_id, sku_id, location_id, batch_id, serial_id, movement_type, quantity, \
                 reference_type, reference_id, occurred_at, recorded_at, metadata \
             ) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {MOVEMENT_COLUMNS}"
        );

        let mut appended = Vec::with_capacity(entries.len());
        for (entry, id) in entries.into_iter().zip(last_id - count + 1..) {
            let row = sqlx::query_as::<_, MovementRow>(&sql)
                .bind(id)
                .bind(entry.tenant_id)
                .bind(entry.sku_id)
                .bind(entry.location_id)
                .bind(entry.batch_id)
                .bind(entry.serial_id)
                .bind(entry.movement_type.as_str())
                .bind(entry.quantity)
                .bind(&entry.reference.reference_type)
                .bind(&entry.reference.reference_id)
                .bind(entry.occurred_at)
                .bind(recorded_at)
                .bind(Json(&entry.metadata))
                .fetch_one(&mut *self.tx)
                .await?;
            appended.push(StockMovement::try_from(row)?);
        }
        Ok(appended)
    }

    async fn movements_after(
        &mut self,
        tenant_id: Uuid,
        filter: &HistoryFilter,
        after: MovementId,
        until: Option<MovementId>,
        limit: u32,
    ) -> AppResult<Vec<StockMovement>> {
        let sql = format!(
            "SELECT {MOVEMENT_COLUMNS} FROM stock_movements \
             WHERE tenant_id = $1 AND id > $2 \
               AND ($3::bigint IS NULL OR id <= $3) \
               AND ($4::uuid IS NULL OR sku_id = $4) \
               AND ($5::uuid IS NULL OR location_id = $5) \
               AND ($6::uuid IS NULL OR batch_id = $6) \
               AND ($7::text IS NULL OR movement_type = $7) \
               AND ($8::text IS NULL OR reference_type = $8) \
               AND ($9::text IS NULL OR reference_id = $9) \
               AND ($10::timestamptz IS NULL OR occurred_at >= $10) \
               AND ($11::timestamptz IS NULL OR occurred_at < $11) \
             ORDER BY id \
             LIMIT $12"
        );
        let rows = sqlx::query_as::<_, MovementRow>(&sql)
            .bind(tenant_id)
            .bind(after)
            .bind(until)
            .bind(filter.sku_id)
            .bind(filter.location_id)
            .bind(filter.batch_id)
            .bind(filter.movement_type.map(|t| t.as_str()))
            .bind(filter.reference_type.as_deref())
            .bind(filter.reference_id.as_deref())
            .bind(filter.occurred_from)
            .bind(filter.occurred_before)
            .bind(i64::from(limit))
            .fetch_all(&mut *self.tx)
            .await?;
        collect(rows)
    }

    async fn head(&mut self, tenant_id: Uuid) -> AppResult<MovementId> {
        let head = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(id) FROM stock_movements WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(head.unwrap_or(LEDGER_START))
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_reservations (
                id, tenant_id, sku_id, location_id, requested_quantity, policy,
                allocations, status, created_at, expires_at, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(reservation.id)
        .bind(reservation.tenant_id)
        .bind(reservation.sku_id)
        .bind(reservation.location_id)
        .bind(reservation.requested_quantity)
        .bind(reservation.policy.as_str())
        .bind(Json(&reservation.allocations))
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .bind(reservation.resolved_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE stock_reservations SET status = $3, resolved_at = $4 \
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind(reservation.id)
        .bind(reservation.tenant_id)
        .bind(reservation.status.as_str())
        .bind(reservation.resolved_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Internal(format!(
                "reservation {} vanished during update",
                reservation.id
            )));
        }
        Ok(())
    }

    async fn reservation(&mut self, tenant_id: Uuid, id: Uuid) -> AppResult<Option<Reservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations WHERE id = $1 AND tenant_id = $2"
        );
        sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(id)
            .bind(tenant_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Reservation::try_from)
            .transpose()
    }

    async fn held_reservations(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {RESERVATION_COLUMNS} FROM stock_reservations \
             WHERE tenant_id = $1 AND status = 'held' \
               AND ($2::uuid IS NULL OR sku_id = $2) \
               AND ($3::uuid IS NULL OR location_id = $3) \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, ReservationRow>(&sql)
            .bind(tenant_id)
            .bind(sku_id)
            .bind(location_id)
            .fetch_all(&mut *self.tx)
            .await?;
        collect(rows)
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
