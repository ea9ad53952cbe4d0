//! Ledger Store port
//!
//! The ledger services talk to storage only through [`LedgerStore`] and the
//! transactions it opens. Two adapters ship with the crate: PostgreSQL for
//! production and an in-process store for tests and embedded callers.
//!
//! Locking is part of opening a transaction. A transaction holds its tenant
//! lock shared and each requested [`StockScope`] exclusively, taken in
//! ascending order, so every balance row it reads stays stable until commit.
//! Appending also takes the tenant's ledger head, held until commit, so
//! movement ids of a tenant are contiguous and follow commit order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{
    BalanceKey, Batch, BatchKind, HistoryFilter, MovementId, NewMovement, Reservation,
    StockBalance, StockMovement, StockScope,
};

use crate::error::AppResult;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// Named lock held for the rest of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Scope(StockScope),
    Batch { tenant_id: Uuid, batch_id: Uuid },
    /// Taken by the first append and held to commit
    Head { tenant_id: Uuid },
}

impl LockKey {
    pub fn name(&self) -> String {
        match self {
            LockKey::Scope(scope) => scope.lock_name(),
            LockKey::Batch {
                tenant_id,
                batch_id,
            } => format!("batch:{tenant_id}:{batch_id}"),
            LockKey::Head { tenant_id } => format!("head:{tenant_id}"),
        }
    }
}

pub fn tenant_lock_name(tenant_id: Uuid) -> String {
    format!("tenant:{tenant_id}")
}

/// Sorted, de-duplicated scopes in lock acquisition order
pub fn lock_order(scopes: &[StockScope]) -> Vec<StockScope> {
    let mut ordered = scopes.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction holding the tenant lock shared and `scopes` exclusively
    async fn begin(&self, tenant_id: Uuid, scopes: &[StockScope]) -> AppResult<Box<dyn LedgerTx>>;

    /// Open a transaction that excludes every other transaction of the tenant
    async fn begin_exclusive(&self, tenant_id: Uuid) -> AppResult<Box<dyn LedgerTx>>;

    /// Publish a SKU from the catalog
    async fn register_sku(&self, tenant_id: Uuid, sku_id: Uuid) -> AppResult<()>;

    /// Publish a location from the location registry
    async fn register_location(&self, tenant_id: Uuid, location_id: Uuid) -> AppResult<()>;

    /// Held reservations whose TTL ran out, oldest expiry first, across all tenants
    async fn lapsed_reservations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Reservation>>;

    async fn ping(&self) -> AppResult<()>;
}

/// One atomic unit of work
///
/// Dropping a transaction without calling [`LedgerTx::commit`] discards
/// everything it wrote.
#[async_trait]
pub trait LedgerTx: Send {
    /// Owning tenant of a registered SKU
    async fn sku_tenant(&mut self, sku_id: Uuid) -> AppResult<Option<Uuid>>;

    /// Owning tenant of a registered location
    async fn location_tenant(&mut self, location_id: Uuid) -> AppResult<Option<Uuid>>;

    /// Look up a batch regardless of tenant; callers check ownership
    async fn batch(&mut self, batch_id: Uuid) -> AppResult<Option<Batch>>;

    /// Lots are keyed by (tenant, sku, code), serials by (tenant, code)
    async fn find_batch(
        &mut self,
        tenant_id: Uuid,
        sku_id: Uuid,
        kind: BatchKind,
        code: &str,
    ) -> AppResult<Option<Batch>>;

    async fn insert_batch(&mut self, batch: &Batch) -> AppResult<()>;

    /// Serialize writers of one batch across locations
    async fn lock_batch(&mut self, tenant_id: Uuid, batch_id: Uuid) -> AppResult<()>;

    /// Every balance row of one scope
    async fn balances(&mut self, scope: StockScope) -> AppResult<Vec<StockBalance>>;

    async fn balance(&mut self, key: BalanceKey) -> AppResult<Option<StockBalance>>;

    /// Balance rows of a tenant, optionally narrowed to a SKU and location
    async fn balances_matching(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<StockBalance>>;

    /// On-hand quantity of a batch summed over every location
    async fn batch_on_hand(&mut self, tenant_id: Uuid, batch_id: Uuid) -> AppResult<Decimal>;

    async fn put_balance(&mut self, balance: &StockBalance) -> AppResult<()>;

    /// Remove balance rows of a tenant, optionally narrowed; returns rows removed
    async fn delete_balances(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<u64>;

    /// Append a non-empty group of movements, all or none.
    ///
    /// Ids continue the tenant's sequence with no gaps, and no lower id can
    /// commit after a higher one.
    async fn append(
        &mut self,
        entries: Vec<NewMovement>,
        recorded_at: DateTime<Utc>,
    ) -> AppResult<Vec<StockMovement>>;

    /// Movements with `after < id <= until`, in id order
    async fn movements_after(
        &mut self,
        tenant_id: Uuid,
        filter: &HistoryFilter,
        after: MovementId,
        until: Option<MovementId>,
        limit: u32,
    ) -> AppResult<Vec<StockMovement>>;

    /// Highest movement id of the tenant, or the ledger start
    async fn head(&mut self, tenant_id: Uuid) -> AppResult<MovementId>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> AppResult<()>;

    async fn update_reservation(&mut self, reservation: &Reservation) -> AppResult<()>;

    async fn reservation(&mut self, tenant_id: Uuid, id: Uuid) -> AppResult<Option<Reservation>>;

    /// Held reservations of a tenant, optionally narrowed to a SKU and location
    async fn held_reservations(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<Reservation>>;

    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}
