//! In-process ledger store
//!
//! Committed state lives behind one `parking_lot::RwLock`. A transaction
//! buffers its writes and reads through them, then applies everything under
//! a single write lock on commit. Tenant and scope locks are tokio locks so
//! waiting transactions yield instead of blocking a worker thread.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use uuid::Uuid;

use shared::{
    BalanceKey, Batch, BatchKind, HistoryFilter, MovementId, NewMovement, Reservation,
    ReservationStatus, Rule, StockBalance, StockMovement, StockScope, ValidationReport,
    LEDGER_START,
};

use super::{lock_order, tenant_lock_name, LedgerStore, LedgerTx, LockKey};
use crate::config::LedgerConfig;
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct MemoryState {
    /// sku id -> owning tenant
    skus: HashMap<Uuid, Uuid>,
    /// location id -> owning tenant
    locations: HashMap<Uuid, Uuid>,
    batches: HashMap<Uuid, Batch>,
    /// Commit order, which is id order within a tenant
    movements: Vec<StockMovement>,
    /// Last committed movement id per tenant
    heads: HashMap<Uuid, MovementId>,
    balances: BTreeMap<BalanceKey, StockBalance>,
    reservations: HashMap<Uuid, Reservation>,
}

#[derive(Default)]
struct LockTable {
    tenants: HashMap<Uuid, Arc<tokio::sync::RwLock<()>>>,
    keys: HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>,
}

struct Inner {
    state: RwLock<MemoryState>,
    locks: Mutex<LockTable>,
    lock_timeout: Duration,
}

impl Inner {
    fn tenant_lock(&self, tenant_id: Uuid) -> Arc<tokio::sync::RwLock<()>> {
        self.locks
            .lock()
            .tenants
            .entry(tenant_id)
            .or_default()
            .clone()
    }

    fn key_lock(&self, key: LockKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().keys.entry(key).or_default().clone()
    }

    async fn acquire<T>(&self, name: String, wait: impl Future<Output = T>) -> AppResult<T> {
        tokio::time::timeout(self.lock_timeout, wait)
            .await
            .map_err(|_| {
                tracing::warn!(lock = %name, "Lock wait timed out");
                AppError::Concurrency(format!("timed out waiting for {name}"))
            })
    }
}

/// Ledger store kept entirely in memory
#[derive(Clone)]
pub struct MemoryLedgerStore {
    inner: Arc<Inner>,
}

impl MemoryLedgerStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(MemoryState::default()),
                locks: Mutex::new(LockTable::default()),
                lock_timeout,
            }),
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(config.lock_timeout())
    }

    /// Snapshot of every committed movement in commit order
    pub fn movements(&self) -> Vec<StockMovement> {
        self.inner.state.read().movements.clone()
    }

    pub fn movement_count(&self) -> usize {
        self.inner.state.read().movements.len()
    }

    /// Write a balance row without going through the ledger.
    ///
    /// Only useful for simulating a damaged projection.
    pub fn overwrite_balance(&self, balance: StockBalance) {
        self.inner
            .state
            .write()
            .balances
            .insert(balance.key(), balance);
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

fn same_identity(a: &Batch, b: &Batch) -> bool {
    a.tenant_id == b.tenant_id
        && a.kind == b.kind
        && a.code == b.code
        && (a.kind == BatchKind::Serial || a.sku_id == b.sku_id)
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self, tenant_id: Uuid, scopes: &[StockScope]) -> AppResult<Box<dyn LedgerTx>> {
        let lock = self.inner.tenant_lock(tenant_id);
        let guard = self
            .inner
            .acquire(tenant_lock_name(tenant_id), lock.read_owned())
            .await?;

        let mut tx = MemoryTx::new(self.inner.clone(), tenant_id);
        tx._shared = Some(guard);
        for scope in lock_order(scopes) {
            tx.hold(LockKey::Scope(scope)).await?;
        }
        Ok(Box::new(tx))
    }

    async fn begin_exclusive(&self, tenant_id: Uuid) -> AppResult<Box<dyn LedgerTx>> {
        let lock = self.inner.tenant_lock(tenant_id);
        let guard = self
            .inner
            .acquire(tenant_lock_name(tenant_id), lock.write_owned())
            .await?;

        let mut tx = MemoryTx::new(self.inner.clone(), tenant_id);
        tx.exclusive = Some(guard);
        Ok(Box::new(tx))
    }

    async fn register_sku(&self, tenant_id: Uuid, sku_id: Uuid) -> AppResult<()> {
        let mut state = self.inner.state.write();
        register(&mut state.skus, tenant_id, sku_id, "sku_id")
    }

    async fn register_location(&self, tenant_id: Uuid, location_id: Uuid) -> AppResult<()> {
        let mut state = self.inner.state.write();
        register(&mut state.locations, tenant_id, location_id, "location_id")
    }

    async fn lapsed_reservations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> AppResult<Vec<Reservation>> {
        let state = self.inner.state.read();
        let mut lapsed: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.is_lapsed(now))
            .cloned()
            .collect();
        lapsed.sort_by_key(|r| (r.expires_at, r.id));
        lapsed.truncate(limit as usize);
        Ok(lapsed)
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

fn register(
    owners: &mut HashMap<Uuid, Uuid>,
    tenant_id: Uuid,
    id: Uuid,
    field: &str,
) -> AppResult<()> {
    match owners.get(&id) {
        Some(owner) if *owner != tenant_id => {
            let mut report = ValidationReport::new();
            report.push(
                Rule::CrossTenantReference,
                field,
                "Already registered to another tenant",
            );
            Err(AppError::from_report(report))
        }
        _ => {
            owners.insert(id, tenant_id);
            Ok(())
        }
    }
}

#[derive(Default)]
struct Pending {
    batches: Vec<Batch>,
    movements: Vec<StockMovement>,
    /// `None` marks a deleted row
    balances: BTreeMap<BalanceKey, Option<StockBalance>>,
    reservations: HashMap<Uuid, Reservation>,
}

/// Transaction over [`MemoryLedgerStore`]
pub struct MemoryTx {
    inner: Arc<Inner>,
    tenant_id: Uuid,
    pending: Pending,
    held_keys: Vec<LockKey>,
    _held: Vec<OwnedMutexGuard<()>>,
    _shared: Option<OwnedRwLockReadGuard<()>>,
    exclusive: Option<OwnedRwLockWriteGuard<()>>,
}

impl MemoryTx {
    fn new(inner: Arc<Inner>, tenant_id: Uuid) -> Self {
        Self {
            inner,
            tenant_id,
            pending: Pending::default(),
            held_keys: Vec::new(),
            _held: Vec::new(),
            _shared: None,
            exclusive: None,
        }
    }

    async fn hold(&mut self, key: LockKey) -> AppResult<()> {
        if self.exclusive.is_some() || self.held_keys.contains(&key) {
            return Ok(());
        }
        let lock = self.inner.key_lock(key);
        let guard = self.inner.acquire(key.name(), lock.lock_owned()).await?;
        self.held_keys.push(key);
        self._held.push(guard);
        Ok(())
    }

    /// Committed rows overlaid with this transaction's writes
    fn merged_balances(&self, keep: impl Fn(&BalanceKey) -> bool) -> Vec<StockBalance> {
        let mut rows: BTreeMap<BalanceKey, StockBalance> = {
            let state = self.inner.state.read();
            state
                .balances
                .iter()
                .filter(|(key, _)| keep(key))
                .map(|(key, row)| (*key, row.clone()))
                .collect()
        };
        for (key, row) in self.pending.balances.iter().filter(|(key, _)| keep(key)) {
            match row {
                Some(row) => rows.insert(*key, row.clone()),
                None => rows.remove(key),
            };
        }
        rows.into_values().collect()
    }

    fn merged_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut rows: HashMap<Uuid, Reservation> = {
            let state = self.inner.state.read();
            state
                .reservations
                .values()
                .filter(|r| keep(r))
                .map(|r| (r.id, r.clone()))
                .collect()
        };
        for r in self.pending.reservations.values() {
            if keep(r) {
                rows.insert(r.id, r.clone());
            } else {
                rows.remove(&r.id);
            }
        }
        let mut rows: Vec<Reservation> = rows.into_values().collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows
    }

    fn reference_report(&self, entry: &NewMovement, state: &MemoryState) -> ValidationReport {
        let mut report = ValidationReport::new();
        if entry.quantity.is_zero() {
            report.push(Rule::NonZeroQuantity, "quantity", "Quantity must be nonzero");
        }
        if state.skus.get(&entry.sku_id) != Some(&entry.tenant_id) {
            report.push(Rule::UnknownSku, "sku_id", "SKU is not registered to the tenant");
        }
        if state.locations.get(&entry.location_id) != Some(&entry.tenant_id) {
            report.push(
                Rule::UnknownLocation,
                "location_id",
                "Location is not registered to the tenant",
            );
        }
        if let Some(batch_id) = entry.batch_id {
            let known = state.batches.contains_key(&batch_id)
                || self.pending.batches.iter().any(|b| b.id == batch_id);
            if !known {
                report.push(Rule::UnknownBatch, "batch_id", "Batch does not exist");
            }
        }
        report
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn sku_tenant(&mut self, sku_id: Uuid) -> AppResult<Option<Uuid>> {
        Ok(self.inner.state.read().skus.get(&sku_id).copied())
    }

    async fn location_tenant(&mut self, location_id: Uuid) -> AppResult<Option<Uuid>> {
        Ok(self.inner.state.read().locations.get(&location_id).copied())
    }

    async fn batch(&mut self, batch_id: Uuid) -> AppResult<Option<Batch>> {
        if let Some(batch) = self.pending.batches.iter().find(|b| b.id == batch_id) {
            return Ok(Some(batch.clone()));
        }
        Ok(self.inner.state.read().batches.get(&batch_id).cloned())
    }

    async fn find_batch(
        &mut self,
        tenant_id: Uuid,
        sku_id: Uuid,
        kind: BatchKind,
        code: &str,
    ) -> AppResult<Option<Batch>> {
        let matches = |b: &&Batch| {
            b.tenant_id == tenant_id
                && b.kind == kind
                && b.code == code
                && (kind == BatchKind::Serial || b.sku_id == sku_id)
        };
        if let Some(batch) = self.pending.batches.iter().find(matches) {
            return Ok(Some(batch.clone()));
        }
        Ok(self
            .inner
            .state
            .read()
            .batches
            .values()
            .find(matches)
            .cloned())
    }

    async fn insert_batch(&mut self, batch: &Batch) -> AppResult<()> {
        self.pending.batches.push(batch.clone());
        Ok(())
    }

    async fn lock_batch(&mut self, tenant_id: Uuid, batch_id: Uuid) -> AppResult<()> {
        self.hold(LockKey::Batch {
            tenant_id,
            batch_id,
        })
        .await
    }

    async fn balances(&mut self, scope: StockScope) -> AppResult<Vec<StockBalance>> {
        Ok(self.merged_balances(|key| key.scope() == scope))
    }

    async fn balance(&mut self, key: BalanceKey) -> AppResult<Option<StockBalance>> {
        if let Some(row) = self.pending.balances.get(&key) {
            return Ok(row.clone());
        }
        Ok(self.inner.state.read().balances.get(&key).cloned())
    }

    async fn balances_matching(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<StockBalance>> {
        Ok(self.merged_balances(|key| {
            key.tenant_id == tenant_id
                && sku_id.map_or(true, |id| key.sku_id == id)
                && location_id.map_or(true, |id| key.location_id == id)
        }))
    }

    async fn batch_on_hand(&mut self, tenant_id: Uuid, batch_id: Uuid) -> AppResult<Decimal> {
        Ok(self
            .merged_balances(|key| key.tenant_id == tenant_id && key.batch_id == Some(batch_id))
            .iter()
            .map(|row| row.quantity_on_hand)
            .sum())
    }

    async fn put_balance(&mut self, balance: &StockBalance) -> AppResult<()> {
        self.pending
            .balances
            .insert(balance.key(), Some(balance.clone()));
        Ok(())
    }

    async fn delete_balances(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<u64> {
        let doomed = self
            .balances_matching(tenant_id, sku_id, location_id)
            .await?;
        for row in &doomed {
            self.pending.balances.insert(row.key(), None);
        }
        Ok(doomed.len() as u64)
    }

    async fn append(
        &mut self,
        entries: Vec<NewMovement>,
        recorded_at: DateTime<Utc>,
    ) -> AppResult<Vec<StockMovement>> {
        if entries.is_empty() {
            return Err(AppError::Internal("append requires at least one entry".into()));
        }

        let mut report = ValidationReport::new();
        {
            let state = self.inner.state.read();
            for entry in &entries {
                if entry.tenant_id != self.tenant_id {
                    report.push(
                        Rule::CrossTenantReference,
                        "tenant_id",
                        "Movement belongs to another tenant",
                    );
                }
                report.merge(self.reference_report(entry, &state));
            }
        }
        if !report.is_empty() {
            return Err(AppError::from_report(report));
        }

        // Nobody else can advance the head while this transaction holds it
        self.hold(LockKey::Head {
            tenant_id: self.tenant_id,
        })
        .await?;
        let committed = self
            .inner
            .state
            .read()
            .heads
            .get(&self.tenant_id)
            .copied()
            .unwrap_or(LEDGER_START);
        let first = committed + self.pending.movements.len() as i64 + 1;
        let appended: Vec<StockMovement> = entries
            .into_iter()
            .zip(first..)
            .map(|(entry, id)| entry.into_movement(id, recorded_at))
            .collect();

        self.pending.movements.extend(appended.iter().cloned());
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
        let wanted = |m: &&StockMovement| {
            m.tenant_id == tenant_id
                && m.id > after
                && until.map_or(true, |until| m.id <= until)
                && filter.matches(m)
        };
        let mut rows: Vec<StockMovement> = {
            let state = self.inner.state.read();
            state.movements.iter().filter(wanted).cloned().collect()
        };
        rows.extend(self.pending.movements.iter().filter(wanted).cloned());
        rows.sort_by_key(|m| m.id);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn head(&mut self, tenant_id: Uuid) -> AppResult<MovementId> {
        let committed = self.inner.state.read().heads.get(&tenant_id).copied();
        let pending = self
            .pending
            .movements
            .iter()
            .filter(|m| m.tenant_id == tenant_id)
            .map(|m| m.id)
            .max();
        Ok(committed.max(pending).unwrap_or(LEDGER_START))
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        self.pending
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> AppResult<()> {
        self.insert_reservation(reservation).await
    }

    async fn reservation(&mut self, tenant_id: Uuid, id: Uuid) -> AppResult<Option<Reservation>> {
        let found = match self.pending.reservations.get(&id) {
            Some(r) => Some(r.clone()),
            None => self.inner.state.read().reservations.get(&id).cloned(),
        };
        Ok(found.filter(|r| r.tenant_id == tenant_id))
    }

    async fn held_reservations(
        &mut self,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<Reservation>> {
        Ok(self.merged_reservations(|r| {
            r.tenant_id == tenant_id
                && r.status == ReservationStatus::Held
                && sku_id.map_or(true, |id| r.sku_id == id)
                && location_id.map_or(true, |id| r.location_id == id)
        }))
    }

    async fn commit(mut self: Box<Self>) -> AppResult<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut state = self.inner.state.write();

        // Lots and serials are unique; a racing transaction may have created one first
        for batch in &pending.batches {
            if state
                .batches
                .values()
                .any(|existing| existing.id == batch.id || same_identity(existing, batch))
            {
                return Err(AppError::Concurrency(format!(
                    "{} {} was created concurrently",
                    batch.kind.as_str(),
                    batch.code
                )));
            }
        }

        for batch in pending.batches {
            state.batches.insert(batch.id, batch);
        }
        if let Some(last) = pending.movements.last() {
            state.heads.insert(self.tenant_id, last.id);
            state.movements.extend(pending.movements);
        }
        for (key, row) in pending.balances {
            match row {
                Some(row) => state.balances.insert(key, row),
                None => state.balances.remove(&key),
            };
        }
        for (id, reservation) in pending.reservations {
            state.reservations.insert(id, reservation);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}
