//! Balance Projector
//!
//! Balances are a fold over the ledger. [`BalanceProjector::apply`] runs in
//! the same transaction as the append that produced its input, so readers
//! never observe a ledger and projection that disagree. Reserved quantities
//! are not ledger facts; they are the sum of held reservations and are
//! replayed from those.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use shared::{
    validate_range, Allocation, BalanceKey, HistoryFilter, Reservation, Rule, StockBalance,
    StockMovement, StockScope, ValidationReport, LEDGER_START,
};

use crate::error::{AppError, AppResult};
use crate::store::LedgerTx;

/// Add movements to balance rows in ledger order
pub fn fold(
    balances: &mut BTreeMap<BalanceKey, StockBalance>,
    movements: &[StockMovement],
) -> AppResult<()> {
    for movement in movements {
        let key = movement.balance_key();
        let row = balances
            .entry(key)
            .or_insert_with(|| StockBalance::empty(key));
        row.quantity_on_hand = add(row.quantity_on_hand, movement.quantity, &key)?;
        row.last_movement_id = row.last_movement_id.max(Some(movement.id));
    }
    Ok(())
}

/// Add the holds of reservations to balance rows
pub fn fold_holds(
    balances: &mut BTreeMap<BalanceKey, StockBalance>,
    reservations: &[Reservation],
) -> AppResult<()> {
    for reservation in reservations {
        let scope = reservation.scope();
        for allocation in &reservation.allocations {
            let key = scope.key(allocation.batch_id);
            let row = balances
                .entry(key)
                .or_insert_with(|| StockBalance::empty(key));
            row.quantity_reserved = add(row.quantity_reserved, allocation.quantity, &key)?;
        }
    }
    Ok(())
}

fn add(total: Decimal, quantity: Decimal, key: &BalanceKey) -> AppResult<Decimal> {
    total.checked_add(quantity).ok_or_else(|| {
        AppError::Internal(format!("balance for {key:?} overflowed adding {quantity}"))
    })
}

/// A key whose stored balance differs from a full replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceDrift {
    pub key: BalanceKey,
    pub expected_on_hand: Decimal,
    pub actual_on_hand: Decimal,
    pub expected_reserved: Decimal,
    pub actual_reserved: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub tenant_id: Uuid,
    pub sku_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub movements_replayed: usize,
    pub rows_removed: u64,
    pub rows_written: usize,
    /// Keys the rebuild corrected
    pub repaired: Vec<BalanceDrift>,
}

#[derive(Debug, Clone)]
pub struct BalanceProjector {
    page_size: u32,
}

impl BalanceProjector {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    /// Fold freshly appended movements into their balance rows
    pub async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        movements: &[StockMovement],
    ) -> AppResult<Vec<StockBalance>> {
        let mut touched: BTreeMap<BalanceKey, StockBalance> = BTreeMap::new();
        for movement in movements {
            let key = movement.balance_key();
            if !touched.contains_key(&key) {
                let current = tx
                    .balance(key)
                    .await?
                    .unwrap_or_else(|| StockBalance::empty(key));
                touched.insert(key, current);
            }
        }
        fold(&mut touched, movements)?;

        for row in touched.values() {
            ensure_in_range(row)?;
            ensure_consistent(row)?;
            tx.put_balance(row).await?;
        }
        Ok(touched.into_values().collect())
    }

    /// Move allocated quantity into `quantity_reserved`
    pub async fn hold(
        &self,
        tx: &mut dyn LedgerTx,
        scope: StockScope,
        allocations: &[Allocation],
    ) -> AppResult<()> {
        self.shift_reserved(tx, scope, allocations, Decimal::ONE)
            .await
    }

    /// Return held quantity to the available pool
    pub async fn unhold(
        &self,
        tx: &mut dyn LedgerTx,
        scope: StockScope,
        allocations: &[Allocation],
    ) -> AppResult<()> {
        self.shift_reserved(tx, scope, allocations, Decimal::NEGATIVE_ONE)
            .await
    }

    async fn shift_reserved(
        &self,
        tx: &mut dyn LedgerTx,
        scope: StockScope,
        allocations: &[Allocation],
        sign: Decimal,
    ) -> AppResult<()> {
        for allocation in allocations {
            let key = scope.key(allocation.batch_id);
            let mut row = tx
                .balance(key)
                .await?
                .unwrap_or_else(|| StockBalance::empty(key));
            row.quantity_reserved = add(row.quantity_reserved, sign * allocation.quantity, &key)?;
            ensure_consistent(&row)?;
            tx.put_balance(&row).await?;
        }
        Ok(())
    }

    /// Recompute balances from scratch: the full ledger plus held reservations
    pub async fn replay(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<(BTreeMap<BalanceKey, StockBalance>, usize)> {
        let filter = HistoryFilter::for_scope(sku_id, location_id);
        let head = tx.head(tenant_id).await?;
        let mut balances = BTreeMap::new();
        let mut cursor = LEDGER_START;
        let mut replayed = 0;

        loop {
            let page = tx
                .movements_after(tenant_id, &filter, cursor, Some(head), self.page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = last.id;
            replayed += page.len();
            fold(&mut balances, &page)?;
            if page.len() < self.page_size as usize {
                break;
            }
        }

        let holds = tx
            .held_reservations(tenant_id, sku_id, location_id)
            .await?;
        fold_holds(&mut balances, &holds)?;
        Ok((balances, replayed))
    }

    /// Compare stored balances against a replay without changing anything
    pub async fn verify(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<Vec<BalanceDrift>> {
        let (expected, _) = self.replay(tx, tenant_id, sku_id, location_id).await?;
        let actual = tx
            .balances_matching(tenant_id, sku_id, location_id)
            .await?;
        Ok(diff(&expected, actual))
    }

    /// Replace stored balances with a replay of the ledger
    pub async fn rebuild(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: Uuid,
        sku_id: Option<Uuid>,
        location_id: Option<Uuid>,
    ) -> AppResult<RebuildReport> {
        let (expected, movements_replayed) =
            self.replay(tx, tenant_id, sku_id, location_id).await?;
        let actual = tx
            .balances_matching(tenant_id, sku_id, location_id)
            .await?;
        let repaired = diff(&expected, actual);

        let rows_removed = tx
            .delete_balances(tenant_id, sku_id, location_id)
            .await?;
        for row in expected.values() {
            ensure_consistent(row)?;
            tx.put_balance(row).await?;
        }

        Ok(RebuildReport {
            tenant_id,
            sku_id,
            location_id,
            movements_replayed,
            rows_removed,
            rows_written: expected.len(),
            repaired,
        })
    }
}

/// On hand must stay storable after a movement lands
fn ensure_in_range(row: &StockBalance) -> AppResult<()> {
    let mut report = ValidationReport::new();
    report.check(
        Rule::QuantityRange,
        "quantity_on_hand",
        validate_range(row.quantity_on_hand),
    );
    if report.is_empty() {
        return Ok(());
    }
    Err(AppError::from_report(report))
}

fn ensure_consistent(row: &StockBalance) -> AppResult<()> {
    if row.is_consistent() {
        return Ok(());
    }
    tracing::error!(
        key = ?row.key(),
        on_hand = %row.quantity_on_hand,
        reserved = %row.quantity_reserved,
        "Balance invariant breached"
    );
    Err(AppError::Internal(format!(
        "balance for sku {} at location {} would hold {} on hand with {} reserved",
        row.sku_id, row.location_id, row.quantity_on_hand, row.quantity_reserved
    )))
}

/// Keys whose quantities differ; a missing row counts as zero
fn diff(
    expected: &BTreeMap<BalanceKey, StockBalance>,
    actual: Vec<StockBalance>,
) -> Vec<BalanceDrift> {
    let mut actual: BTreeMap<BalanceKey, StockBalance> =
        actual.into_iter().map(|row| (row.key(), row)).collect();
    let mut drift = Vec::new();

    for (key, want) in expected {
        let have = actual.remove(key).unwrap_or_else(|| StockBalance::empty(*key));
        if want.quantity_on_hand != have.quantity_on_hand
            || want.quantity_reserved != have.quantity_reserved
        {
            drift.push(BalanceDrift {
                key: *key,
                expected_on_hand: want.quantity_on_hand,
                actual_on_hand: have.quantity_on_hand,
                expected_reserved: want.quantity_reserved,
                actual_reserved: have.quantity_reserved,
            });
        }
    }

    // Rows with no ledger behind them
    for (key, have) in actual {
        if !have.quantity_on_hand.is_zero() || !have.quantity_reserved.is_zero() {
            drift.push(BalanceDrift {
                key,
                expected_on_hand: Decimal::ZERO,
                actual_on_hand: have.quantity_on_hand,
                expected_reserved: Decimal::ZERO,
                actual_reserved: have.quantity_reserved,
            });
        }
    }
    drift.sort_by_key(|d| d.key);
    drift
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::MovementType;

    fn movement(id: i64, batch: Option<Uuid>, quantity: i64) -> StockMovement {
        StockMovement {
            id,
            tenant_id: Uuid::from_u128(1),
            sku_id: Uuid::from_u128(2),
            location_id: Uuid::from_u128(3),
            batch_id: batch,
            serial_id: None,
            movement_type: if quantity > 0 {
                MovementType::Receipt
            } else {
                MovementType::Sale
            },
            quantity: Decimal::from(quantity),
            reference_type: "test".to_string(),
            reference_id: id.to_string(),
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_fold_sums_per_key_and_tracks_last_id() {
        let lot = Some(Uuid::from_u128(9));
        let mut balances = BTreeMap::new();
        fold(
            &mut balances,
            &[
                movement(1, lot, 10),
                movement(2, None, 4),
                movement(3, lot, -3),
            ],
        )
        .unwrap();

        assert_eq!(balances.len(), 2);
        let lot_row = balances.values().find(|b| b.batch_id == lot).unwrap();
        assert_eq!(lot_row.quantity_on_hand, Decimal::from(7));
        assert_eq!(lot_row.last_movement_id, Some(3));
        let bulk_row = balances.values().find(|b| b.batch_id.is_none()).unwrap();
        assert_eq!(bulk_row.last_movement_id, Some(2));
    }

    #[test]
    fn test_diff_treats_missing_rows_as_zero() {
        let mut expected = BTreeMap::new();
        fold(&mut expected, &[movement(1, None, 5)]).unwrap();

        assert!(diff(&expected, expected.values().cloned().collect()).is_empty());

        let drift = diff(&expected, vec![]);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].expected_on_hand, Decimal::from(5));
        assert_eq!(drift[0].actual_on_hand, Decimal::ZERO);

        let scope = StockScope::new(Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3));
        let mut stray = StockBalance::empty(scope.key(None));
        stray.quantity_on_hand = Decimal::ONE;
        let drift = diff(&BTreeMap::new(), vec![stray]);
        assert_eq!(drift[0].expected_on_hand, Decimal::ZERO);
    }

    #[test]
    fn test_fold_overflow_is_an_error() {
        let mut balances = BTreeMap::new();
        let mut huge = movement(1, None, 1);
        huge.quantity = Decimal::MAX;

        fold(&mut balances, &[huge.clone()]).unwrap();
        let err = fold(&mut balances, &[huge]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[test]
    fn test_out_of_range_balance_is_a_validation_error() {
        let scope = StockScope::new(Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3));
        let mut row = StockBalance::empty(scope.key(None));
        row.quantity_on_hand = Decimal::from(10_i64.pow(14));

        let err = ensure_in_range(&row).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert_eq!(err.violations()[0].rule, Rule::QuantityRange);
    }
}
