//! Derived stock balance models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MovementId;

/// Unit of locking and partitioning: one SKU at one location for one tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockScope {
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub location_id: Uuid,
}

impl StockScope {
    pub fn new(tenant_id: Uuid, sku_id: Uuid, location_id: Uuid) -> Self {
        Self {
            tenant_id,
            sku_id,
            location_id,
        }
    }

    pub fn key(&self, batch_id: Option<Uuid>) -> BalanceKey {
        BalanceKey {
            tenant_id: self.tenant_id,
            sku_id: self.sku_id,
            location_id: self.location_id,
            batch_id,
        }
    }

    /// Stable textual form used for named locks
    pub fn lock_name(&self) -> String {
        format!("scope:{}:{}:{}", self.tenant_id, self.sku_id, self.location_id)
    }
}

/// Key of one projected balance row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BalanceKey {
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub location_id: Uuid,
    /// `None` for untracked bulk stock
    pub batch_id: Option<Uuid>,
}

impl BalanceKey {
    pub fn scope(&self) -> StockScope {
        StockScope {
            tenant_id: self.tenant_id,
            sku_id: self.sku_id,
            location_id: self.location_id,
        }
    }
}

/// Projected quantity for one key
///
/// `quantity_on_hand` equals the sum of ledger quantities for the key up to
/// `last_movement_id`. `quantity_reserved` is the sum of held reservations
/// and never exceeds `quantity_on_hand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub quantity_on_hand: Decimal,
    pub quantity_reserved: Decimal,
    pub last_movement_id: Option<MovementId>,
}

impl StockBalance {
    pub fn empty(key: BalanceKey) -> Self {
        Self {
            tenant_id: key.tenant_id,
            sku_id: key.sku_id,
            location_id: key.location_id,
            batch_id: key.batch_id,
            quantity_on_hand: Decimal::ZERO,
            quantity_reserved: Decimal::ZERO,
            last_movement_id: None,
        }
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey {
            tenant_id: self.tenant_id,
            sku_id: self.sku_id,
            location_id: self.location_id,
            batch_id: self.batch_id,
        }
    }

    /// Units that can still be issued or reserved
    pub fn available(&self) -> Decimal {
        self.quantity_on_hand - self.quantity_reserved
    }

    /// Reservation bookkeeping never exceeds on-hand stock and never goes negative
    pub fn is_consistent(&self) -> bool {
        self.quantity_reserved >= Decimal::ZERO && self.quantity_reserved <= self.quantity_on_hand
    }
}

/// Totals across every batch of one SKU at one location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockSummary {
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub quantity_on_hand: Decimal,
    pub quantity_reserved: Decimal,
    pub quantity_available: Decimal,
    pub batches: Vec<StockBalance>,
}

impl StockSummary {
    pub fn from_rows(scope: StockScope, batches: Vec<StockBalance>) -> Self {
        let quantity_on_hand: Decimal = batches.iter().map(|b| b.quantity_on_hand).sum();
        let quantity_reserved: Decimal = batches.iter().map(|b| b.quantity_reserved).sum();
        Self {
            tenant_id: scope.tenant_id,
            sku_id: scope.sku_id,
            location_id: scope.location_id,
            quantity_on_hand,
            quantity_reserved,
            quantity_available: quantity_on_hand - quantity_reserved,
            batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_order_by_location_within_sku() {
        let tenant = Uuid::from_u128(1);
        let sku = Uuid::from_u128(2);
        let low = StockScope::new(tenant, sku, Uuid::from_u128(3));
        let high = StockScope::new(tenant, sku, Uuid::from_u128(4));
        assert!(low < high);
    }

    #[test]
    fn test_summary_totals() {
        let scope = StockScope::new(Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3));
        let mut a = StockBalance::empty(scope.key(None));
        a.quantity_on_hand = Decimal::from(7);
        a.quantity_reserved = Decimal::from(2);
        let mut b = StockBalance::empty(scope.key(Some(Uuid::from_u128(9))));
        b.quantity_on_hand = Decimal::from(5);

        let summary = StockSummary::from_rows(scope, vec![a, b]);
        assert_eq!(summary.quantity_on_hand, Decimal::from(12));
        assert_eq!(summary.quantity_reserved, Decimal::from(2));
        assert_eq!(summary.quantity_available, Decimal::from(10));
    }
}
