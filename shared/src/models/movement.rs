//! Stock movement models
//!
//! A movement is one immutable ledger line. Quantities are signed: inbound
//! movements are positive, outbound movements negative.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BalanceKey;

/// Ledger position assigned at append time
pub type MovementId = i64;

/// Opaque key-value bag attached to a movement
pub type Metadata = BTreeMap<String, String>;

/// Kinds of stock movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Receipt,
    Sale,
    TransferOut,
    TransferIn,
    Adjustment,
    Return,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Receipt => "receipt",
            MovementType::Sale => "sale",
            MovementType::TransferOut => "transfer_out",
            MovementType::TransferIn => "transfer_in",
            MovementType::Adjustment => "adjustment",
            MovementType::Return => "return",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "receipt" => Some(MovementType::Receipt),
            "sale" => Some(MovementType::Sale),
            "transfer_out" => Some(MovementType::TransferOut),
            "transfer_in" => Some(MovementType::TransferIn),
            "adjustment" => Some(MovementType::Adjustment),
            "return" => Some(MovementType::Return),
            _ => None,
        }
    }

    /// Direction implied by the type; adjustments carry their direction in
    /// the sign of the quantity instead.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            MovementType::Receipt | MovementType::TransferIn | MovementType::Return => {
                Some(Direction::In)
            }
            MovementType::Sale | MovementType::TransferOut => Some(Direction::Out),
            MovementType::Adjustment => None,
        }
    }

    /// Whether a quantity with this sign is legal for the type
    pub fn accepts(&self, quantity: Decimal) -> bool {
        match self.direction() {
            Some(Direction::In) => quantity > Decimal::ZERO,
            Some(Direction::Out) => quantity < Decimal::ZERO,
            None => !quantity.is_zero(),
        }
    }
}

impl std::fmt::Display for MovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Pointer to the business document that caused a movement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub reference_type: String,
    pub reference_id: String,
}

impl DocumentRef {
    pub fn new(reference_type: impl Into<String>, reference_id: impl Into<String>) -> Self {
        Self {
            reference_type: reference_type.into(),
            reference_id: reference_id.into(),
        }
    }
}

/// An appended, immutable ledger line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub location_id: Uuid,
    /// `None` for untracked bulk stock
    pub batch_id: Option<Uuid>,
    pub serial_id: Option<Uuid>,
    pub movement_type: MovementType,
    pub quantity: Decimal,
    pub reference_type: String,
    pub reference_id: String,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl StockMovement {
    pub fn balance_key(&self) -> BalanceKey {
        BalanceKey {
            tenant_id: self.tenant_id,
            sku_id: self.sku_id,
            location_id: self.location_id,
            batch_id: self.batch_id,
        }
    }
}

/// A movement proposed for append; the store assigns `id` and `recorded_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMovement {
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub serial_id: Option<Uuid>,
    pub movement_type: MovementType,
    pub quantity: Decimal,
    pub reference: DocumentRef,
    pub occurred_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl NewMovement {
    pub fn balance_key(&self) -> BalanceKey {
        BalanceKey {
            tenant_id: self.tenant_id,
            sku_id: self.sku_id,
            location_id: self.location_id,
            batch_id: self.batch_id,
        }
    }

    pub fn into_movement(self, id: MovementId, recorded_at: DateTime<Utc>) -> StockMovement {
        StockMovement {
            id,
            tenant_id: self.tenant_id,
            sku_id: self.sku_id,
            location_id: self.location_id,
            batch_id: self.batch_id,
            serial_id: self.serial_id,
            movement_type: self.movement_type,
            quantity: self.quantity,
            reference_type: self.reference.reference_type,
            reference_id: self.reference.reference_id,
            occurred_at: self.occurred_at,
            recorded_at,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movement_type_round_trips_through_str() {
        for t in [
            MovementType::Receipt,
            MovementType::Sale,
            MovementType::TransferOut,
            MovementType::TransferIn,
            MovementType::Adjustment,
            MovementType::Return,
        ] {
            assert_eq!(MovementType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(MovementType::from_str("consume"), None);
    }

    #[test]
    fn test_sign_rules() {
        let ten = Decimal::from(10);
        assert!(MovementType::Receipt.accepts(ten));
        assert!(!MovementType::Receipt.accepts(-ten));
        assert!(MovementType::Sale.accepts(-ten));
        assert!(!MovementType::Sale.accepts(ten));
        assert!(MovementType::Adjustment.accepts(ten));
        assert!(MovementType::Adjustment.accepts(-ten));
        assert!(!MovementType::Adjustment.accepts(Decimal::ZERO));
        assert!(!MovementType::Return.accepts(Decimal::ZERO));
    }
}
