//! Common query types used across the ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MovementId, MovementType, StockMovement};

/// Cursor value that starts a replay from the beginning of the ledger
pub const LEDGER_START: MovementId = 0;

/// Filters for movement history queries; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub sku_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub movement_type: Option<MovementType>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    /// Inclusive lower bound on business time
    pub occurred_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on business time
    pub occurred_before: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn for_scope(sku_id: Option<Uuid>, location_id: Option<Uuid>) -> Self {
        Self {
            sku_id,
            location_id,
            ..Default::default()
        }
    }

    pub fn matches(&self, movement: &StockMovement) -> bool {
        self.sku_id.map_or(true, |id| movement.sku_id == id)
            && self.location_id.map_or(true, |id| movement.location_id == id)
            && self.batch_id.map_or(true, |id| movement.batch_id == Some(id))
            && self
                .movement_type
                .map_or(true, |t| movement.movement_type == t)
            && self
                .reference_type
                .as_ref()
                .map_or(true, |r| &movement.reference_type == r)
            && self
                .reference_id
                .as_ref()
                .map_or(true, |r| &movement.reference_id == r)
            && self
                .occurred_from
                .map_or(true, |from| movement.occurred_at >= from)
            && self
                .occurred_before
                .map_or(true, |before| movement.occurred_at < before)
    }
}

/// One page of movement history in ledger order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementPage {
    pub movements: Vec<StockMovement>,
    /// Pass back as the cursor to continue; `None` once the end was reached
    pub next_cursor: Option<MovementId>,
}

impl MovementPage {
    /// A page that filled its limit may have more rows behind it
    pub fn from_rows(movements: Vec<StockMovement>, limit: u32) -> Self {
        let next_cursor = if movements.len() >= limit as usize {
            movements.last().map(|m| m.id)
        } else {
            None
        };
        Self {
            movements,
            next_cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn movement(id: MovementId, sku: Uuid) -> StockMovement {
        StockMovement {
            id,
            tenant_id: Uuid::nil(),
            sku_id: sku,
            location_id: Uuid::nil(),
            batch_id: None,
            serial_id: None,
            movement_type: MovementType::Receipt,
            quantity: Decimal::ONE,
            reference_type: "po".to_string(),
            reference_id: "PO-1".to_string(),
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_filter_matches_on_every_set_field() {
        let sku = Uuid::new_v4();
        let m = movement(1, sku);
        assert!(HistoryFilter::default().matches(&m));
        assert!(HistoryFilter::for_scope(Some(sku), None).matches(&m));
        assert!(!HistoryFilter::for_scope(Some(Uuid::new_v4()), None).matches(&m));

        let by_type = HistoryFilter {
            movement_type: Some(MovementType::Sale),
            ..Default::default()
        };
        assert!(!by_type.matches(&m));

        let by_reference = HistoryFilter {
            reference_id: Some("PO-1".to_string()),
            ..Default::default()
        };
        assert!(by_reference.matches(&m));
    }

    #[test]
    fn test_page_cursor_only_when_full() {
        let sku = Uuid::new_v4();
        let full = MovementPage::from_rows(vec![movement(4, sku), movement(7, sku)], 2);
        assert_eq!(full.next_cursor, Some(7));
        let short = MovementPage::from_rows(vec![movement(4, sku)], 2);
        assert_eq!(short.next_cursor, None);
    }
}
