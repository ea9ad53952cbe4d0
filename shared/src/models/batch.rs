//! Batch, lot, and serial models

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a batch is identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// A lot of any size, unique per (tenant, sku)
    Lot,
    /// A single unit, unique per tenant
    Serial,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Lot => "lot",
            BatchKind::Serial => "serial",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "lot" => Some(BatchKind::Lot),
            "serial" => Some(BatchKind::Serial),
            _ => None,
        }
    }
}

/// A traceable group of stock received together
///
/// Batches are never deleted. An exhausted batch keeps its row for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub kind: BatchKind,
    /// Lot code or serial code depending on `kind`
    pub code: String,
    /// Fixed at creation
    pub expiry_date: Option<NaiveDate>,
    pub received_at: DateTime<Utc>,
}

impl Batch {
    pub fn lot_code(&self) -> Option<&str> {
        (self.kind == BatchKind::Lot).then_some(self.code.as_str())
    }

    pub fn serial_code(&self) -> Option<&str> {
        (self.kind == BatchKind::Serial).then_some(self.code.as_str())
    }

    pub fn is_serial(&self) -> bool {
        self.kind == BatchKind::Serial
    }

    /// Expired batches have an expiry date strictly before `today`
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|expiry| expiry < today)
    }

    /// Expiry falls on or before `today + within_days`
    ///
    /// A window reaching past the last representable date has no upper bound.
    pub fn expires_within(&self, today: NaiveDate, within_days: u32) -> bool {
        let horizon = today.checked_add_signed(Duration::days(i64::from(within_days)));
        match (self.expiry_date, horizon) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(expiry), Some(horizon)) => expiry <= horizon,
        }
    }
}
