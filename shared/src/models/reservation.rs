//! Allocation and reservation models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::StockScope;

/// Order in which candidate batches are consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Oldest received first
    #[default]
    Fifo,
    /// Soonest expiry first; expired batches are excluded
    Fefo,
    /// Untracked bulk stock only
    None,
}

impl AllocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPolicy::Fifo => "fifo",
            AllocationPolicy::Fefo => "fefo",
            AllocationPolicy::None => "none",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fifo" => Some(AllocationPolicy::Fifo),
            "fefo" => Some(AllocationPolicy::Fefo),
            "none" => Some(AllocationPolicy::None),
            _ => None,
        }
    }
}

/// One line of an allocation plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// `None` draws from untracked bulk stock
    pub batch_id: Option<Uuid>,
    pub quantity: Decimal,
    /// Set when the batch is a serial
    #[serde(default)]
    pub serial: bool,
}

/// Reservation lifecycle
///
/// Held is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "held" => Some(ReservationStatus::Held),
            "committed" => Some(ReservationStatus::Committed),
            "released" => Some(ReservationStatus::Released),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (
                ReservationStatus::Held,
                ReservationStatus::Committed | ReservationStatus::Released | ReservationStatus::Expired
            )
        )
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected reservation state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("reservation cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ReservationStatus,
    pub to: ReservationStatus,
}

/// A temporary hold on available stock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub sku_id: Uuid,
    pub location_id: Uuid,
    pub requested_quantity: Decimal,
    pub policy: AllocationPolicy,
    /// Ordered plan chosen by the allocator
    pub allocations: Vec<Allocation>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn scope(&self) -> StockScope {
        StockScope::new(self.tenant_id, self.sku_id, self.location_id)
    }

    /// Held past its TTL, awaiting the move to Expired
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Held && now >= self.expires_at
    }

    pub fn transition(
        &mut self,
        next: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.resolved_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn held() -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            sku_id: Uuid::new_v4(),
            location_id: Uuid::new_v4(),
            requested_quantity: Decimal::from(5),
            policy: AllocationPolicy::Fifo,
            allocations: vec![],
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now + Duration::minutes(15),
            resolved_at: None,
        }
    }

    #[test]
    fn test_held_moves_to_each_terminal_state() {
        for next in [
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            let mut r = held();
            assert!(r.transition(next, Utc::now()).is_ok());
            assert_eq!(r.status, next);
            assert!(r.resolved_at.is_some());
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut r = held();
        r.transition(ReservationStatus::Committed, Utc::now()).unwrap();
        let err = r
            .transition(ReservationStatus::Released, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, ReservationStatus::Committed);
        assert_eq!(err.to, ReservationStatus::Released);
        assert!(!ReservationStatus::Released.can_transition_to(ReservationStatus::Held));
        assert!(!ReservationStatus::Expired.can_transition_to(ReservationStatus::Committed));
    }

    #[test]
    fn test_lapse_only_applies_to_held() {
        let mut r = held();
        let later = r.expires_at + Duration::seconds(1);
        assert!(r.is_lapsed(later));
        assert!(!r.is_lapsed(r.created_at));
        r.transition(ReservationStatus::Released, later).unwrap();
        assert!(!r.is_lapsed(later));
    }
}
