//! Fixtures shared by the ledger integration tests

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{AllocationPolicy, DocumentRef, MovementType, NewMovement, Rule, StockScope};
use stock_ledger::clock::ManualClock;
use stock_ledger::config::LedgerConfig;
use stock_ledger::services::{
    AdjustInput, IssueInput, LedgerService, ReceiveInput, ReserveInput, TransferInput,
};
use stock_ledger::store::MemoryLedgerStore;
use stock_ledger::AppError;

// Helper to create Decimal from string
pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Fixed starting instant for every test clock
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
}

/// Calendar day relative to the starting instant
pub fn day(offset: i64) -> NaiveDate {
    start().date_naive() + chrono::Duration::days(offset)
}

pub fn reference(id: &str) -> DocumentRef {
    DocumentRef::new("test", id)
}

/// Rules named by a validation or conflict error
pub fn rules(err: &AppError) -> Vec<Rule> {
    err.violations().iter().map(|v| v.rule).collect()
}

/// One tenant with one SKU and two locations, backed by the memory store
pub struct Fixture {
    pub ledger: LedgerService,
    pub store: MemoryLedgerStore,
    pub clock: Arc<ManualClock>,
    pub tenant: Uuid,
    pub sku: Uuid,
    pub location: Uuid,
    pub other_location: Uuid,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(LedgerConfig::default()).await
    }

    pub async fn with_config(config: LedgerConfig) -> Self {
        let store = MemoryLedgerStore::from_config(&config);
        let clock = Arc::new(ManualClock::new(start()));
        let ledger = LedgerService::new(Arc::new(store.clone()), clock.clone(), config);

        let fixture = Self {
            ledger,
            store,
            clock,
            tenant: Uuid::new_v4(),
            sku: Uuid::new_v4(),
            location: Uuid::new_v4(),
            other_location: Uuid::new_v4(),
        };
        fixture
            .ledger
            .register_sku(fixture.tenant, fixture.sku)
            .await
            .unwrap();
        for location in [fixture.location, fixture.other_location] {
            fixture
                .ledger
                .register_location(fixture.tenant, location)
                .await
                .unwrap();
        }
        fixture
    }

    pub fn scope(&self) -> StockScope {
        StockScope::new(self.tenant, self.sku, self.location)
    }

    /// Untracked receipt at the primary location
    pub fn receipt(&self, quantity: &str) -> ReceiveInput {
        ReceiveInput {
            sku_id: self.sku,
            location_id: self.location,
            quantity: dec(quantity),
            lot_code: None,
            serial_code: None,
            expiry_date: None,
            movement_type: None,
            reference: reference("PO-1"),
            occurred_at: None,
            metadata: Default::default(),
        }
    }

    /// Receipt entry for appending straight through a store transaction
    pub fn raw_receipt(&self, location_id: Uuid, quantity: &str) -> NewMovement {
        NewMovement {
            tenant_id: self.tenant,
            sku_id: self.sku,
            location_id,
            batch_id: None,
            serial_id: None,
            movement_type: MovementType::Receipt,
            quantity: dec(quantity),
            reference: reference("PO-RAW"),
            occurred_at: start(),
            metadata: Default::default(),
        }
    }

    pub fn lot_receipt(&self, code: &str, quantity: &str, expiry: Option<NaiveDate>) -> ReceiveInput {
        ReceiveInput {
            lot_code: Some(code.to_string()),
            expiry_date: expiry,
            ..self.receipt(quantity)
        }
    }

    pub fn serial_receipt(&self, code: &str) -> ReceiveInput {
        ReceiveInput {
            serial_code: Some(code.to_string()),
            ..self.receipt("1")
        }
    }

    pub fn return_of(&self, input: ReceiveInput) -> ReceiveInput {
        ReceiveInput {
            movement_type: Some(MovementType::Return),
            reference: reference("RMA-1"),
            ..input
        }
    }

    pub fn issue(&self, quantity: &str, policy: AllocationPolicy) -> IssueInput {
        IssueInput {
            sku_id: self.sku,
            location_id: self.location,
            quantity: dec(quantity),
            policy,
            reference: reference("SO-1"),
            occurred_at: None,
            metadata: Default::default(),
        }
    }

    /// Transfer from the primary to the other location
    pub fn transfer(&self, quantity: &str, policy: AllocationPolicy) -> TransferInput {
        TransferInput {
            sku_id: self.sku,
            from_location_id: self.location,
            to_location_id: self.other_location,
            quantity: dec(quantity),
            policy,
            reference: reference("TR-1"),
            occurred_at: None,
            metadata: Default::default(),
        }
    }

    pub fn adjustment(&self, batch_id: Option<Uuid>, delta: &str, reason: &str) -> AdjustInput {
        AdjustInput {
            sku_id: self.sku,
            location_id: self.location,
            batch_id,
            delta: dec(delta),
            reason: reason.to_string(),
            reference: reference("CC-1"),
            occurred_at: None,
            metadata: Default::default(),
        }
    }

    pub fn reservation(&self, quantity: &str, policy: AllocationPolicy) -> ReserveInput {
        ReserveInput {
            sku_id: self.sku,
            location_id: self.location,
            quantity: dec(quantity),
            policy,
        }
    }

    /// On hand for one balance key at `location`
    pub async fn on_hand(&self, location: Uuid, batch_id: Option<Uuid>) -> Decimal {
        self.ledger
            .get_balance(self.tenant, self.sku, location, batch_id)
            .await
            .unwrap()
            .quantity_on_hand
    }

    /// Summary totals at `location`: (on hand, reserved, available)
    pub async fn totals(&self, location: Uuid) -> (Decimal, Decimal, Decimal) {
        let summary = self
            .ledger
            .get_stock_summary(self.tenant, self.sku, location)
            .await
            .unwrap();
        (
            summary.quantity_on_hand,
            summary.quantity_reserved,
            summary.quantity_available,
        )
    }
}
