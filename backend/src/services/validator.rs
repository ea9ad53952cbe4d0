//! Movement Validator
//!
//! Checks every proposed movement of a request against referential,
//! quantity, tracking and availability rules, collecting all violations
//! before anything is appended. Lines of one request see each other's
//! effect, so two lines drawing on the same balance cannot both pass on the
//! strength of the same units.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use shared::{
    validate_code, validate_direction, validate_non_zero, validate_occurred_at,
    validate_range, validate_reference, validate_scale, validate_serial_quantity, BalanceKey, Batch, BatchKind,
    NewMovement, Rule, StockBalance, ValidationReport,
};

use crate::error::{AppError, AppResult};
use crate::store::LedgerTx;

pub struct MovementValidator {
    tenant_id: Uuid,
    now: DateTime<Utc>,
    report: ValidationReport,
    /// Net quantity proposed so far per balance key
    pending: BTreeMap<BalanceKey, Decimal>,
    /// Net quantity proposed so far per serial, across locations
    pending_serials: HashMap<Uuid, Decimal>,
    /// New batches to insert once validation passes
    staged: Vec<Batch>,
    checked_skus: HashSet<Uuid>,
    checked_locations: HashSet<Uuid>,
}

impl MovementValidator {
    pub fn new(tenant_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            now,
            report: ValidationReport::new(),
            pending: BTreeMap::new(),
            pending_serials: HashMap::new(),
            staged: Vec::new(),
            checked_skus: HashSet::new(),
            checked_locations: HashSet::new(),
        }
    }

    pub fn push(&mut self, rule: Rule, field: &str, message: impl Into<String>) {
        self.report.push(rule, field, message);
    }

    pub fn check(&mut self, rule: Rule, field: &str, result: Result<(), &'static str>) {
        self.report.check(rule, field, result);
    }

    /// Fail now if anything was recorded so far
    pub fn ensure_clean(&mut self) -> AppResult<()> {
        if self.report.is_empty() {
            return Ok(());
        }
        Err(AppError::from_report(std::mem::take(&mut self.report)))
    }

    /// Consume the validator, yielding the batches that must be inserted
    pub fn finish(self) -> AppResult<Vec<Batch>> {
        if !self.report.is_empty() {
            return Err(AppError::from_report(self.report));
        }
        Ok(self.staged)
    }

    /// The SKU and location exist and belong to the tenant
    pub async fn check_scope(
        &mut self,
        tx: &mut dyn LedgerTx,
        sku_id: Uuid,
        location_id: Uuid,
    ) -> AppResult<()> {
        if self.checked_skus.insert(sku_id) {
            let owner = tx.sku_tenant(sku_id).await?;
            self.check_owner(owner, Rule::UnknownSku, "sku_id", "SKU does not exist");
        }
        if self.checked_locations.insert(location_id) {
            let owner = tx.location_tenant(location_id).await?;
            self.check_owner(
                owner,
                Rule::UnknownLocation,
                "location_id",
                "Location does not exist",
            );
        }
        Ok(())
    }

    fn check_owner(&mut self, owner: Option<Uuid>, missing: Rule, field: &str, message: &str) {
        match owner {
            None => self.report.push(missing, field, message),
            Some(tenant) if tenant != self.tenant_id => self.report.push(
                Rule::CrossTenantReference,
                field,
                "Belongs to another tenant",
            ),
            Some(_) => {}
        }
    }

    /// Register a batch a receipt is about to create; false when it was rejected
    pub async fn stage_batch(&mut self, tx: &mut dyn LedgerTx, batch: Batch) -> AppResult<bool> {
        let field = match batch.kind {
            BatchKind::Lot => "lot_code",
            BatchKind::Serial => "serial_code",
        };
        if let Err(message) = validate_code(&batch.code) {
            self.report.push(Rule::InvalidCode, field, message);
            return Ok(false);
        }

        let taken = tx
            .find_batch(batch.tenant_id, batch.sku_id, batch.kind, &batch.code)
            .await?
            .is_some()
            || self.staged.iter().any(|b| {
                b.kind == batch.kind
                    && b.code == batch.code
                    && (b.kind == BatchKind::Serial || b.sku_id == batch.sku_id)
            });
        if taken {
            match batch.kind {
                BatchKind::Lot => self.report.push(
                    Rule::DuplicateLotCode,
                    field,
                    format!("Lot code {} already exists for this SKU", batch.code),
                ),
                BatchKind::Serial => self.report.push(
                    Rule::DuplicateSerial,
                    field,
                    format!("Serial {} already exists", batch.code),
                ),
            }
            return Ok(false);
        }

        self.staged.push(batch);
        Ok(true)
    }

    async fn lookup_batch(&self, tx: &mut dyn LedgerTx, batch_id: Uuid) -> AppResult<Option<Batch>> {
        if let Some(batch) = self.staged.iter().find(|b| b.id == batch_id) {
            return Ok(Some(batch.clone()));
        }
        tx.batch(batch_id).await
    }

    /// Check one proposed movement and record its effect for later lines
    pub async fn validate(&mut self, tx: &mut dyn LedgerTx, proposed: &NewMovement) -> AppResult<()> {
        let quantity = proposed.quantity;
        self.report
            .check(Rule::NonZeroQuantity, "quantity", validate_non_zero(quantity));
        self.report
            .check(Rule::QuantityScale, "quantity", validate_scale(quantity));
        self.report
            .check(Rule::QuantityRange, "quantity", validate_range(quantity));
        self.report.check(
            Rule::DirectionMatchesType,
            "quantity",
            validate_direction(proposed.movement_type, quantity),
        );
        self.report.check(
            Rule::MissingReference,
            "reference",
            validate_reference(&proposed.reference),
        );
        self.report.check(
            Rule::OccurredInFuture,
            "occurred_at",
            validate_occurred_at(proposed.occurred_at, self.now),
        );

        if proposed.tenant_id != self.tenant_id {
            self.report.push(
                Rule::CrossTenantReference,
                "tenant_id",
                "Movement names another tenant",
            );
        }
        self.check_scope(tx, proposed.sku_id, proposed.location_id)
            .await?;

        let batch = match proposed.batch_id {
            Some(batch_id) => self.check_batch(tx, batch_id, proposed).await?,
            None => {
                if proposed.serial_id.is_some() {
                    self.report.push(
                        Rule::SerialMismatch,
                        "serial_id",
                        "Serialized movements must name the serial's batch",
                    );
                }
                None
            }
        };

        let key = proposed.balance_key();
        let proposed_before = self.pending.get(&key).copied().unwrap_or_default();

        if quantity < Decimal::ZERO {
            let balance = tx
                .balance(key)
                .await?
                .unwrap_or_else(|| StockBalance::empty(key));
            let available = balance.available() + proposed_before;
            if available + quantity < Decimal::ZERO {
                self.report.push(
                    Rule::InsufficientAvailable,
                    "quantity",
                    format!("Requested {} but only {} available", -quantity, available.max(Decimal::ZERO)),
                );
            }
        }

        if let Some(batch) = batch.as_ref().filter(|b| b.is_serial()) {
            let in_flight = self.pending_serials.get(&batch.id).copied().unwrap_or_default();
            if quantity > Decimal::ZERO {
                let on_hand = tx.batch_on_hand(self.tenant_id, batch.id).await? + in_flight;
                if on_hand > Decimal::ZERO {
                    self.report.push(
                        Rule::DuplicateSerial,
                        "serial_code",
                        format!("Serial {} is already in stock", batch.code),
                    );
                }
            }
            *self.pending_serials.entry(batch.id).or_default() += quantity;
        }

        *self.pending.entry(key).or_default() += quantity;
        Ok(())
    }

    async fn check_batch(
        &mut self,
        tx: &mut dyn LedgerTx,
        batch_id: Uuid,
        proposed: &NewMovement,
    ) -> AppResult<Option<Batch>> {
        let Some(batch) = self.lookup_batch(tx, batch_id).await? else {
            self.report
                .push(Rule::UnknownBatch, "batch_id", "Batch does not exist");
            return Ok(None);
        };

        if batch.tenant_id != self.tenant_id {
            self.report.push(
                Rule::CrossTenantReference,
                "batch_id",
                "Batch belongs to another tenant",
            );
            return Ok(None);
        }
        if batch.sku_id != proposed.sku_id {
            self.report.push(
                Rule::BatchSkuMismatch,
                "batch_id",
                "Batch belongs to a different SKU",
            );
        }

        if batch.is_serial() {
            if proposed.serial_id != Some(batch.id) {
                self.report.push(
                    Rule::SerialMismatch,
                    "serial_id",
                    "Serialized movements must carry the serial id",
                );
            }
            self.report.check(
                Rule::SerialQuantity,
                "quantity",
                validate_serial_quantity(proposed.quantity),
            );
        } else if proposed.serial_id.is_some() {
            self.report.push(
                Rule::SerialMismatch,
                "serial_id",
                "Batch is a lot, not a serial",
            );
        }
        Ok(Some(batch))
    }
}
