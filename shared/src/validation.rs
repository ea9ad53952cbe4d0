//! Validation utilities for the stock ledger
//!
//! Pure rule checks plus the report type the movement validator fills in.
//! A report collects every violated rule, not just the first one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{DocumentRef, MovementType};

/// Largest number of fractional digits a stored quantity may carry
pub const MAX_QUANTITY_SCALE: u32 = 6;

/// Largest number of integer digits a stored quantity may carry
pub const MAX_QUANTITY_DIGITS: u32 = 14;

/// Longest accepted lot or serial code
pub const MAX_CODE_LEN: usize = 64;

/// Longest accepted reference type or id
pub const MAX_REFERENCE_LEN: usize = 128;

// ============================================================================
// Rules and reports
// ============================================================================

/// Rules a proposed movement can violate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    NonZeroQuantity,
    PositiveQuantity,
    QuantityScale,
    QuantityRange,
    DirectionMatchesType,
    InboundType,
    MissingReference,
    MissingReason,
    OccurredInFuture,
    UnknownSku,
    UnknownLocation,
    UnknownBatch,
    UnknownReservation,
    CrossTenantReference,
    BatchSkuMismatch,
    InsufficientAvailable,
    InvalidCode,
    AmbiguousTracking,
    ExpiryWithoutBatch,
    ExpiryImmutable,
    DuplicateLotCode,
    DuplicateSerial,
    SerialQuantity,
    SerialMismatch,
    SameLocation,
}

impl Rule {
    pub fn code(&self) -> &'static str {
        match self {
            Rule::NonZeroQuantity => "non_zero_quantity",
            Rule::PositiveQuantity => "positive_quantity",
            Rule::QuantityScale => "quantity_scale",
            Rule::QuantityRange => "quantity_range",
            Rule::DirectionMatchesType => "direction_matches_type",
            Rule::InboundType => "inbound_type",
            Rule::MissingReference => "missing_reference",
            Rule::MissingReason => "missing_reason",
            Rule::OccurredInFuture => "occurred_in_future",
            Rule::UnknownSku => "unknown_sku",
            Rule::UnknownLocation => "unknown_location",
            Rule::UnknownBatch => "unknown_batch",
            Rule::UnknownReservation => "unknown_reservation",
            Rule::CrossTenantReference => "cross_tenant_reference",
            Rule::BatchSkuMismatch => "batch_sku_mismatch",
            Rule::InsufficientAvailable => "insufficient_available",
            Rule::InvalidCode => "invalid_code",
            Rule::AmbiguousTracking => "ambiguous_tracking",
            Rule::ExpiryWithoutBatch => "expiry_without_batch",
            Rule::ExpiryImmutable => "expiry_immutable",
            Rule::DuplicateLotCode => "duplicate_lot_code",
            Rule::DuplicateSerial => "duplicate_serial",
            Rule::SerialQuantity => "serial_quantity",
            Rule::SerialMismatch => "serial_mismatch",
            Rule::SameLocation => "same_location",
        }
    }

    /// Rules about referenced entities rather than the input itself
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Rule::UnknownSku
                | Rule::UnknownLocation
                | Rule::UnknownBatch
                | Rule::UnknownReservation
                | Rule::CrossTenantReference
        )
    }
}

/// One violated rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: Rule,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Accumulates violations across every rule and every line of a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: Rule, field: impl Into<String>, message: impl Into<String>) {
        let violation = Violation {
            rule,
            field: field.into(),
            message: message.into(),
        };
        if !self.violations.contains(&violation) {
            self.violations.push(violation);
        }
    }

    /// Record `rule` when a pure check fails
    pub fn check(&mut self, rule: Rule, field: &str, result: Result<(), &'static str>) {
        if let Err(message) = result {
            self.push(rule, field, message);
        }
    }

    pub fn merge(&mut self, other: ValidationReport) {
        for v in other.violations {
            if !self.violations.contains(&v) {
                self.violations.push(v);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn has(&self, rule: Rule) -> bool {
        self.violations.iter().any(|v| v.rule == rule)
    }

    pub fn has_reference_violation(&self) -> bool {
        self.violations.iter().any(|v| v.rule.is_reference())
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn into_violations(self) -> Vec<Violation> {
        self.violations
    }
}

// ============================================================================
// Quantity Validations
// ============================================================================

/// Ledger lines never carry zero
pub fn validate_non_zero(quantity: Decimal) -> Result<(), &'static str> {
    if quantity.is_zero() {
        return Err("Quantity must be nonzero");
    }
    Ok(())
}

/// Requested quantities (issue, reserve, transfer, receive) are unsigned
pub fn validate_positive(quantity: Decimal) -> Result<(), &'static str> {
    if quantity <= Decimal::ZERO {
        return Err("Quantity must be positive");
    }
    Ok(())
}

/// Quantities are stored as fixed-point with six fractional digits
pub fn validate_scale(quantity: Decimal) -> Result<(), &'static str> {
    if quantity.normalize().scale() > MAX_QUANTITY_SCALE {
        return Err("Quantity has more than 6 decimal places");
    }
    Ok(())
}

/// Magnitude stays below 10^14 so it fits NUMERIC(20, 6)
pub fn validate_range(quantity: Decimal) -> Result<(), &'static str> {
    let limit = Decimal::from(10_i64.pow(MAX_QUANTITY_DIGITS));
    if quantity.abs() >= limit {
        return Err("Quantity must be less than 10^14 in magnitude");
    }
    Ok(())
}

/// Sign must agree with the movement type
pub fn validate_direction(movement_type: MovementType, quantity: Decimal) -> Result<(), &'static str> {
    if quantity.is_zero() || movement_type.accepts(quantity) {
        return Ok(());
    }
    match movement_type.direction() {
        Some(crate::models::Direction::In) => Err("Inbound movements must have positive quantity"),
        _ => Err("Outbound movements must have negative quantity"),
    }
}

/// Serial units move one at a time
pub fn validate_serial_quantity(quantity: Decimal) -> Result<(), &'static str> {
    if quantity.abs() != Decimal::ONE {
        return Err("Serialized stock moves in units of exactly 1");
    }
    Ok(())
}

// ============================================================================
// General Validations
// ============================================================================

/// Every movement points at the business document that caused it
pub fn validate_reference(reference: &DocumentRef) -> Result<(), &'static str> {
    if reference.reference_type.trim().is_empty() || reference.reference_id.trim().is_empty() {
        return Err("Reference type and id are required");
    }
    if reference.reference_type.len() > MAX_REFERENCE_LEN
        || reference.reference_id.len() > MAX_REFERENCE_LEN
    {
        return Err("Reference type and id must be at most 128 characters");
    }
    Ok(())
}

/// Lot and serial codes: 1-64 characters, no surrounding or embedded whitespace
pub fn validate_code(code: &str) -> Result<(), &'static str> {
    if code.is_empty() {
        return Err("Code must not be empty");
    }
    if code.len() > MAX_CODE_LEN {
        return Err("Code must be at most 64 characters");
    }
    if code.chars().any(char::is_whitespace) {
        return Err("Code must not contain whitespace");
    }
    Ok(())
}

/// Business time may lag append time but never lead it
pub fn validate_occurred_at(
    occurred_at: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
) -> Result<(), &'static str> {
    if occurred_at > recorded_at {
        return Err("Movement cannot occur after it is recorded");
    }
    Ok(())
}
