//! Lot Allocator
//!
//! Chooses which batches satisfy an outbound quantity. The allocator is pure:
//! the caller reads candidate balances inside the same locked transaction
//! that will append the resulting movements.

use std::cmp::Ordering;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use shared::{validate_positive, Allocation, AllocationPolicy, Batch, Rule, ValidationReport};

use crate::error::{AppError, AppResult};

/// Stock that could be drawn from: one balance row of the scope
#[derive(Debug, Clone)]
pub struct Candidate {
    /// `None` for untracked bulk stock
    pub batch: Option<Batch>,
    /// On hand minus reserved
    pub available: Decimal,
}

impl Candidate {
    pub fn untracked(available: Decimal) -> Self {
        Self {
            batch: None,
            available,
        }
    }

    pub fn tracked(batch: Batch, available: Decimal) -> Self {
        Self {
            batch: Some(batch),
            available,
        }
    }

    fn is_serial(&self) -> bool {
        self.batch.as_ref().is_some_and(Batch::is_serial)
    }
}

pub struct LotAllocator;

impl LotAllocator {
    /// Candidates the policy may draw from, in consumption order
    pub fn order(
        candidates: &[Candidate],
        policy: AllocationPolicy,
        today: NaiveDate,
    ) -> Vec<Candidate> {
        let mut eligible: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.available > Decimal::ZERO)
            .filter(|c| match (&c.batch, policy) {
                (Some(_), AllocationPolicy::None) => false,
                (Some(batch), AllocationPolicy::Fefo) => !batch.is_expired(today),
                _ => true,
            })
            .cloned()
            .collect();

        eligible.sort_by(|a, b| match (&a.batch, &b.batch) {
            // Untracked bulk goes after every batch
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => match policy {
                AllocationPolicy::Fefo => expiry_order(x, y).then(x.id.cmp(&y.id)),
                _ => x.received_at.cmp(&y.received_at).then(x.id.cmp(&y.id)),
            },
        });
        eligible
    }

    /// Greedy, all-or-nothing allocation of `quantity`
    pub fn allocate(
        candidates: &[Candidate],
        quantity: Decimal,
        policy: AllocationPolicy,
        today: NaiveDate,
    ) -> AppResult<Vec<Allocation>> {
        if let Err(message) = validate_positive(quantity) {
            let mut report = ValidationReport::new();
            report.push(Rule::PositiveQuantity, "quantity", message);
            return Err(AppError::from_report(report));
        }

        let ordered = Self::order(candidates, policy, today);
        let mut remaining = quantity;
        let mut plan = Vec::new();

        for candidate in &ordered {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(candidate.available);
            // Serial units are indivisible
            if candidate.is_serial() && take < candidate.available {
                continue;
            }
            plan.push(Allocation {
                batch_id: candidate.batch.as_ref().map(|b| b.id),
                quantity: take,
                serial: candidate.is_serial(),
            });
            remaining -= take;
        }

        if remaining > Decimal::ZERO {
            return Err(AppError::InsufficientStock {
                requested: quantity,
                available: quantity - remaining,
                shortfall: remaining,
            });
        }
        Ok(plan)
    }
}

/// Soonest expiry first; batches without expiry never expire and sort last
fn expiry_order(a: &Batch, b: &Batch) -> Ordering {
    match (a.expiry_date, b.expiry_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
