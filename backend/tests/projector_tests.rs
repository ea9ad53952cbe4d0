//! Balance projection tests
//!
//! Drift detection, rebuild from the ledger, and properties over random
//! operation sequences:
//! - stored balances always equal a full replay of the ledger
//! - reserved never exceeds on hand and on hand never goes negative
//! - on hand totals equal the sum of every ledger quantity
//! - committed movements never change

mod common;

use proptest::prelude::*;
use rust_decimal::Decimal;

use common::{day, dec, Fixture};
use shared::{AllocationPolicy, StockBalance, StockMovement};
use stock_ledger::ErrorKind;

// ============================================================================
// Drift and rebuild
// ============================================================================

#[tokio::test]
async fn test_consistent_projection_reports_no_drift() {
    let fx = Fixture::new().await;
    fx.ledger
        .receive(fx.tenant, fx.lot_receipt("L-1", "9", Some(day(10))))
        .await
        .unwrap();
    fx.ledger
        .transfer(fx.tenant, fx.transfer("4", AllocationPolicy::Fefo))
        .await
        .unwrap();
    fx.ledger
        .reserve(fx.tenant, fx.reservation("2", AllocationPolicy::Fefo))
        .await
        .unwrap();

    let drift = fx
        .ledger
        .check_consistency(fx.tenant, None, None)
        .await
        .unwrap();
    assert!(drift.is_empty(), "unexpected drift: {drift:?}");
}

#[tokio::test]
async fn test_damaged_balance_is_detected_and_repaired() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("10")).await.unwrap();
    fx.ledger
        .issue(fx.tenant, fx.issue("3", AllocationPolicy::None))
        .await
        .unwrap();

    let mut damaged = StockBalance::empty(fx.scope().key(None));
    damaged.quantity_on_hand = dec("99");
    fx.store.overwrite_balance(damaged);

    let drift = fx
        .ledger
        .check_consistency(fx.tenant, Some(fx.sku), Some(fx.location))
        .await
        .unwrap();
    assert_eq!(drift.len(), 1);
    assert_eq!(drift[0].expected_on_hand, dec("7"));
    assert_eq!(drift[0].actual_on_hand, dec("99"));
    // Checking does not repair
    assert_eq!(fx.on_hand(fx.location, None).await, dec("99"));

    let report = fx
        .ledger
        .rebuild_balances(fx.tenant, Some(fx.sku), Some(fx.location))
        .await
        .unwrap();
    assert_eq!(report.movements_replayed, 2);
    assert_eq!(report.repaired.len(), 1);
    assert_eq!(fx.on_hand(fx.location, None).await, dec("7"));

    let balance = fx
        .ledger
        .get_balance(fx.tenant, fx.sku, fx.location, None)
        .await
        .unwrap();
    assert_eq!(balance.last_movement_id, Some(2));
    assert!(fx
        .ledger
        .check_consistency(fx.tenant, None, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_stray_rows_are_removed_by_rebuild() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("1")).await.unwrap();

    let mut stray = StockBalance::empty(fx.scope().key(Some(uuid::Uuid::new_v4())));
    stray.quantity_on_hand = dec("5");
    fx.store.overwrite_balance(stray);

    let report = fx
        .ledger
        .rebuild_balances(fx.tenant, None, None)
        .await
        .unwrap();

    assert_eq!(report.repaired.len(), 1);
    assert_eq!(report.repaired[0].expected_on_hand, Decimal::ZERO);
    assert_eq!(report.rows_removed, 2);
    assert_eq!(report.rows_written, 1);
    assert_eq!(fx.totals(fx.location).await.0, dec("1"));
}

#[tokio::test]
async fn test_rebuild_keeps_held_reservations() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("8")).await.unwrap();
    fx.ledger
        .reserve(fx.tenant, fx.reservation("5", AllocationPolicy::Fifo))
        .await
        .unwrap();

    let report = fx
        .ledger
        .rebuild_balances(fx.tenant, None, None)
        .await
        .unwrap();

    assert!(report.repaired.is_empty());
    assert_eq!(fx.totals(fx.location).await, (dec("8"), dec("5"), dec("3")));
}

#[tokio::test]
async fn test_rebuild_is_scoped() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("4")).await.unwrap();
    fx.ledger
        .transfer(fx.tenant, fx.transfer("1", AllocationPolicy::None))
        .await
        .unwrap();

    let report = fx
        .ledger
        .rebuild_balances(fx.tenant, Some(fx.sku), Some(fx.other_location))
        .await
        .unwrap();

    assert_eq!(report.movements_replayed, 1);
    assert_eq!(report.rows_written, 1);
    assert_eq!(fx.on_hand(fx.location, None).await, dec("3"));
    assert_eq!(fx.on_hand(fx.other_location, None).await, dec("1"));
}

// ============================================================================
// Property Tests
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Receive { lot: Option<u8>, quantity: u32 },
    Issue { quantity: u32, fefo: bool },
    Transfer { quantity: u32 },
    Adjust { delta: i32 },
    Reserve { quantity: u32 },
    ReleaseOldest,
    CommitOldest,
    Expire { minutes: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (prop::option::of(0u8..3), 1u32..20)
            .prop_map(|(lot, quantity)| Op::Receive { lot, quantity }),
        2 => (1u32..15, any::<bool>()).prop_map(|(quantity, fefo)| Op::Issue { quantity, fefo }),
        1 => (1u32..10).prop_map(|quantity| Op::Transfer { quantity }),
        1 => (-8i32..8).prop_filter("nonzero", |d| *d != 0).prop_map(|delta| Op::Adjust { delta }),
        2 => (1u32..10).prop_map(|quantity| Op::Reserve { quantity }),
        1 => Just(Op::ReleaseOldest),
        1 => Just(Op::CommitOldest),
        1 => (1u8..30).prop_map(|minutes| Op::Expire { minutes }),
    ]
}

/// What a run observed, checked outside the async block
struct Outcome {
    unexpected: Vec<String>,
    drift: usize,
    bad_rows: Vec<StockBalance>,
    ledger_total: Decimal,
    on_hand_total: Decimal,
    history_preserved: bool,
}

async fn run_ops(ops: Vec<Op>) -> Outcome {
    let fx = Fixture::new().await;
    let mut held = Vec::new();
    let mut unexpected = Vec::new();
    let mut history_preserved = true;

    for op in ops {
        let before: Vec<StockMovement> = fx.store.movements();
        let result = match op {
            Op::Receive { lot, quantity } => {
                let quantity = quantity.to_string();
                let input = match lot {
                    Some(n) => fx.lot_receipt(
                        &format!("LOT-{n}"),
                        &quantity,
                        Some(day(i64::from(n) * 5)),
                    ),
                    None => fx.receipt(&quantity),
                };
                fx.ledger.receive(fx.tenant, input).await.map(|_| ())
            }
            Op::Issue { quantity, fefo } => {
                let policy = if fefo {
                    AllocationPolicy::Fefo
                } else {
                    AllocationPolicy::Fifo
                };
                fx.ledger
                    .issue(fx.tenant, fx.issue(&quantity.to_string(), policy))
                    .await
                    .map(|_| ())
            }
            Op::Transfer { quantity } => fx
                .ledger
                .transfer(
                    fx.tenant,
                    fx.transfer(&quantity.to_string(), AllocationPolicy::Fifo),
                )
                .await
                .map(|_| ()),
            Op::Adjust { delta } => fx
                .ledger
                .adjust(fx.tenant, fx.adjustment(None, &delta.to_string(), "count"))
                .await
                .map(|_| ()),
            Op::Reserve { quantity } => fx
                .ledger
                .reserve(
                    fx.tenant,
                    fx.reservation(&quantity.to_string(), AllocationPolicy::Fifo),
                )
                .await
                .map(|r| held.push(r.id)),
            Op::ReleaseOldest => match held.first().copied() {
                Some(id) => {
                    held.remove(0);
                    fx.ledger.release(fx.tenant, id).await.map(|_| ())
                }
                None => Ok(()),
            },
            Op::CommitOldest => match held.first().copied() {
                Some(id) => {
                    held.remove(0);
                    fx.ledger
                        .commit_reservation(fx.tenant, id, common::reference("SO-P"))
                        .await
                        .map(|_| ())
                }
                None => Ok(()),
            },
            Op::Expire { minutes } => {
                fx.clock.advance(chrono::Duration::minutes(i64::from(minutes)));
                fx.ledger.expire_reservations().await.map(|_| ())
            }
        };

        if let Err(err) = result {
            // Business rejections are expected; anything else is a defect
            if !matches!(
                err.kind(),
                ErrorKind::Validation
                    | ErrorKind::InsufficientStock
                    | ErrorKind::InvalidStateTransition
            ) {
                unexpected.push(err.to_string());
            }
        }

        let after = fx.store.movements();
        history_preserved &= after.len() >= before.len() && after[..before.len()] == before[..];
    }

    let drift = fx
        .ledger
        .check_consistency(fx.tenant, None, None)
        .await
        .map(|d| d.len())
        .unwrap_or(usize::MAX);

    let mut rows = Vec::new();
    let mut on_hand_total = Decimal::ZERO;
    for location in [fx.location, fx.other_location] {
        let summary = fx
            .ledger
            .get_stock_summary(fx.tenant, fx.sku, location)
            .await
            .unwrap();
        on_hand_total += summary.quantity_on_hand;
        rows.extend(summary.batches);
    }
    let bad_rows = rows
        .into_iter()
        .filter(|b| !b.is_consistent() || b.quantity_on_hand < Decimal::ZERO)
        .collect();
    let ledger_total = fx.store.movements().iter().map(|m| m.quantity).sum();

    Outcome {
        unexpected,
        drift,
        bad_rows,
        ledger_total,
        on_hand_total,
        history_preserved,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_projection_matches_ledger(ops in prop::collection::vec(arb_op(), 1..40)) {
        let outcome = tokio_test::block_on(run_ops(ops));

        prop_assert!(outcome.unexpected.is_empty(), "unexpected errors: {:?}", outcome.unexpected);
        prop_assert_eq!(outcome.drift, 0);
        prop_assert!(outcome.bad_rows.is_empty(), "inconsistent rows: {:?}", outcome.bad_rows);
        prop_assert_eq!(outcome.ledger_total, outcome.on_hand_total);
        prop_assert!(outcome.history_preserved);
    }
}
