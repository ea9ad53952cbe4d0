//! Concurrency tests
//!
//! Racing writers on one scope, opposite transfers, lock timeouts and
//! rebuilds running alongside writes.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use rust_decimal::Decimal;

use futures::TryStreamExt;

use common::{dec, day, start, Fixture};
use shared::{AllocationPolicy, HistoryFilter, LEDGER_START};
use stock_ledger::config::LedgerConfig;
use stock_ledger::store::{LedgerStore, LedgerTx};
use stock_ledger::ErrorKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_issues_never_oversell() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("10")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let ledger = fx.ledger.clone();
        let input = fx.issue("10", AllocationPolicy::Fifo);
        let tenant = fx.tenant;
        handles.push(tokio::spawn(async move { ledger.issue(tenant, input).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::InsufficientStock),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(fx.on_hand(fx.location, None).await, Decimal::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_small_issues_drain_exactly() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("50")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..60 {
        let ledger = fx.ledger.clone();
        let input = fx.issue("1", AllocationPolicy::None);
        let tenant = fx.tenant;
        handles.push(tokio::spawn(async move { ledger.issue(tenant, input).await }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 50);
    assert_eq!(fx.on_hand(fx.location, None).await, Decimal::ZERO);

    // Every committed id is distinct
    let ids: Vec<i64> = fx.store.movements().iter().map(|m| m.id).collect();
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_do_not_deadlock() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("100")).await.unwrap();
    let mut at_other = fx.receipt("100");
    at_other.location_id = fx.other_location;
    fx.ledger.receive(fx.tenant, at_other).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = fx.ledger.clone();
        let mut input = fx.transfer("1", AllocationPolicy::None);
        if i % 2 == 1 {
            std::mem::swap(&mut input.from_location_id, &mut input.to_location_id);
        }
        let tenant = fx.tenant;
        handles.push(tokio::spawn(async move { ledger.transfer(tenant, input).await }));
    }

    let all = futures::future::join_all(handles);
    let results = tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("transfers deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    assert_eq!(fx.on_hand(fx.location, None).await, dec("100"));
    assert_eq!(fx.on_hand(fx.other_location, None).await, dec("100"));
}

#[tokio::test]
async fn test_lock_timeout_is_retryable() {
    let fx = Fixture::with_config(LedgerConfig {
        lock_timeout_ms: 50,
        ..Default::default()
    })
    .await;
    fx.ledger.receive(fx.tenant, fx.receipt("5")).await.unwrap();

    let blocker = fx.store.begin(fx.tenant, &[fx.scope()]).await.unwrap();
    let err = fx
        .ledger
        .issue(fx.tenant, fx.issue("1", AllocationPolicy::Fifo))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Concurrency);
    assert!(err.is_retryable());

    blocker.rollback().await.unwrap();
    fx.ledger
        .issue(fx.tenant, fx.issue("1", AllocationPolicy::Fifo))
        .await
        .unwrap();
    assert_eq!(fx.on_hand(fx.location, None).await, dec("4"));
}

#[tokio::test]
async fn test_other_scopes_are_not_blocked() {
    let fx = Fixture::with_config(LedgerConfig {
        lock_timeout_ms: 50,
        ..Default::default()
    })
    .await;

    let _blocker = fx.store.begin(fx.tenant, &[fx.scope()]).await.unwrap();
    let mut elsewhere = fx.receipt("3");
    elsewhere.location_id = fx.other_location;
    fx.ledger.receive(fx.tenant, elsewhere).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_new_lot_at_two_locations() {
    let fx = Fixture::new().await;

    let mut handles = Vec::new();
    for location in [fx.location, fx.other_location] {
        let ledger = fx.ledger.clone();
        let mut input = fx.lot_receipt("SHARED", "2", Some(day(9)));
        input.location_id = location;
        let tenant = fx.tenant;
        handles.push(tokio::spawn(async move { ledger.receive(tenant, input).await }));
    }

    let mut batch_ids = HashSet::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(movement) => {
                batch_ids.insert(movement.batch_id);
            }
            Err(err) => assert!(err.is_retryable(), "unexpected error: {err}"),
        }
    }
    // Whoever won, the lot exists once
    assert_eq!(batch_ids.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebuild_alongside_writers_stays_consistent() {
    let fx = Fixture::new().await;
    fx.ledger.receive(fx.tenant, fx.receipt("40")).await.unwrap();

    let mut writers = Vec::new();
    for _ in 0..20 {
        let ledger = fx.ledger.clone();
        let input = fx.issue("1", AllocationPolicy::None);
        let tenant = fx.tenant;
        writers.push(tokio::spawn(async move { ledger.issue(tenant, input).await }));
    }
    let rebuilder = {
        let ledger = fx.ledger.clone();
        let tenant = fx.tenant;
        tokio::spawn(async move { ledger.rebuild_balances(tenant, None, None).await })
    };

    for writer in writers {
        writer.await.unwrap().unwrap();
    }
    rebuilder.await.unwrap().unwrap();

    assert_eq!(fx.on_hand(fx.location, None).await, dec("20"));
    assert!(fx
        .ledger
        .check_consistency(fx.tenant, None, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_scopes_commit_in_id_order() {
    let fx = Fixture::new().await;

    // First writer appends at one location and keeps its transaction open
    let mut first = fx.store.begin(fx.tenant, &[fx.scope()]).await.unwrap();
    let appended = first
        .append(vec![fx.raw_receipt(fx.location, "1")], start())
        .await
        .unwrap();
    assert_eq!(appended[0].id, 1);

    // Second writer works another scope and commits as soon as it can
    let second = {
        let ledger = fx.ledger.clone();
        let mut input = fx.receipt("2");
        input.location_id = fx.other_location;
        let tenant = fx.tenant;
        tokio::spawn(async move { ledger.receive(tenant, input).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    // A reader sees nothing until the lower id commits
    let early: Vec<_> = fx
        .ledger
        .movement_stream(fx.tenant, HistoryFilter::default(), LEDGER_START)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert!(early.is_empty());

    first.commit().await.unwrap();
    let movement = second.await.unwrap().unwrap();
    assert_eq!(movement.id, 2);

    // Resuming from the last seen id misses nothing
    let seen: Vec<_> = fx
        .ledger
        .movement_stream(fx.tenant, HistoryFilter::default(), LEDGER_START)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(seen.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    let resumed: Vec<_> = fx
        .ledger
        .movement_stream(fx.tenant, HistoryFilter::default(), 1)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(resumed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn test_rolled_back_append_leaves_no_gap() {
    let fx = Fixture::new().await;

    let mut doomed = fx.store.begin(fx.tenant, &[fx.scope()]).await.unwrap();
    doomed
        .append(
            vec![
                fx.raw_receipt(fx.location, "1"),
                fx.raw_receipt(fx.location, "1"),
            ],
            start(),
        )
        .await
        .unwrap();
    doomed.rollback().await.unwrap();

    let first = fx.ledger.receive(fx.tenant, fx.receipt("3")).await.unwrap();
    let second = fx.ledger.receive(fx.tenant, fx.receipt("4")).await.unwrap();
    assert_eq!((first.id, second.id), (1, 2));
}
