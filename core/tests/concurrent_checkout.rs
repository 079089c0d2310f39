//! Concurrent checkouts and webhook deliveries against shared stock.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use boxoffice_core::error::{CheckoutError, ModifierError, StockError};
use boxoffice_core::modifier::{ModifierId, ModifierKind, ModifierRepository};
use boxoffice_core::order::OrderStatus;
use boxoffice_testing::fixtures::{Harness, cart_in_group, percent_coupon, purchaser, GATEWAY_ID};
use futures::future::join_all;
use std::sync::Arc;

async fn concurrent_checkouts(
    harness: &Harness,
    attempts: usize,
    quantity: u32,
) -> Vec<Result<boxoffice_core::order::Order, CheckoutError>> {
    let handles = (0..attempts).map(|_| {
        let service = Arc::clone(&harness.service);
        tokio::spawn(async move {
            service
                .place_order(&cart_in_group(1, quantity, 1000, "ga"), purchaser(), GATEWAY_ID)
                .await
        })
    });
    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect()
}

fn sold_out_count<T>(results: &[Result<T, CheckoutError>]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r, Err(CheckoutError::Stock(StockError::Insufficient { .. }))))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_seat_goes_to_exactly_one_buyer() {
    let harness = Harness::new();
    harness.define_group("ga", 1).await;

    let results = concurrent_checkouts(&harness, 2, 1).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(sold_out_count(&results), 1);
    assert_eq!(harness.record("ga").await.reserved, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn six_pairs_against_ten_seats_admit_five() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;

    let results = concurrent_checkouts(&harness, 6, 2).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    assert_eq!(sold_out_count(&results), 1);
    let record = harness.record("ga").await;
    assert_eq!(record.reserved, 10);
    assert_eq!(record.available(), Some(0));
    assert_eq!(harness.orders.len().await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_webhooks_commit_once() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 2, 1000, "ga")).await.unwrap();
    let notification = Harness::notification("evt_dup", "payment.settled", &order);

    let handles = (0..8).map(|_| {
        let service = Arc::clone(&harness.service);
        let notification = notification.clone();
        tokio::spawn(async move { service.handle_webhook(notification).await })
    });
    let outcomes = join_all(handles).await;

    assert!(outcomes.into_iter().all(|joined| joined.unwrap().is_ok()));
    let record = harness.record("ga").await;
    assert_eq!((record.reserved, record.committed), (0, 2));
    assert_eq!(
        harness.service.order(order.id).await.unwrap().status,
        OrderStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn settle_and_cancel_race_has_a_single_winner() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 3, 1000, "ga")).await.unwrap();

    let settle = {
        let service = Arc::clone(&harness.service);
        tokio::spawn(async move { service.settle(order.id).await })
    };
    let cancel = {
        let service = Arc::clone(&harness.service);
        tokio::spawn(async move { service.cancel(order.id, "abandoned").await })
    };
    let (settled, cancelled) = (settle.await.unwrap(), cancel.await.unwrap());

    assert_ne!(settled.is_ok(), cancelled.is_ok());
    let record = harness.record("ga").await;
    let stored = harness.service.order(order.id).await.unwrap();
    assert!(matches!(
        stored.status,
        OrderStatus::Completed | OrderStatus::Cancelled
    ));
    let expected = if stored.status == OrderStatus::Completed {
        (0, 3)
    } else {
        (0, 0)
    };
    assert_eq!((record.reserved, record.committed), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_use_coupon_is_redeemed_once_under_contention() {
    let harness = Harness::with_catalog(
        [percent_coupon(7, "ONCE", 1_000).with_usage_limit(1)]
            .into_iter()
            .collect(),
    );
    harness.define_group("ga", 20).await;
    let mut cart = cart_in_group(1, 1, 1000, "ga");
    harness.service.apply_coupon(&mut cart, "ONCE").await.unwrap();

    let handles = (0..8).map(|_| {
        let service = Arc::clone(&harness.service);
        let cart = cart.clone();
        tokio::spawn(async move { service.place_order(&cart, purchaser(), GATEWAY_ID).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
        r,
        Err(CheckoutError::Modifier(ModifierError::CouponExhausted(slug))) if slug == "ONCE"
    )));
    assert_eq!(harness.record("ga").await.reserved, 1);
    let catalog = harness.modifiers.load_catalog().await.unwrap();
    assert!(matches!(
        catalog.get(&ModifierId::new(7)).unwrap().kind,
        ModifierKind::Coupon { times_redeemed: 1, .. }
    ));
}
