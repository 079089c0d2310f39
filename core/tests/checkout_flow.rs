//! End-to-end checkout flows over the in-memory stores.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use boxoffice_core::OrderService;
use boxoffice_core::error::{CheckoutError, GatewayError, ModifierError, OrderError};
use boxoffice_core::gateway::{GatewayAdapter, GatewayRef, Settlement};
use boxoffice_core::janitor::Janitor;
use boxoffice_core::modifier::{
    InMemoryModifierRepository, ModifierCatalog, ModifierId, ModifierKind, ModifierRepository,
    ModifierScope,
};
use boxoffice_core::money::Money;
use boxoffice_core::order::{
    InMemoryOrderRepository, Order, OrderId, OrderPolicy, OrderRepository, OrderStatus,
};
use boxoffice_core::stock::{InMemoryStockLedger, StockGroupKey, StockLedger};
use boxoffice_core::webhook::{InMemoryWebhookStore, WebhookEventStore, WebhookNotification, WebhookOutcome};
use boxoffice_testing::fixtures::{
    GATEWAY_ID, Harness, cart_in_group, flat_fee, percent_coupon, purchaser,
};
use boxoffice_testing::{ManualClock, ScriptedGateway, init_test_tracing, test_time};
use chrono::Duration;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};

fn catalog(modifiers: impl IntoIterator<Item = boxoffice_core::modifier::Modifier>) -> ModifierCatalog {
    modifiers.into_iter().collect()
}

#[tokio::test]
async fn per_item_fee_is_charged_per_unit() {
    let harness = Harness::with_catalog(catalog([flat_fee(1, "booking", 150, ModifierScope::PerItem)]));

    let pricing = harness
        .service
        .price_cart(&cart_in_group(1, 2, 1000, "ga"))
        .await
        .unwrap();

    assert_eq!(pricing.subtotal.to_string(), "20.00");
    assert_eq!(pricing.fees.to_string(), "3.00");
    assert_eq!(pricing.total.to_string(), "23.00");
}

#[tokio::test]
async fn percentage_coupon_discounts_subtotal() {
    let harness = Harness::with_catalog(catalog([percent_coupon(7, "SAVE10", 1_000)]));
    let mut cart = cart_in_group(1, 2, 1000, "ga");

    let id = harness.service.apply_coupon(&mut cart, "save10").await.unwrap();
    let pricing = harness.service.price_cart(&cart).await.unwrap();

    assert_eq!(id, ModifierId::new(7));
    assert_eq!(pricing.discount.to_string(), "2.00");
    assert_eq!(pricing.discounted_subtotal().unwrap().to_string(), "18.00");
    assert_eq!(pricing.total.to_string(), "18.00");
}

#[tokio::test]
async fn expired_coupon_is_a_user_facing_error() {
    let coupon = percent_coupon(7, "SUMMER", 1_000)
        .with_window(None, Some(boxoffice_testing::test_time() - Duration::days(1)));
    let harness = Harness::with_catalog(catalog([coupon]));
    let mut cart = cart_in_group(1, 1, 1000, "ga");

    let error = harness
        .service
        .apply_coupon(&mut cart, "SUMMER")
        .await
        .unwrap_err();

    assert_eq!(
        error,
        CheckoutError::Cart(ModifierError::CouponExpired("SUMMER".to_string()).into())
    );
    assert!(error.is_user_facing());
    assert!(cart.attached_cart_modifiers.is_empty());
}

#[tokio::test]
async fn settled_order_commits_stock_and_redeems_coupon() {
    init_test_tracing();
    let harness = Harness::with_catalog(catalog([percent_coupon(7, "SAVE10", 1_000)]));
    harness.define_group("ga", 10).await;
    let mut cart = cart_in_group(1, 2, 1000, "ga");
    harness.service.apply_coupon(&mut cart, "SAVE10").await.unwrap();

    let order = harness.place(&cart).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(harness.record("ga").await.reserved, 2);

    let order = harness.service.settle(order.id).await.unwrap();

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.total.to_string(), "18.00");
    let record = harness.record("ga").await;
    assert_eq!((record.reserved, record.committed), (0, 2));

    let stored = harness.modifiers.load_catalog().await.unwrap();
    assert!(matches!(
        stored.get(&ModifierId::new(7)).unwrap().kind,
        ModifierKind::Coupon { times_redeemed: 1, .. }
    ));
}

async fn coupon_redemptions(harness: &Harness, id: u64) -> u32 {
    let catalog = harness.modifiers.load_catalog().await.unwrap();
    match catalog.get(&ModifierId::new(id)).unwrap().kind {
        ModifierKind::Coupon { times_redeemed, .. } => times_redeemed,
        ModifierKind::Fee { .. } => 0,
    }
}

#[tokio::test]
async fn single_use_coupon_is_held_by_the_first_order() {
    init_test_tracing();
    let harness = Harness::with_catalog(catalog([
        percent_coupon(7, "ONCE", 1_000).with_usage_limit(1),
    ]));
    harness.define_group("ga", 10).await;
    let mut first_cart = cart_in_group(1, 1, 1000, "ga");
    let mut second_cart = cart_in_group(1, 1, 1000, "ga");
    harness.service.apply_coupon(&mut first_cart, "ONCE").await.unwrap();
    harness.service.apply_coupon(&mut second_cart, "ONCE").await.unwrap();

    let first = harness.place(&first_cart).await.unwrap();
    assert_eq!(first.total.to_string(), "9.00");
    assert_eq!(coupon_redemptions(&harness, 7).await, 1);

    let second = harness.place(&second_cart).await;
    assert_eq!(
        second,
        Err(CheckoutError::Modifier(ModifierError::CouponExhausted("ONCE".to_string())))
    );
    assert_eq!(harness.record("ga").await.reserved, 1);
    assert_eq!(harness.orders.len().await, 1);

    harness.service.settle(first.id).await.unwrap();
    assert_eq!(coupon_redemptions(&harness, 7).await, 1);
    assert!(harness.place(&second_cart).await.is_err());
}

#[tokio::test]
async fn cancelled_order_gives_its_coupon_back() {
    let harness = Harness::with_catalog(catalog([
        percent_coupon(7, "ONCE", 1_000).with_usage_limit(1),
    ]));
    harness.define_group("ga", 10).await;
    let mut cart = cart_in_group(1, 1, 1000, "ga");
    harness.service.apply_coupon(&mut cart, "ONCE").await.unwrap();

    let first = harness.place(&cart).await.unwrap();
    harness.service.cancel(first.id, "changed mind").await.unwrap();
    assert_eq!(coupon_redemptions(&harness, 7).await, 0);

    let second = harness.place(&cart).await.unwrap();
    assert_eq!(second.total.to_string(), "9.00");
    assert_eq!(coupon_redemptions(&harness, 7).await, 1);
}

#[tokio::test]
async fn sold_out_checkout_returns_the_coupon_hold() {
    let harness = Harness::with_catalog(catalog([
        percent_coupon(7, "ONCE", 1_000).with_usage_limit(1),
    ]));
    harness.define_group("ga", 1).await;
    let mut cart = cart_in_group(1, 2, 1000, "ga");
    harness.service.apply_coupon(&mut cart, "ONCE").await.unwrap();

    let result = harness.place(&cart).await;

    assert!(matches!(result, Err(CheckoutError::Stock(_))));
    assert_eq!(coupon_redemptions(&harness, 7).await, 0);
}

#[tokio::test]
async fn declined_payment_fails_order_and_releases_stock() {
    let harness = Harness::with_options(
        ModifierCatalog::new(),
        OrderPolicy::default(),
        ScriptedGateway::new(GATEWAY_ID).then_decline("card_declined"),
    );
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 4, 1000, "ga")).await.unwrap();

    let order = harness.service.settle(order.id).await.unwrap();

    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.status_reason.as_deref(), Some("card_declined"));
    let record = harness.record("ga").await;
    assert_eq!((record.reserved, record.committed), (0, 0));
}

#[tokio::test]
async fn sold_out_checkout_leaves_no_order_behind() {
    let harness = Harness::new();
    harness.define_group("ga", 1).await;

    let error = harness
        .place(&cart_in_group(1, 2, 1000, "ga"))
        .await
        .unwrap_err();

    assert!(error.is_user_facing());
    assert_eq!(error.user_message().as_deref(), Some("Only 1 left"));
    assert!(harness.orders.is_empty().await);
    assert_eq!(harness.record("ga").await.reserved, 0);
}

#[tokio::test]
async fn failed_order_cannot_be_completed() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 1, 1000, "ga")).await.unwrap();
    harness.service.fail(order.id, "card_declined").await.unwrap();

    let result = harness.service.complete(order.id, None).await;

    assert_eq!(
        result,
        Err(CheckoutError::Order(OrderError::InvalidTransition {
            from: OrderStatus::Failed,
            to: OrderStatus::Completed
        }))
    );
    assert_eq!(harness.record("ga").await.committed, 0);
}

#[tokio::test]
async fn duplicate_webhooks_commit_stock_once() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 2, 1000, "ga")).await.unwrap();
    let settled = Harness::notification("evt_1", "payment.settled", &order);

    let first = harness.service.handle_webhook(settled.clone()).await.unwrap();
    let redelivered = harness.service.handle_webhook(settled).await.unwrap();
    let second_event = harness
        .service
        .handle_webhook(Harness::notification("evt_2", "payment.succeeded", &order))
        .await
        .unwrap();

    assert_eq!(first, WebhookOutcome::Processed(order.id, OrderStatus::Completed));
    assert_eq!(redelivered, WebhookOutcome::Duplicate);
    assert_eq!(second_event, WebhookOutcome::Processed(order.id, OrderStatus::Completed));
    let record = harness.record("ga").await;
    assert_eq!((record.reserved, record.committed), (0, 2));
    assert_eq!(harness.orders.len().await, 1);
    let stored = harness.webhooks.get("evt_1".to_string()).await.unwrap().unwrap();
    assert_eq!(stored.order_id, Some(order.id));
    assert!(stored.processed_at.is_some());
}

#[tokio::test]
async fn refund_restocks_only_when_policy_says_so() {
    for restock_on_refund in [false, true] {
        let harness = Harness::with_options(
            ModifierCatalog::new(),
            OrderPolicy {
                restock_on_refund,
                ..OrderPolicy::default()
            },
            ScriptedGateway::new(GATEWAY_ID),
        );
        harness.define_group("ga", 10).await;
        let order = harness.place(&cart_in_group(1, 3, 1000, "ga")).await.unwrap();
        harness.service.settle(order.id).await.unwrap();

        let refunded = harness.service.refund(order.id, None).await.unwrap();

        assert_eq!(refunded.status, OrderStatus::Refunded);
        assert_eq!(refunded.refunded_amount, Money::from_cents(3000));
        assert_eq!(harness.gateway.refunds().await.len(), 1);
        let expected_committed = if restock_on_refund { 0 } else { 3 };
        assert_eq!(harness.record("ga").await.committed, expected_committed);
    }
}

#[tokio::test]
async fn failed_gateway_refund_keeps_order_completed() {
    let harness = Harness::with_options(
        ModifierCatalog::new(),
        OrderPolicy::default(),
        ScriptedGateway::new(GATEWAY_ID).failing_refunds(GatewayError::Timeout),
    );
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 1, 1000, "ga")).await.unwrap();
    harness.service.settle(order.id).await.unwrap();

    let result = harness.service.refund(order.id, None).await;

    assert_eq!(result, Err(CheckoutError::Gateway(GatewayError::Timeout)));
    assert_eq!(
        harness.service.order(order.id).await.unwrap().status,
        OrderStatus::Completed
    );
}

#[tokio::test]
async fn refund_retried_after_lost_status_write_is_not_paid_twice() {
    init_test_tracing();
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 2, 1000, "ga")).await.unwrap();
    harness.service.settle(order.id).await.unwrap();

    harness.orders.fail_next_updates(1);
    let first = harness.service.refund(order.id, None).await;
    assert!(matches!(first, Err(CheckoutError::Order(OrderError::Storage(_)))));
    assert_eq!(
        harness.service.order(order.id).await.unwrap().status,
        OrderStatus::Completed
    );

    let retried = harness.service.refund(order.id, None).await.unwrap();

    assert_eq!(retried.status, OrderStatus::Refunded);
    assert_eq!(harness.gateway.refund_attempts().await, 2);
    assert_eq!(
        harness.gateway.refunds().await,
        vec![(order.gateway_order_ref.clone().unwrap(), Money::from_cents(2000))]
    );
}

#[tokio::test]
async fn refund_without_gateway_reference_is_refused() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let placed = harness.place(&cart_in_group(1, 1, 1000, "ga")).await.unwrap();
    let mut unreferenced = placed.clone();
    unreferenced.gateway_order_ref = None;
    harness
        .orders
        .update(unreferenced, OrderStatus::Pending)
        .await
        .unwrap();
    harness.service.complete(placed.id, None).await.unwrap();

    let result = harness.service.refund(placed.id, None).await;

    assert_eq!(result, Err(CheckoutError::Gateway(GatewayError::MissingReference)));
    assert_eq!(
        harness.service.order(placed.id).await.unwrap().status,
        OrderStatus::Completed
    );
    assert_eq!(harness.gateway.refund_attempts().await, 0);

    // A refund the provider reports itself needs no reference.
    let mut reported = Harness::notification("evt_r", "payment.refunded", &placed);
    reported.order_id = Some(placed.id);
    reported.gateway_ref = None;
    let outcome = harness.service.handle_webhook(reported).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed(placed.id, OrderStatus::Refunded));
    assert_eq!(harness.gateway.refund_attempts().await, 0);
}

#[tokio::test]
async fn refund_webhook_does_not_refund_twice() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 1, 1000, "ga")).await.unwrap();
    harness.service.settle(order.id).await.unwrap();

    let outcome = harness
        .service
        .handle_webhook(Harness::notification("evt_r", "payment.refunded", &order))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Processed(order.id, OrderStatus::Refunded));
    assert!(harness.gateway.refunds().await.is_empty());
}

#[tokio::test]
async fn unmatched_webhooks_are_evicted_after_retention() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;
    let order = harness.place(&cart_in_group(1, 1, 1000, "ga")).await.unwrap();
    let mut stray = Harness::notification("evt_stray", "payment.settled", &order);
    stray.gateway_ref = Some(boxoffice_core::gateway::GatewayRef::new("unknown_ref"));

    let outcome = harness.service.handle_webhook(stray).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Unmatched);
    assert_eq!(harness.service.evict_stale_webhooks().await.unwrap(), 0);

    harness.clock.advance(Duration::days(8));

    assert_eq!(harness.service.evict_stale_webhooks().await.unwrap(), 1);
    assert!(harness.webhooks.get("evt_stray".to_string()).await.unwrap().is_none());
}

#[tokio::test]
async fn janitor_cancels_orders_whose_reservation_expired() {
    let harness = Harness::new();
    harness.define_group("ga", 5).await;
    let order = harness.place(&cart_in_group(1, 5, 1000, "ga")).await.unwrap();
    let (janitor, _shutdown) = Janitor::new(harness.service.clone(), std::time::Duration::from_secs(60));

    let early = janitor.sweep_once().await.unwrap();
    assert!(early.cancelled_orders.is_empty());

    harness.clock.advance(Duration::minutes(16));
    let report = janitor.sweep_once().await.unwrap();

    assert_eq!(report.cancelled_orders, vec![order.id]);
    let stored = harness.service.order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert_eq!(harness.record("ga").await.reserved, 0);

    // A settlement arriving after expiry cannot resurrect the order.
    assert!(harness.service.settle(order.id).await.is_err());
    assert_eq!(harness.record("ga").await.committed, 0);
}

#[tokio::test]
async fn failed_expiry_cancellation_is_retried_by_the_next_sweep() {
    init_test_tracing();
    let harness = Harness::new();
    harness.define_group("ga", 5).await;
    let order = harness.place(&cart_in_group(1, 2, 1000, "ga")).await.unwrap();
    let (janitor, _shutdown) = Janitor::new(harness.service.clone(), std::time::Duration::from_secs(60));
    harness.clock.advance(Duration::minutes(16));

    harness.orders.fail_next_updates(1);
    let first = janitor.sweep_once().await.unwrap();
    assert!(first.cancelled_orders.is_empty());
    assert_eq!(
        harness.service.order(order.id).await.unwrap().status,
        OrderStatus::Pending
    );

    let second = janitor.sweep_once().await.unwrap();

    assert_eq!(second.cancelled_orders, vec![order.id]);
    assert_eq!(
        harness.service.order(order.id).await.unwrap().status,
        OrderStatus::Cancelled
    );
    assert_eq!(harness.record("ga").await.reserved, 0);
    assert!(janitor.sweep_once().await.unwrap().cancelled_orders.is_empty());
}

#[tokio::test]
async fn spawned_janitor_stops_on_shutdown() {
    let harness = Harness::new();
    let (handle, shutdown) = Janitor::spawn(harness.service.clone(), std::time::Duration::from_millis(5));

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    shutdown.send(true).unwrap();

    assert!(handle.await.is_ok());
}

#[tokio::test]
async fn failed_payment_intent_cancels_the_order() {
    let harness = Harness::with_options(
        ModifierCatalog::new(),
        OrderPolicy::default(),
        ScriptedGateway::new(GATEWAY_ID).failing_intents(GatewayError::Provider("down".to_string())),
    );
    harness.define_group("ga", 10).await;

    let result = harness.place(&cart_in_group(1, 2, 1000, "ga")).await;

    assert_eq!(
        result,
        Err(CheckoutError::Gateway(GatewayError::Provider("down".to_string())))
    );
    assert_eq!(harness.orders.len().await, 1);
    assert_eq!(harness.record("ga").await.reserved, 0);
}

#[tokio::test]
async fn unbounded_ttl_and_retention_saturate() {
    let harness = Harness::with_options(
        ModifierCatalog::new(),
        OrderPolicy {
            reservation_ttl: Duration::MAX,
            ..OrderPolicy::default()
        },
        ScriptedGateway::new(GATEWAY_ID),
    );
    harness.define_group("ga", 10).await;

    let order = harness.place(&cart_in_group(1, 1, 1000, "ga")).await.unwrap();

    assert_eq!(
        order.reservation.as_ref().map(|r| r.expires_at),
        Some(chrono::DateTime::<chrono::Utc>::MAX_UTC)
    );
    let keep_forever = OrderService::new(
        harness.ledger.clone(),
        harness.orders.clone(),
        harness.webhooks.clone(),
        harness.modifiers.clone(),
        harness.clock.clone(),
    )
    .with_webhook_retention(Duration::MAX);
    assert_eq!(keep_forever.evict_stale_webhooks().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_gateway_is_rejected_before_reserving() {
    let harness = Harness::new();
    harness.define_group("ga", 10).await;

    let result = harness
        .service
        .place_order(
            &cart_in_group(1, 2, 1000, "ga"),
            boxoffice_testing::fixtures::purchaser(),
            "paypal",
        )
        .await;

    assert_eq!(
        result,
        Err(CheckoutError::Gateway(GatewayError::UnknownGateway("paypal".to_string())))
    );
    assert_eq!(harness.record("ga").await.reserved, 0);
}

/// Gateway whose intent creation waits until the test lets it finish.
struct HeldIntentGateway {
    started: Mutex<Option<oneshot::Sender<OrderId>>>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

impl GatewayAdapter for HeldIntentGateway {
    fn id(&self) -> &str {
        "held"
    }

    fn create_intent<'a>(
        &'a self,
        order: &'a Order,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayRef, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(started) = self.started.lock().await.take() {
                let _ = started.send(order.id);
            }
            if let Some(release) = self.release.lock().await.take() {
                let _ = release.await;
            }
            Ok(GatewayRef::new("pi_held"))
        })
    }

    fn confirm(
        &self,
        _reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement, GatewayError>> + Send + '_>> {
        Box::pin(async { Ok(Settlement::Settled) })
    }

    fn refund(
        &self,
        _reference: GatewayRef,
        _amount: Money,
        idempotency_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>> {
        Box::pin(async move { Ok(idempotency_key) })
    }
}

#[tokio::test]
async fn settlement_during_intent_creation_is_not_overwritten() {
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let ledger = Arc::new(InMemoryStockLedger::new());
    let orders = Arc::new(InMemoryOrderRepository::new());
    ledger.define_group(StockGroupKey::new("ga"), 10).await.unwrap();
    let service = Arc::new(
        OrderService::new(
            ledger.clone(),
            orders.clone(),
            Arc::new(InMemoryWebhookStore::new()),
            Arc::new(InMemoryModifierRepository::default()),
            Arc::new(ManualClock::starting_at(test_time())),
        )
        .with_gateway(Arc::new(HeldIntentGateway {
            started: Mutex::new(Some(started_tx)),
            release: Mutex::new(Some(release_rx)),
        })),
    );

    let placing = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .place_order(&cart_in_group(1, 2, 1000, "ga"), purchaser(), "held")
                .await
        })
    };
    let order_id = started_rx.await.unwrap();
    let settled = service
        .handle_webhook(WebhookNotification {
            external_event_id: "evt_early".to_string(),
            gateway_id: "held".to_string(),
            event_type: "payment.settled".to_string(),
            order_id: Some(order_id),
            gateway_ref: None,
            payload: serde_json::Value::Null,
        })
        .await
        .unwrap();
    assert_eq!(settled, WebhookOutcome::Processed(order_id, OrderStatus::Completed));
    release_tx.send(()).unwrap();

    let placed = placing.await.unwrap().unwrap();

    assert_eq!(placed.status, OrderStatus::Completed);
    assert_eq!(placed.gateway_order_ref, Some(GatewayRef::new("pi_held")));
    let stored = orders.get(order_id).await.unwrap();
    assert_eq!(stored, placed);
    let record = ledger.record(StockGroupKey::new("ga")).await.unwrap();
    assert_eq!((record.reserved, record.committed), (0, 2));
}
