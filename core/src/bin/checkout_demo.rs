//! End-to-end checkout walkthrough against the in-memory stores.
//!
//! Run with `RUST_LOG=boxoffice_core=debug` to see every reservation and transition.

use boxoffice_core::{
    Cart, Config, FeeApplicability, InMemoryModifierRepository, InMemoryOrderRepository,
    InMemoryStockLedger, InMemoryWebhookStore, ItemDetails, Janitor, MockGateway, Modifier,
    ModifierAmount, ModifierCatalog, ModifierId, ModifierScope, Money, OrderService, Percentage,
    Purchaser, StockGroupKey, StockLedger, SystemClock, TicketId, WebhookNotification,
    metrics::register_commerce_metrics,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    register_commerce_metrics();

    let format = config.price_format();
    info!(currency = %config.currency.code, "Starting checkout demo");

    // Catalog: a per-ticket booking fee and a 10% coupon
    let mut catalog = ModifierCatalog::new();
    catalog.insert(Modifier::fee(
        ModifierId::new(1),
        "booking-fee",
        "Booking fee",
        ModifierAmount::Flat(Money::from_cents(150)),
        ModifierScope::PerItem,
        FeeApplicability::Automatic,
    ));
    catalog.insert(Modifier::coupon(
        ModifierId::new(2),
        "EARLYBIRD",
        "Early bird 10%",
        ModifierAmount::Percentage(Percentage::from_basis_points(1_000)?),
    ));

    // Two ticket types share one 100-seat floor
    let ledger = Arc::new(InMemoryStockLedger::new());
    let floor = StockGroupKey::new("floor");
    ledger.define_group(floor.clone(), 100).await?;

    let service = Arc::new(
        OrderService::new(
            ledger.clone(),
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(InMemoryWebhookStore::new()),
            Arc::new(InMemoryModifierRepository::new(catalog)),
            Arc::new(SystemClock),
        )
        .with_gateway(MockGateway::shared())
        .with_policy(config.order_policy())
        .with_webhook_retention(config.webhook_retention()),
    );

    let (janitor_handle, shutdown) = Janitor::spawn(service.clone(), config.janitor_interval());

    // Build the cart
    let mut cart = Cart::new();
    cart.upsert_item(
        TicketId::new(1),
        2,
        ItemDetails::new(Money::from_cents(4_500)).in_group(floor.clone()),
    );
    cart.upsert_item(
        TicketId::new(2),
        1,
        ItemDetails::new(Money::from_cents(2_500)).in_group(floor.clone()),
    );
    service.apply_coupon(&mut cart, "earlybird").await?;

    let pricing = service.price_cart(&cart).await?;
    info!(
        subtotal = %format.format(&pricing.subtotal),
        discount = %format.format(&pricing.discount),
        fees = %format.format(&pricing.fees),
        total = %format.format(&pricing.total),
        "Cart priced"
    );

    // Checkout and synchronous settlement
    let order = service
        .place_order(&cart, Purchaser::new("Ada Lovelace", "ada@example.com"), MockGateway::ID)
        .await?;
    let order = service.settle(order.id).await?;
    info!(order_id = %order.id, status = %order.status, "First order settled");

    // Second order settled by webhook, delivered twice
    let second = service
        .place_order(&cart, Purchaser::new("Grace Hopper", "grace@example.com"), MockGateway::ID)
        .await?;
    let notification = WebhookNotification {
        external_event_id: "evt_demo_1".to_string(),
        gateway_id: MockGateway::ID.to_string(),
        event_type: "payment.settled".to_string(),
        order_id: None,
        gateway_ref: second.gateway_order_ref.clone(),
        payload: serde_json::json!({}),
    };
    let first_delivery = service.handle_webhook(notification.clone()).await?;
    let redelivery = service.handle_webhook(notification).await?;
    info!(?first_delivery, ?redelivery, "Webhook delivered twice");

    // Refund the first order
    let refunded = service.refund(order.id, None).await?;
    info!(
        order_id = %refunded.id,
        refunded = %format.format(&refunded.refunded_amount),
        "First order refunded"
    );

    let record = ledger.record(floor).await?;
    info!(
        capacity = record.capacity,
        committed = record.committed,
        reserved = record.reserved,
        "Final floor stock"
    );

    shutdown.send(true).ok();
    janitor_handle.await?;
    Ok(())
}
