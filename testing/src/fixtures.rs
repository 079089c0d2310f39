//! Fixture builders and an in-memory service harness.

use crate::gateway::ScriptedGateway;
use crate::mocks::{ManualClock, test_clock};
use crate::stores::FlakyOrderRepository;
use crate::test_time;
use boxoffice_core::cart::{Cart, ItemDetails, TicketId};
use boxoffice_core::checkout::OrderService;
use boxoffice_core::error::CheckoutError;
use boxoffice_core::modifier::{
    FeeApplicability, InMemoryModifierRepository, Modifier, ModifierAmount, ModifierCatalog,
    ModifierId, ModifierScope,
};
use boxoffice_core::money::{Money, Percentage};
use boxoffice_core::order::{
    Order, OrderAction, OrderEnvironment, OrderPolicy, OrderReducer, Purchaser,
};
use boxoffice_core::pricing::PricingEngine;
use boxoffice_core::stock::{
    InMemoryStockLedger, ReservationId, ReservationToken, StockGroupKey, StockLedger, StockRecord,
    StockRequest,
};
use boxoffice_core::webhook::{InMemoryWebhookStore, WebhookNotification};
use chrono::Duration;
use std::sync::Arc;

/// Gateway id the harness registers its [`ScriptedGateway`] under.
pub const GATEWAY_ID: &str = "scripted";

// ============================================================================
// Value builders
// ============================================================================

/// Line details at `cents` per unit.
#[must_use]
pub const fn price(cents: i64) -> ItemDetails {
    ItemDetails::new(Money::from_cents(cents))
}

/// Percentage from basis points, clamped into range.
#[must_use]
#[allow(clippy::expect_used)]
pub fn percent(basis_points: u32) -> Percentage {
    Percentage::from_basis_points(basis_points.min(Percentage::FULL)).expect("clamped into range")
}

/// Active cart coupon taking `basis_points` off the subtotal.
#[must_use]
pub fn percent_coupon(id: u64, slug: &str, basis_points: u32) -> Modifier {
    Modifier::coupon(
        ModifierId::new(id),
        slug,
        slug,
        ModifierAmount::Percentage(percent(basis_points)),
    )
}

/// Active cart coupon taking a flat amount off the subtotal.
#[must_use]
pub fn flat_coupon(id: u64, slug: &str, cents: i64) -> Modifier {
    Modifier::coupon(
        ModifierId::new(id),
        slug,
        slug,
        ModifierAmount::Flat(Money::from_cents(cents)),
    )
}

/// Automatic flat fee.
#[must_use]
pub fn flat_fee(id: u64, slug: &str, cents: i64, scope: ModifierScope) -> Modifier {
    Modifier::fee(
        ModifierId::new(id),
        slug,
        slug,
        ModifierAmount::Flat(Money::from_cents(cents)),
        scope,
        FeeApplicability::Automatic,
    )
}

/// Automatic percentage fee.
#[must_use]
pub fn percent_fee(id: u64, slug: &str, basis_points: u32, scope: ModifierScope) -> Modifier {
    Modifier::fee(
        ModifierId::new(id),
        slug,
        slug,
        ModifierAmount::Percentage(percent(basis_points)),
        scope,
        FeeApplicability::Automatic,
    )
}

/// Default purchaser.
#[must_use]
pub fn purchaser() -> Purchaser {
    Purchaser::new("Test Purchaser", "buyer@example.com")
}

/// Reducer environment on the fixed test clock.
#[must_use]
pub fn order_env(restock_on_refund: bool) -> OrderEnvironment {
    OrderEnvironment::new(
        Arc::new(test_clock()),
        OrderPolicy {
            restock_on_refund,
            ..OrderPolicy::default()
        },
    )
}

/// A `Pending` order for two 10.00 tickets holding a reservation on group `ga`.
///
/// # Panics
///
/// Never in practice; pricing a fee-free cart cannot fail.
#[must_use]
#[allow(clippy::expect_used)]
pub fn pending_order() -> Order {
    let mut cart = Cart::new();
    cart.upsert_item(TicketId::new(1), 2, price(1000).in_group(StockGroupKey::new("ga")));
    let pricing = PricingEngine::standard()
        .price(&cart, &ModifierCatalog::new(), test_time())
        .expect("fee-free cart prices");
    let mut order = Order::draft(cart, pricing, purchaser(), GATEWAY_ID, test_time());
    OrderReducer::new()
        .reduce(
            &mut order,
            OrderAction::Submit {
                reservation: ReservationToken {
                    id: ReservationId::new(),
                    lines: vec![StockRequest::new(StockGroupKey::new("ga"), 2)],
                    expires_at: test_time() + Duration::minutes(15),
                },
            },
            &order_env(false),
        )
        .expect("draft can be submitted");
    order
}

// ============================================================================
// Harness
// ============================================================================

/// A full `OrderService` over in-memory stores, a manual clock and a scripted gateway.
///
/// Every collaborator is exposed so tests can inspect stock, orders and webhook records
/// directly.
pub struct Harness {
    /// Service under test
    pub service: Arc<OrderService>,
    /// Stock ledger
    pub ledger: Arc<InMemoryStockLedger>,
    /// Order store; its updates can be made to fail
    pub orders: Arc<FlakyOrderRepository>,
    /// Webhook idempotency store
    pub webhooks: Arc<InMemoryWebhookStore>,
    /// Modifier catalog
    pub modifiers: Arc<InMemoryModifierRepository>,
    /// Clock shared by the service
    pub clock: Arc<ManualClock>,
    /// Gateway registered under [`GATEWAY_ID`]
    pub gateway: Arc<ScriptedGateway>,
}

impl Harness {
    /// Harness with an empty catalog, default policy and an always-settling gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(
            ModifierCatalog::new(),
            OrderPolicy::default(),
            ScriptedGateway::new(GATEWAY_ID),
        )
    }

    /// Harness with a seeded catalog.
    #[must_use]
    pub fn with_catalog(catalog: ModifierCatalog) -> Self {
        Self::with_options(
            catalog,
            OrderPolicy::default(),
            ScriptedGateway::new(GATEWAY_ID),
        )
    }

    /// Fully configured harness. The gateway should be created with [`GATEWAY_ID`].
    #[must_use]
    pub fn with_options(
        catalog: ModifierCatalog,
        policy: OrderPolicy,
        gateway: ScriptedGateway,
    ) -> Self {
        let ledger = Arc::new(InMemoryStockLedger::new());
        let orders = Arc::new(FlakyOrderRepository::new());
        let webhooks = Arc::new(InMemoryWebhookStore::new());
        let modifiers = Arc::new(InMemoryModifierRepository::new(catalog));
        let clock = Arc::new(ManualClock::starting_at(test_time()));
        let gateway = Arc::new(gateway);

        let service = OrderService::new(
            ledger.clone(),
            orders.clone(),
            webhooks.clone(),
            modifiers.clone(),
            clock.clone(),
        )
        .with_gateway(gateway.clone())
        .with_policy(policy);

        Self {
            service: Arc::new(service),
            ledger,
            orders,
            webhooks,
            modifiers,
            clock,
            gateway,
        }
    }

    /// Defines a stock group.
    ///
    /// # Panics
    ///
    /// If the capacity is invalid.
    #[allow(clippy::expect_used)]
    pub async fn define_group(&self, key: &str, capacity: i64) {
        self.ledger
            .define_group(StockGroupKey::new(key), capacity)
            .await
            .expect("valid capacity");
    }

    /// Current ledger state of a group.
    ///
    /// # Panics
    ///
    /// If the group is not defined.
    #[allow(clippy::expect_used)]
    pub async fn record(&self, key: &str) -> StockRecord {
        self.ledger
            .record(StockGroupKey::new(key))
            .await
            .expect("group is defined")
    }

    /// Places an order for `cart` with the default purchaser and the scripted gateway.
    ///
    /// # Errors
    ///
    /// Whatever `OrderService::place_order` returns.
    pub async fn place(&self, cart: &Cart) -> Result<Order, CheckoutError> {
        self.service
            .place_order(cart, purchaser(), GATEWAY_ID)
            .await
    }

    /// Notification for `order` referencing its gateway reference.
    #[must_use]
    pub fn notification(event_id: &str, event_type: &str, order: &Order) -> WebhookNotification {
        WebhookNotification {
            external_event_id: event_id.to_string(),
            gateway_id: GATEWAY_ID.to_string(),
            event_type: event_type.to_string(),
            order_id: None,
            gateway_ref: order.gateway_order_ref.clone(),
            payload: serde_json::Value::Null,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line cart: `quantity` tickets of `ticket` at `cents`, drawing from `group`.
#[must_use]
pub fn cart_in_group(ticket: u64, quantity: u32, cents: i64, group: &str) -> Cart {
    let mut cart = Cart::new();
    cart.upsert_item(
        TicketId::new(ticket),
        quantity,
        price(cents).in_group(StockGroupKey::new(group)),
    );
    cart
}
