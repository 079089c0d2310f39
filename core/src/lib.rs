//! # Boxoffice Core
//!
//! Order processing engine for capacity-limited ticket sales.
//!
//! A purchaser fills a [`cart::Cart`], the [`pricing::PricingEngine`] applies fees and
//! coupons to it, and [`checkout::OrderService`] turns it into an [`order::Order`]:
//! stock is reserved in the [`stock::StockLedger`], payment runs through a
//! [`gateway::GatewayAdapter`], and the order moves through its state machine until the
//! stock is committed or released.
//!
//! ## Core Concepts
//!
//! - **Money**: integer minor units at a fixed precision; no floats anywhere
//! - **Modifier**: a fee or coupon, evaluated by a rule registered per kind
//! - **Stock group**: one shared capacity pool, possibly spanning several ticket types
//! - **Reservation**: a time-limited hold, later committed or released
//! - **Order reducer**: pure `(Order, Action, Environment) -> effects`
//!
//! ## Architecture Principles
//!
//! - Functional core, imperative shell: [`order::OrderReducer`] decides,
//!   [`checkout::OrderService`] executes
//! - Storage behind traits, with in-memory implementations here and `PostgreSQL` ones in
//!   `boxoffice-postgres`
//! - Every multi-group stock operation is all-or-nothing
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_core::*;
//!
//! let service = OrderService::new(ledger, orders, webhooks, modifiers, Arc::new(SystemClock))
//!     .with_gateway(MockGateway::shared());
//!
//! let mut cart = Cart::new();
//! cart.upsert_item(TicketId::new(1), 2, ItemDetails::new(Money::from_cents(1000)));
//! service.apply_coupon(&mut cart, "SAVE10").await?;
//!
//! let order = service.place_order(&cart, purchaser, MockGateway::ID).await?;
//! let order = service.settle(order.id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod cart;
pub mod checkout;
pub mod config;
pub mod environment;
pub mod error;
pub mod gateway;
pub mod janitor;
pub mod metrics;
pub mod modifier;
pub mod money;
pub mod order;
pub mod pricing;
pub mod stock;
pub mod webhook;

pub use cart::{Cart, CartItem, ItemDetails, TicketId};
pub use checkout::OrderService;
pub use config::Config;
pub use environment::{Clock, SystemClock};
pub use error::{
    CartError, CheckoutError, GatewayError, ModifierError, OrderError, ParseError, StockError,
    WebhookError,
};
pub use gateway::{
    GatewayAdapter, GatewayRef, GatewayRegistry, MockGateway, Settlement, refund_idempotency_key,
};
pub use janitor::{Janitor, SweepReport};
pub use modifier::{
    Adjustment, CouponRule, EligibilityContext, FeeApplicability, FeeRule, InMemoryModifierRepository,
    Modifier, ModifierAmount, ModifierCatalog, ModifierId, ModifierKind, ModifierKindTag,
    ModifierRegistry, ModifierRepository, ModifierRule, ModifierScope, ModifierStatus,
};
pub use money::{Money, Percentage, PriceFormat, SymbolPosition};
pub use order::{
    InMemoryOrderRepository, Order, OrderAction, OrderEffect, OrderEnvironment, OrderId,
    OrderPolicy, OrderReducer, OrderRepository, OrderStatus, Purchaser,
};
pub use pricing::{AppliedModifier, PricingEngine, PricingResult};
pub use stock::{
    InMemoryStockLedger, ReservationId, ReservationState, ReservationToken, StockGroupKey,
    StockLedger, StockRecord, StockRequest, UNLIMITED,
};
pub use webhook::{
    InMemoryWebhookStore, RecordOutcome, WebhookEventRecord, WebhookEventStore,
    WebhookEventType, WebhookNotification, WebhookOutcome,
};
