//! Business metrics for the order processing engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `boxoffice_reservations_total{status}` - reservations by outcome
//!   (`reserved`, `sold_out`, `committed`, `released`, `expired`)
//! - `boxoffice_orders_total{status}` - order transitions by target status
//! - `boxoffice_revenue_minor_units_total` - settled revenue in minor units
//! - `boxoffice_refunds_minor_units_total` - refunds in minor units
//! - `boxoffice_webhooks_total{outcome}` - inbound notifications
//!   (`processed`, `duplicate`, `unmatched`, `failed`)
//!
//! ## Gauges
//! - `boxoffice_active_reservations` - reservations currently holding stock

use crate::money::Money;
use crate::order::OrderStatus;
use metrics::{describe_counter, describe_gauge};

/// Initialize and register all metric descriptions.
///
/// Call once at startup, before anything is recorded.
pub fn register_commerce_metrics() {
    describe_counter!(
        "boxoffice_reservations_total",
        "Stock reservations by outcome (reserved, sold_out, committed, released, expired)"
    );
    describe_gauge!(
        "boxoffice_active_reservations",
        "Reservations currently holding stock"
    );
    describe_counter!(
        "boxoffice_orders_total",
        "Order status transitions by target status"
    );
    describe_counter!(
        "boxoffice_revenue_minor_units_total",
        "Revenue from completed orders in minor currency units"
    );
    describe_counter!(
        "boxoffice_refunds_minor_units_total",
        "Refunds issued in minor currency units"
    );
    describe_counter!(
        "boxoffice_webhooks_total",
        "Inbound gateway notifications by outcome"
    );

    tracing::info!("Commerce metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// A reservation now holds stock.
pub fn record_reservation_held() {
    metrics::counter!("boxoffice_reservations_total", "status" => "reserved").increment(1);
    metrics::gauge!("boxoffice_active_reservations").increment(1.0);
}

/// A reservation was rejected for lack of capacity.
pub fn record_sold_out() {
    metrics::counter!("boxoffice_reservations_total", "status" => "sold_out").increment(1);
}

/// A held reservation stopped holding stock.
///
/// `status` is `committed`, `released` or `expired`.
pub fn record_reservation_closed(status: &'static str) {
    metrics::counter!("boxoffice_reservations_total", "status" => status).increment(1);
    metrics::gauge!("boxoffice_active_reservations").decrement(1.0);
}

/// An order entered `status`.
pub fn record_order_transition(status: OrderStatus) {
    metrics::counter!("boxoffice_orders_total", "status" => status.as_str()).increment(1);
}

/// Revenue from a completed order.
pub fn record_revenue(total: Money) {
    metrics::counter!("boxoffice_revenue_minor_units_total")
        .increment(total.to_minor_units().unsigned_abs());
}

/// A refund was issued.
pub fn record_refund(amount: Money) {
    metrics::counter!("boxoffice_refunds_minor_units_total")
        .increment(amount.to_minor_units().unsigned_abs());
}

/// An inbound notification was handled.
pub fn record_webhook(outcome: &'static str) {
    metrics::counter!("boxoffice_webhooks_total", "outcome" => outcome).increment(1);
    tracing::debug!(outcome, "Recorded webhook metric");
}
