//! Error taxonomy for the order processing engine.
//!
//! Every component returns its own `thiserror` enum. [`CheckoutError`] wraps them for the
//! imperative shell and knows which failures are user-facing (sold out, bad coupon,
//! malformed amount) and which are integration errors that should surface as a 5xx.

use crate::cart::TicketId;
use crate::order::{OrderId, OrderStatus};
use crate::stock::{ReservationId, StockGroupKey};
use thiserror::Error;

/// Malformed or incompatible monetary input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing left to parse after trimming.
    #[error("Amount is empty")]
    Empty,

    /// Input is not a number once separators are normalized.
    #[error("Amount '{0}' is not numeric")]
    NotNumeric(String),

    /// More than one decimal separator.
    #[error("Amount '{0}' contains more than one decimal separator")]
    MultipleDecimalPoints(String),

    /// The value does not fit in the minor-unit integer.
    #[error("Amount overflows the supported range")]
    Overflow,

    /// Two values of different precision were combined.
    #[error("Currency mismatch: precision {left} combined with precision {right}")]
    CurrencyMismatch {
        /// Precision of the left-hand value
        left: u8,
        /// Precision of the right-hand value
        right: u8,
    },
}

/// Fee and coupon validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModifierError {
    /// Percentage outside 0..=100%.
    #[error("Percentage of {0} basis points is outside 0..=10000")]
    InvalidPercentage(u32),

    /// Coupons only apply to the whole cart.
    #[error("Coupons cannot be scoped per item")]
    UnsupportedScope,

    /// No coupon with this code exists.
    #[error("Coupon '{0}' does not exist")]
    UnknownCoupon(String),

    /// The slug belongs to a fee, not a coupon.
    #[error("'{0}' is not a coupon")]
    NotACoupon(String),

    /// Coupon exists but is drafted or disabled.
    #[error("Coupon '{0}' is not active")]
    CouponInactive(String),

    /// Coupon validity window has not opened yet.
    #[error("Coupon '{0}' is not valid yet")]
    CouponNotYetValid(String),

    /// Coupon validity window has closed.
    #[error("Coupon '{0}' has expired")]
    CouponExpired(String),

    /// Coupon has no redemptions left.
    #[error("Coupon '{0}' has already been fully redeemed")]
    CouponExhausted(String),

    /// Arithmetic failure while computing a contribution.
    #[error(transparent)]
    Money(#[from] ParseError),

    /// Persistence collaborator failure.
    #[error("Modifier storage error: {0}")]
    Storage(String),
}

/// Cart lookups and pricing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartError {
    /// Ticket is not in the cart.
    #[error("Ticket {0} is not in the cart")]
    NotFound(TicketId),

    /// Pricing the cart failed.
    #[error(transparent)]
    Pricing(#[from] ModifierError),
}

impl From<ParseError> for CartError {
    fn from(error: ParseError) -> Self {
        Self::Pricing(ModifierError::Money(error))
    }
}

/// Stock ledger failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StockError {
    /// Not enough remaining capacity; surfaced to the purchaser as sold out.
    #[error("Only {available} left for '{group_key}' (requested {requested})")]
    Insufficient {
        /// Group that ran out
        group_key: StockGroupKey,
        /// Remaining capacity at the time of the check
        available: u64,
        /// Quantity the cart asked for
        requested: u64,
    },

    /// Group was never defined in the ledger.
    #[error("Stock group '{0}' is not defined")]
    UnknownGroup(StockGroupKey),

    /// Reservation id is not known to the ledger.
    #[error("Reservation {0} not found")]
    UnknownReservation(ReservationId),

    /// Reservation was released (expired or cancelled) before it could be committed.
    #[error("Reservation {0} was released before commit")]
    ReservationExpired(ReservationId),

    /// Zero quantity or empty request batch.
    #[error("Invalid reservation request: {0}")]
    InvalidQuantity(String),

    /// Persistence collaborator failure.
    #[error("Stock storage error: {0}")]
    Storage(String),
}

impl StockError {
    /// Whether this is the user-facing "sold out" condition.
    #[must_use]
    pub const fn is_sold_out(&self) -> bool {
        matches!(self, Self::Insufficient { .. })
    }
}

/// Order lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// Transition not allowed by the state machine.
    #[error("Invalid order transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: OrderStatus,
        /// Requested status
        to: OrderStatus,
    },

    /// Order does not exist.
    #[error("Order {0} not found")]
    NotFound(OrderId),

    /// Status changed underneath a compare-and-set update.
    #[error("Order {order_id} was modified concurrently (expected {expected})")]
    ConcurrentModification {
        /// Order that conflicted
        order_id: OrderId,
        /// Status the writer expected to replace
        expected: OrderStatus,
    },

    /// Pending orders must carry a reservation.
    #[error("Order {0} has no stock reservation")]
    MissingReservation(OrderId),

    /// Refund larger than what was charged.
    #[error("Refund exceeds the order total")]
    RefundExceedsTotal,

    /// Persistence collaborator failure.
    #[error("Order storage error: {0}")]
    Storage(String),
}

/// Payment gateway failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No adapter registered under this id.
    #[error("Unknown payment gateway '{0}'")]
    UnknownGateway(String),

    /// Provider refused the operation (e.g. a refund).
    #[error("Declined by payment provider: {0}")]
    Declined(String),

    /// Provider did not answer in time.
    #[error("Gateway timeout")]
    Timeout,

    /// Order has no gateway reference to act on.
    #[error("Order has no gateway reference")]
    MissingReference,

    /// Any other provider-side failure.
    #[error("Payment provider error: {0}")]
    Provider(String),
}

/// Webhook record persistence failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// Persistence collaborator failure.
    #[error("Webhook storage error: {0}")]
    Storage(String),
}

/// Errors returned by the checkout service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckoutError {
    /// Checkout attempted with nothing in the cart.
    #[error("Cart is empty")]
    EmptyCart,

    /// Monetary input problem.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Coupon or fee problem.
    #[error(transparent)]
    Modifier(#[from] ModifierError),

    /// Cart problem.
    #[error(transparent)]
    Cart(#[from] CartError),

    /// Stock problem.
    #[error(transparent)]
    Stock(#[from] StockError),

    /// Order lifecycle problem.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// Payment gateway problem.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Webhook persistence problem.
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

impl CheckoutError {
    /// Whether the purchaser can fix this themselves (change quantity, coupon or input).
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        match self {
            Self::EmptyCart
            | Self::Cart(CartError::NotFound(_))
            | Self::Parse(
                ParseError::Empty | ParseError::NotNumeric(_) | ParseError::MultipleDecimalPoints(_),
            ) => true,
            Self::Stock(error) => error.is_sold_out(),
            Self::Modifier(error) | Self::Cart(CartError::Pricing(error)) => {
                !matches!(
                    error,
                    ModifierError::Money(_)
                        | ModifierError::InvalidPercentage(_)
                        | ModifierError::UnsupportedScope
                        | ModifierError::Storage(_)
                )
            }
            _ => false,
        }
    }

    /// Message suitable for showing to the purchaser, if this error is user-facing.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        if !self.is_user_facing() {
            return None;
        }
        Some(match self {
            Self::Stock(StockError::Insufficient { available: 0, .. }) => "Sold out".to_string(),
            Self::Stock(StockError::Insufficient { available, .. }) => {
                format!("Only {available} left")
            }
            other => other.to_string(),
        })
    }
}
