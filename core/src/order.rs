//! Order state machine.
//!
//! ```text
//! Draft -> Pending -> { Completed, Failed, Cancelled }
//!                      Completed -> Refunded
//! ```
//!
//! [`OrderReducer`] is pure: it validates an [`OrderAction`] against the current order,
//! applies it, and returns the side effects the transition requires as [`OrderEffect`]
//! descriptions. The checkout service executes those effects (stock commit, release,
//! refund) *before* persisting the new status, so a failed stock commit never leaves a
//! `Completed` order behind.

use crate::cart::Cart;
use crate::environment::Clock;
use crate::error::OrderError;
use crate::gateway::GatewayRef;
use crate::modifier::ModifierId;
use crate::money::Money;
use crate::pricing::{AppliedModifier, PricingResult};
use crate::stock::{ReservationId, ReservationToken, StockRequest};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ============================================================================
// Data Structures
// ============================================================================

/// Unique identifier for an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Creates a new random `OrderId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an `OrderId` from a UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Built in memory, not yet persisted
    Draft,
    /// Stock reserved, awaiting payment
    Pending,
    /// Paid; stock committed
    Completed,
    /// Payment failed; stock released
    Failed,
    /// Abandoned or cancelled; stock released
    Cancelled,
    /// Money returned after completion
    Refunded,
}

impl OrderStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    /// Whether `self -> to` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Draft, Self::Pending)
                | (Self::Pending, Self::Completed | Self::Failed | Self::Cancelled)
                | (Self::Completed, Self::Refunded)
        )
    }

    /// No further transitions possible.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Refunded)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is buying.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchaser {
    /// Full name
    pub name: String,
    /// Contact email
    pub email: String,
}

impl Purchaser {
    /// Creates a purchaser record.
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// A persisted snapshot of a priced cart plus purchaser and gateway metadata.
///
/// `cart_snapshot` and the pricing fields never change after creation; only the status
/// and the gateway/reservation bookkeeping move.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Unique id
    pub id: OrderId,
    /// Cart as priced at checkout
    pub cart_snapshot: Cart,
    /// Fees charged
    pub fees_applied: Vec<AppliedModifier>,
    /// Coupons redeemed
    pub coupons_applied: Vec<AppliedModifier>,
    /// Sum of line subtotals
    pub subtotal: Money,
    /// Coupon discount
    pub discount: Money,
    /// All fees
    pub fees: Money,
    /// Amount charged
    pub total: Money,
    /// Buyer
    pub purchaser: Purchaser,
    /// Gateway that handles payment
    pub gateway_id: String,
    /// Provider reference once an intent exists
    pub gateway_order_ref: Option<GatewayRef>,
    /// Stock hold, present from `Pending` on
    pub reservation: Option<ReservationToken>,
    /// Amount refunded (zero unless `Refunded`)
    pub refunded_amount: Money,
    /// Why the order failed or was cancelled
    pub status_reason: Option<String>,
    /// Current status
    pub status: OrderStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Draft order from a priced cart.
    #[must_use]
    pub fn draft(
        cart: Cart,
        pricing: PricingResult,
        purchaser: Purchaser,
        gateway_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let precision = pricing.total.precision();
        Self {
            id: OrderId::new(),
            cart_snapshot: cart,
            fees_applied: pricing.fees_applied,
            coupons_applied: pricing.coupons_applied,
            subtotal: pricing.subtotal,
            discount: pricing.discount,
            fees: pricing.fees,
            total: pricing.total,
            purchaser,
            gateway_id: gateway_id.into(),
            gateway_order_ref: None,
            reservation: None,
            refunded_amount: Money::zero(precision),
            status_reason: None,
            status: OrderStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reservation id, if the order holds one.
    #[must_use]
    pub fn reservation_id(&self) -> Option<ReservationId> {
        self.reservation.as_ref().map(|r| r.id)
    }

    /// Ids of redeemed coupons.
    #[must_use]
    pub fn coupon_ids(&self) -> Vec<ModifierId> {
        self.coupons_applied.iter().map(|c| c.modifier_id).collect()
    }
}

// ============================================================================
// Actions and effects
// ============================================================================

/// Commands accepted by the order state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    /// `Draft -> Pending` once stock is reserved
    Submit {
        /// The successful reservation
        reservation: ReservationToken,
    },
    /// `Pending -> Completed` once the gateway confirms settlement
    Complete {
        /// Provider reference, if not already recorded
        gateway_ref: Option<GatewayRef>,
    },
    /// `Pending -> Failed`
    Fail {
        /// Decline or error reason
        reason: String,
    },
    /// `Pending -> Cancelled`
    Cancel {
        /// Cancellation reason
        reason: String,
    },
    /// `Completed -> Refunded`
    Refund {
        /// Partial amount; `None` refunds the full total
        amount: Option<Money>,
    },
}

impl OrderAction {
    /// Status this command moves the order to.
    #[must_use]
    pub const fn target_status(&self) -> OrderStatus {
        match self {
            Self::Submit { .. } => OrderStatus::Pending,
            Self::Complete { .. } => OrderStatus::Completed,
            Self::Fail { .. } => OrderStatus::Failed,
            Self::Cancel { .. } => OrderStatus::Cancelled,
            Self::Refund { .. } => OrderStatus::Refunded,
        }
    }
}

/// Side effects a transition requires, executed by the checkout service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderEffect {
    /// Move the reservation to committed
    CommitStock(ReservationId),
    /// Give the reservation back
    ReleaseStock(ReservationId),
    /// Return committed units to availability
    Restock(Vec<StockRequest>),
    /// Ask the gateway to return money
    RefundPayment {
        /// Order being refunded; doubles as the gateway idempotency key
        order_id: OrderId,
        /// Gateway that took the payment
        gateway_id: String,
        /// Provider reference, missing if the intent was never recorded
        gateway_ref: Option<GatewayRef>,
        /// Amount to refund
        amount: Money,
    },
    /// Give back the coupon redemptions held since checkout
    ReleaseCoupons(Vec<ModifierId>),
}

/// Explicit, passed-in order policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderPolicy {
    /// Return stock to availability on refund
    pub restock_on_refund: bool,
    /// How long a pending reservation holds stock
    pub reservation_ttl: Duration,
}

impl Default for OrderPolicy {
    fn default() -> Self {
        Self {
            restock_on_refund: false,
            reservation_ttl: Duration::minutes(15),
        }
    }
}

/// Environment for the order reducer
#[derive(Clone)]
pub struct OrderEnvironment {
    /// Clock for timestamps
    pub clock: Arc<dyn Clock>,
    /// Scarcity and expiry policy
    pub policy: OrderPolicy,
}

impl OrderEnvironment {
    /// Creates a new order environment
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, policy: OrderPolicy) -> Self {
        Self { clock, policy }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Pure order state machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrderReducer;

impl OrderReducer {
    /// Creates a new order reducer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a command against the order.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] for edges outside the state machine,
    /// [`OrderError::MissingReservation`] when a pending order has no stock hold and
    /// [`OrderError::RefundExceedsTotal`] for refunds outside `0..=total`.
    pub fn validate(order: &Order, action: &OrderAction) -> Result<(), OrderError> {
        let to = action.target_status();
        if !order.status.can_transition_to(to) {
            return Err(OrderError::InvalidTransition {
                from: order.status,
                to,
            });
        }
        match action {
            OrderAction::Submit { .. } => Ok(()),
            OrderAction::Complete { .. } | OrderAction::Fail { .. } | OrderAction::Cancel { .. } => {
                if order.reservation.is_none() {
                    return Err(OrderError::MissingReservation(order.id));
                }
                Ok(())
            }
            OrderAction::Refund { amount } => {
                if let Some(amount) = amount {
                    let exceeds = amount.is_negative()
                        || amount.precision() != order.total.precision()
                        || amount.to_minor_units() > order.total.to_minor_units();
                    if exceeds {
                        return Err(OrderError::RefundExceedsTotal);
                    }
                }
                Ok(())
            }
        }
    }

    /// Applies a validated command to the order.
    pub fn apply(order: &mut Order, action: &OrderAction, now: DateTime<Utc>) {
        match action {
            OrderAction::Submit { reservation } => {
                order.reservation = Some(reservation.clone());
            }
            OrderAction::Complete { gateway_ref } => {
                if let Some(reference) = gateway_ref {
                    order.gateway_order_ref = Some(reference.clone());
                }
            }
            OrderAction::Fail { reason } | OrderAction::Cancel { reason } => {
                order.status_reason = Some(reason.clone());
            }
            OrderAction::Refund { amount } => {
                order.refunded_amount = amount.unwrap_or(order.total);
            }
        }
        order.status = action.target_status();
        order.updated_at = now;
    }

    /// Runs one command: validate, apply, describe effects.
    ///
    /// Re-applying the transition the order already went through is a no-op with no
    /// effects, which makes duplicate deliveries harmless.
    ///
    /// # Errors
    ///
    /// See [`OrderReducer::validate`].
    pub fn reduce(
        &self,
        order: &mut Order,
        action: OrderAction,
        env: &OrderEnvironment,
    ) -> Result<SmallVec<[OrderEffect; 4]>, OrderError> {
        let to = action.target_status();
        if order.status == to {
            tracing::debug!(order_id = %order.id, status = %to, "Transition already applied");
            return Ok(SmallVec::new());
        }

        if let Err(error) = Self::validate(order, &action) {
            tracing::error!(
                order_id = %order.id,
                from = %order.status,
                to = %to,
                error = %error,
                "Order transition rejected"
            );
            return Err(error);
        }

        let effects = Self::effects_for(order, &action, &env.policy);
        let from = order.status;
        Self::apply(order, &action, env.clock.now());
        tracing::info!(order_id = %order.id, from = %from, to = %to, "Order transitioned");
        Ok(effects)
    }

    fn effects_for(
        order: &Order,
        action: &OrderAction,
        policy: &OrderPolicy,
    ) -> SmallVec<[OrderEffect; 4]> {
        let reservation = order.reservation_id();
        match action {
            OrderAction::Submit { .. } => SmallVec::new(),
            OrderAction::Complete { .. } => {
                reservation.map(OrderEffect::CommitStock).into_iter().collect()
            }
            OrderAction::Fail { .. } | OrderAction::Cancel { .. } => {
                let mut effects: SmallVec<[OrderEffect; 4]> =
                    reservation.map(OrderEffect::ReleaseStock).into_iter().collect();
                let coupons = order.coupon_ids();
                if !coupons.is_empty() {
                    effects.push(OrderEffect::ReleaseCoupons(coupons));
                }
                effects
            }
            OrderAction::Refund { amount } => {
                let amount = amount.unwrap_or(order.total);
                let mut effects = SmallVec::new();
                if !amount.is_zero() {
                    effects.push(OrderEffect::RefundPayment {
                        order_id: order.id,
                        gateway_id: order.gateway_id.clone(),
                        gateway_ref: order.gateway_order_ref.clone(),
                        amount,
                    });
                }
                if let Some(token) = order.reservation.as_ref().filter(|_| policy.restock_on_refund) {
                    effects.push(OrderEffect::Restock(token.lines.clone()));
                }
                effects
            }
        }
    }
}

// ============================================================================
// Repository contract
// ============================================================================

/// Durable order storage.
///
/// Status updates are compare-and-set on the previous status, which is what makes a
/// concurrent duplicate transition detectable.
pub trait OrderRepository: Send + Sync {
    /// Stores a new order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::Storage`] on failure or duplicate id.
    fn insert(
        &self,
        order: Order,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>>;

    /// Loads an order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::NotFound`] if it does not exist.
    fn get(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Order, OrderError>> + Send + '_>>;

    /// Finds the order a gateway reference belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::Storage`] on failure.
    fn find_by_gateway_ref(
        &self,
        gateway_id: String,
        reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>>;

    /// Finds the order holding a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::Storage`] on failure.
    fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>>;

    /// Pending orders whose stock hold lapsed at or before `now`, oldest expiry first.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::Storage`] on failure.
    fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, OrderError>> + Send + '_>>;

    /// Replaces the stored order if its status is still `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::ConcurrentModification`] if the status moved and
    /// [`OrderError::NotFound`] if the order does not exist.
    fn update(
        &self,
        order: Order,
        expected: OrderStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>>;
}

/// Order storage for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderRepository {
    /// Empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders.
    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Whether no orders are stored.
    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

impl OrderRepository for InMemoryOrderRepository {
    fn insert(
        &self,
        order: Order,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>> {
        Box::pin(async move {
            let mut orders = self.orders.write().await;
            if orders.contains_key(&order.id) {
                return Err(OrderError::Storage(format!("order {} already exists", order.id)));
            }
            orders.insert(order.id, order);
            Ok(())
        })
    }

    fn get(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Order, OrderError>> + Send + '_>> {
        Box::pin(async move {
            self.orders
                .read()
                .await
                .get(&order_id)
                .cloned()
                .ok_or(OrderError::NotFound(order_id))
        })
    }

    fn find_by_gateway_ref(
        &self,
        gateway_id: String,
        reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .orders
                .read()
                .await
                .values()
                .find(|o| {
                    o.gateway_id == gateway_id && o.gateway_order_ref.as_ref() == Some(&reference)
                })
                .cloned())
        })
    }

    fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .orders
                .read()
                .await
                .values()
                .find(|o| o.reservation_id() == Some(reservation_id))
                .cloned())
        })
    }

    fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, OrderError>> + Send + '_>> {
        Box::pin(async move {
            let mut expired: Vec<Order> = self
                .orders
                .read()
                .await
                .values()
                .filter(|o| {
                    o.status == OrderStatus::Pending
                        && o.reservation.as_ref().is_some_and(|r| r.expires_at <= now)
                })
                .cloned()
                .collect();
            expired.sort_by_key(|o| o.reservation.as_ref().map(|r| r.expires_at));
            Ok(expired)
        })
    }

    fn update(
        &self,
        order: Order,
        expected: OrderStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>> {
        Box::pin(async move {
            let mut orders = self.orders.write().await;
            let Some(stored) = orders.get_mut(&order.id) else {
                return Err(OrderError::NotFound(order.id));
            };
            if stored.status != expected {
                return Err(OrderError::ConcurrentModification {
                    order_id: order.id,
                    expected,
                });
            }
            *stored = order;
            Ok(())
        })
    }
}
