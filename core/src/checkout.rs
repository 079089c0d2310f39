//! Checkout service: the imperative shell around the pure order reducer.
//!
//! [`OrderService`] owns the collaborators (stock ledger, repositories, gateways) and
//! drives every order transition through the same path:
//!
//! 1. take the order's lock, load it
//! 2. run the reducer on a copy
//! 3. execute stock and payment effects
//! 4. compare-and-set the new status
//! 5. run bookkeeping effects (coupon releases, refund restocking)
//!
//! A failure in step 3 aborts before the status write, so no order is ever `Completed`
//! without its stock committed. Gateway refunds carry an idempotency key derived from
//! the order, so a refund retried after a failed status write moves no money twice.
//!
//! Coupon redemptions are held when the order is placed, with the usage limit checked
//! atomically by the [`ModifierRepository`], and handed back if the order fails or is
//! cancelled.

use crate::cart::Cart;
use crate::environment::Clock;
use crate::error::{CheckoutError, GatewayError, ModifierError, OrderError};
use crate::gateway::{
    GatewayAdapter, GatewayRef, GatewayRegistry, Settlement, refund_idempotency_key,
};
use crate::metrics;
use crate::modifier::{ModifierId, ModifierRepository};
use crate::money::Money;
use crate::order::{
    Order, OrderAction, OrderEffect, OrderEnvironment, OrderId, OrderPolicy, OrderReducer,
    OrderRepository, OrderStatus, Purchaser,
};
use crate::pricing::{PricingEngine, PricingResult};
use crate::stock::{ReservationId, StockLedger};
use crate::webhook::{RecordOutcome, WebhookEventStore, WebhookNotification, WebhookOutcome};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Number of lock stripes used to serialize transitions per order.
const ORDER_LOCK_STRIPES: usize = 64;

/// Orchestrates checkout, settlement, webhooks and expiry.
pub struct OrderService {
    ledger: Arc<dyn StockLedger>,
    orders: Arc<dyn OrderRepository>,
    webhooks: Arc<dyn WebhookEventStore>,
    modifiers: Arc<dyn ModifierRepository>,
    gateways: GatewayRegistry,
    pricing: PricingEngine,
    reducer: OrderReducer,
    env: OrderEnvironment,
    webhook_retention: Duration,
    order_locks: Vec<Mutex<()>>,
}

impl OrderService {
    /// Creates a service with default policy, no gateways and the standard pricing rules.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        orders: Arc<dyn OrderRepository>,
        webhooks: Arc<dyn WebhookEventStore>,
        modifiers: Arc<dyn ModifierRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            orders,
            webhooks,
            modifiers,
            gateways: GatewayRegistry::new(),
            pricing: PricingEngine::standard(),
            reducer: OrderReducer::new(),
            env: OrderEnvironment::new(clock, OrderPolicy::default()),
            webhook_retention: Duration::days(7),
            order_locks: (0..ORDER_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Registers a payment gateway.
    #[must_use]
    pub fn with_gateway(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.gateways = self.gateways.with_adapter(adapter);
        self
    }

    /// Sets the order policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: OrderPolicy) -> Self {
        self.env.policy = policy;
        self
    }

    /// Replaces the pricing engine.
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingEngine) -> Self {
        self.pricing = pricing;
        self
    }

    /// Sets how long unmatched webhook records are kept.
    #[must_use]
    pub const fn with_webhook_retention(mut self, retention: Duration) -> Self {
        self.webhook_retention = retention;
        self
    }

    /// The stock ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn StockLedger> {
        &self.ledger
    }

    /// Loads an order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::NotFound`] if it does not exist.
    pub async fn order(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        Ok(self.orders.get(order_id).await?)
    }

    // ========================================================================
    // Cart helpers
    // ========================================================================

    /// Prices a cart against the current catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be loaded or pricing fails.
    pub async fn price_cart(&self, cart: &Cart) -> Result<PricingResult, CheckoutError> {
        let catalog = self.modifiers.load_catalog().await?;
        Ok(cart.compute_pricing(&self.pricing, &catalog, self.env.clock.now())?)
    }

    /// Validates a coupon code against the current catalog and attaches it to the cart.
    ///
    /// # Errors
    ///
    /// Returns the specific coupon error (unknown, expired, exhausted, ...).
    pub async fn apply_coupon(
        &self,
        cart: &mut Cart,
        slug: &str,
    ) -> Result<ModifierId, CheckoutError> {
        let catalog = self.modifiers.load_catalog().await?;
        Ok(cart.apply_coupon(slug, &catalog, self.env.clock.now())?)
    }

    // ========================================================================
    // Order lifecycle
    // ========================================================================

    /// Prices the cart, holds coupon redemptions, reserves stock, persists a `Pending`
    /// order and creates the payment intent.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::EmptyCart`], [`ModifierError::CouponExhausted`] if an attached
    /// coupon has no redemptions left, a sold-out
    /// [`crate::error::StockError::Insufficient`], pricing errors, or gateway/storage
    /// failures. On any failure after the holds are taken, they are given back.
    pub async fn place_order(
        &self,
        cart: &Cart,
        purchaser: Purchaser,
        gateway_id: &str,
    ) -> Result<Order, CheckoutError> {
        if cart.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let gateway = self.gateways.get(gateway_id)?;
        let now = self.env.clock.now();

        let catalog = self.modifiers.load_catalog().await?;
        if let Some(exhausted) = cart
            .attached_cart_modifiers
            .iter()
            .filter_map(|id| catalog.get(id))
            .find(|modifier| modifier.is_exhausted())
        {
            return Err(ModifierError::CouponExhausted(exhausted.slug.clone()).into());
        }
        let pricing = cart.compute_pricing(&self.pricing, &catalog, now)?;
        let coupon_ids = pricing.coupon_ids();
        let mut order = Order::draft(cart.clone(), pricing, purchaser, gateway_id, now);

        self.hold_coupons(order.id, &coupon_ids).await?;
        let expires_at = now
            .checked_add_signed(self.env.policy.reservation_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let token = match self
            .ledger
            .validate_and_reserve(cart.stock_requests(), expires_at)
            .await
        {
            Ok(token) => token,
            Err(error) => {
                self.release_coupons(order.id, coupon_ids).await;
                return Err(error.into());
            }
        };
        let reservation_id = token.id;

        let persisted = async {
            self.reducer
                .reduce(&mut order, OrderAction::Submit { reservation: token }, &self.env)?;
            self.orders.insert(order.clone()).await?;
            Ok::<_, CheckoutError>(())
        }
        .await;
        if let Err(error) = persisted {
            self.release_after_failure(reservation_id).await;
            self.release_coupons(order.id, coupon_ids).await;
            return Err(error);
        }
        metrics::record_order_transition(OrderStatus::Pending);
        tracing::info!(
            order_id = %order.id,
            reservation_id = %reservation_id,
            total = %order.total,
            "Order placed"
        );

        match gateway.create_intent(&order).await {
            Ok(reference) => self.attach_intent(order.id, reference).await,
            Err(error) => {
                tracing::warn!(order_id = %order.id, error = %error, "Payment intent failed");
                self.transition(
                    order.id,
                    OrderAction::Cancel {
                        reason: format!("payment intent failed: {error}"),
                    },
                    true,
                )
                .await?;
                Err(error.into())
            }
        }
    }

    /// Confirms payment with the gateway and completes or fails the order accordingly.
    ///
    /// # Errors
    ///
    /// [`GatewayError::MissingReference`] if no intent exists, gateway failures, or
    /// [`crate::error::StockError::ReservationExpired`] if the hold lapsed first.
    pub async fn settle(&self, order_id: OrderId) -> Result<Order, CheckoutError> {
        let order = self.orders.get(order_id).await?;
        let reference = order
            .gateway_order_ref
            .clone()
            .ok_or(GatewayError::MissingReference)?;
        let gateway = self.gateways.get(&order.gateway_id)?;

        match gateway.confirm(reference.clone()).await? {
            Settlement::Settled => self.complete(order_id, Some(reference)).await,
            Settlement::Declined { reason } => self.fail(order_id, reason).await,
        }
    }

    /// `Pending -> Completed`: commits stock. Coupon holds become final.
    ///
    /// # Errors
    ///
    /// See [`OrderService::transition`].
    pub async fn complete(
        &self,
        order_id: OrderId,
        gateway_ref: Option<GatewayRef>,
    ) -> Result<Order, CheckoutError> {
        self.transition(order_id, OrderAction::Complete { gateway_ref }, true)
            .await
    }

    /// `Pending -> Failed`: releases stock and coupon holds.
    ///
    /// # Errors
    ///
    /// See [`OrderService::transition`].
    pub async fn fail(
        &self,
        order_id: OrderId,
        reason: impl Into<String>,
    ) -> Result<Order, CheckoutError> {
        self.transition(order_id, OrderAction::Fail { reason: reason.into() }, true)
            .await
    }

    /// `Pending -> Cancelled`: releases stock and coupon holds.
    ///
    /// # Errors
    ///
    /// See [`OrderService::transition`].
    pub async fn cancel(
        &self,
        order_id: OrderId,
        reason: impl Into<String>,
    ) -> Result<Order, CheckoutError> {
        self.transition(order_id, OrderAction::Cancel { reason: reason.into() }, true)
            .await
    }

    /// `Completed -> Refunded`: refunds through the gateway, restocking if the policy says so.
    ///
    /// # Errors
    ///
    /// See [`OrderService::transition`].
    pub async fn refund(
        &self,
        order_id: OrderId,
        amount: Option<Money>,
    ) -> Result<Order, CheckoutError> {
        self.transition(order_id, OrderAction::Refund { amount }, true)
            .await
    }

    /// Runs one command against a stored order.
    ///
    /// Transitions of the same order are serialized. Re-applying a transition the order
    /// already went through returns the stored order unchanged.
    ///
    /// `issue_gateway_refund` is `false` when the provider itself reported the refund.
    ///
    /// # Errors
    ///
    /// [`OrderError::InvalidTransition`] for illegal edges, effect failures (stock,
    /// gateway), [`GatewayError::MissingReference`] when a refund is due but the order
    /// never got a gateway reference, or [`OrderError::ConcurrentModification`] if
    /// another writer got in.
    pub async fn transition(
        &self,
        order_id: OrderId,
        action: OrderAction,
        issue_gateway_refund: bool,
    ) -> Result<Order, CheckoutError> {
        let _guard = self.order_lock(order_id).lock().await;

        let current = self.orders.get(order_id).await?;
        let mut next = current.clone();
        let effects = self.reducer.reduce(&mut next, action, &self.env)?;
        if next.status == current.status {
            return Ok(current);
        }

        let mut deferred = Vec::new();
        for effect in effects {
            match effect {
                OrderEffect::CommitStock(reservation_id) => {
                    if let Err(error) = self.ledger.commit(reservation_id).await {
                        tracing::error!(
                            order_id = %order_id,
                            reservation_id = %reservation_id,
                            error = %error,
                            "Stock commit failed; order left unchanged"
                        );
                        return Err(error.into());
                    }
                }
                OrderEffect::ReleaseStock(reservation_id) => {
                    self.ledger.release(reservation_id).await?;
                }
                OrderEffect::RefundPayment {
                    order_id,
                    gateway_id,
                    gateway_ref,
                    amount,
                } => {
                    if issue_gateway_refund {
                        let Some(reference) = gateway_ref else {
                            tracing::error!(
                                order_id = %order_id,
                                amount = %amount,
                                "Refund due but order has no gateway reference"
                            );
                            return Err(GatewayError::MissingReference.into());
                        };
                        let refund_id = self
                            .gateways
                            .get(&gateway_id)?
                            .refund(reference, amount, refund_idempotency_key(order_id, amount))
                            .await?;
                        tracing::info!(order_id = %order_id, refund_id = %refund_id, "Refund issued");
                    }
                }
                OrderEffect::Restock(_) | OrderEffect::ReleaseCoupons(_) => deferred.push(effect),
            }
        }

        self.orders.update(next.clone(), current.status).await?;
        Self::record_transition_metrics(&next);

        for effect in deferred {
            self.run_bookkeeping(order_id, effect).await;
        }
        Ok(next)
    }

    // ========================================================================
    // Webhooks
    // ========================================================================

    /// Handles an inbound gateway notification exactly once per `external_event_id`.
    ///
    /// Duplicates of a processed notification are acknowledged as success. A notification
    /// whose earlier delivery never finished is processed again; order-level idempotency
    /// keeps that safe.
    ///
    /// # Errors
    ///
    /// Storage failures and transition errors. The record then stays unprocessed so a
    /// redelivery can retry.
    pub async fn handle_webhook(
        &self,
        notification: WebhookNotification,
    ) -> Result<WebhookOutcome, CheckoutError> {
        let now = self.env.clock.now();
        let event_id = notification.external_event_id.clone();

        match self.webhooks.record(notification.to_record(now)).await? {
            RecordOutcome::Duplicate(existing) if existing.processed_at.is_some() => {
                metrics::record_webhook("duplicate");
                tracing::info!(external_event_id = %event_id, "Duplicate webhook acknowledged");
                return Ok(WebhookOutcome::Duplicate);
            }
            RecordOutcome::Duplicate(_) | RecordOutcome::New(_) => {}
        }

        let Some(order) = self.find_order_for(&notification).await? else {
            metrics::record_webhook("unmatched");
            tracing::warn!(
                external_event_id = %event_id,
                event_type = %notification.event_type,
                "Webhook did not match any order"
            );
            return Ok(WebhookOutcome::Unmatched);
        };

        let Some(action) = notification.to_action(order.total.precision()) else {
            self.webhooks
                .mark_processed(event_id, Some(order.id), now)
                .await?;
            metrics::record_webhook("ignored");
            return Ok(WebhookOutcome::Ignored);
        };

        let updated = match self.transition(order.id, action, false).await {
            Ok(updated) => updated,
            Err(error) => {
                metrics::record_webhook("failed");
                tracing::error!(
                    external_event_id = %event_id,
                    order_id = %order.id,
                    error = %error,
                    "Webhook dispatch failed"
                );
                return Err(error);
            }
        };

        self.webhooks
            .mark_processed(event_id.clone(), Some(order.id), now)
            .await?;
        metrics::record_webhook("processed");
        tracing::info!(
            external_event_id = %event_id,
            order_id = %order.id,
            status = %updated.status,
            "Webhook processed"
        );
        Ok(WebhookOutcome::Processed(order.id, updated.status))
    }

    // ========================================================================
    // Janitor operations
    // ========================================================================

    /// Cancels pending orders whose reservation lapsed, then releases whatever expired
    /// holds remain (for example one whose order was never stored).
    ///
    /// Orders are found by their own expiry rather than through the released holds, so a
    /// cancellation that fails is picked up again by the next sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or order store fails. Individual cancellations
    /// that fail or lose a race with settlement are logged and skipped.
    pub async fn sweep_expired_reservations(&self) -> Result<Vec<OrderId>, CheckoutError> {
        let now = self.env.clock.now();
        let expired = self.orders.find_expired_pending(now).await?;

        let mut cancelled = Vec::new();
        for order in expired {
            match self
                .transition(
                    order.id,
                    OrderAction::Cancel {
                        reason: "reservation expired".to_string(),
                    },
                    false,
                )
                .await
            {
                Ok(updated) if updated.status == OrderStatus::Cancelled => cancelled.push(order.id),
                Ok(updated) => {
                    tracing::debug!(order_id = %order.id, status = %updated.status, "Expired order already moved on");
                }
                Err(error) => {
                    tracing::warn!(order_id = %order.id, error = %error, "Could not cancel expired order");
                }
            }
        }
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "Expired orders cancelled");
        }

        let orphaned = self.ledger.release_expired(now).await?;
        if !orphaned.is_empty() {
            tracing::info!(count = orphaned.len(), "Expired reservations released");
        }
        Ok(cancelled)
    }

    /// Deletes unmatched webhook records older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if the webhook store fails.
    pub async fn evict_stale_webhooks(&self) -> Result<u64, CheckoutError> {
        let cutoff = self
            .env
            .clock
            .now()
            .checked_sub_signed(self.webhook_retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let evicted = self.webhooks.evict_unprocessed_before(cutoff).await?;
        if evicted > 0 {
            tracing::info!(evicted, "Stale webhook records evicted");
        }
        Ok(evicted)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn order_lock(&self, order_id: OrderId) -> &Mutex<()> {
        let stripe = order_id.as_uuid().as_u128() % (ORDER_LOCK_STRIPES as u128);
        &self.order_locks[usize::try_from(stripe).unwrap_or(0)]
    }

    async fn find_order_for(
        &self,
        notification: &WebhookNotification,
    ) -> Result<Option<Order>, CheckoutError> {
        if let Some(order_id) = notification.order_id {
            return match self.orders.get(order_id).await {
                Ok(order) => Ok(Some(order)),
                Err(OrderError::NotFound(_)) => Ok(None),
                Err(error) => Err(error.into()),
            };
        }
        match &notification.gateway_ref {
            Some(reference) => Ok(self
                .orders
                .find_by_gateway_ref(notification.gateway_id.clone(), reference.clone())
                .await?),
            None => Ok(None),
        }
    }

    /// Stores the intent reference on the order as it is now, not as it was placed; a
    /// webhook may already have moved it on.
    async fn attach_intent(
        &self,
        order_id: OrderId,
        reference: GatewayRef,
    ) -> Result<Order, CheckoutError> {
        let _guard = self.order_lock(order_id).lock().await;
        let mut current = self.orders.get(order_id).await?;
        if current.gateway_order_ref.is_none() {
            current.gateway_order_ref = Some(reference);
            self.orders.update(current.clone(), current.status).await?;
        } else if current.gateway_order_ref.as_ref() != Some(&reference) {
            tracing::warn!(
                order_id = %order_id,
                stored = ?current.gateway_order_ref,
                intent = %reference,
                "Order already carries a different gateway reference"
            );
        }
        Ok(current)
    }

    async fn hold_coupons(
        &self,
        order_id: OrderId,
        coupon_ids: &[ModifierId],
    ) -> Result<(), CheckoutError> {
        for (held, id) in coupon_ids.iter().enumerate() {
            if let Err(error) = self.modifiers.reserve_redemption(*id).await {
                tracing::info!(order_id = %order_id, modifier_id = %id, error = %error, "Coupon hold refused");
                self.release_coupons(order_id, coupon_ids[..held].to_vec()).await;
                return Err(error.into());
            }
        }
        Ok(())
    }

    async fn release_coupons(&self, order_id: OrderId, coupon_ids: Vec<ModifierId>) {
        for id in coupon_ids {
            if let Err(error) = self.modifiers.release_redemption(id).await {
                tracing::warn!(order_id = %order_id, modifier_id = %id, error = %error, "Coupon hold not released");
            }
        }
    }

    async fn release_after_failure(&self, reservation_id: ReservationId) {
        if let Err(error) = self.ledger.release(reservation_id).await {
            tracing::error!(
                reservation_id = %reservation_id,
                error = %error,
                "Could not release reservation after failed checkout"
            );
        }
    }

    async fn run_bookkeeping(&self, order_id: OrderId, effect: OrderEffect) {
        match effect {
            OrderEffect::ReleaseCoupons(ids) => self.release_coupons(order_id, ids).await,
            OrderEffect::Restock(lines) => {
                if let Err(error) = self.ledger.restock(lines).await {
                    tracing::error!(order_id = %order_id, error = %error, "Refund restock failed");
                }
            }
            other => {
                tracing::debug!(order_id = %order_id, effect = ?other, "Not a bookkeeping effect");
            }
        }
    }

    fn record_transition_metrics(order: &Order) {
        metrics::record_order_transition(order.status);
        match order.status {
            OrderStatus::Completed => metrics::record_revenue(order.total),
            OrderStatus::Refunded => metrics::record_refund(order.refunded_amount),
            _ => {}
        }
        tracing::debug!(order_id = %order.id, status = %order.status, "Order persisted");
    }
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("gateways", &self.gateways)
            .field("policy", &self.env.policy)
            .field("webhook_retention", &self.webhook_retention)
            .finish_non_exhaustive()
    }
}
