//! Payment gateway adapter boundary.
//!
//! The order state machine only ever talks to a [`GatewayAdapter`]; concrete providers
//! (card processors, wallets) implement it outside this crate. [`MockGateway`] settles
//! everything and is used by the demo binary.

use crate::error::GatewayError;
use crate::money::Money;
use crate::order::{Order, OrderId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Provider-side reference for a payment intent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayRef(String);

impl GatewayRef {
    /// Wraps a provider reference.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Raw reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of confirming a payment intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Settlement {
    /// Money captured
    Settled,
    /// Provider refused the payment
    Declined {
        /// Provider's reason
        reason: String,
    },
}

/// Payment gateway capability.
///
/// Abstraction over payment processors. Returns boxed futures to stay dyn-compatible.
pub trait GatewayAdapter: Send + Sync {
    /// Registry key, matched against `Order::gateway_id`.
    fn id(&self) -> &str;

    /// Creates a payment intent for the order total.
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects the request or is unreachable.
    fn create_intent<'a>(
        &'a self,
        order: &'a Order,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayRef, GatewayError>> + Send + 'a>>;

    /// Confirms an intent.
    ///
    /// # Errors
    ///
    /// Returns error if the provider cannot be reached. A refused payment is
    /// `Ok(Settlement::Declined)`, not an error.
    fn confirm(
        &self,
        reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement, GatewayError>> + Send + '_>>;

    /// Refunds part or all of a settled payment. Returns the provider's refund id.
    ///
    /// Providers must treat a repeated `idempotency_key` as the same refund and return the
    /// original refund id instead of moving money twice.
    ///
    /// # Errors
    ///
    /// Returns error if the refund fails.
    fn refund(
        &self,
        reference: GatewayRef,
        amount: Money,
        idempotency_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>>;
}

/// Idempotency key for refunding `amount` of an order.
///
/// Stable across retries, so a refund whose status write failed is not issued twice.
#[must_use]
pub fn refund_idempotency_key(order_id: OrderId, amount: Money) -> String {
    format!("refund_{order_id}_{}", amount.to_minor_units())
}

/// Adapters by gateway id.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    adapters: HashMap<String, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its own id.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.insert(adapter.id().to_string(), adapter);
        self
    }

    /// Looks up an adapter.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownGateway`] if nothing is registered under `gateway_id`.
    pub fn get(&self, gateway_id: &str) -> Result<Arc<dyn GatewayAdapter>, GatewayError> {
        self.adapters
            .get(gateway_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownGateway(gateway_id.to_string()))
    }
}

impl fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("gateways", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Mock payment gateway (always settles, for development)
#[derive(Clone, Debug, Default)]
pub struct MockGateway;

impl MockGateway {
    /// Registry key of the mock gateway.
    pub const ID: &'static str = "mock";

    /// Creates a new mock gateway
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn GatewayAdapter> {
        Arc::new(Self::new())
    }
}

impl GatewayAdapter for MockGateway {
    fn id(&self) -> &str {
        Self::ID
    }

    fn create_intent<'a>(
        &'a self,
        order: &'a Order,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayRef, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            let reference = GatewayRef::new(format!("mock_intent_{}", uuid::Uuid::new_v4()));
            tracing::info!(
                order_id = %order.id,
                amount = %order.total,
                gateway_ref = %reference,
                "Mock payment intent created"
            );
            Ok(reference)
        })
    }

    fn confirm(
        &self,
        reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement, GatewayError>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!(gateway_ref = %reference, "Mock payment settled");
            Ok(Settlement::Settled)
        })
    }

    fn refund(
        &self,
        reference: GatewayRef,
        amount: Money,
        idempotency_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>> {
        Box::pin(async move {
            let refund_id = format!("mock_{idempotency_key}");
            tracing::info!(
                gateway_ref = %reference,
                amount = %amount,
                refund_id = %refund_id,
                "Mock refund processed"
            );
            Ok(refund_id)
        })
    }
}
