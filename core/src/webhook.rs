//! Inbound gateway notifications and their idempotency records.
//!
//! Every notification is recorded under its provider-assigned `external_event_id` before
//! anything else happens. A notification whose record already carries `processed_at` is a
//! duplicate delivery and is acknowledged without touching the order. Records that never
//! matched an order keep `processed_at = None` and are evicted once they are older than
//! the retention window.

use crate::error::WebhookError;
use crate::gateway::GatewayRef;
use crate::money::Money;
use crate::order::{OrderAction, OrderId, OrderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// A notification as delivered by a gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookNotification {
    /// Provider-assigned unique event id
    pub external_event_id: String,
    /// Gateway that sent it
    pub gateway_id: String,
    /// Provider event type, e.g. `payment.settled`
    pub event_type: String,
    /// Our order id, when the provider echoes it back
    pub order_id: Option<OrderId>,
    /// Provider payment reference
    pub gateway_ref: Option<GatewayRef>,
    /// Raw payload
    pub payload: serde_json::Value,
}

impl WebhookNotification {
    /// The idempotency record for this notification.
    #[must_use]
    pub fn to_record(&self, received_at: DateTime<Utc>) -> WebhookEventRecord {
        WebhookEventRecord {
            external_event_id: self.external_event_id.clone(),
            gateway_id: self.gateway_id.clone(),
            order_id: self.order_id,
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            received_at,
            processed_at: None,
        }
    }

    /// Classified event type.
    #[must_use]
    pub fn kind(&self) -> WebhookEventType {
        WebhookEventType::parse(&self.event_type)
    }

    /// The order command this notification asks for, if any.
    ///
    /// Refund notifications carry an optional `amount` in minor units in the payload.
    #[must_use]
    pub fn to_action(&self, precision: u8) -> Option<OrderAction> {
        let reason = || {
            self.payload
                .get("reason")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(&self.event_type)
                .to_string()
        };
        match self.kind() {
            WebhookEventType::PaymentSettled => Some(OrderAction::Complete {
                gateway_ref: self.gateway_ref.clone(),
            }),
            WebhookEventType::PaymentFailed => Some(OrderAction::Fail { reason: reason() }),
            WebhookEventType::PaymentCancelled => Some(OrderAction::Cancel { reason: reason() }),
            WebhookEventType::PaymentRefunded => Some(OrderAction::Refund {
                amount: self
                    .payload
                    .get("amount")
                    .and_then(serde_json::Value::as_i64)
                    .map(|minor| Money::from_minor_units(minor, precision)),
            }),
            WebhookEventType::Unrecognized => None,
        }
    }
}

/// Gateway event types the engine acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookEventType {
    /// Payment captured
    PaymentSettled,
    /// Payment declined or errored
    PaymentFailed,
    /// Payment abandoned by the purchaser
    PaymentCancelled,
    /// Money returned by the provider
    PaymentRefunded,
    /// Anything else; recorded but not acted on
    Unrecognized,
}

impl WebhookEventType {
    /// Classifies a provider event type string.
    #[must_use]
    pub fn parse(event_type: &str) -> Self {
        match event_type.trim().to_ascii_lowercase().as_str() {
            "payment.settled" | "payment.succeeded" | "payment.completed" => Self::PaymentSettled,
            "payment.failed" | "payment.declined" => Self::PaymentFailed,
            "payment.cancelled" | "payment.canceled" => Self::PaymentCancelled,
            "payment.refunded" => Self::PaymentRefunded,
            _ => Self::Unrecognized,
        }
    }
}

/// Persisted idempotency record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    /// Unique key
    pub external_event_id: String,
    /// Sending gateway
    pub gateway_id: String,
    /// Matched order
    pub order_id: Option<OrderId>,
    /// Provider event type
    pub event_type: String,
    /// Raw payload
    pub payload: serde_json::Value,
    /// When it first arrived
    pub received_at: DateTime<Utc>,
    /// When it was dispatched to an order
    pub processed_at: Option<DateTime<Utc>>,
}

/// Result of recording a notification.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordOutcome {
    /// First delivery
    New(WebhookEventRecord),
    /// Seen before; carries the stored record
    Duplicate(WebhookEventRecord),
}

/// What `handle_webhook` did with a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Dispatched; the order is now in this status
    Processed(OrderId, OrderStatus),
    /// Already processed earlier; nothing done
    Duplicate,
    /// No order matched; kept for eviction
    Unmatched,
    /// Event type not acted on
    Ignored,
}

/// Storage for webhook idempotency records.
pub trait WebhookEventStore: Send + Sync {
    /// Inserts the record unless one with the same `external_event_id` exists.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] on failure.
    fn record(
        &self,
        record: WebhookEventRecord,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, WebhookError>> + Send + '_>>;

    /// Stamps `processed_at` and the matched order.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] on failure.
    fn mark_processed(
        &self,
        external_event_id: String,
        order_id: Option<OrderId>,
        processed_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>>;

    /// Loads a record.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] on failure.
    fn get(
        &self,
        external_event_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEventRecord>, WebhookError>> + Send + '_>>;

    /// Deletes unprocessed records received before `cutoff`. Returns how many went.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] on failure.
    fn evict_unprocessed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, WebhookError>> + Send + '_>>;
}

/// Webhook record storage for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryWebhookStore {
    records: RwLock<HashMap<String, WebhookEventRecord>>,
}

impl InMemoryWebhookStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WebhookEventStore for InMemoryWebhookStore {
    fn record(
        &self,
        record: WebhookEventRecord,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            if let Some(existing) = records.get(&record.external_event_id) {
                return Ok(RecordOutcome::Duplicate(existing.clone()));
            }
            records.insert(record.external_event_id.clone(), record.clone());
            Ok(RecordOutcome::New(record))
        })
    }

    fn mark_processed(
        &self,
        external_event_id: String,
        order_id: Option<OrderId>,
        processed_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&external_event_id) else {
                return Err(WebhookError::Storage(format!(
                    "no webhook record '{external_event_id}'"
                )));
            };
            record.processed_at = Some(processed_at);
            if order_id.is_some() {
                record.order_id = order_id;
            }
            Ok(())
        })
    }

    fn get(
        &self,
        external_event_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEventRecord>, WebhookError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.records.read().await.get(&external_event_id).cloned()) })
    }

    fn evict_unprocessed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, r| r.processed_at.is_some() || r.received_at >= cutoff);
            Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
        })
    }
}
