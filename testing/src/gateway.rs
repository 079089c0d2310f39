//! Scripted payment gateway.

use boxoffice_core::error::GatewayError;
use boxoffice_core::gateway::{GatewayAdapter, GatewayRef, Settlement};
use boxoffice_core::money::Money;
use boxoffice_core::order::{Order, OrderId};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Calls {
    settlements: VecDeque<Settlement>,
    intents: Vec<OrderId>,
    confirmations: Vec<GatewayRef>,
    refunds: Vec<(GatewayRef, Money)>,
    refund_ids: HashMap<String, String>,
    refund_attempts: usize,
}

/// Gateway whose answers are set up front and whose calls are recorded.
///
/// Confirmations pop the scripted settlements in order and settle once the script runs
/// out. Refunds honour their idempotency key: a repeated key returns the first refund id
/// and moves no money.
///
/// ```ignore
/// let gateway = Arc::new(ScriptedGateway::new("scripted").then_decline("card_declined"));
/// ```
#[derive(Debug)]
pub struct ScriptedGateway {
    id: String,
    intent_error: Option<GatewayError>,
    refund_error: Option<GatewayError>,
    next_ref: AtomicU64,
    calls: Mutex<Calls>,
}

impl ScriptedGateway {
    /// Gateway registered under `id` that settles everything.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            intent_error: None,
            refund_error: None,
            next_ref: AtomicU64::new(1),
            calls: Mutex::new(Calls::default()),
        }
    }

    /// Queues a settlement for the next confirmation.
    #[must_use]
    pub fn then_settle(self) -> Self {
        self.push(Settlement::Settled)
    }

    /// Queues a decline for the next confirmation.
    #[must_use]
    pub fn then_decline(self, reason: impl Into<String>) -> Self {
        self.push(Settlement::Declined {
            reason: reason.into(),
        })
    }

    /// Makes every `create_intent` fail with `error`.
    #[must_use]
    pub fn failing_intents(mut self, error: GatewayError) -> Self {
        self.intent_error = Some(error);
        self
    }

    /// Makes every refund fail with `error`.
    #[must_use]
    pub fn failing_refunds(mut self, error: GatewayError) -> Self {
        self.refund_error = Some(error);
        self
    }

    /// Orders an intent was created for, in call order.
    pub async fn intents(&self) -> Vec<OrderId> {
        self.calls.lock().await.intents.clone()
    }

    /// References that were confirmed, in call order.
    pub async fn confirmations(&self) -> Vec<GatewayRef> {
        self.calls.lock().await.confirmations.clone()
    }

    /// Refunds issued, in call order. Retries with a known key are not listed again.
    pub async fn refunds(&self) -> Vec<(GatewayRef, Money)> {
        self.calls.lock().await.refunds.clone()
    }

    /// Every `refund` call that reached the gateway, retries included.
    pub async fn refund_attempts(&self) -> usize {
        self.calls.lock().await.refund_attempts
    }

    fn push(mut self, settlement: Settlement) -> Self {
        self.calls.get_mut().settlements.push_back(settlement);
        self
    }
}

impl GatewayAdapter for ScriptedGateway {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_intent<'a>(
        &'a self,
        order: &'a Order,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayRef, GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.lock().await.intents.push(order.id);
            if let Some(error) = &self.intent_error {
                return Err(error.clone());
            }
            let n = self.next_ref.fetch_add(1, Ordering::SeqCst);
            Ok(GatewayRef::new(format!("{}_ref_{n}", self.id)))
        })
    }

    fn confirm(
        &self,
        reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Settlement, GatewayError>> + Send + '_>> {
        Box::pin(async move {
            let mut calls = self.calls.lock().await;
            calls.confirmations.push(reference);
            Ok(calls.settlements.pop_front().unwrap_or(Settlement::Settled))
        })
    }

    fn refund(
        &self,
        reference: GatewayRef,
        amount: Money,
        idempotency_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, GatewayError>> + Send + '_>> {
        Box::pin(async move {
            let mut calls = self.calls.lock().await;
            calls.refund_attempts += 1;
            if let Some(error) = &self.refund_error {
                return Err(error.clone());
            }
            if let Some(existing) = calls.refund_ids.get(&idempotency_key) {
                return Ok(existing.clone());
            }
            calls.refunds.push((reference, amount));
            let refund_id = format!("{}_refund_{}", self.id, calls.refunds.len());
            calls.refund_ids.insert(idempotency_key, refund_id.clone());
            Ok(refund_id)
        })
    }
}
