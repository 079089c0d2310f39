//! Store wrappers that fail on demand.

use boxoffice_core::error::OrderError;
use boxoffice_core::gateway::GatewayRef;
use boxoffice_core::order::{InMemoryOrderRepository, Order, OrderId, OrderRepository, OrderStatus};
use boxoffice_core::stock::ReservationId;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory order store whose next `update` calls can be made to fail.
///
/// Reads and inserts always go through, so a test can break exactly the status write
/// that follows a transition's side effects.
///
/// ```
/// use boxoffice_testing::stores::FlakyOrderRepository;
///
/// let orders = FlakyOrderRepository::new();
/// orders.fail_next_updates(1);
/// ```
#[derive(Debug, Default)]
pub struct FlakyOrderRepository {
    inner: InMemoryOrderRepository,
    failing_updates: AtomicUsize,
}

impl FlakyOrderRepository {
    /// Empty store that never fails until told to.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` updates fail with [`OrderError::Storage`].
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// Number of stored orders.
    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    /// Whether no orders are stored.
    pub async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }

    fn take_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl OrderRepository for FlakyOrderRepository {
    fn insert(
        &self,
        order: Order,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>> {
        self.inner.insert(order)
    }

    fn get(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Order, OrderError>> + Send + '_>> {
        self.inner.get(order_id)
    }

    fn find_by_gateway_ref(
        &self,
        gateway_id: String,
        reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>> {
        self.inner.find_by_gateway_ref(gateway_id, reference)
    }

    fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>> {
        self.inner.find_by_reservation(reservation_id)
    }

    fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, OrderError>> + Send + '_>> {
        self.inner.find_expired_pending(now)
    }

    fn update(
        &self,
        order: Order,
        expected: OrderStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>> {
        if self.take_failure() {
            let order_id = order.id;
            return Box::pin(async move {
                Err(OrderError::Storage(format!("injected failure updating {order_id}")))
            });
        }
        self.inner.update(order, expected)
    }
}
