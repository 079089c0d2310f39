//! Stock ledger.
//!
//! Tracks capacity and `committed`/`reserved` quantities per group. A group may be a single
//! ticket or a shared-capacity pool spanning several tickets.
//!
//! **Concurrency Strategy**: [`StockLedger::validate_and_reserve`] locks every group in the
//! batch in sorted key order, checks capacity for all of them, and only then increments
//! `reserved`. Two checkouts touching overlapping groups therefore serialize on the first
//! shared key instead of deadlocking, and the loser observes the winner's reservation.
//! Commit, release and the janitor sweep take the same group locks in the same order.

use crate::cart::TicketId;
use crate::error::StockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

/// Capacity value meaning "no limit".
pub const UNLIMITED: i64 = -1;

// ============================================================================
// Data Structures
// ============================================================================

/// Identifier of a capacity pool.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockGroupKey(String);

impl StockGroupKey {
    /// Creates a key for a named pool.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The group a ticket draws from when it has no shared pool.
    #[must_use]
    pub fn for_ticket(ticket_id: TicketId) -> Self {
        Self(format!("ticket-{ticket_id}"))
    }

    /// Raw key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StockGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capacity and usage of one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    /// Group
    pub group_key: StockGroupKey,
    /// Total capacity, or [`UNLIMITED`]
    pub capacity: i64,
    /// Sold for good
    pub committed: u64,
    /// Held by open reservations
    pub reserved: u64,
}

impl StockRecord {
    /// Fresh record with nothing sold or held.
    #[must_use]
    pub const fn new(group_key: StockGroupKey, capacity: i64) -> Self {
        Self {
            group_key,
            capacity,
            committed: 0,
            reserved: 0,
        }
    }

    /// Whether capacity is unlimited.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.capacity < 0
    }

    /// Remaining capacity, `None` when unlimited.
    #[must_use]
    pub fn available(&self) -> Option<u64> {
        if self.is_unlimited() {
            return None;
        }
        let capacity = u64::try_from(self.capacity).unwrap_or(0);
        Some(capacity.saturating_sub(self.committed.saturating_add(self.reserved)))
    }

    /// Checks that `quantity` more units fit.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Insufficient`] with the remaining availability.
    pub fn ensure_available(&self, quantity: u64) -> Result<(), StockError> {
        match self.available() {
            Some(available) if available < quantity => Err(StockError::Insufficient {
                group_key: self.group_key.clone(),
                available,
                requested: quantity,
            }),
            _ => Ok(()),
        }
    }
}

/// Quantity requested from one group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockRequest {
    /// Group to draw from
    pub group_key: StockGroupKey,
    /// Units
    pub quantity: u64,
}

impl StockRequest {
    /// Creates a request.
    #[must_use]
    pub const fn new(group_key: StockGroupKey, quantity: u64) -> Self {
        Self {
            group_key,
            quantity,
        }
    }
}

/// Unique identifier for a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random `ReservationId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a `ReservationId` from a UUID
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

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of a successful reservation, attached to the pending order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    /// Reservation id
    pub id: ReservationId,
    /// Reserved quantities, merged per group and sorted by key
    pub lines: Vec<StockRequest>,
    /// When the janitor may release it
    pub expires_at: DateTime<Utc>,
}

/// Lifecycle of a reservation inside the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    /// Holding `reserved` units
    Held,
    /// Moved to `committed`
    Committed,
    /// Given back (cancelled, failed, or expired)
    Released,
}

impl ReservationState {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "held" => Some(Self::Held),
            "committed" => Some(Self::Committed),
            "released" => Some(Self::Released),
            _ => None,
        }
    }
}

/// Merges requests per group, sorted by key, rejecting empty batches and zero quantities.
///
/// # Errors
///
/// Returns [`StockError::InvalidQuantity`].
pub fn normalize_requests(requests: Vec<StockRequest>) -> Result<Vec<StockRequest>, StockError> {
    if requests.is_empty() {
        return Err(StockError::InvalidQuantity(
            "no groups requested".to_string(),
        ));
    }
    let mut merged: BTreeMap<StockGroupKey, u64> = BTreeMap::new();
    for request in requests {
        if request.quantity == 0 {
            return Err(StockError::InvalidQuantity(format!(
                "zero quantity for '{}'",
                request.group_key
            )));
        }
        let total = merged.entry(request.group_key).or_default();
        *total = total.checked_add(request.quantity).ok_or_else(|| {
            StockError::InvalidQuantity("quantity overflow".to_string())
        })?;
    }
    Ok(merged
        .into_iter()
        .map(|(group_key, quantity)| StockRequest::new(group_key, quantity))
        .collect())
}

// ============================================================================
// Ledger contract
// ============================================================================

/// Capacity ledger with atomic batch reservation.
///
/// Returns boxed futures to stay dyn-compatible.
pub trait StockLedger: Send + Sync {
    /// Creates a group, or changes the capacity of an existing one.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::InvalidQuantity`] for capacities below [`UNLIMITED`].
    fn define_group(
        &self,
        group_key: StockGroupKey,
        capacity: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>>;

    /// Reserves every request or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Insufficient`] for the first group (in key order) that lacks
    /// capacity, [`StockError::UnknownGroup`] for undefined groups, and
    /// [`StockError::InvalidQuantity`] for empty batches or zero quantities.
    fn validate_and_reserve(
        &self,
        requests: Vec<StockRequest>,
        expires_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationToken, StockError>> + Send + '_>>;

    /// Moves a held reservation to `committed`. Committing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::ReservationExpired`] if it was already released.
    fn commit(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>>;

    /// Gives a held reservation back. Releasing twice, or releasing after commit, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::UnknownReservation`] for ids the ledger never issued.
    fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>>;

    /// Releases every held reservation whose `expires_at` is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::Storage`] if the backing store fails.
    fn release_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationId>, StockError>> + Send + '_>>;

    /// Returns committed units to availability (refund restocking).
    ///
    /// # Errors
    ///
    /// Returns [`StockError::UnknownGroup`] for undefined groups.
    fn restock(
        &self,
        lines: Vec<StockRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>>;

    /// Current state of a group.
    ///
    /// # Errors
    ///
    /// Returns [`StockError::UnknownGroup`] for undefined groups.
    fn record(
        &self,
        group_key: StockGroupKey,
    ) -> Pin<Box<dyn Future<Output = Result<StockRecord, StockError>> + Send + '_>>;
}

// ============================================================================
// In-memory ledger
// ============================================================================

#[derive(Debug)]
struct ReservationEntry {
    lines: Vec<StockRequest>,
    expires_at: DateTime<Utc>,
    state: ReservationState,
}

/// Single-process ledger.
///
/// Each group sits behind its own async mutex; the reservation table has one more.
/// Lock order is always group locks (sorted) first, reservation table second.
#[derive(Debug, Default)]
pub struct InMemoryStockLedger {
    groups: RwLock<HashMap<StockGroupKey, Arc<Mutex<StockRecord>>>>,
    reservations: Mutex<HashMap<ReservationId, ReservationEntry>>,
}

impl InMemoryStockLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the given groups in the order given, which callers keep sorted.
    async fn lock_groups<'a, I>(&self, keys: I) -> Result<Vec<OwnedMutexGuard<StockRecord>>, StockError>
    where
        I: IntoIterator<Item = &'a StockGroupKey>,
    {
        let handles = {
            let groups = self.groups.read().await;
            keys.into_iter()
                .map(|key| {
                    groups
                        .get(key)
                        .cloned()
                        .ok_or_else(|| StockError::UnknownGroup(key.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        Ok(guards)
    }

    /// Lines of a reservation together with its state, without holding any lock afterwards.
    async fn peek(
        &self,
        reservation_id: ReservationId,
    ) -> Result<(ReservationState, Vec<StockRequest>), StockError> {
        let reservations = self.reservations.lock().await;
        reservations
            .get(&reservation_id)
            .map(|entry| (entry.state, entry.lines.clone()))
            .ok_or(StockError::UnknownReservation(reservation_id))
    }

    /// Releases one held reservation. Returns whether anything changed.
    async fn release_held(
        &self,
        reservation_id: ReservationId,
        expired_before: Option<DateTime<Utc>>,
    ) -> Result<bool, StockError> {
        let (state, lines) = self.peek(reservation_id).await?;
        if state != ReservationState::Held {
            return Ok(false);
        }

        let mut guards = self.lock_groups(lines.iter().map(|l| &l.group_key)).await?;
        let mut reservations = self.reservations.lock().await;
        let Some(entry) = reservations.get_mut(&reservation_id) else {
            return Err(StockError::UnknownReservation(reservation_id));
        };
        // Recheck under the group locks: a commit may have won the race.
        if entry.state != ReservationState::Held {
            return Ok(false);
        }
        if expired_before.is_some_and(|now| entry.expires_at > now) {
            return Ok(false);
        }

        for (line, record) in entry.lines.iter().zip(guards.iter_mut()) {
            record.reserved = record.reserved.saturating_sub(line.quantity);
        }
        entry.state = ReservationState::Released;
        Ok(true)
    }
}

impl StockLedger for InMemoryStockLedger {
    fn define_group(
        &self,
        group_key: StockGroupKey,
        capacity: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            if capacity < UNLIMITED {
                return Err(StockError::InvalidQuantity(format!(
                    "capacity {capacity} for '{group_key}'"
                )));
            }
            let existing = self.groups.read().await.get(&group_key).cloned();
            match existing {
                Some(record) => record.lock().await.capacity = capacity,
                None => {
                    self.groups
                        .write()
                        .await
                        .entry(group_key.clone())
                        .or_insert_with(|| {
                            Arc::new(Mutex::new(StockRecord::new(group_key.clone(), capacity)))
                        });
                }
            }
            tracing::debug!(group_key = %group_key, capacity, "Stock group defined");
            Ok(())
        })
    }

    fn validate_and_reserve(
        &self,
        requests: Vec<StockRequest>,
        expires_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationToken, StockError>> + Send + '_>> {
        Box::pin(async move {
            let lines = normalize_requests(requests)?;
            let mut guards = self.lock_groups(lines.iter().map(|l| &l.group_key)).await?;

            // Check everything before touching anything.
            for (line, record) in lines.iter().zip(guards.iter()) {
                if let Err(error) = record.ensure_available(line.quantity) {
                    tracing::info!(
                        group_key = %line.group_key,
                        requested = line.quantity,
                        "Reservation rejected: insufficient stock"
                    );
                    crate::metrics::record_sold_out();
                    return Err(error);
                }
            }
            for (line, record) in lines.iter().zip(guards.iter_mut()) {
                record.reserved += line.quantity;
            }

            let id = ReservationId::new();
            self.reservations.lock().await.insert(
                id,
                ReservationEntry {
                    lines: lines.clone(),
                    expires_at,
                    state: ReservationState::Held,
                },
            );
            drop(guards);

            crate::metrics::record_reservation_held();
            tracing::info!(reservation_id = %id, groups = lines.len(), "Stock reserved");
            Ok(ReservationToken {
                id,
                lines,
                expires_at,
            })
        })
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            let (state, lines) = self.peek(reservation_id).await?;
            match state {
                ReservationState::Committed => return Ok(()),
                ReservationState::Released => {
                    return Err(StockError::ReservationExpired(reservation_id));
                }
                ReservationState::Held => {}
            }

            let mut guards = self.lock_groups(lines.iter().map(|l| &l.group_key)).await?;
            let mut reservations = self.reservations.lock().await;
            let Some(entry) = reservations.get_mut(&reservation_id) else {
                return Err(StockError::UnknownReservation(reservation_id));
            };
            match entry.state {
                ReservationState::Committed => return Ok(()),
                ReservationState::Released => {
                    return Err(StockError::ReservationExpired(reservation_id));
                }
                ReservationState::Held => {}
            }

            for (line, record) in entry.lines.iter().zip(guards.iter_mut()) {
                record.reserved = record.reserved.saturating_sub(line.quantity);
                record.committed += line.quantity;
            }
            entry.state = ReservationState::Committed;

            crate::metrics::record_reservation_closed("committed");
            tracing::info!(reservation_id = %reservation_id, "Reservation committed");
            Ok(())
        })
    }

    fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            if self.release_held(reservation_id, None).await? {
                crate::metrics::record_reservation_closed("released");
                tracing::info!(reservation_id = %reservation_id, "Reservation released");
            }
            Ok(())
        })
    }

    fn release_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationId>, StockError>> + Send + '_>> {
        Box::pin(async move {
            let candidates: Vec<ReservationId> = {
                let reservations = self.reservations.lock().await;
                reservations
                    .iter()
                    .filter(|(_, e)| e.state == ReservationState::Held && e.expires_at <= now)
                    .map(|(id, _)| *id)
                    .collect()
            };

            let mut released = Vec::with_capacity(candidates.len());
            for id in candidates {
                if self.release_held(id, Some(now)).await? {
                    crate::metrics::record_reservation_closed("expired");
                    tracing::info!(reservation_id = %id, "Expired reservation released");
                    released.push(id);
                }
            }
            Ok(released)
        })
    }

    fn restock(
        &self,
        lines: Vec<StockRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            let lines = normalize_requests(lines)?;
            let mut guards = self.lock_groups(lines.iter().map(|l| &l.group_key)).await?;
            for (line, record) in lines.iter().zip(guards.iter_mut()) {
                record.committed = record.committed.saturating_sub(line.quantity);
                tracing::info!(
                    group_key = %line.group_key,
                    quantity = line.quantity,
                    "Stock returned to availability"
                );
            }
            Ok(())
        })
    }

    fn record(
        &self,
        group_key: StockGroupKey,
    ) -> Pin<Box<dyn Future<Output = Result<StockRecord, StockError>> + Send + '_>> {
        Box::pin(async move {
            let mut guards = self.lock_groups(std::iter::once(&group_key)).await?;
            guards
                .pop()
                .map(|guard| (*guard).clone())
                .ok_or(StockError::UnknownGroup(group_key))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn later() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    fn key(name: &str) -> StockGroupKey {
        StockGroupKey::new(name)
    }

    async fn ledger_with(groups: &[(&str, i64)]) -> Arc<InMemoryStockLedger> {
        let ledger = Arc::new(InMemoryStockLedger::new());
        for (name, capacity) in groups {
            ledger.define_group(key(name), *capacity).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn batch_reservation_is_all_or_nothing() {
        let ledger = ledger_with(&[("a", 5), ("b", 1)]).await;

        let result = ledger
            .validate_and_reserve(
                vec![StockRequest::new(key("a"), 2), StockRequest::new(key("b"), 2)],
                later(),
            )
            .await;

        assert_eq!(
            result.unwrap_err(),
            StockError::Insufficient {
                group_key: key("b"),
                available: 1,
                requested: 2
            }
        );
        assert_eq!(ledger.record(key("a")).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn duplicate_keys_in_batch_are_merged() {
        let ledger = ledger_with(&[("a", 3)]).await;
        let result = ledger
            .validate_and_reserve(
                vec![StockRequest::new(key("a"), 2), StockRequest::new(key("a"), 2)],
                later(),
            )
            .await;
        assert!(result.unwrap_err().is_sold_out());
    }

    #[tokio::test]
    async fn commit_and_release_are_idempotent() {
        let ledger = ledger_with(&[("a", 10)]).await;
        let token = ledger
            .validate_and_reserve(vec![StockRequest::new(key("a"), 3)], later())
            .await
            .unwrap();

        ledger.commit(token.id).await.unwrap();
        ledger.commit(token.id).await.unwrap();
        ledger.release(token.id).await.unwrap();

        let record = ledger.record(key("a")).await.unwrap();
        assert_eq!((record.committed, record.reserved), (3, 0));

        let other = ledger
            .validate_and_reserve(vec![StockRequest::new(key("a"), 2)], later())
            .await
            .unwrap();
        ledger.release(other.id).await.unwrap();
        ledger.release(other.id).await.unwrap();
        assert_eq!(
            ledger.commit(other.id).await,
            Err(StockError::ReservationExpired(other.id))
        );
        assert_eq!(ledger.record(key("a")).await.unwrap().available(), Some(7));
    }

    #[tokio::test]
    async fn unlimited_groups_never_sell_out() {
        let ledger = ledger_with(&[("open", UNLIMITED)]).await;
        let token = ledger
            .validate_and_reserve(vec![StockRequest::new(key("open"), 1_000_000)], later())
            .await
            .unwrap();
        assert_eq!(token.lines.len(), 1);
        assert_eq!(ledger.record(key("open")).await.unwrap().available(), None);
    }

    #[tokio::test]
    async fn release_expired_only_touches_overdue_holds() {
        let ledger = ledger_with(&[("a", 10)]).await;
        let now = later();
        let stale = ledger
            .validate_and_reserve(vec![StockRequest::new(key("a"), 4)], now - Duration::minutes(1))
            .await
            .unwrap();
        let fresh = ledger
            .validate_and_reserve(vec![StockRequest::new(key("a"), 1)], now + Duration::minutes(10))
            .await
            .unwrap();

        let released = ledger.release_expired(now).await.unwrap();

        assert_eq!(released, vec![stale.id]);
        assert_eq!(ledger.record(key("a")).await.unwrap().reserved, 1);
        ledger.commit(fresh.id).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_group_and_bad_quantities_are_rejected() {
        let ledger = ledger_with(&[("a", 10)]).await;
        assert_eq!(
            ledger
                .validate_and_reserve(vec![StockRequest::new(key("zzz"), 1)], later())
                .await
                .unwrap_err(),
            StockError::UnknownGroup(key("zzz"))
        );
        assert!(matches!(
            ledger.validate_and_reserve(vec![], later()).await,
            Err(StockError::InvalidQuantity(_))
        ));
        assert!(matches!(
            ledger
                .validate_and_reserve(vec![StockRequest::new(key("a"), 0)], later())
                .await,
            Err(StockError::InvalidQuantity(_))
        ));
        assert!(ledger.define_group(key("bad"), -2).await.is_err());
    }

    #[tokio::test]
    async fn restock_returns_committed_units() {
        let ledger = ledger_with(&[("a", 2)]).await;
        let token = ledger
            .validate_and_reserve(vec![StockRequest::new(key("a"), 2)], later())
            .await
            .unwrap();
        ledger.commit(token.id).await.unwrap();
        assert_eq!(ledger.record(key("a")).await.unwrap().available(), Some(0));

        ledger.restock(token.lines).await.unwrap();
        assert_eq!(ledger.record(key("a")).await.unwrap().available(), Some(2));
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversell() {
        let ledger = ledger_with(&[("a", 10)]).await;

        let attempts = (0..6).map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                ledger
                    .validate_and_reserve(vec![StockRequest::new(key("a"), 2)], later())
                    .await
            })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
        let failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_sold_out());
        assert_eq!(ledger.record(key("a")).await.unwrap().reserved, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_batches_do_not_deadlock() {
        let ledger = ledger_with(&[("a", 1000), ("b", 1000)]).await;

        let attempts = (0..50).map(|i| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let requests = if i % 2 == 0 {
                    vec![StockRequest::new(key("a"), 1), StockRequest::new(key("b"), 1)]
                } else {
                    vec![StockRequest::new(key("b"), 1), StockRequest::new(key("a"), 1)]
                };
                ledger.validate_and_reserve(requests, later()).await
            })
        });
        let results = futures::future::join_all(attempts).await;

        assert!(results.into_iter().all(|r| r.unwrap().is_ok()));
        assert_eq!(ledger.record(key("a")).await.unwrap().reserved, 50);
        assert_eq!(ledger.record(key("b")).await.unwrap().reserved, 50);
    }
}
