//! # Boxoffice Testing
//!
//! Testing utilities for the order processing engine.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - A [`ScriptedGateway`] that settles, declines or fails on demand and records calls
//! - Fixture builders and an in-memory [`fixtures::Harness`] wiring a full `OrderService`
//! - A [`stores::FlakyOrderRepository`] for injecting status-write failures
//! - Given-When-Then [`TransitionTest`] for the order reducer
//! - proptest strategies for money values
//!
//! ## Example
//!
//! ```ignore
//! use boxoffice_testing::fixtures::{Harness, cart_in_group};
//!
//! #[tokio::test]
//! async fn checkout_reserves_stock() {
//!     let harness = Harness::new();
//!     harness.define_group("ga", 10).await;
//!
//!     harness.place(&cart_in_group(1, 2, 1000, "ga")).await.unwrap();
//!     assert_eq!(harness.record("ga").await.reserved, 2);
//! }
//! ```

use boxoffice_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod fixtures;
pub mod gateway;
pub mod stores;
pub mod transition_test;

/// Mock implementations of environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_testing::mocks::FixedClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Used to walk a reservation past its expiry without sleeping.
    ///
    /// ```
    /// use boxoffice_testing::mocks::ManualClock;
    /// use boxoffice_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::starting_at(boxoffice_testing::test_time());
    /// let before = clock.now();
    /// clock.advance(Duration::minutes(16));
    /// assert_eq!(clock.now() - before, Duration::minutes(16));
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        millis: AtomicI64,
    }

    impl ManualClock {
        /// Starts the clock at `time`.
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                millis: AtomicI64::new(time.timestamp_millis()),
            }
        }

        /// Moves the clock forward (or back, for negative durations).
        pub fn advance(&self, by: Duration) {
            self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
        }

        /// Jumps to an absolute time.
        pub fn set(&self, time: DateTime<Utc>) {
            self.millis.store(time.timestamp_millis(), Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(super::test_time())
    }
}

/// The instant every test clock starts at: 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn test_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Installs a test-writer `fmt` subscriber once. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boxoffice_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use boxoffice_core::money::{Money, Percentage};
    use proptest::prelude::*;

    /// Non-negative amounts at precision 2, up to one billion.
    pub fn money_strategy() -> impl Strategy<Value = Money> {
        (0i64..100_000_000_000).prop_map(Money::from_cents)
    }

    /// Any valid percentage.
    pub fn percentage_strategy() -> impl Strategy<Value = Percentage> {
        (0u32..=10_000).prop_filter_map("valid basis points", |bps| {
            Percentage::from_basis_points(bps).ok()
        })
    }
}

// Re-export commonly used items
pub use gateway::ScriptedGateway;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use transition_test::TransitionTest;
