//! Ergonomic testing utilities for the order reducer
//!
//! This module provides a fluent API for testing order transitions with readable
//! Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // TransitionTest is the natural name

use boxoffice_core::error::OrderError;
use boxoffice_core::order::{Order, OrderAction, OrderEffect, OrderEnvironment, OrderReducer};

/// Type alias for order assertion functions
type OrderAssertion = Box<dyn FnOnce(&Order)>;

/// Type alias for effect assertion functions
type EffectAssertion = Box<dyn FnOnce(&[OrderEffect])>;

/// Type alias for error assertion functions
type ErrorAssertion = Box<dyn FnOnce(&OrderError)>;

/// Fluent API for testing order transitions with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use boxoffice_testing::TransitionTest;
///
/// TransitionTest::new()
///     .with_env(test_environment())
///     .given_order(pending_order())
///     .when_action(OrderAction::Complete { gateway_ref: None })
///     .then_order(|order| assert_eq!(order.status, OrderStatus::Completed))
///     .then_effects(assertions::assert_commits_stock)
///     .run();
/// ```
pub struct TransitionTest {
    reducer: OrderReducer,
    environment: Option<OrderEnvironment>,
    initial_order: Option<Order>,
    action: Option<OrderAction>,
    order_assertions: Vec<OrderAssertion>,
    effect_assertions: Vec<EffectAssertion>,
    error_assertion: Option<ErrorAssertion>,
}

impl TransitionTest {
    /// Create a new transition test
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reducer: OrderReducer::new(),
            environment: None,
            initial_order: None,
            action: None,
            order_assertions: Vec::new(),
            effect_assertions: Vec::new(),
            error_assertion: None,
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: OrderEnvironment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial order (Given)
    #[must_use]
    pub fn given_order(mut self, order: Order) -> Self {
        self.initial_order = Some(order);
        self
    }

    /// Set the action to test (When)
    #[must_use]
    pub fn when_action(mut self, action: OrderAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Add an assertion about the resulting order (Then)
    ///
    /// Runs whether or not the transition succeeded, so it can also check that a
    /// rejected transition left the order untouched.
    #[must_use]
    pub fn then_order<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&Order) + 'static,
    {
        self.order_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the resulting effects (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[OrderEffect]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Expect the transition to be rejected (Then)
    #[must_use]
    pub fn then_error<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&OrderError) + 'static,
    {
        self.error_assertion = Some(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if order, action, or environment is not set, if the outcome (success or
    /// rejection) is not the expected one, or if any assertions fail.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut order = self
            .initial_order
            .expect("Initial order must be set with given_order()");

        let action = self.action.expect("Action must be set with when_action()");

        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        let result = self.reducer.reduce(&mut order, action, &env);

        match (result, self.error_assertion) {
            (Ok(effects), None) => {
                for assertion in self.effect_assertions {
                    assertion(&effects);
                }
            }
            (Err(error), Some(assertion)) => assertion(&error),
            (Ok(effects), Some(_)) => {
                panic!("Expected the transition to be rejected, but it produced {effects:?}")
            }
            (Err(error), None) => panic!("Transition rejected unexpectedly: {error}"),
        }

        for assertion in self.order_assertions {
            assertion(&order);
        }
    }
}

impl Default for TransitionTest {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper assertions for order effects
pub mod assertions {
    use boxoffice_core::order::OrderEffect;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if effects is not empty.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_effects(effects: &[OrderEffect]) {
        assert!(
            effects.is_empty(),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_effects_count(effects: &[OrderEffect], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that effects commit stock
    ///
    /// # Panics
    ///
    /// Panics if no `CommitStock` effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_commits_stock(effects: &[OrderEffect]) {
        assert!(
            effects.iter().any(|e| matches!(e, OrderEffect::CommitStock(_))),
            "Expected a CommitStock effect, found {effects:?}"
        );
    }

    /// Assert that effects release stock
    ///
    /// # Panics
    ///
    /// Panics if no `ReleaseStock` effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_releases_stock(effects: &[OrderEffect]) {
        assert!(
            effects.iter().any(|e| matches!(e, OrderEffect::ReleaseStock(_))),
            "Expected a ReleaseStock effect, found {effects:?}"
        );
    }

    /// Assert that effects ask the gateway for a refund
    ///
    /// # Panics
    ///
    /// Panics if no `RefundPayment` effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_refunds_payment(effects: &[OrderEffect]) {
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, OrderEffect::RefundPayment { .. })),
            "Expected a RefundPayment effect, found {effects:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use boxoffice_core::error::OrderError;
    use boxoffice_core::order::OrderStatus;

    #[test]
    fn complete_commits_stock() {
        TransitionTest::new()
            .with_env(fixtures::order_env(false))
            .given_order(fixtures::pending_order())
            .when_action(OrderAction::Complete { gateway_ref: None })
            .then_order(|order| assert_eq!(order.status, OrderStatus::Completed))
            .then_effects(assertions::assert_commits_stock)
            .run();
    }

    #[test]
    fn fail_releases_stock() {
        TransitionTest::new()
            .with_env(fixtures::order_env(false))
            .given_order(fixtures::pending_order())
            .when_action(OrderAction::Fail {
                reason: "card_declined".to_string(),
            })
            .then_order(|order| {
                assert_eq!(order.status, OrderStatus::Failed);
                assert_eq!(order.status_reason.as_deref(), Some("card_declined"));
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_releases_stock(effects);
            })
            .run();
    }

    #[test]
    fn refund_of_pending_order_is_rejected() {
        TransitionTest::new()
            .with_env(fixtures::order_env(false))
            .given_order(fixtures::pending_order())
            .when_action(OrderAction::Refund { amount: None })
            .then_error(|error| {
                assert_eq!(
                    error,
                    &OrderError::InvalidTransition {
                        from: OrderStatus::Pending,
                        to: OrderStatus::Refunded
                    }
                );
            })
            .then_order(|order| assert_eq!(order.status, OrderStatus::Pending))
            .run();
    }
}
