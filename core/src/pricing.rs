//! Pricing engine.
//!
//! Given a [`Cart`] and a [`ModifierCatalog`], computes which modifiers apply and what
//! they contribute, always in the same order:
//!
//! 1. per-item fees against each line's `unit_price × quantity`
//! 2. the cart subtotal
//! 3. coupons, each against the original subtotal, clamped so the discount never exceeds it
//! 4. cart-level fees against the discounted subtotal
//! 5. `total = subtotal - discount + per_item_fees + cart_fees`
//!
//! Eligibility and contribution are dispatched through the [`ModifierRegistry`]. Every
//! registered rule is consulted: charge rules feed steps 1 and 4, discount rules feed
//! step 3. The engine itself knows nothing kind-specific beyond the ordering above.

use crate::cart::{Cart, TicketId};
use crate::error::ModifierError;
use crate::modifier::{
    Adjustment, EligibilityContext, ModifierCatalog, ModifierId, ModifierRegistry,
    ModifierScope,
};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A modifier that was applied and what it contributed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedModifier {
    /// Which modifier
    pub modifier_id: ModifierId,
    /// Line item it was charged against, `None` at cart scope
    pub ticket_id: Option<TicketId>,
    /// Positive contribution (fees add it, coupons subtract it)
    pub amount: Money,
}

/// Result of pricing a cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingResult {
    /// Sum of line subtotals
    pub subtotal: Money,
    /// Total coupon discount, never more than `subtotal`
    pub discount: Money,
    /// Per-item fees
    pub item_fees: Money,
    /// Cart-level fees
    pub cart_fees: Money,
    /// `item_fees + cart_fees`
    pub fees: Money,
    /// `subtotal - discount + fees`
    pub total: Money,
    /// Every fee charged, per line then per cart
    pub fees_applied: Vec<AppliedModifier>,
    /// Every coupon redeemed, with its clamped amount
    pub coupons_applied: Vec<AppliedModifier>,
}

impl PricingResult {
    /// Subtotal after coupons, before fees.
    ///
    /// # Errors
    ///
    /// Only on precision mismatch, which cannot happen for engine-built results.
    pub fn discounted_subtotal(&self) -> Result<Money, ModifierError> {
        Ok(self.subtotal.subtract(self.discount)?)
    }

    /// Ids of coupons that contributed.
    #[must_use]
    pub fn coupon_ids(&self) -> Vec<ModifierId> {
        self.coupons_applied.iter().map(|c| c.modifier_id).collect()
    }
}

/// Prices carts against a modifier catalog.
#[derive(Clone, Debug)]
pub struct PricingEngine {
    registry: Arc<ModifierRegistry>,
}

impl PricingEngine {
    /// Creates an engine with the given rule table.
    #[must_use]
    pub const fn new(registry: Arc<ModifierRegistry>) -> Self {
        Self { registry }
    }

    /// Engine with the built-in fee and coupon rules.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(Arc::new(ModifierRegistry::standard()))
    }

    /// Prices `cart` at time `now`.
    ///
    /// # Errors
    ///
    /// Returns [`ModifierError::Money`] if line prices or flat amounts mix precisions or
    /// the arithmetic overflows. Stale modifier references are skipped, never an error.
    pub fn price(
        &self,
        cart: &Cart,
        catalog: &ModifierCatalog,
        now: DateTime<Utc>,
    ) -> Result<PricingResult, ModifierError> {
        let precision = cart.precision();

        // 1. Per-item fees
        let mut fees_applied = Vec::new();
        let mut line_subtotals = Vec::with_capacity(cart.get_items().len());
        for item in cart.get_items() {
            let line_subtotal = item.line_subtotal()?;
            log_stale_references(catalog, &item.attached_modifiers, now);

            let context = EligibilityContext {
                now,
                scope: ModifierScope::PerItem,
                attached: &item.attached_modifiers,
            };
            self.collect_fees(
                catalog,
                &context,
                line_subtotal,
                item.quantity,
                Some(item.ticket_id),
                &mut fees_applied,
            )?;
            line_subtotals.push(line_subtotal);
        }
        let item_fees = Money::sum_in(precision, fees_applied.iter().map(|f| &f.amount))?;

        // 2. Subtotal
        let subtotal = Money::sum_in(precision, &line_subtotals)?;

        // 3. Coupons
        log_stale_references(catalog, &cart.attached_cart_modifiers, now);
        let coupons_applied = self.collect_coupons(cart, catalog, subtotal, now)?;
        let discount = Money::sum_in(precision, coupons_applied.iter().map(|c| &c.amount))?;
        let discounted = subtotal.subtract(discount)?;

        // 4. Cart-level fees
        let cart_fee_start = fees_applied.len();
        let context = EligibilityContext {
            now,
            scope: ModifierScope::AllCart,
            attached: &cart.attached_cart_modifiers,
        };
        self.collect_fees(catalog, &context, discounted, 1, None, &mut fees_applied)?;
        let cart_fees = Money::sum_in(
            precision,
            fees_applied[cart_fee_start..].iter().map(|f| &f.amount),
        )?;

        // 5. Total
        let fees = item_fees.add(cart_fees)?;
        let total = discounted.add(fees)?;

        tracing::debug!(
            cart = %cart.stable_hash(),
            subtotal = %subtotal,
            discount = %discount,
            fees = %fees,
            total = %total,
            "Priced cart"
        );

        Ok(PricingResult {
            subtotal,
            discount,
            item_fees,
            cart_fees,
            fees,
            total,
            fees_applied,
            coupons_applied,
        })
    }

    fn collect_fees(
        &self,
        catalog: &ModifierCatalog,
        context: &EligibilityContext<'_>,
        base: Money,
        units: u32,
        ticket_id: Option<TicketId>,
        applied: &mut Vec<AppliedModifier>,
    ) -> Result<(), ModifierError> {
        for rule in self.registry.rules(Adjustment::Charge) {
            for modifier in catalog.of_kind(rule.tag()) {
                if !rule.is_eligible(modifier, context) {
                    continue;
                }
                applied.push(AppliedModifier {
                    modifier_id: modifier.id,
                    ticket_id,
                    amount: rule.contribution(modifier, base, units)?,
                });
            }
        }
        Ok(())
    }

    fn collect_coupons(
        &self,
        cart: &Cart,
        catalog: &ModifierCatalog,
        subtotal: Money,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppliedModifier>, ModifierError> {
        let context = EligibilityContext {
            now,
            scope: ModifierScope::AllCart,
            attached: &cart.attached_cart_modifiers,
        };

        let mut remaining = subtotal.floor_zero();
        let mut applied: Vec<AppliedModifier> = Vec::new();
        for id in &cart.attached_cart_modifiers {
            if applied.iter().any(|a| a.modifier_id == *id) {
                continue;
            }
            let Some(coupon) = catalog.get(id) else {
                continue;
            };
            let Some(rule) = self
                .registry
                .rule(coupon.kind.tag())
                .filter(|rule| rule.adjustment() == Adjustment::Discount)
            else {
                continue;
            };
            if !rule.is_eligible(coupon, &context) {
                continue;
            }
            // Every coupon sees the original subtotal; only the clamp is cumulative.
            let raw = rule.contribution(coupon, subtotal, 1)?.floor_zero();
            let amount = raw.min(remaining)?;
            remaining = remaining.subtract(amount)?;
            applied.push(AppliedModifier {
                modifier_id: coupon.id,
                ticket_id: None,
                amount,
            });
        }
        Ok(applied)
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::standard()
    }
}

fn log_stale_references(catalog: &ModifierCatalog, attached: &[ModifierId], now: DateTime<Utc>) {
    for id in attached {
        match catalog.get(id) {
            None => {
                tracing::debug!(modifier_id = %id, "Skipping attached modifier missing from catalog");
            }
            Some(modifier) if !modifier.is_live_at(now) => {
                tracing::debug!(
                    modifier_id = %id,
                    slug = %modifier.slug,
                    "Skipping attached modifier that is not live"
                );
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cart::ItemDetails;
    use crate::modifier::{
        FeeApplicability, Modifier, ModifierAmount, ModifierKindTag, ModifierRule,
        ModifierStatus,
    };
    use crate::money::Percentage;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn money(s: &str) -> Money {
        Money::parse(s, ".", ",").unwrap()
    }

    fn percent(s: &str) -> Percentage {
        Percentage::parse(s).unwrap()
    }

    fn booking_fee() -> Modifier {
        Modifier::fee(
            ModifierId::new(1),
            "booking",
            "Booking fee",
            ModifierAmount::Flat(money("1.50")),
            ModifierScope::PerItem,
            FeeApplicability::Automatic,
        )
    }

    fn coupon(id: u64, slug: &str, amount: ModifierAmount) -> Modifier {
        Modifier::coupon(ModifierId::new(id), slug, slug, amount)
    }

    fn cart_of(price: &str, quantity: u32) -> Cart {
        let mut cart = Cart::new();
        cart.upsert_item(TicketId::new(1), quantity, ItemDetails::new(money(price)));
        cart
    }

    #[test]
    fn per_item_flat_fee_scales_with_quantity() {
        let cart = cart_of("10.00", 2);
        let catalog: ModifierCatalog = [booking_fee()].into_iter().collect();

        let result = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();

        assert_eq!(result.subtotal, money("20.00"));
        assert_eq!(result.fees, money("3.00"));
        assert_eq!(result.total, money("23.00"));
        assert_eq!(result.fees_applied.len(), 1);
        assert_eq!(result.fees_applied[0].ticket_id, Some(TicketId::new(1)));
    }

    #[test]
    fn percentage_coupon_discounts_original_subtotal() {
        let mut cart = cart_of("10.00", 2);
        let ten_off = coupon(5, "TENOFF", ModifierAmount::Percentage(percent("10")));
        cart.attach_cart_modifier(ten_off.id);
        let catalog: ModifierCatalog = [ten_off].into_iter().collect();

        let result = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();

        assert_eq!(result.discount, money("2.00"));
        assert_eq!(result.discounted_subtotal().unwrap(), money("18.00"));
        assert_eq!(result.total, money("18.00"));
    }

    #[test]
    fn coupons_are_additive_not_compounding() {
        let mut cart = cart_of("100.00", 1);
        let a = coupon(5, "A", ModifierAmount::Percentage(percent("10")));
        let b = coupon(6, "B", ModifierAmount::Percentage(percent("10")));
        cart.attach_cart_modifier(a.id);
        cart.attach_cart_modifier(b.id);
        let catalog: ModifierCatalog = [a, b].into_iter().collect();

        let result = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();

        assert_eq!(result.discount, money("20.00"));
        assert_eq!(result.coupons_applied.len(), 2);
    }

    #[test]
    fn oversized_coupon_is_clamped_to_subtotal() {
        let mut cart = cart_of("5.00", 1);
        let big = coupon(5, "BIG", ModifierAmount::Flat(money("50.00")));
        cart.attach_cart_modifier(big.id);
        let catalog: ModifierCatalog = [big].into_iter().collect();

        let result = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();

        assert_eq!(result.discount, result.subtotal);
        assert!(result.total.is_zero());
        assert_eq!(result.coupons_applied[0].amount, money("5.00"));
    }

    #[test]
    fn cart_fee_applies_to_discounted_subtotal() {
        let mut cart = cart_of("100.00", 1);
        let half = coupon(5, "HALF", ModifierAmount::Percentage(percent("50")));
        let service = Modifier::fee(
            ModifierId::new(9),
            "service",
            "Service charge",
            ModifierAmount::Percentage(percent("10")),
            ModifierScope::AllCart,
            FeeApplicability::Automatic,
        );
        cart.attach_cart_modifier(half.id);
        let catalog: ModifierCatalog = [half, service].into_iter().collect();

        let result = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();

        assert_eq!(result.cart_fees, money("5.00"));
        assert_eq!(result.total, money("55.00"));
    }

    #[test]
    fn selectable_fee_only_charges_attached_line() {
        let insurance = Modifier::fee(
            ModifierId::new(3),
            "insurance",
            "Ticket insurance",
            ModifierAmount::Flat(money("2.00")),
            ModifierScope::PerItem,
            FeeApplicability::Selectable,
        );
        let mut cart = Cart::new();
        cart.upsert_item(
            TicketId::new(1),
            1,
            ItemDetails::new(money("10.00")).with_modifier(insurance.id),
        );
        cart.upsert_item(TicketId::new(2), 3, ItemDetails::new(money("10.00")));
        let catalog: ModifierCatalog = [insurance].into_iter().collect();

        let result = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();

        assert_eq!(result.item_fees, money("2.00"));
        assert_eq!(result.total, money("42.00"));
    }

    #[test]
    fn stale_attachments_are_skipped() {
        let mut cart = Cart::new();
        cart.upsert_item(
            TicketId::new(1),
            1,
            ItemDetails::new(money("10.00")).with_modifier(ModifierId::new(404)),
        );
        let disabled = coupon(5, "OLD", ModifierAmount::Flat(money("1.00")))
            .with_status(ModifierStatus::Inactive);
        cart.attach_cart_modifier(disabled.id);
        cart.attach_cart_modifier(ModifierId::new(405));
        let catalog: ModifierCatalog = [disabled].into_iter().collect();

        let result = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();

        assert_eq!(result.total, money("10.00"));
        assert!(result.coupons_applied.is_empty());
        assert!(result.fees_applied.is_empty());
    }

    #[test]
    fn empty_registry_applies_nothing() {
        let catalog: ModifierCatalog = [booking_fee()].into_iter().collect();
        let engine = PricingEngine::new(Arc::new(ModifierRegistry::new()));

        let result = engine.price(&cart_of("10.00", 2), &catalog, now()).unwrap();

        assert_eq!(result.total, money("20.00"));
    }

    /// Treats attached cart-level fees as rebates.
    struct RebateRule;

    impl ModifierRule for RebateRule {
        fn tag(&self) -> ModifierKindTag {
            ModifierKindTag::Fee
        }

        fn adjustment(&self) -> Adjustment {
            Adjustment::Discount
        }

        fn is_eligible(&self, modifier: &Modifier, context: &EligibilityContext<'_>) -> bool {
            modifier.scope == context.scope && context.attached.contains(&modifier.id)
        }

        fn contribution(
            &self,
            modifier: &Modifier,
            base: Money,
            _units: u32,
        ) -> Result<Money, ModifierError> {
            match modifier.amount {
                ModifierAmount::Flat(flat) => Ok(flat),
                ModifierAmount::Percentage(p) => Ok(base.apply_percentage(p)),
            }
        }
    }

    #[test]
    fn registered_rules_decide_which_side_of_the_bill() {
        let rebate = Modifier::fee(
            ModifierId::new(8),
            "loyalty",
            "Loyalty rebate",
            ModifierAmount::Flat(money("4.00")),
            ModifierScope::AllCart,
            FeeApplicability::Selectable,
        );
        let mut cart = cart_of("10.00", 1);
        cart.attach_cart_modifier(rebate.id);
        let catalog: ModifierCatalog = [rebate].into_iter().collect();

        let standard = PricingEngine::standard().price(&cart, &catalog, now()).unwrap();
        assert_eq!(standard.total, money("14.00"));

        let registry = ModifierRegistry::new().with_rule(Box::new(RebateRule));
        let result = PricingEngine::new(Arc::new(registry))
            .price(&cart, &catalog, now())
            .unwrap();

        assert_eq!(result.discount, money("4.00"));
        assert!(result.fees.is_zero());
        assert_eq!(result.total, money("6.00"));
        assert_eq!(result.coupon_ids(), vec![ModifierId::new(8)]);
    }

    #[test]
    fn mixed_precision_lines_fail() {
        let mut cart = cart_of("10.00", 1);
        cart.upsert_item(
            TicketId::new(2),
            1,
            ItemDetails::new(Money::from_minor_units(1000, 3)),
        );
        let result = PricingEngine::standard().price(&cart, &ModifierCatalog::new(), now());
        assert!(matches!(result, Err(ModifierError::Money(_))));
    }
}
