//! Fee and coupon definitions.
//!
//! A [`Modifier`] is either a fee (adds to the price) or a coupon (takes off the price).
//! Which modifiers apply, and how much they contribute, is decided by a [`ModifierRule`]
//! per kind. Rules live in a [`ModifierRegistry`] that is built once at startup and handed
//! to the pricing engine, so adding a modifier kind means registering one more rule rather
//! than threading string-keyed hooks through the checkout path.

use crate::error::ModifierError;
use crate::money::{Money, Percentage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

// ============================================================================
// Identifiers and enums
// ============================================================================

/// Identifier of a fee or coupon definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModifierId(u64);

impl ModifierId {
    /// Creates a `ModifierId`
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a fee attaches itself or must be selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeApplicability {
    /// Applies to every relevant cart.
    Automatic,
    /// Applies only when attached to a line item or the cart.
    Selectable,
}

/// Fee or coupon, with the data only that kind carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierKind {
    /// Adds to the price
    Fee {
        /// Automatic or selectable
        applicability: FeeApplicability,
    },
    /// Takes off the price; redeemed with a code
    Coupon {
        /// Maximum redemptions (`Some(1)` for single-use)
        usage_limit: Option<u32>,
        /// Redemptions held by live or completed orders
        times_redeemed: u32,
    },
}

impl ModifierKind {
    /// The registry key for this kind.
    #[must_use]
    pub const fn tag(&self) -> ModifierKindTag {
        match self {
            Self::Fee { .. } => ModifierKindTag::Fee,
            Self::Coupon { .. } => ModifierKindTag::Coupon,
        }
    }
}

/// Registry key for a modifier kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModifierKindTag {
    /// Fees
    Fee,
    /// Coupons
    Coupon,
}

impl fmt::Display for ModifierKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fee => write!(f, "fee"),
            Self::Coupon => write!(f, "coupon"),
        }
    }
}

/// Raw amount; the variant is the modifier's sub-type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierAmount {
    /// Fixed money amount
    Flat(Money),
    /// Ratio of the base amount
    Percentage(Percentage),
}

/// Per line item or once per cart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModifierScope {
    /// Charged against each line item's subtotal
    PerItem,
    /// Charged once against the cart
    AllCart,
}

/// Publication status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierStatus {
    /// Live
    Active,
    /// Being edited
    Draft,
    /// Switched off
    Inactive,
}

// ============================================================================
// Modifier
// ============================================================================

/// A fee or coupon definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifier {
    /// Unique id
    pub id: ModifierId,
    /// Fee or coupon
    pub kind: ModifierKind,
    /// Flat or percentage amount
    pub amount: ModifierAmount,
    /// Per item or per cart
    pub scope: ModifierScope,
    /// Publication status
    pub status: ModifierStatus,
    /// Redemption code for coupons, identifier for fees
    pub slug: String,
    /// Label shown to purchasers
    pub display_name: String,
    /// Start of the validity window (open if `None`)
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window (open if `None`)
    pub valid_until: Option<DateTime<Utc>>,
}

impl Modifier {
    /// Creates an active fee.
    #[must_use]
    pub fn fee(
        id: ModifierId,
        slug: impl Into<String>,
        display_name: impl Into<String>,
        amount: ModifierAmount,
        scope: ModifierScope,
        applicability: FeeApplicability,
    ) -> Self {
        Self {
            id,
            kind: ModifierKind::Fee { applicability },
            amount,
            scope,
            status: ModifierStatus::Active,
            slug: slug.into(),
            display_name: display_name.into(),
            valid_from: None,
            valid_until: None,
        }
    }

    /// Creates an active, unlimited cart coupon.
    #[must_use]
    pub fn coupon(
        id: ModifierId,
        slug: impl Into<String>,
        display_name: impl Into<String>,
        amount: ModifierAmount,
    ) -> Self {
        Self {
            id,
            kind: ModifierKind::Coupon {
                usage_limit: None,
                times_redeemed: 0,
            },
            amount,
            scope: ModifierScope::AllCart,
            status: ModifierStatus::Active,
            slug: slug.into(),
            display_name: display_name.into(),
            valid_from: None,
            valid_until: None,
        }
    }

    /// Restricts the validity window.
    #[must_use]
    pub const fn with_window(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_until = valid_until;
        self
    }

    /// Sets the publication status.
    #[must_use]
    pub const fn with_status(mut self, status: ModifierStatus) -> Self {
        self.status = status;
        self
    }

    /// Caps coupon redemptions. No effect on fees.
    #[must_use]
    pub const fn with_usage_limit(mut self, limit: u32) -> Self {
        if let ModifierKind::Coupon { usage_limit, .. } = &mut self.kind {
            *usage_limit = Some(limit);
        }
        self
    }

    /// Checks structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ModifierError::UnsupportedScope`] for per-item coupons.
    pub const fn validate(&self) -> Result<(), ModifierError> {
        if matches!(self.kind, ModifierKind::Coupon { .. })
            && matches!(self.scope, ModifierScope::PerItem)
        {
            return Err(ModifierError::UnsupportedScope);
        }
        Ok(())
    }

    /// Whether `now` falls inside the inclusive validity window.
    #[must_use]
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| now >= from)
            && self.valid_until.is_none_or(|until| now <= until)
    }

    /// Active and inside the window.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ModifierStatus::Active && self.is_within_window(now)
    }

    /// Whether a coupon has used up its redemptions. Always `false` for fees.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        match self.kind {
            ModifierKind::Coupon {
                usage_limit: Some(limit),
                times_redeemed,
            } => times_redeemed >= limit,
            _ => false,
        }
    }

    /// Whether this is a fee that applies without being attached.
    #[must_use]
    pub const fn is_automatic(&self) -> bool {
        matches!(
            self.kind,
            ModifierKind::Fee {
                applicability: FeeApplicability::Automatic
            }
        )
    }
}

// ============================================================================
// Rules and registry
// ============================================================================

/// What a rule needs to know to decide eligibility.
#[derive(Clone, Copy, Debug)]
pub struct EligibilityContext<'a> {
    /// Pricing time
    pub now: DateTime<Utc>,
    /// Scope being priced (a line item or the whole cart)
    pub scope: ModifierScope,
    /// Modifier ids explicitly attached at that scope
    pub attached: &'a [ModifierId],
}

/// Which side of the bill a rule's contributions land on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjustment {
    /// Added to the price
    Charge,
    /// Taken off the subtotal, clamped so it never goes below zero
    Discount,
}

/// Capability implemented once per modifier kind.
pub trait ModifierRule: Send + Sync {
    /// Kind this rule handles.
    fn tag(&self) -> ModifierKindTag;

    /// Whether contributions are charged or discounted.
    fn adjustment(&self) -> Adjustment;

    /// Whether the modifier applies in this context.
    fn is_eligible(&self, modifier: &Modifier, context: &EligibilityContext<'_>) -> bool;

    /// Monetary contribution against `base`; `units` is the line quantity for per-item
    /// modifiers and 1 at cart scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the arithmetic overflows or precisions differ.
    fn contribution(
        &self,
        modifier: &Modifier,
        base: Money,
        units: u32,
    ) -> Result<Money, ModifierError>;
}

fn flat_or_percentage(
    amount: ModifierAmount,
    base: Money,
    units: u32,
) -> Result<Money, ModifierError> {
    match amount {
        ModifierAmount::Flat(flat) => {
            if flat.precision() != base.precision() {
                return Err(crate::error::ParseError::CurrencyMismatch {
                    left: base.precision(),
                    right: flat.precision(),
                }
                .into());
            }
            Ok(flat.multiply_by_quantity(units)?)
        }
        ModifierAmount::Percentage(percentage) => Ok(base.apply_percentage(percentage)),
    }
}

/// Fees: automatic ones always apply, selectable ones only when attached.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeeRule;

impl ModifierRule for FeeRule {
    fn tag(&self) -> ModifierKindTag {
        ModifierKindTag::Fee
    }

    fn adjustment(&self) -> Adjustment {
        Adjustment::Charge
    }

    fn is_eligible(&self, modifier: &Modifier, context: &EligibilityContext<'_>) -> bool {
        modifier.scope == context.scope
            && modifier.is_live_at(context.now)
            && (modifier.is_automatic() || context.attached.contains(&modifier.id))
    }

    fn contribution(
        &self,
        modifier: &Modifier,
        base: Money,
        units: u32,
    ) -> Result<Money, ModifierError> {
        flat_or_percentage(modifier.amount, base, units)
    }
}

/// Coupons: apply once per cart when attached, live and not exhausted.
#[derive(Clone, Copy, Debug, Default)]
pub struct CouponRule;

impl ModifierRule for CouponRule {
    fn tag(&self) -> ModifierKindTag {
        ModifierKindTag::Coupon
    }

    fn adjustment(&self) -> Adjustment {
        Adjustment::Discount
    }

    fn is_eligible(&self, modifier: &Modifier, context: &EligibilityContext<'_>) -> bool {
        context.scope == ModifierScope::AllCart
            && context.attached.contains(&modifier.id)
            && modifier.is_live_at(context.now)
            && !modifier.is_exhausted()
    }

    fn contribution(
        &self,
        modifier: &Modifier,
        base: Money,
        _units: u32,
    ) -> Result<Money, ModifierError> {
        flat_or_percentage(modifier.amount, base, 1)
    }
}

/// Capability table of modifier rules, resolved at startup.
pub struct ModifierRegistry {
    rules: BTreeMap<ModifierKindTag, Box<dyn ModifierRule>>,
}

impl ModifierRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Registry with the built-in fee and coupon rules.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_rule(Box::new(FeeRule))
            .with_rule(Box::new(CouponRule))
    }

    /// Registers (or replaces) the rule for its kind.
    #[must_use]
    pub fn with_rule(mut self, rule: Box<dyn ModifierRule>) -> Self {
        self.rules.insert(rule.tag(), rule);
        self
    }

    /// Rule for a kind, if registered.
    #[must_use]
    pub fn rule(&self, tag: ModifierKindTag) -> Option<&dyn ModifierRule> {
        self.rules.get(&tag).map(AsRef::as_ref)
    }

    /// Registered rules with the given adjustment, in tag order.
    pub fn rules(&self, adjustment: Adjustment) -> impl Iterator<Item = &dyn ModifierRule> {
        self.rules
            .values()
            .map(AsRef::as_ref)
            .filter(move |rule| rule.adjustment() == adjustment)
    }
}

impl Default for ModifierRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for ModifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModifierRegistry")
            .field("kinds", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// The full set of known modifiers, iterated in id order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifierCatalog {
    modifiers: BTreeMap<ModifierId, Modifier>,
}

impl ModifierCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a modifier.
    pub fn insert(&mut self, modifier: Modifier) {
        self.modifiers.insert(modifier.id, modifier);
    }

    /// Gets a modifier by id.
    #[must_use]
    pub fn get(&self, id: &ModifierId) -> Option<&Modifier> {
        self.modifiers.get(id)
    }

    /// Mutable access, used to bump redemption counts.
    pub fn get_mut(&mut self, id: &ModifierId) -> Option<&mut Modifier> {
        self.modifiers.get_mut(id)
    }

    /// All modifiers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Modifier> {
        self.modifiers.values()
    }

    /// Modifiers of one kind, in id order.
    pub fn of_kind(&self, tag: ModifierKindTag) -> impl Iterator<Item = &Modifier> {
        self.modifiers.values().filter(move |m| m.kind.tag() == tag)
    }

    /// Number of modifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modifiers.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    /// Case-insensitive slug lookup.
    #[must_use]
    pub fn find_by_slug(&self, slug: &str) -> Option<&Modifier> {
        let slug = slug.trim();
        self.modifiers
            .values()
            .find(|m| m.slug.eq_ignore_ascii_case(slug))
    }

    /// Case-insensitive coupon lookup; fees with a matching slug are ignored.
    #[must_use]
    pub fn find_coupon(&self, slug: &str) -> Option<&Modifier> {
        self.find_by_slug(slug)
            .filter(|m| m.kind.tag() == ModifierKindTag::Coupon)
    }

    /// Validates a user-entered coupon code.
    ///
    /// # Errors
    ///
    /// One of the coupon variants of [`ModifierError`], each distinguishable so the
    /// caller can tell the purchaser exactly what is wrong with the code.
    pub fn validate_coupon(
        &self,
        slug: &str,
        now: DateTime<Utc>,
    ) -> Result<&Modifier, ModifierError> {
        let Some(modifier) = self.find_by_slug(slug) else {
            return Err(ModifierError::UnknownCoupon(slug.trim().to_string()));
        };
        let code = modifier.slug.clone();

        if modifier.kind.tag() != ModifierKindTag::Coupon {
            return Err(ModifierError::NotACoupon(code));
        }
        if modifier.status != ModifierStatus::Active {
            return Err(ModifierError::CouponInactive(code));
        }
        if modifier.valid_from.is_some_and(|from| now < from) {
            return Err(ModifierError::CouponNotYetValid(code));
        }
        if modifier.valid_until.is_some_and(|until| now > until) {
            return Err(ModifierError::CouponExpired(code));
        }
        if modifier.is_exhausted() {
            return Err(ModifierError::CouponExhausted(code));
        }
        Ok(modifier)
    }
}

impl FromIterator<Modifier> for ModifierCatalog {
    fn from_iter<T: IntoIterator<Item = Modifier>>(iter: T) -> Self {
        Self {
            modifiers: iter.into_iter().map(|m| (m.id, m)).collect(),
        }
    }
}

// ============================================================================
// Repository contract
// ============================================================================

/// Durable storage for modifier definitions.
pub trait ModifierRepository: Send + Sync {
    /// Loads every modifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn load_catalog(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ModifierCatalog, ModifierError>> + Send + '_>>;

    /// Holds one redemption of a coupon, atomically with the usage-limit check. Fees and
    /// unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ModifierError::CouponExhausted`] if the coupon has no redemptions left,
    /// or a storage error if the backing store fails.
    fn reserve_redemption(
        &self,
        id: ModifierId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ModifierError>> + Send + '_>>;

    /// Gives back a redemption held by [`reserve_redemption`](Self::reserve_redemption).
    /// The count never drops below zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn release_redemption(
        &self,
        id: ModifierId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ModifierError>> + Send + '_>>;
}

/// Modifier storage for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryModifierRepository {
    catalog: RwLock<ModifierCatalog>,
}

impl InMemoryModifierRepository {
    /// Repository seeded with a catalog.
    #[must_use]
    pub fn new(catalog: ModifierCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
        }
    }

    /// Adds or replaces a modifier.
    pub async fn upsert(&self, modifier: Modifier) {
        self.catalog.write().await.insert(modifier);
    }
}

impl ModifierRepository for InMemoryModifierRepository {
    fn load_catalog(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ModifierCatalog, ModifierError>> + Send + '_>> {
        Box::pin(async move { Ok(self.catalog.read().await.clone()) })
    }

    fn reserve_redemption(
        &self,
        id: ModifierId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ModifierError>> + Send + '_>> {
        Box::pin(async move {
            let mut catalog = self.catalog.write().await;
            let Some(modifier) = catalog.get_mut(&id) else {
                return Ok(());
            };
            if modifier.is_exhausted() {
                return Err(ModifierError::CouponExhausted(modifier.slug.clone()));
            }
            if let ModifierKind::Coupon { times_redeemed, .. } = &mut modifier.kind {
                *times_redeemed = times_redeemed.saturating_add(1);
            }
            Ok(())
        })
    }

    fn release_redemption(
        &self,
        id: ModifierId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ModifierError>> + Send + '_>> {
        Box::pin(async move {
            let mut catalog = self.catalog.write().await;
            if let Some(Modifier {
                kind: ModifierKind::Coupon { times_redeemed, .. },
                ..
            }) = catalog.get_mut(&id)
            {
                *times_redeemed = times_redeemed.saturating_sub(1);
            }
            Ok(())
        })
    }
}
