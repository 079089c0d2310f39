//! Shopping cart.
//!
//! A [`Cart`] is ephemeral state owned by the session building it. It holds line items
//! unique by ticket, plus modifiers attached at cart level (coupons and selectable cart
//! fees). Pricing is delegated to the [`PricingEngine`]; the cart itself only knows
//! quantities, unit prices and attachments.

use crate::error::CartError;
use crate::modifier::{ModifierCatalog, ModifierId};
use crate::money::{DEFAULT_PRECISION, Money};
use crate::pricing::{PricingEngine, PricingResult};
use crate::stock::{StockGroupKey, StockRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a ticket type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TicketId(u64);

impl TicketId {
    /// Creates a `TicketId`
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

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One line of the cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Ticket type
    pub ticket_id: TicketId,
    /// Always greater than zero
    pub quantity: u32,
    /// Price of one ticket
    pub unit_price: Money,
    /// Selectable fees attached to this line
    pub attached_modifiers: Vec<ModifierId>,
    /// Capacity pool this ticket draws from
    pub stock_group: StockGroupKey,
}

impl CartItem {
    /// `unit_price × quantity`
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ParseError::Overflow`] if the product does not fit.
    pub fn line_subtotal(&self) -> Result<Money, crate::error::ParseError> {
        self.unit_price.multiply_by_quantity(self.quantity)
    }
}

/// Everything about a line besides its ticket and quantity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemDetails {
    unit_price: Money,
    attached_modifiers: Vec<ModifierId>,
    stock_group: Option<StockGroupKey>,
}

impl ItemDetails {
    /// Details with a unit price and nothing attached.
    #[must_use]
    pub const fn new(unit_price: Money) -> Self {
        Self {
            unit_price,
            attached_modifiers: Vec::new(),
            stock_group: None,
        }
    }

    /// Attaches a selectable per-item fee.
    #[must_use]
    pub fn with_modifier(mut self, id: ModifierId) -> Self {
        if !self.attached_modifiers.contains(&id) {
            self.attached_modifiers.push(id);
        }
        self
    }

    /// Draws capacity from a shared pool instead of the ticket's own group.
    #[must_use]
    pub fn in_group(mut self, group: StockGroupKey) -> Self {
        self.stock_group = Some(group);
        self
    }
}

/// An ordered collection of line items plus cart-level modifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    items: Vec<CartItem>,
    /// Coupons and selectable cart fees, in attachment order
    pub attached_cart_modifiers: Vec<ModifierId>,
}

impl Cart {
    /// Empty cart.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the line for `ticket_id`. Quantity 0 removes it.
    ///
    /// Replacing keeps the line's position so the cart order stays stable.
    pub fn upsert_item(&mut self, ticket_id: TicketId, quantity: u32, details: ItemDetails) {
        if quantity == 0 {
            self.remove_item(ticket_id);
            return;
        }
        let item = CartItem {
            ticket_id,
            quantity,
            unit_price: details.unit_price,
            attached_modifiers: details.attached_modifiers,
            stock_group: details
                .stock_group
                .unwrap_or_else(|| StockGroupKey::for_ticket(ticket_id)),
        };
        match self.items.iter_mut().find(|i| i.ticket_id == ticket_id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    /// Removes the line for `ticket_id`. Returns whether anything was removed.
    pub fn remove_item(&mut self, ticket_id: TicketId) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.ticket_id != ticket_id);
        self.items.len() != before
    }

    /// Line items in insertion order.
    #[must_use]
    pub fn get_items(&self) -> &[CartItem] {
        &self.items
    }

    /// Number of distinct lines.
    #[must_use]
    pub fn has_items(&self) -> usize {
        self.items.len()
    }

    /// Whether the cart has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Quantity of one ticket.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::NotFound`] if the ticket is not in the cart.
    pub fn get_item_quantity(&self, ticket_id: TicketId) -> Result<u32, CartError> {
        self.items
            .iter()
            .find(|i| i.ticket_id == ticket_id)
            .map(|i| i.quantity)
            .ok_or(CartError::NotFound(ticket_id))
    }

    /// Tickets across all lines.
    #[must_use]
    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    /// Precision of the cart's prices (taken from the first line).
    #[must_use]
    pub fn precision(&self) -> u8 {
        self.items
            .first()
            .map_or(DEFAULT_PRECISION, |i| i.unit_price.precision())
    }

    /// Prices the cart.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Pricing`] on precision mismatch or overflow.
    pub fn compute_pricing(
        &self,
        engine: &PricingEngine,
        catalog: &ModifierCatalog,
        now: DateTime<Utc>,
    ) -> Result<PricingResult, CartError> {
        Ok(engine.price(self, catalog, now)?)
    }

    /// Validates a coupon code and attaches it. Attaching twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the specific [`crate::error::ModifierError`] explaining why the code
    /// cannot be used.
    pub fn apply_coupon(
        &mut self,
        slug: &str,
        catalog: &ModifierCatalog,
        now: DateTime<Utc>,
    ) -> Result<ModifierId, CartError> {
        let coupon = catalog.validate_coupon(slug, now)?;
        self.attach_cart_modifier(coupon.id);
        Ok(coupon.id)
    }

    /// Detaches a coupon. Returns whether it was attached.
    pub fn remove_coupon(&mut self, id: ModifierId) -> bool {
        let before = self.attached_cart_modifiers.len();
        self.attached_cart_modifiers.retain(|m| *m != id);
        self.attached_cart_modifiers.len() != before
    }

    /// Attaches a selectable cart-level fee.
    pub fn attach_cart_fee(&mut self, id: ModifierId) {
        self.attach_cart_modifier(id);
    }

    pub(crate) fn attach_cart_modifier(&mut self, id: ModifierId) {
        if !self.attached_cart_modifiers.contains(&id) {
            self.attached_cart_modifiers.push(id);
        }
    }

    /// Quantities per stock group, summed across tickets sharing a pool, in key order.
    #[must_use]
    pub fn stock_requests(&self) -> Vec<StockRequest> {
        let mut per_group: BTreeMap<&StockGroupKey, u64> = BTreeMap::new();
        for item in &self.items {
            *per_group.entry(&item.stock_group).or_default() += u64::from(item.quantity);
        }
        per_group
            .into_iter()
            .map(|(group_key, quantity)| StockRequest::new(group_key.clone(), quantity))
            .collect()
    }

    /// Content-addressed key for session correlation.
    ///
    /// Identical item sets hash identically regardless of insertion order.
    #[must_use]
    pub fn stable_hash(&self) -> String {
        let mut items: Vec<&CartItem> = self.items.iter().collect();
        items.sort_by_key(|i| i.ticket_id);

        let mut hasher = Sha256::new();
        for item in items {
            let mut modifiers = item.attached_modifiers.clone();
            modifiers.sort_unstable();
            modifiers.dedup();
            hasher.update(
                format!(
                    "item:{}:{}:{}@{}:{}:{}\n",
                    item.ticket_id,
                    item.quantity,
                    item.unit_price.to_minor_units(),
                    item.unit_price.precision(),
                    item.stock_group,
                    join_ids(&modifiers),
                )
                .as_bytes(),
            );
        }
        let mut cart_modifiers = self.attached_cart_modifiers.clone();
        cart_modifiers.sort_unstable();
        cart_modifiers.dedup();
        hasher.update(format!("cart:{}\n", join_ids(&cart_modifiers)).as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

fn join_ids(ids: &[ModifierId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
