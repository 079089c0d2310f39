//! Money value object.
//!
//! Amounts arrive from form inputs, stored meta and gateway payloads as locale-formatted
//! strings with inconsistent separators. They are converted to an integer count of minor
//! units immediately and every calculation happens on that integer; formatted strings are
//! derived on demand and never stored as the source of truth.
//!
//! ```text
//! "1.234,56"  --parse(",", ".")-->  Money { minor_units: 123456, precision: 2 }
//!                                        |
//!             <--format(",", ".")--------+   "1.234,56"
//! ```

use crate::error::{ModifierError, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Digits after the decimal separator for most currencies.
pub const DEFAULT_PRECISION: u8 = 2;

/// Largest precision whose scale factor fits comfortably in `u64`.
pub const MAX_PRECISION: u8 = 18;

// ============================================================================
// Money
// ============================================================================

/// Signed fixed-point monetary amount.
///
/// Immutable: every operation returns a new value. Values of different precision
/// never combine silently; they fail with [`ParseError::CurrencyMismatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    minor_units: i64,
    precision: u8,
}

impl Money {
    /// Creates a value from a raw minor-unit count.
    #[must_use]
    pub const fn from_minor_units(minor_units: i64, precision: u8) -> Self {
        let precision = if precision > MAX_PRECISION {
            MAX_PRECISION
        } else {
            precision
        };
        Self {
            minor_units,
            precision,
        }
    }

    /// Creates a two-decimal value from cents.
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self::from_minor_units(cents, DEFAULT_PRECISION)
    }

    /// Zero at the given precision.
    #[must_use]
    pub const fn zero(precision: u8) -> Self {
        Self::from_minor_units(0, precision)
    }

    /// The authoritative integer amount.
    #[must_use]
    pub const fn to_minor_units(&self) -> i64 {
        self.minor_units
    }

    /// Digits after the decimal separator.
    #[must_use]
    pub const fn precision(&self) -> u8 {
        self.precision
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.minor_units == 0
    }

    /// Checks if the amount is below zero
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.minor_units < 0
    }

    /// Parses a locale-formatted amount at [`DEFAULT_PRECISION`].
    ///
    /// # Errors
    ///
    /// See [`Money::parse_with_precision`].
    pub fn parse(input: &str, decimal_sep: &str, thousands_sep: &str) -> Result<Self, ParseError> {
        Self::parse_with_precision(input, decimal_sep, thousands_sep, DEFAULT_PRECISION)
    }

    /// Parses a locale-formatted amount.
    ///
    /// Thousands separators are stripped, the decimal separator is normalized, a bare
    /// leading or trailing separator is tolerated (`.78`, `1010.`), and extra fraction
    /// digits are rounded half away from zero.
    ///
    /// # Errors
    ///
    /// - [`ParseError::Empty`] for blank input
    /// - [`ParseError::MultipleDecimalPoints`] when the decimal separator appears twice
    /// - [`ParseError::NotNumeric`] for anything else that is not a plain decimal number
    /// - [`ParseError::Overflow`] if the value does not fit in `i64` minor units
    pub fn parse_with_precision(
        input: &str,
        decimal_sep: &str,
        thousands_sep: &str,
        precision: u8,
    ) -> Result<Self, ParseError> {
        let precision = precision.min(MAX_PRECISION);
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };

        let decimal_sep = if decimal_sep.is_empty() { "." } else { decimal_sep };
        let mut normalized = body.to_string();
        if !thousands_sep.is_empty() && thousands_sep != decimal_sep {
            normalized = normalized.replace(thousands_sep, "");
        }
        if decimal_sep != "." {
            // A literal dot is neither a grouping nor a decimal mark in this locale.
            if normalized.contains('.') {
                return Err(ParseError::NotNumeric(input.to_string()));
            }
            normalized = normalized.replace(decimal_sep, ".");
        }

        let (whole, fraction) = match normalized.split_once('.') {
            Some((_, fraction)) if fraction.contains('.') => {
                return Err(ParseError::MultipleDecimalPoints(input.to_string()));
            }
            Some((whole, fraction)) => (whole, fraction),
            None => (normalized.as_str(), ""),
        };

        let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty()) || !is_digits(whole) || !is_digits(fraction) {
            return Err(ParseError::NotNumeric(input.to_string()));
        }

        let mut magnitude: i128 = 0;
        for digit in whole.bytes() {
            magnitude = push_digit(magnitude, digit)?;
        }

        let mut fraction_digits = fraction.bytes();
        for _ in 0..precision {
            let digit = fraction_digits.next().unwrap_or(b'0');
            magnitude = push_digit(magnitude, digit)?;
        }
        if fraction_digits.next().is_some_and(|digit| digit >= b'5') {
            magnitude = magnitude.checked_add(1).ok_or(ParseError::Overflow)?;
        }

        let signed = if negative { -magnitude } else { magnitude };
        let minor_units = i64::try_from(signed).map_err(|_| ParseError::Overflow)?;
        Ok(Self::from_minor_units(minor_units, precision))
    }

    /// Adds two amounts of the same precision.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::CurrencyMismatch`] for differing precision and
    /// [`ParseError::Overflow`] if the sum does not fit.
    pub fn add(self, other: Self) -> Result<Self, ParseError> {
        self.ensure_same_currency(other)?;
        self.minor_units
            .checked_add(other.minor_units)
            .map(|minor| Self::from_minor_units(minor, self.precision))
            .ok_or(ParseError::Overflow)
    }

    /// Subtracts `other` from `self`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::CurrencyMismatch`] for differing precision and
    /// [`ParseError::Overflow`] if the result does not fit.
    pub fn subtract(self, other: Self) -> Result<Self, ParseError> {
        self.ensure_same_currency(other)?;
        self.minor_units
            .checked_sub(other.minor_units)
            .map(|minor| Self::from_minor_units(minor, self.precision))
            .ok_or(ParseError::Overflow)
    }

    /// Line subtotal: unit price times quantity.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Overflow`] if the product does not fit.
    pub fn multiply_by_quantity(self, quantity: u32) -> Result<Self, ParseError> {
        self.minor_units
            .checked_mul(i64::from(quantity))
            .map(|minor| Self::from_minor_units(minor, self.precision))
            .ok_or(ParseError::Overflow)
    }

    /// Percentage of this amount, rounded half away from zero to the minor unit.
    #[must_use]
    pub fn apply_percentage(self, percentage: Percentage) -> Self {
        let product = i128::from(self.minor_units) * i128::from(percentage.basis_points());
        let rounded = round_half_away_from_zero(product, i128::from(Percentage::FULL));
        // |rounded| <= |minor_units| because the percentage never exceeds 100%.
        #[allow(clippy::cast_possible_truncation)]
        let minor = rounded as i64;
        Self::from_minor_units(minor, self.precision)
    }

    /// The smaller of two amounts of the same precision.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::CurrencyMismatch`] for differing precision.
    pub fn min(self, other: Self) -> Result<Self, ParseError> {
        self.ensure_same_currency(other)?;
        Ok(if other.minor_units < self.minor_units {
            other
        } else {
            self
        })
    }

    /// Negative amounts become zero.
    #[must_use]
    pub const fn floor_zero(self) -> Self {
        if self.minor_units < 0 {
            Self::zero(self.precision)
        } else {
            self
        }
    }

    /// Sums amounts that must all share one precision; empty input sums to zero at
    /// [`DEFAULT_PRECISION`].
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::CurrencyMismatch`] if any precision differs and
    /// [`ParseError::Overflow`] if the total does not fit.
    pub fn sum<'a, I>(values: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = &'a Self>,
    {
        let mut values = values.into_iter();
        let Some(first) = values.next() else {
            return Ok(Self::zero(DEFAULT_PRECISION));
        };
        values.try_fold(*first, |total, value| total.add(*value))
    }

    /// Sums amounts into an explicitly typed zero, so empty input keeps the right precision.
    ///
    /// # Errors
    ///
    /// Same as [`Money::sum`].
    pub fn sum_in<'a, I>(precision: u8, values: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = &'a Self>,
    {
        values
            .into_iter()
            .try_fold(Self::zero(precision), |total, value| total.add(*value))
    }

    /// Formats the number only, e.g. `1.234,56`.
    #[must_use]
    pub fn format_number(&self, decimal_sep: &str, thousands_sep: &str) -> String {
        let magnitude = self.format_magnitude(decimal_sep, thousands_sep);
        if self.is_negative() {
            format!("-{magnitude}")
        } else {
            magnitude
        }
    }

    /// Formats the absolute value; works for `i64::MIN` minor units too.
    fn format_magnitude(&self, decimal_sep: &str, thousands_sep: &str) -> String {
        let decimal_sep = if decimal_sep.is_empty() { "." } else { decimal_sep };
        let scale = 10u64.pow(u32::from(self.precision));
        let magnitude = self.minor_units.unsigned_abs();
        let whole = (magnitude / scale).to_string();
        let fraction = magnitude % scale;

        let mut out = String::with_capacity(whole.len() + 8);
        if thousands_sep.is_empty() || thousands_sep == decimal_sep {
            out.push_str(&whole);
        } else {
            let offset = whole.len() % 3;
            for (index, digit) in whole.chars().enumerate() {
                if index > 0 && index % 3 == offset {
                    out.push_str(thousands_sep);
                }
                out.push(digit);
            }
        }
        if self.precision > 0 {
            out.push_str(decimal_sep);
            out.push_str(&format!(
                "{fraction:0width$}",
                width = usize::from(self.precision)
            ));
        }
        out
    }

    /// Formats with a currency symbol, e.g. `$1,234.56` or `-1.234,56€`.
    #[must_use]
    pub fn format(
        &self,
        decimal_sep: &str,
        thousands_sep: &str,
        symbol: &str,
        position: SymbolPosition,
    ) -> String {
        let number = self.format_magnitude(decimal_sep, thousands_sep);
        let sign = if self.is_negative() { "-" } else { "" };
        match position {
            SymbolPosition::Prefix => format!("{sign}{symbol}{number}"),
            SymbolPosition::Suffix => format!("{sign}{number}{symbol}"),
        }
    }

    const fn ensure_same_currency(self, other: Self) -> Result<(), ParseError> {
        if self.precision == other.precision {
            Ok(())
        } else {
            Err(ParseError::CurrencyMismatch {
                left: self.precision,
                right: other.precision,
            })
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_number(".", ""))
    }
}

/// Largest magnitude a parsed amount can have: that of `i64::MIN`.
const MAX_MAGNITUDE: i128 = 9_223_372_036_854_775_808;

fn push_digit(value: i128, digit: u8) -> Result<i128, ParseError> {
    value
        .checked_mul(10)
        .and_then(|v| v.checked_add(i128::from(digit - b'0')))
        .filter(|v| *v <= MAX_MAGNITUDE)
        .ok_or(ParseError::Overflow)
}

/// Integer division rounding half away from zero; `denominator` must be positive.
fn round_half_away_from_zero(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator {
        quotient + numerator.signum()
    } else {
        quotient
    }
}

// ============================================================================
// Percentage
// ============================================================================

/// A ratio in `[0, 1]`, stored as basis points (1% = 100).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Percentage(u32);

impl Percentage {
    /// 100% in basis points.
    pub const FULL: u32 = 10_000;

    /// Creates a percentage from basis points.
    ///
    /// # Errors
    ///
    /// Returns [`ModifierError::InvalidPercentage`] above 100%.
    pub const fn from_basis_points(basis_points: u32) -> Result<Self, ModifierError> {
        if basis_points > Self::FULL {
            Err(ModifierError::InvalidPercentage(basis_points))
        } else {
            Ok(Self(basis_points))
        }
    }

    /// Parses a human percentage such as `10` or `12.5`.
    ///
    /// # Errors
    ///
    /// Returns [`ModifierError::Money`] for malformed input and
    /// [`ModifierError::InvalidPercentage`] outside 0..=100.
    pub fn parse(input: &str) -> Result<Self, ModifierError> {
        let trimmed = input.trim().trim_end_matches('%');
        let hundredths = Money::parse_with_precision(trimmed, ".", "", 2)?.to_minor_units();
        let basis_points = u32::try_from(hundredths)
            .map_err(|_| ModifierError::InvalidPercentage(u32::MAX))?;
        Self::from_basis_points(basis_points)
    }

    /// Basis points (0..=10000).
    #[must_use]
    pub const fn basis_points(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Percentage {
    type Error = ModifierError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_basis_points(value)
    }
}

impl From<Percentage> for u32 {
    fn from(value: Percentage) -> Self {
        value.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 100;
        match self.0 % 100 {
            0 => write!(f, "{whole}%"),
            rest if rest % 10 == 0 => write!(f, "{whole}.{}%", rest / 10),
            rest => write!(f, "{whole}.{rest:02}%"),
        }
    }
}

// ============================================================================
// Presentation profile
// ============================================================================

/// Where the currency symbol goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolPosition {
    /// `$10.00`
    Prefix,
    /// `10,00€`
    Suffix,
}

impl FromStr for SymbolPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefix" | "before" => Ok(Self::Prefix),
            "suffix" | "postfix" | "after" => Ok(Self::Suffix),
            other => Err(format!("Unknown symbol position '{other}'")),
        }
    }
}

/// Locale presentation profile for a currency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFormat {
    /// Decimal separator, e.g. `.` or `,`
    pub decimal_separator: String,
    /// Thousands separator, may be empty or an HTML entity such as `&nbsp;`
    pub thousands_separator: String,
    /// Currency symbol
    pub symbol: String,
    /// Symbol placement
    pub symbol_position: SymbolPosition,
    /// Digits after the decimal separator
    pub precision: u8,
}

impl PriceFormat {
    /// Creates a presentation profile.
    #[must_use]
    pub fn new(
        decimal_separator: impl Into<String>,
        thousands_separator: impl Into<String>,
        symbol: impl Into<String>,
        symbol_position: SymbolPosition,
        precision: u8,
    ) -> Self {
        Self {
            decimal_separator: decimal_separator.into(),
            thousands_separator: thousands_separator.into(),
            symbol: symbol.into(),
            symbol_position,
            precision: precision.min(MAX_PRECISION),
        }
    }

    /// Formats a value with this profile.
    #[must_use]
    pub fn format(&self, money: &Money) -> String {
        money.format(
            &self.decimal_separator,
            &self.thousands_separator,
            &self.symbol,
            self.symbol_position,
        )
    }

    /// Parses user or stored input, tolerating this profile's currency symbol.
    ///
    /// # Errors
    ///
    /// See [`Money::parse_with_precision`].
    pub fn parse(&self, input: &str) -> Result<Money, ParseError> {
        let trimmed = input.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };
        let body = if self.symbol.is_empty() {
            body
        } else {
            body.strip_prefix(self.symbol.as_str())
                .or_else(|| body.strip_suffix(self.symbol.as_str()))
                .unwrap_or(body)
                .trim()
        };
        let signed;
        let body = if negative {
            signed = format!("-{body}");
            signed.as_str()
        } else {
            body
        };
        Money::parse_with_precision(
            body,
            &self.decimal_separator,
            &self.thousands_separator,
            self.precision,
        )
    }
}

impl Default for PriceFormat {
    fn default() -> Self {
        Self::new(".", ",", "$", SymbolPosition::Prefix, DEFAULT_PRECISION)
    }
}
