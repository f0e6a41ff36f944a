//! # Quantity Module
//!
//! Provides the `Quantity` type for stock counts.
//!
//! ## Why Decimal?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Stock is not always counted in whole units                             │
//! │                                                                         │
//! │    2.5 kg of rice, 0.75 m of cable, 1.5 boxes                           │
//! │                                                                         │
//! │  Floats drift:   0.1 + 0.2 = 0.30000000000000004                        │
//! │  Decimal is exact: 0.1 + 0.2 = 0.3                                      │
//! │                                                                         │
//! │  Stored as canonical TEXT ("2.5", never "2.50"), so two equal           │
//! │  quantities always compare equal in SQL as well as in Rust.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::Quantity;
//!
//! let on_hand: Quantity = "10.5".parse().unwrap();
//! let sold = Quantity::from(3);
//!
//! assert_eq!((on_hand - sold).to_string(), "7.5");
//! assert_eq!(Quantity::from(2).line_total_cents(1099), Some(2198));
//! ```

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

// =============================================================================
// Quantity Type
// =============================================================================

/// An exact, signed stock quantity.
///
/// Balances and document lines are never negative; deltas and correction
/// differences are. Equality and hashing are by value, so `2.50 == 2.5`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Quantity(value)
    }

    #[inline]
    pub fn value(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_negative(&self) -> bool {
        !self.0.is_zero() && self.0.is_sign_negative()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        !self.0.is_zero() && self.0.is_sign_positive()
    }

    /// Digits after the decimal point, ignoring trailing zeros.
    pub fn scale(&self) -> u32 {
        self.0.normalize().scale()
    }

    /// `None` when the sum is outside `Decimal`'s range.
    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Quantity)
    }

    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_sub(other.0).map(Quantity)
    }

    /// Price of this many units, in whole cents.
    ///
    /// Half a cent rounds away from zero. `None` if the total does not fit
    /// in an `i64`.
    ///
    /// ## Example
    /// ```rust
    /// use tally_core::Quantity;
    ///
    /// let half_kg: Quantity = "0.5".parse().unwrap();
    /// assert_eq!(half_kg.line_total_cents(199), Some(100)); // 99.5 rounds up
    /// ```
    pub fn line_total_cents(&self, unit_price_cents: i64) -> Option<i64> {
        Decimal::from(unit_price_cents)
            .checked_mul(self.0)?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
    }
}

impl fmt::Display for Quantity {
    /// Canonical form: no trailing zeros, no negative zero.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_zero() {
            return f.write_str("0");
        }
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Quantity {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Quantity)
    }
}

impl From<i64> for Quantity {
    fn from(units: i64) -> Self {
        Quantity(Decimal::from(units))
    }
}

impl From<Decimal> for Quantity {
    fn from(value: Decimal) -> Self {
        Quantity(value)
    }
}

// =============================================================================
// Arithmetic
// =============================================================================
// Operators panic on `Decimal` overflow like the integer operators do.
// Paths that can see untrusted magnitudes use checked_add / checked_sub.

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 - rhs.0)
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Quantity {
        Quantity(-self.0)
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Quantity) {
        self.0 -= rhs.0;
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Quantity {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

// =============================================================================
// SQLite Mapping
// =============================================================================
// SQLite has no decimal type. Quantities go in as canonical TEXT and come
// back through the decimal parser; numeric cells are read the same way.

#[cfg(feature = "sqlx")]
mod sqlite {
    use super::Quantity;
    use rust_decimal::Decimal;
    use sqlx::encode::IsNull;
    use sqlx::error::BoxDynError;
    use sqlx::sqlite::{SqliteTypeInfo, SqliteValueRef};
    use sqlx::{Decode, Encode, Sqlite, Type};
    use std::str::FromStr;

    impl Type<Sqlite> for Quantity {
        fn type_info() -> SqliteTypeInfo {
            <String as Type<Sqlite>>::type_info()
        }

        fn compatible(ty: &SqliteTypeInfo) -> bool {
            <String as Type<Sqlite>>::compatible(ty)
                || <i64 as Type<Sqlite>>::compatible(ty)
                || <f64 as Type<Sqlite>>::compatible(ty)
        }
    }

    impl<'q> Encode<'q, Sqlite> for Quantity {
        fn encode_by_ref(
            &self,
            buf: &mut <Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
        ) -> Result<IsNull, BoxDynError> {
            <String as Encode<'q, Sqlite>>::encode(self.to_string(), buf)
        }
    }

    impl<'r> Decode<'r, Sqlite> for Quantity {
        fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
            let text = <&str as Decode<'r, Sqlite>>::decode(value)?;
            Ok(Quantity(Decimal::from_str(text.trim())?))
        }
    }
}
