//! Fixed-point amounts.
//!
//! Amounts are stored in the database as raw integers at the precision of
//! their commodity; a [`Decimal`] pairs that integer with its number of
//! decimal places.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use tally_core::{Error, OverflowErrorKind, Result};

/// A fixed-point number: `intval / 10^places`.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    intval: i64,
    places: u8,
}

impl Decimal {
    /// Most decimal places a value may carry.
    pub const MAX_PLACES: u8 = 18;

    /// # Panics
    ///
    /// Panics if `places` exceeds [`MAX_PLACES`](Self::MAX_PLACES). Use
    /// [`try_new`](Self::try_new) for values read from outside the program.
    pub const fn new(intval: i64, places: u8) -> Self {
        assert!(places <= Self::MAX_PLACES, "too many decimal places");
        Self { intval, places }
    }

    /// Fallible form of [`new`](Self::new).
    pub fn try_new(intval: i64, places: u8) -> Result<Self> {
        if places > Self::MAX_PLACES {
            return Err(unsafe_arithmetic("too many decimal places"));
        }
        Ok(Self { intval, places })
    }

    pub const fn zero(places: u8) -> Self {
        Self::new(0, places)
    }

    pub const fn intval(self) -> i64 {
        self.intval
    }

    pub const fn places(self) -> u8 {
        self.places
    }

    pub const fn is_zero(self) -> bool {
        self.intval == 0
    }

    /// The same value expressed with `places` decimal places.
    ///
    /// Reducing places rounds half away from zero. Fails if the result does
    /// not fit.
    pub fn rescale(self, places: u8) -> Result<Self> {
        if places > Self::MAX_PLACES {
            return Err(unsafe_arithmetic("too many decimal places"));
        }
        match places.cmp(&self.places) {
            Ordering::Equal => Ok(self),
            Ordering::Greater => {
                let factor = pow10(places - self.places);
                self.intval
                    .checked_mul(factor)
                    .map(|intval| Self::new(intval, places))
                    .ok_or_else(|| unsafe_arithmetic("rescaling would overflow"))
            }
            Ordering::Less => {
                let factor = pow10(self.places - places);
                let quotient = self.intval / factor;
                let remainder = self.intval % factor;
                let rounded = if remainder.unsigned_abs() * 2 >= factor.unsigned_abs() {
                    quotient + self.intval.signum()
                } else {
                    quotient
                };
                Ok(Self::new(rounded, places))
            }
        }
    }

    /// Sum of two values at the larger of their precisions.
    pub fn checked_add(self, other: Self) -> Result<Self> {
        let places = self.places.max(other.places);
        let a = self.rescale(places)?;
        let b = other.rescale(places)?;
        a.intval
            .checked_add(b.intval)
            .map(|intval| Self::new(intval, places))
            .ok_or_else(|| unsafe_arithmetic("addition would overflow"))
    }

    pub fn checked_neg(self) -> Result<Self> {
        self.intval
            .checked_neg()
            .map(|intval| Self::new(intval, self.places))
            .ok_or_else(|| unsafe_arithmetic("negation would overflow"))
    }

    fn widened(self, places: u8) -> i128 {
        i128::from(self.intval) * i128::from(pow10(places - self.places))
    }
}

fn pow10(exp: u8) -> i64 {
    10_i64.pow(u32::from(exp))
}

fn unsafe_arithmetic(message: &str) -> Error {
    Error::overflow(OverflowErrorKind::Arithmetic, message)
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let places = self.places.max(other.places);
        self.widened(places).cmp(&other.widened(places))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.intval < 0 { "-" } else { "" };
        let magnitude = self.intval.unsigned_abs();
        if self.places == 0 {
            return write!(f, "{}{}", sign, magnitude);
        }
        let factor = 10_u64.pow(u32::from(self.places));
        write!(
            f,
            "{}{}.{:0width$}",
            sign,
            magnitude / factor,
            magnitude % factor,
            width = usize::from(self.places)
        )
    }
}

fn decimal_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^([+-])?(\d*)(?:\.(\d*))?$").ok())
        .as_ref()
}

impl FromStr for Decimal {
    type Err = Error;

    /// Parses `[+-]digits[.digits]`, keeping as many places as are written.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Serde(format!("invalid decimal: {:?}", s));
        let trimmed = s.trim();
        let caps = decimal_pattern()
            .and_then(|re| re.captures(trimmed))
            .ok_or_else(invalid)?;
        let whole = caps.get(2).map_or("", |m| m.as_str());
        let fraction = caps.get(3).map_or("", |m| m.as_str());
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let places = u8::try_from(fraction.len())
            .ok()
            .filter(|p| *p <= Self::MAX_PLACES)
            .ok_or_else(|| unsafe_arithmetic("too many decimal places"))?;

        let digits = format!("{}{}", whole, fraction);
        let magnitude: i64 = if digits.is_empty() {
            0
        } else {
            digits
                .parse()
                .map_err(|_| unsafe_arithmetic("decimal does not fit in 64 bits"))?
        };
        let intval = if caps.get(1).is_some_and(|m| m.as_str() == "-") {
            -magnitude
        } else {
            magnitude
        };
        Ok(Self::new(intval, places))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let d: Decimal = "150.25".parse().unwrap();
        assert_eq!(d.intval(), 15025);
        assert_eq!(d.places(), 2);
        assert_eq!(d.to_string(), "150.25");

        assert_eq!("-0.5".parse::<Decimal>().unwrap().to_string(), "-0.5");
        assert_eq!("7".parse::<Decimal>().unwrap().to_string(), "7");
        assert_eq!(".75".parse::<Decimal>().unwrap().intval(), 75);
        assert_eq!(Decimal::new(-3, 2).to_string(), "-0.03");
        assert!("1.2.3".parse::<Decimal>().is_err());
        assert!("".parse::<Decimal>().is_err());
        assert!("abc".parse::<Decimal>().is_err());
    }

    #[test]
    fn equality_is_numeric() {
        assert_eq!(Decimal::new(150, 0), Decimal::new(15000, 2));
        assert!(Decimal::new(1, 2) < Decimal::new(1, 1));
        assert_eq!(Decimal::new(5, 1).checked_neg().unwrap(), Decimal::new(-50, 2));
    }

    #[test]
    fn negating_the_minimum_overflows() {
        let err = Decimal::new(i64::MIN, 2).checked_neg().unwrap_err();
        assert_eq!(err.overflow_kind(), Some(OverflowErrorKind::Arithmetic));
        assert_eq!(Decimal::new(i64::MAX, 2).checked_neg().unwrap().intval(), -i64::MAX);
    }

    #[test]
    fn places_are_bounded() {
        let err = Decimal::try_new(1, Decimal::MAX_PLACES + 1).unwrap_err();
        assert_eq!(err.overflow_kind(), Some(OverflowErrorKind::Arithmetic));

        let widest = Decimal::try_new(1, Decimal::MAX_PLACES).unwrap();
        assert!(widest < Decimal::new(1, 0));
        assert_eq!(widest.to_string(), "0.000000000000000001");
    }

    #[test]
    #[should_panic(expected = "too many decimal places")]
    fn new_rejects_too_many_places() {
        let _ = Decimal::new(1, 19);
    }

    #[test]
    fn rescale_rounds_half_away_from_zero() {
        assert_eq!(Decimal::new(125, 2).rescale(1).unwrap().intval(), 13);
        assert_eq!(Decimal::new(-125, 2).rescale(1).unwrap().intval(), -13);
        assert_eq!(Decimal::new(124, 2).rescale(1).unwrap().intval(), 12);
        assert_eq!(Decimal::new(12, 1).rescale(3).unwrap().intval(), 1200);
    }

    #[test]
    fn overflow_is_reported() {
        let big = Decimal::new(i64::MAX, 0);
        let err = big.checked_add(Decimal::new(1, 0)).unwrap_err();
        assert_eq!(err.overflow_kind(), Some(OverflowErrorKind::Arithmetic));
        assert!(big.rescale(2).is_err());
    }
}
