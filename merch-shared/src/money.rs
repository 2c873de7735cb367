use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

const BASIS_POINTS: i128 = 10_000;

/// An amount in integer minor units (cents) of the settlement currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor_units: i64) -> Self {
        Self(minor_units)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Unit price times quantity.
    pub fn times(self, quantity: u32) -> Money {
        Money(self.0 * i64::from(quantity))
    }

    /// Split `self` across `weights` proportionally with the largest-remainder
    /// method. The parts always sum to `self` exactly.
    ///
    /// Ties on the remainder go to the earlier weight. A zero total weight puts
    /// the whole amount on the first part.
    pub fn apportion(self, weights: &[Money]) -> Vec<Money> {
        if weights.is_empty() {
            return Vec::new();
        }

        let total_weight: i128 = weights.iter().map(|w| i128::from(w.0)).sum();
        if total_weight == 0 {
            let mut parts = vec![Money::ZERO; weights.len()];
            parts[0] = self;
            return parts;
        }

        let amount = i128::from(self.0);
        let mut parts = Vec::with_capacity(weights.len());
        let mut remainders = Vec::with_capacity(weights.len());
        for (index, weight) in weights.iter().enumerate() {
            let numerator = amount * i128::from(weight.0);
            parts.push(numerator.div_euclid(total_weight));
            remainders.push((numerator.rem_euclid(total_weight), index));
        }

        let mut leftover = amount - parts.iter().sum::<i128>();
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, index) in remainders {
            if leftover == 0 {
                break;
            }
            parts[index] += 1;
            leftover -= 1;
        }

        parts.into_iter().map(|p| Money(p as i64)).collect()
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RateError {
    #[error("Rate out of range: {0}")]
    OutOfRange(f64),
}

/// A proportional rate in basis points (1/100 of a percent).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(u32);

impl Rate {
    pub const fn from_basis_points(bps: u32) -> Self {
        Self(bps)
    }

    pub const fn basis_points(self) -> u32 {
        self.0
    }

    /// `0.23` for 23%.
    pub fn from_fraction(fraction: f64) -> Result<Self, RateError> {
        if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
            return Err(RateError::OutOfRange(fraction));
        }
        Ok(Self((fraction * BASIS_POINTS as f64).round() as u32))
    }

    /// `15.0` for 15%.
    pub fn from_percent(percent: f64) -> Result<Self, RateError> {
        Self::from_fraction(percent / 100.0).map_err(|_| RateError::OutOfRange(percent))
    }

    /// `amount × rate`, rounded half away from zero to the nearest minor unit.
    pub fn apply(self, amount: Money) -> Money {
        let product = i128::from(amount.0) * i128::from(self.0);
        let quotient = product / BASIS_POINTS;
        let remainder = product % BASIS_POINTS;
        let rounded = if remainder.abs() * 2 >= BASIS_POINTS {
            quotient + product.signum()
        } else {
            quotient
        };
        Money(rounded as i64)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}
