//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` so callers see only the handful of operations
//! targets and digests need: byte conversions in both orders, division, and
//! ordering.

use ruint::aliases::U256 as Ruint256;
use std::fmt;
use std::ops::{Div, Shl};

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(Ruint256);

impl U256 {
    pub const ZERO: Self = Self(Ruint256::ZERO);
    pub const MAX: Self = Self(Ruint256::MAX);

    /// Create from little-endian bytes (Bitcoin's internal hash order).
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Convert to u64, saturating at u64::MAX.
    pub fn saturating_to_u64(self) -> u64 {
        self.0.saturating_to()
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Ruint256::from(value))
    }
}

impl From<u128> for U256 {
    fn from(value: u128) -> Self {
        Self(Ruint256::from_limbs([value as u64, (value >> 64) as u64, 0, 0]))
    }
}

/// Bits shifted past the top are lost.
impl Shl<usize> for U256 {
    type Output = Self;

    fn shl(self, rhs: usize) -> Self::Output {
        Self(self.0 << rhs)
    }
}

impl Div for U256 {
    type Output = Self;

    fn div(self, rhs: Self) -> Self::Output {
        Self(self.0 / rhs.0)
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Self(self.0 / Ruint256::from(rhs))
    }
}

/// Zero-padded 64-digit hex, most significant digit first.
impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_be_bytes()))
    }
}
