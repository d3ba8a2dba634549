//! Pool difficulty type.

use crate::u256::U256;
use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::pow::Target;
use std::fmt;

/// Fractional bits kept for pool difficulties below one or between integers.
const FRACTION_BITS: u32 = 32;

/// Pool difficulty, as a fixed-point number with 32 fractional bits.
///
/// Difficulty and target are inversely related:
/// ```text
/// target = floor(BASE_TARGET / difficulty)
/// ```
/// where `BASE_TARGET` is `00000000ffff0000...0000`, the difficulty-1 target
/// (`Target::MAX`). A hash is a valid share when it is strictly below the
/// target. Difficulties below one give targets above `BASE_TARGET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Difficulty(u128);

impl Difficulty {
    pub const ONE: Self = Self::new(1);

    pub const fn new(value: u64) -> Self {
        Self((value as u128) << FRACTION_BITS)
    }

    /// Interpret a difficulty as pools send it: a JSON number that may be
    /// fractional.
    ///
    /// Scaling by a power of two is exact, so any value with no bits below
    /// 2^-32 is kept as sent. Returns `None` for values that are not
    /// positive and finite, or that fall outside that range.
    pub fn from_pool_value(value: f64) -> Option<Self> {
        if !value.is_finite() || value <= 0.0 || value >= u64::MAX as f64 {
            return None;
        }
        let scaled = (value * (1u64 << FRACTION_BITS) as f64) as u128;
        (scaled > 0).then_some(Self(scaled))
    }

    /// Difficulty a block hash would satisfy, for logging found shares.
    pub fn from_hash(hash: &BlockHash) -> Self {
        let hash_u256 = U256::from_le_bytes(*hash.as_byte_array());
        if hash_u256 == U256::ZERO {
            return Self::new(u64::MAX);
        }

        let difficulty = U256::from(Target::MAX) / hash_u256;
        Self::new(difficulty.saturating_to_u64())
    }

    /// Share target for this difficulty, using exact 256-bit division.
    ///
    /// Difficulty 0 is treated as 1.
    pub fn to_target(self) -> Target {
        if self.0 == 0 {
            return Target::MAX;
        }

        let base = U256::from(Target::MAX) << FRACTION_BITS as usize;
        Target::from(base / U256::from(self.0))
    }

    fn as_f64(self) -> f64 {
        self.0 as f64 / (1u64 << FRACTION_BITS) as f64
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.as_f64();

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::target_hex;
    use test_case::test_case;

    const DIFF1_TARGET: &str = "00000000ffff0000000000000000000000000000000000000000000000000000";

    #[test]
    fn test_difficulty_one_is_base_target() {
        assert_eq!(target_hex(Difficulty::ONE.to_target()), DIFF1_TARGET);
        assert_eq!(Difficulty::new(0).to_target(), Target::MAX);
    }

    #[test]
    fn test_difficulty_two_halves_target() {
        let one = U256::from(Difficulty::ONE.to_target());
        let two = U256::from(Difficulty::new(2).to_target());
        assert_eq!(two, one / 2u64);
        assert_eq!(
            target_hex(Difficulty::new(2).to_target()),
            "000000007fff8000000000000000000000000000000000000000000000000000"
        );
    }

    #[test_case(7, "0000000024922492492492492492492492492492492492492492492492492492"; "floors")]
    #[test_case(8192, "000000000007fff8000000000000000000000000000000000000000000000000"; "pool_8192")]
    fn test_target_hex(difficulty: u64, expected: &str) {
        assert_eq!(target_hex(Difficulty::new(difficulty).to_target()), expected);
    }

    #[test]
    fn test_difficulty_from_hash() {
        let hash = BlockHash::from_byte_array(Target::MAX.to_le_bytes());
        assert_eq!(Difficulty::from_hash(&hash), Difficulty::ONE);

        let hash = BlockHash::from_byte_array([0u8; 32]);
        assert_eq!(Difficulty::from_hash(&hash), Difficulty::new(u64::MAX));
    }

    #[test_case(512.0 => Some(Difficulty::new(512)); "integral")]
    #[test_case(0.0 => None; "zero")]
    #[test_case(1e-12 => None; "below_resolution")]
    #[test_case(-8.0 => None; "negative")]
    #[test_case(f64::NAN => None; "nan")]
    fn test_from_pool_value(value: f64) -> Option<Difficulty> {
        Difficulty::from_pool_value(value)
    }

    #[test_case(1.5, "00000000aaaa0000000000000000000000000000000000000000000000000000"; "one_and_a_half")]
    #[test_case(0.5, "00000001fffe0000000000000000000000000000000000000000000000000000"; "half")]
    #[test_case(0.25, "00000003fffc0000000000000000000000000000000000000000000000000000"; "quarter")]
    #[test_case(1024.25, "00000000003ffbc043fbc043fbc043fbc043fbc043fbc043fbc043fbc043fbc0"; "above_integer")]
    fn test_fractional_target(value: f64, expected: &str) {
        let difficulty = Difficulty::from_pool_value(value).unwrap();
        assert_eq!(target_hex(difficulty.to_target()), expected);
    }

    #[test]
    fn test_fraction_sits_between_integers() {
        let one = Difficulty::ONE;
        let half_more = Difficulty::from_pool_value(1.5).unwrap();
        let two = Difficulty::new(2);
        assert!(one < half_more && half_more < two);
        assert!(U256::from(half_more.to_target()) > U256::from(two.to_target()));
        assert!(U256::from(half_more.to_target()) < U256::from(one.to_target()));
    }

    #[test]
    fn test_difficulty_display() {
        assert_eq!(Difficulty::from_pool_value(1.5).unwrap().to_string(), "1.50");
        assert_eq!(Difficulty::new(1_500_000).to_string(), "1.50M");
        assert_eq!(Difficulty::new(8192).to_string(), "8.19K");
        assert_eq!(Difficulty::new(500).to_string(), "500");
    }
}
