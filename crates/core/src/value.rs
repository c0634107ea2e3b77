//! Typed state values and their packed format codes.
//!
//! A [`StateValue`] is what the reservoir hands out and accepts: a small
//! tagged sum over bool, unsigned, signed, and float. The reservoir itself
//! never stores a `StateValue`; it stores raw bits plus a [`Variety`] code
//! describing how to decode them.
//!
//! ## Variety encoding
//!
//! `Variety` is a signed byte:
//!
//! ```text
//!  0        empty (no such state)
//!  1        bool, 1 bit
//! -1        float, FLOAT_BITS bits
//!  N >=  2  unsigned integer of N bits
//!  N <= -2  signed integer of |N| bits
//! ```
//!
//! `|variety|` never exceeds [`BLOCK_BITS`].

use std::cmp::Ordering;

/// Bits per storage block in the reservoir.
pub const BLOCK_BITS: u8 = 64;

/// Bits used to store a float state. Floats are stored as `f64` patterns.
pub const FLOAT_BITS: u8 = 64;

/// Signed format code for a state value. See the module docs.
pub type Variety = i8;

/// `Variety` code for an absent state.
pub const VARIETY_EMPTY: Variety = 0;
/// `Variety` code for a bool state.
pub const VARIETY_BOOL: Variety = 1;
/// `Variety` code for a float state.
pub const VARIETY_FLOAT: Variety = -1;

/// Kind of a state value, independent of bit width.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Signed = -2,
    Float = -1,
    Empty = 0,
    Bool = 1,
    Unsigned = 2,
}

/// Bit width implied by a variety code. Empty reports zero.
#[inline]
pub fn variety_bits(variety: Variety) -> u8 {
    match variety {
        VARIETY_EMPTY => 0,
        VARIETY_BOOL => 1,
        VARIETY_FLOAT => FLOAT_BITS,
        v if v < 0 => -(v as i16) as u8,
        v => v as u8,
    }
}

/// Kind implied by a variety code.
#[inline]
pub fn variety_kind(variety: Variety) -> StateKind {
    match variety {
        VARIETY_EMPTY => StateKind::Empty,
        VARIETY_BOOL => StateKind::Bool,
        VARIETY_FLOAT => StateKind::Float,
        v if v < 0 => StateKind::Signed,
        _ => StateKind::Unsigned,
    }
}

/// A typed state value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateValue {
    Empty,
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl StateValue {
    /// Kind discriminant of this value.
    pub fn kind(&self) -> StateKind {
        match self {
            StateValue::Empty => StateKind::Empty,
            StateValue::Bool(_) => StateKind::Bool,
            StateValue::Unsigned(_) => StateKind::Unsigned,
            StateValue::Signed(_) => StateKind::Signed,
            StateValue::Float(_) => StateKind::Float,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, StateValue::Empty)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            StateValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<i64> {
        match self {
            StateValue::Signed(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            StateValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Compare two state values across kinds.
    ///
    /// Bools only compare with bools. Integers compare with each other with
    /// sign awareness (a negative signed value orders below any unsigned).
    /// A float compares with an integer only when the integer survives a
    /// round trip through `f64`; otherwise the comparison fails.
    ///
    /// Returns `None` when the two values cannot be meaningfully ordered
    /// (an empty operand, a bool against a number, a lossy float cast, or
    /// a NaN operand).
    pub fn compare(&self, right: &StateValue) -> Option<Ordering> {
        match *self {
            StateValue::Bool(left) => match *right {
                StateValue::Bool(r) => Some(left.cmp(&r)),
                _ => None,
            },
            StateValue::Unsigned(left) => Self::compare_unsigned(left, right),
            StateValue::Signed(left) => Self::compare_signed(left, right),
            StateValue::Float(left) => Self::compare_float(left, right),
            StateValue::Empty => None,
        }
    }

    fn compare_unsigned(left: u64, right: &StateValue) -> Option<Ordering> {
        match *right {
            StateValue::Unsigned(r) => Some(left.cmp(&r)),
            StateValue::Signed(r) => {
                if r < 0 {
                    Some(Ordering::Greater)
                } else {
                    Some(left.cmp(&(r as u64)))
                }
            }
            StateValue::Float(r) => u64_to_f64_exact(left)?.partial_cmp(&r),
            _ => None,
        }
    }

    fn compare_signed(left: i64, right: &StateValue) -> Option<Ordering> {
        match *right {
            StateValue::Unsigned(r) => {
                if left < 0 {
                    Some(Ordering::Less)
                } else {
                    Some((left as u64).cmp(&r))
                }
            }
            StateValue::Signed(r) => Some(left.cmp(&r)),
            StateValue::Float(r) => i64_to_f64_exact(left)?.partial_cmp(&r),
            _ => None,
        }
    }

    fn compare_float(left: f64, right: &StateValue) -> Option<Ordering> {
        match *right {
            StateValue::Unsigned(r) => {
                if left < 0.0 {
                    Some(Ordering::Less)
                } else {
                    left.partial_cmp(&u64_to_f64_exact(r)?)
                }
            }
            StateValue::Signed(r) => left.partial_cmp(&i64_to_f64_exact(r)?),
            StateValue::Float(r) => left.partial_cmp(&r),
            _ => None,
        }
    }
}

/// `2^64` and `2^63`, both exactly representable in `f64`.
const U64_BOUND: f64 = 18446744073709551616.0;
const I64_BOUND: f64 = 9223372036854775808.0;

/// The value as `f64`, only when the cast is lossless. The upper-bound
/// guard matters: `u64::MAX as f64` rounds up to `2^64`, and the
/// saturating cast back would spuriously "round-trip".
fn u64_to_f64_exact(value: u64) -> Option<f64> {
    let cast = value as f64;
    (cast < U64_BOUND && cast as u64 == value).then_some(cast)
}

fn i64_to_f64_exact(value: i64) -> Option<f64> {
    let cast = value as f64;
    (cast < I64_BOUND && cast as i64 == value).then_some(cast)
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<u64> for StateValue {
    fn from(value: u64) -> Self {
        StateValue::Unsigned(value)
    }
}

impl From<u32> for StateValue {
    fn from(value: u32) -> Self {
        StateValue::Unsigned(u64::from(value))
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Signed(value)
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        StateValue::Signed(i64::from(value))
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variety_bits() {
        assert_eq!(variety_bits(VARIETY_EMPTY), 0);
        assert_eq!(variety_bits(VARIETY_BOOL), 1);
        assert_eq!(variety_bits(VARIETY_FLOAT), FLOAT_BITS);
        assert_eq!(variety_bits(8), 8);
        assert_eq!(variety_bits(-8), 8);
        assert_eq!(variety_bits(64), 64);
        assert_eq!(variety_bits(-64), 64);
    }

    #[test]
    fn test_variety_kind() {
        assert_eq!(variety_kind(0), StateKind::Empty);
        assert_eq!(variety_kind(1), StateKind::Bool);
        assert_eq!(variety_kind(-1), StateKind::Float);
        assert_eq!(variety_kind(2), StateKind::Unsigned);
        assert_eq!(variety_kind(-2), StateKind::Signed);
    }

    #[test]
    fn test_compare_same_kind() {
        assert_eq!(
            StateValue::Unsigned(1).compare(&StateValue::Unsigned(2)),
            Some(Ordering::Less)
        );
        assert_eq!(
            StateValue::Signed(-3).compare(&StateValue::Signed(-3)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            StateValue::Float(2.5).compare(&StateValue::Float(1.0)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            StateValue::Bool(true).compare(&StateValue::Bool(false)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_compare_cross_sign() {
        assert_eq!(
            StateValue::Unsigned(0).compare(&StateValue::Signed(-1)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            StateValue::Signed(-1).compare(&StateValue::Unsigned(0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            StateValue::Signed(7).compare(&StateValue::Unsigned(7)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_compare_int_float() {
        assert_eq!(
            StateValue::Unsigned(2).compare(&StateValue::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            StateValue::Float(2.0).compare(&StateValue::Signed(2)),
            Some(Ordering::Equal)
        );
        // An integer that f64 cannot represent exactly fails the comparison.
        assert_eq!(
            StateValue::Unsigned(u64::MAX).compare(&StateValue::Float(1.0)),
            None
        );
    }

    #[test]
    fn test_compare_failures() {
        assert_eq!(StateValue::Bool(true).compare(&StateValue::Unsigned(1)), None);
        assert_eq!(StateValue::Empty.compare(&StateValue::Empty), None);
        assert_eq!(
            StateValue::Float(f64::NAN).compare(&StateValue::Float(1.0)),
            None
        );
    }
}
