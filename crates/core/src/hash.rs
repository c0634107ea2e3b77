//! Hashing primitives shared by the archive, flyweight, and builder layers.
//!
//! All hashes are unsigned 32-bit:
//! - byte strings hash with FNV-1 (multiply, then xor; not FNV-1a)
//! - `u32` values pass through unchanged
//! - `u64` values xor-fold their high and low halves
//!
//! The empty-string hash equals the FNV-1 offset basis. The flyweight
//! factory reserves it to mark free placeholders, so it is exported as a
//! named constant rather than recomputed at each site.

/// FNV-1 32-bit offset basis.
pub const FNV1_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1 32-bit prime.
pub const FNV1_PRIME: u32 = 0x0100_0193;

/// Hash of the empty byte string (`fnv1_32(b"")`).
pub const EMPTY_HASH: u32 = FNV1_OFFSET_BASIS;

/// FNV-1 over a byte string.
#[inline]
pub fn fnv1_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV1_OFFSET_BASIS;
    for &byte in bytes {
        hash = hash.wrapping_mul(FNV1_PRIME) ^ u32::from(byte);
    }
    hash
}

/// Fold a 64-bit value into a 32-bit hash by xor-ing its halves.
#[inline]
pub fn fold_u64(value: u64) -> u32 {
    (value as u32) ^ ((value >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hash_is_offset_basis() {
        assert_eq!(fnv1_32(b""), EMPTY_HASH);
    }

    #[test]
    fn test_fnv1_known_vectors() {
        // FNV-1 (not FNV-1a) reference values.
        assert_eq!(fnv1_32(b"a"), 0x050c5d7e);
        assert_eq!(fnv1_32(b"foobar"), 0x31f0b262);
    }

    #[test]
    fn test_fnv1_differs_per_input() {
        assert_ne!(fnv1_32(b"hello"), fnv1_32(b"world"));
        assert_ne!(fnv1_32(b"hello"), fnv1_32(b"hello "));
    }

    #[test]
    fn test_fold_u64() {
        assert_eq!(fold_u64(0), 0);
        assert_eq!(fold_u64(0xffff_ffff), 0xffff_ffff);
        assert_eq!(fold_u64(0x1_0000_0000), 1);
        assert_eq!(fold_u64(0xdead_beef_dead_beef), 0);
    }
}
