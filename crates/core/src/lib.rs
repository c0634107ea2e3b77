//! tarn core: foundation types for the tarn runtime toolkit.
//!
//! Key design principles:
//! - Records live in plain `Vec`s sorted by an embedded key; lookups are
//!   binary searches, not hash maps (`keyed`)
//! - Values are small tagged sums decoded from packed bits (`value`)
//! - Cross-thread coordination uses atomics and short spin sections, never
//!   long-held mutexes (`count`, `spin`)

pub mod count;
pub mod hash;
pub mod keyed;
pub mod spin;
pub mod token;
pub mod value;

// Re-export the types nearly every consumer touches.
pub use count::RefCount;
pub use hash::{fnv1_32, fold_u64, EMPTY_HASH};
pub use keyed::Keyed;
pub use spin::{SpinGuard, SpinLock};
pub use token::TypeToken;
pub use value::{
    variety_bits, variety_kind, StateKind, StateValue, Variety, BLOCK_BITS, FLOAT_BITS,
};
