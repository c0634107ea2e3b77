//! State reservoir: a bit-packed store of typed state values.
//!
//! Game state is thousands of tiny values: flags, counters, a few floats.
//! The reservoir packs them into 64-bit blocks addressed by stable keys so
//! that a whole scenario's state fits in a few cache lines and can be
//! snapshotted by copying raw blocks.
//!
//! ## Layout
//!
//! ```text
//! Reservoir
//! ├── registries: Vec<Registry>   sorted by status key
//! │     field: u32 = [variety:8 | position:24], transition flag beside it
//! └── chunks: Vec<Chunk>          sorted by chunk key
//!       blocks:       Vec<u64>    the packed bits
//!       empty_fields: Vec<u32>    free ranges, sorted by (size, position)
//! ```
//!
//! The variety subfield is a full signed byte: `+64` (a 64-bit unsigned
//! state) and `-64` (a 64-bit signed one) are distinct codes, so the
//! transition flag lives outside the packed word rather than squeezing
//! variety down to seven bits.
//!
//! A registry's `position` addresses a bit range inside its chunk's block
//! run. Ranges never straddle a block boundary: allocation only ever carves
//! fields out of a single block, and `|variety|` is capped at
//! [`BLOCK_BITS`].
//!
//! ## Transition bits
//!
//! Every registry carries one transition bit, set whenever a write changes
//! the stored bits (registration counts as a change). Rule evaluation reads
//! the bits, then the host clears them all at the end of a frame with
//! [`Reservoir::reset_transitions`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tarn_core::keyed::{self, Keyed};
use tarn_core::value::{
    variety_bits, variety_kind, StateKind, StateValue, Variety, BLOCK_BITS, FLOAT_BITS,
    VARIETY_BOOL, VARIETY_EMPTY, VARIETY_FLOAT,
};

/// Identifier usable as a status or chunk key.
pub trait Key: Copy + Ord + fmt::Debug {}

impl<T: Copy + Ord + fmt::Debug> Key for T {}

// Packed `field` layout shared by registries and empty-field records.
const POSITION_BITS: u32 = 24;
/// Largest representable bit position inside a chunk.
pub const POSITION_MASK: u32 = (1 << POSITION_BITS) - 1;
const VARIETY_SHIFT: u32 = POSITION_BITS;
const VARIETY_MASK: u32 = 0xff;

/// Metadata record for one registered state value.
#[derive(Debug, Clone)]
struct Registry<S, C> {
    status_key: S,
    chunk_key: C,
    /// `[variety:8 | position:24]`.
    field: u32,
    transition: bool,
}

impl<S: Key, C: Key> Registry<S, C> {
    fn new(status_key: S, chunk_key: C, variety: Variety, position: u32) -> Self {
        debug_assert!(position <= POSITION_MASK);
        Self {
            status_key,
            chunk_key,
            field: (u32::from(variety as u8) << VARIETY_SHIFT) | position,
            // Fresh registrations start with the transition flag set.
            transition: true,
        }
    }

    fn variety(&self) -> Variety {
        ((self.field >> VARIETY_SHIFT) & VARIETY_MASK) as u8 as i8
    }

    fn position(&self) -> u32 {
        self.field & POSITION_MASK
    }

    fn transition(&self) -> bool {
        self.transition
    }

    fn mark_transition(&mut self) {
        self.transition = true;
    }

    fn clear_transition(&mut self) {
        self.transition = false;
    }
}

impl<S: Key, C: Key> Keyed for Registry<S, C> {
    type Key = S;

    fn key(&self) -> S {
        self.status_key
    }
}

/// A run of 64-bit blocks plus its free ranges.
#[derive(Debug, Clone)]
struct Chunk<C> {
    key: C,
    blocks: Vec<u64>,
    empty_fields: Vec<u32>,
}

impl<C: Key> Chunk<C> {
    fn new(key: C) -> Self {
        Self {
            key,
            blocks: Vec::new(),
            empty_fields: Vec::new(),
        }
    }
}

impl<C: Key> Keyed for Chunk<C> {
    type Key = C;

    fn key(&self) -> C {
        self.key
    }
}

// ---------------------------------------------------------------------------
// Empty-field records: position in the low 24 bits, size in the high
// byte. Sorted by (size, position) so the packer's first-fit search is a
// lower bound on size.

fn empty_field_position(field: u32) -> u32 {
    field & POSITION_MASK
}

fn empty_field_size(field: u32) -> u8 {
    ((field >> VARIETY_SHIFT) & VARIETY_MASK) as u8
}

fn push_empty_field(empty_fields: &mut Vec<u32>, position: u32, size: u32) {
    if position > POSITION_MASK || size > VARIETY_MASK {
        debug_assert!(false, "empty field out of range: +{position} x{size}");
        return;
    }
    let field = (size << VARIETY_SHIFT) | position;
    let at = empty_fields.partition_point(|&other| {
        (empty_field_size(other), empty_field_position(other)) < (size as u8, position)
    });
    empty_fields.insert(at, field);
}

// ---------------------------------------------------------------------------
// Raw block access. A field always lies inside a single block.

fn block_mask(size: u8) -> u64 {
    if size < BLOCK_BITS {
        (1u64 << size) - 1
    } else {
        u64::MAX
    }
}

fn get_bits(blocks: &[u64], position: u32, size: u8) -> u64 {
    if size > BLOCK_BITS {
        debug_assert!(false, "field size {size} exceeds a block");
        return 0;
    }
    let block_index = (position / u32::from(BLOCK_BITS)) as usize;
    let Some(&block) = blocks.get(block_index) else {
        debug_assert!(false, "registry points outside its chunk");
        return 0;
    };
    let offset = position % u32::from(BLOCK_BITS);
    debug_assert!(offset + u32::from(size) <= u32::from(BLOCK_BITS));
    (block >> offset) & block_mask(size)
}

/// Writes `value` into the field. `Some(true)` if the bits changed,
/// `Some(false)` if they were already equal, `None` on failure.
fn set_bits(blocks: &mut [u64], position: u32, size: u8, value: u64) -> Option<bool> {
    debug_assert!(size == BLOCK_BITS || value >> size == 0, "value overflows field");
    if size > BLOCK_BITS {
        debug_assert!(false, "field size {size} exceeds a block");
        return None;
    }
    let block_index = (position / u32::from(BLOCK_BITS)) as usize;
    let Some(block) = blocks.get_mut(block_index) else {
        debug_assert!(false, "registry points outside its chunk");
        return None;
    };
    let offset = position % u32::from(BLOCK_BITS);
    debug_assert!(offset + u32::from(size) <= u32::from(BLOCK_BITS));
    let mask = block_mask(size);
    let previous = *block;
    *block = (previous & !(mask << offset)) | ((value & mask) << offset);
    Some(previous != *block)
}

// ---------------------------------------------------------------------------

/// Why a serialized chunk image was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ChunkCodecError {
    #[error("chunk image failed to encode: {0}")]
    Encode(#[source] bincode::Error),
    #[error("chunk image failed to decode: {0}")]
    Decode(#[source] bincode::Error),
    #[error("chunk key already present in the reservoir")]
    ChunkExists,
    #[error("status key in the image is already registered")]
    DuplicateStatus,
    #[error("image registry points outside the image blocks")]
    FieldOutOfRange,
}

/// Serialized form of one chunk: its raw blocks, free ranges, and the
/// registries that live in it. Carrying the registries means a restore
/// does not have to replay registration order.
#[derive(Serialize, Deserialize)]
struct ChunkImage<S> {
    blocks: Vec<u64>,
    empty_fields: Vec<u32>,
    states: Vec<StateImage<S>>,
}

#[derive(Serialize, Deserialize)]
struct StateImage<S> {
    key: S,
    variety: Variety,
    position: u32,
}

// ---------------------------------------------------------------------------

/// The bit-packed typed state store. `S` identifies states, `C` chunks.
///
/// Single-writer / multi-reader: `&mut self` methods are the writes; no
/// internal synchronization is provided or needed. Wrap the reservoir in a
/// lock if several threads must write.
pub struct Reservoir<S, C> {
    registries: Vec<Registry<S, C>>,
    chunks: Vec<Chunk<C>>,
}

impl<S: Key, C: Key> Reservoir<S, C> {
    /// An empty reservoir with capacity reserved for the expected number
    /// of states and chunks.
    pub fn new(reserve_states: usize, reserve_chunks: usize) -> Self {
        Self {
            registries: Vec::with_capacity(reserve_states),
            chunks: Vec::with_capacity(reserve_chunks),
        }
    }

    /// Number of registered states.
    pub fn state_count(&self) -> usize {
        self.registries.len()
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    // -- registration -------------------------------------------------------

    /// Register a bool state with an initial value.
    ///
    /// Fails if `status_key` is already registered.
    pub fn register_bool(&mut self, chunk_key: C, status_key: S, value: bool) -> bool {
        self.register(chunk_key, status_key, VARIETY_BOOL, u64::from(value))
    }

    /// Register an unsigned state of `bits` bits (2 ..= 64) with an
    /// initial value.
    ///
    /// Fails on a duplicate key or a width outside 2..=64.
    pub fn register_unsigned(&mut self, chunk_key: C, status_key: S, value: u64, bits: u8) -> bool {
        if !(2..=BLOCK_BITS).contains(&bits) {
            return false;
        }
        debug_assert!(bits == BLOCK_BITS || value >> bits == 0, "initial value overflows width");
        self.register(chunk_key, status_key, bits as Variety, value & block_mask(bits))
    }

    /// Register a signed state of `bits` bits (2 ..= 64) with an initial
    /// value. Negative initials are stored two's-complement masked.
    pub fn register_signed(&mut self, chunk_key: C, status_key: S, value: i64, bits: u8) -> bool {
        if !(2..=BLOCK_BITS).contains(&bits) {
            return false;
        }
        let mask = block_mask(bits);
        let raw = value as u64;
        if value < 0 {
            debug_assert!(raw | mask == u64::MAX, "initial value overflows width");
        } else {
            debug_assert!(bits == BLOCK_BITS || raw >> bits == 0, "initial value overflows width");
        }
        self.register(chunk_key, status_key, -(bits as i16) as Variety, raw & mask)
    }

    /// Register a float state with an initial value. NaN and infinities
    /// round-trip bit-exactly but compare per IEEE-754 rules (NaN never
    /// equal), which this store does not paper over.
    pub fn register_float(&mut self, chunk_key: C, status_key: S, value: f64) -> bool {
        debug_assert!(value.is_finite(), "non-finite float state");
        self.register(chunk_key, status_key, VARIETY_FLOAT, value.to_bits())
    }

    fn register(&mut self, chunk_key: C, status_key: S, variety: Variety, bits: u64) -> bool {
        let registry_at = keyed::insertion_point(&self.registries, status_key);
        if self.registries.get(registry_at).is_some_and(|r| r.status_key == status_key) {
            return false;
        }

        let chunk_at = self.equip_chunk(chunk_key);
        let chunk = &mut self.chunks[chunk_at];
        let size = variety_bits(variety);
        let Some(position) = allocate_field(size, &mut chunk.empty_fields, &mut chunk.blocks)
        else {
            return false;
        };
        if set_bits(&mut chunk.blocks, position, size, bits).is_none() {
            return false;
        }
        self.registries.insert(
            registry_at,
            Registry::new(status_key, chunk_key, variety, position),
        );
        true
    }

    /// Index of the chunk for `chunk_key`, creating it if absent.
    fn equip_chunk(&mut self, chunk_key: C) -> usize {
        let at = keyed::insertion_point(&self.chunks, chunk_key);
        if !self.chunks.get(at).is_some_and(|c| c.key == chunk_key) {
            self.chunks.insert(at, Chunk::new(chunk_key));
        }
        at
    }

    // -- reads --------------------------------------------------------------

    /// Variety code of a registered state, or [`VARIETY_EMPTY`] if absent.
    pub fn format(&self, status_key: S) -> Variety {
        keyed::find(&self.registries, status_key)
            .map(|registry| registry.variety())
            .unwrap_or(VARIETY_EMPTY)
    }

    /// Current value of a state, or [`StateValue::Empty`] if absent.
    pub fn value(&self, status_key: S) -> StateValue {
        let Some(registry) = keyed::find(&self.registries, status_key) else {
            return StateValue::Empty;
        };
        let Some(chunk) = keyed::find(&self.chunks, registry.chunk_key) else {
            debug_assert!(false, "registry without a chunk");
            return StateValue::Empty;
        };
        let variety = registry.variety();
        let size = variety_bits(variety);
        let bits = get_bits(&chunk.blocks, registry.position(), size);
        match variety {
            VARIETY_BOOL => StateValue::Bool(bits != 0),
            VARIETY_FLOAT => StateValue::Float(f64::from_bits(bits)),
            v if v < 0 => {
                // Sign-extend `size` bits up to the full width.
                let shift = u32::from(BLOCK_BITS - size);
                StateValue::Signed(((bits << shift) as i64) >> shift)
            }
            v if v > 0 => StateValue::Unsigned(bits),
            _ => {
                debug_assert!(false, "empty variety in a registry");
                StateValue::Empty
            }
        }
    }

    /// Transition bit of a state; `None` if the key is not registered.
    pub fn transition(&self, status_key: S) -> Option<bool> {
        keyed::find(&self.registries, status_key).map(|registry| registry.transition())
    }

    /// Clear every transition bit in one pass.
    pub fn reset_transitions(&mut self) {
        for registry in &mut self.registries {
            registry.clear_transition();
        }
    }

    // -- writes -------------------------------------------------------------

    /// Set a registered state to a new value.
    ///
    /// Fails (returning `false`, leaving the state unchanged) when the key
    /// is absent or the value kind does not fit the stored variety:
    /// only bools may be written to a bool state, bools may not be written
    /// to a float state, and only integers may be written to an integer
    /// state. The transition bit is set only if the stored bits change.
    pub fn set_value<V: Into<StateValue>>(&mut self, status_key: S, value: V) -> bool {
        let value = value.into();
        let Some(registry_at) = keyed::index_of(&self.registries, status_key) else {
            return false;
        };
        let chunk_key = self.registries[registry_at].chunk_key;
        let Some(chunk_at) = keyed::index_of(&self.chunks, chunk_key) else {
            debug_assert!(false, "registry without a chunk");
            return false;
        };

        let registry = &self.registries[registry_at];
        let variety = registry.variety();
        let position = registry.position();
        let size = variety_bits(variety);
        let blocks = &mut self.chunks[chunk_at].blocks;

        let changed = match variety_kind(variety) {
            StateKind::Bool => {
                let StateValue::Bool(v) = value else {
                    return false;
                };
                set_bits(blocks, position, 1, u64::from(v))
            }
            StateKind::Float => {
                let bits = match value {
                    StateValue::Float(v) => v.to_bits(),
                    StateValue::Unsigned(v) => {
                        let cast = v as f64;
                        debug_assert!(cast as u64 == v, "integer not representable as float");
                        cast.to_bits()
                    }
                    StateValue::Signed(v) => {
                        let cast = v as f64;
                        debug_assert!(cast as i64 == v, "integer not representable as float");
                        cast.to_bits()
                    }
                    _ => return false,
                };
                set_bits(blocks, position, FLOAT_BITS, bits)
            }
            StateKind::Unsigned => {
                let raw = match value {
                    StateValue::Unsigned(v) => v,
                    StateValue::Signed(v) => v as u64,
                    _ => return false,
                };
                debug_assert!(size == BLOCK_BITS || raw >> size == 0, "value overflows field");
                set_bits(blocks, position, size, raw & block_mask(size))
            }
            StateKind::Signed => {
                let (raw, negative) = match value {
                    StateValue::Signed(v) => (v as u64, v < 0),
                    StateValue::Unsigned(v) => (v, false),
                    _ => return false,
                };
                let mask = block_mask(size);
                if negative {
                    debug_assert!(raw | mask == u64::MAX, "value overflows field");
                } else {
                    debug_assert!(size == BLOCK_BITS || raw >> size == 0, "value overflows field");
                }
                set_bits(blocks, position, size, raw & mask)
            }
            StateKind::Empty => {
                debug_assert!(false, "empty variety in a registry");
                return false;
            }
        };

        match changed {
            Some(true) => {
                self.registries[registry_at].mark_transition();
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    // -- chunk lifecycle ----------------------------------------------------

    /// Pre-size a chunk's block and free-range storage.
    pub fn reserve_chunk(&mut self, chunk_key: C, reserve_blocks: usize, reserve_empties: usize) {
        let at = self.equip_chunk(chunk_key);
        let chunk = &mut self.chunks[at];
        chunk.blocks.reserve(reserve_blocks);
        chunk.empty_fields.reserve(reserve_empties);
    }

    /// Remove a chunk and every state registered in it.
    pub fn remove_chunk(&mut self, chunk_key: C) -> bool {
        let Some(at) = keyed::index_of(&self.chunks, chunk_key) else {
            return false;
        };
        self.chunks.remove(at);
        let before = self.registries.len();
        self.registries.retain(|registry| registry.chunk_key != chunk_key);
        tracing::debug!(
            removed_states = before - self.registries.len(),
            "removed reservoir chunk"
        );
        true
    }

    /// Encode a chunk (blocks, free ranges, and its registries) to bytes.
    /// Returns `None` if the chunk does not exist or encoding fails.
    pub fn serialize_chunk(&self, chunk_key: C) -> Option<Vec<u8>>
    where
        S: Serialize,
    {
        let chunk = keyed::find(&self.chunks, chunk_key)?;
        let image = ChunkImage {
            blocks: chunk.blocks.clone(),
            empty_fields: chunk.empty_fields.clone(),
            states: self
                .registries
                .iter()
                .filter(|registry| registry.chunk_key == chunk_key)
                .map(|registry| StateImage {
                    key: registry.status_key,
                    variety: registry.variety(),
                    position: registry.position(),
                })
                .collect(),
        };
        match bincode::serialize(&image).map_err(ChunkCodecError::Encode) {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                tracing::warn!(%error, "chunk image rejected");
                None
            }
        }
    }

    /// Restore a serialized chunk under `chunk_key`. The key may differ
    /// from the one the chunk was serialized under.
    ///
    /// Fails without mutating anything if the bytes do not decode, the
    /// chunk key is already present, or any status key in the image is
    /// already registered.
    pub fn deserialize_chunk(&mut self, chunk_key: C, bytes: &[u8]) -> bool
    where
        S: DeserializeOwned,
    {
        match self.restore_chunk(chunk_key, bytes) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(%error, "chunk image rejected");
                false
            }
        }
    }

    fn restore_chunk(&mut self, chunk_key: C, bytes: &[u8]) -> Result<(), ChunkCodecError>
    where
        S: DeserializeOwned,
    {
        let image: ChunkImage<S> =
            bincode::deserialize(bytes).map_err(ChunkCodecError::Decode)?;
        if keyed::find(&self.chunks, chunk_key).is_some() {
            return Err(ChunkCodecError::ChunkExists);
        }
        let total_bits = image.blocks.len() as u64 * u64::from(BLOCK_BITS);
        for state in &image.states {
            if keyed::find(&self.registries, state.key).is_some() {
                return Err(ChunkCodecError::DuplicateStatus);
            }
            let size = variety_bits(state.variety);
            if state.variety == VARIETY_EMPTY
                || state.position > POSITION_MASK
                || u64::from(state.position) + u64::from(size) > total_bits
            {
                return Err(ChunkCodecError::FieldOutOfRange);
            }
        }

        let chunk_at = self.equip_chunk(chunk_key);
        self.chunks[chunk_at].blocks = image.blocks;
        self.chunks[chunk_at].empty_fields = image.empty_fields;
        for state in image.states {
            let at = keyed::insertion_point(&self.registries, state.key);
            self.registries.insert(
                at,
                Registry::new(state.key, chunk_key, state.variety, state.position),
            );
        }
        Ok(())
    }

    // -- compaction ---------------------------------------------------------

    /// Rebuild the reservoir with states repacked widest-first, then shrink
    /// every container to fit. Every `(key, value)` pair is preserved;
    /// transition bits end up set (a rebuild is a write of every state).
    pub fn shrink_to_fit(&mut self) {
        // Order registries by field size descending so wide fields claim
        // whole blocks before narrow ones fill the gaps.
        let mut order: Vec<usize> = (0..self.registries.len()).collect();
        order.sort_by_key(|&at| std::cmp::Reverse(variety_bits(self.registries[at].variety())));

        let mut rebuilt = Reservoir::new(self.registries.len(), self.chunks.len());
        for chunk in &self.chunks {
            let at = rebuilt.equip_chunk(chunk.key);
            rebuilt.chunks[at].blocks.reserve(chunk.blocks.len());
        }
        for at in order {
            let registry = &self.registries[at];
            let Some(chunk) = keyed::find(&self.chunks, registry.chunk_key) else {
                debug_assert!(false, "registry without a chunk");
                continue;
            };
            let variety = registry.variety();
            let size = variety_bits(variety);
            let bits = get_bits(&chunk.blocks, registry.position(), size);
            let ok = match variety {
                VARIETY_BOOL => {
                    rebuilt.register_bool(registry.chunk_key, registry.status_key, bits != 0)
                }
                VARIETY_FLOAT => rebuilt.register_float(
                    registry.chunk_key,
                    registry.status_key,
                    f64::from_bits(bits),
                ),
                v if v < 0 => rebuilt.register_signed(
                    registry.chunk_key,
                    registry.status_key,
                    {
                        let shift = u32::from(BLOCK_BITS - size);
                        ((bits << shift) as i64) >> shift
                    },
                    size,
                ),
                _ => rebuilt.register_unsigned(
                    registry.chunk_key,
                    registry.status_key,
                    bits,
                    size,
                ),
            };
            debug_assert!(ok, "repacking lost a state");
        }

        *self = rebuilt;
        self.registries.shrink_to_fit();
        self.chunks.shrink_to_fit();
        for chunk in &mut self.chunks {
            chunk.blocks.shrink_to_fit();
            chunk.empty_fields.shrink_to_fit();
        }
    }
}

/// Find or create a bit range of `size` bits. First-fit over the free
/// ranges (sorted by size, then position); grows the block run when no
/// free range is wide enough.
fn allocate_field(size: u8, empty_fields: &mut Vec<u32>, blocks: &mut Vec<u64>) -> Option<u32> {
    let at = empty_fields.partition_point(|&field| empty_field_size(field) < size);
    if let Some(&field) = empty_fields.get(at) {
        // Reuse an existing free range; the remainder becomes a new one.
        let position = empty_field_position(field);
        let empty_size = u32::from(empty_field_size(field));
        empty_fields.remove(at);
        if u32::from(size) < empty_size {
            push_empty_field(
                empty_fields,
                position + u32::from(size),
                empty_size - u32::from(size),
            );
        }
        return Some(position);
    }

    // Grow the chunk by whole zeroed blocks and carve from the front.
    let position = blocks.len() as u64 * u64::from(BLOCK_BITS);
    if position > u64::from(POSITION_MASK) {
        debug_assert!(false, "chunk bit position space exhausted");
        return None;
    }
    let grown_blocks = (u32::from(size) + u32::from(BLOCK_BITS) - 1) / u32::from(BLOCK_BITS);
    blocks.extend(std::iter::repeat(0).take(grown_blocks as usize));
    tracing::trace!(blocks = blocks.len(), "reservoir chunk grew");
    let grown_bits = grown_blocks * u32::from(BLOCK_BITS);
    let position = position as u32;
    if u32::from(size) < grown_bits {
        push_empty_field(empty_fields, position + u32::from(size), grown_bits - u32::from(size));
    }
    Some(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestReservoir = Reservoir<u32, u32>;

    #[test]
    fn test_register_and_read_each_kind() {
        let mut reservoir = TestReservoir::new(8, 1);
        assert!(reservoir.register_bool(1, 10, true));
        assert!(reservoir.register_unsigned(1, 11, 250, 8));
        assert!(reservoir.register_signed(1, 12, -100, 8));
        assert!(reservoir.register_float(1, 13, 1.5));

        assert_eq!(reservoir.value(10), StateValue::Bool(true));
        assert_eq!(reservoir.value(11), StateValue::Unsigned(250));
        assert_eq!(reservoir.value(12), StateValue::Signed(-100));
        assert_eq!(reservoir.value(13), StateValue::Float(1.5));
        assert_eq!(reservoir.value(999), StateValue::Empty);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut reservoir = TestReservoir::new(2, 1);
        assert!(reservoir.register_bool(1, 10, true));
        assert!(!reservoir.register_bool(1, 10, false));
        assert!(!reservoir.register_unsigned(2, 10, 1, 8));
        assert_eq!(reservoir.value(10), StateValue::Bool(true));
    }

    #[test]
    fn test_width_limits() {
        let mut reservoir = TestReservoir::new(4, 1);
        assert!(!reservoir.register_unsigned(1, 1, 0, 0));
        assert!(!reservoir.register_unsigned(1, 1, 0, 1));
        assert!(!reservoir.register_unsigned(1, 1, 0, 65));
        assert!(reservoir.register_unsigned(1, 1, u64::MAX, 64));
        assert_eq!(reservoir.value(1), StateValue::Unsigned(u64::MAX));
    }

    #[test]
    fn test_format_codes() {
        let mut reservoir = TestReservoir::new(4, 1);
        reservoir.register_bool(1, 1, false);
        reservoir.register_unsigned(1, 2, 0, 12);
        reservoir.register_signed(1, 3, 0, 12);
        reservoir.register_float(1, 4, 0.0);
        assert_eq!(reservoir.format(1), VARIETY_BOOL);
        assert_eq!(reservoir.format(2), 12);
        assert_eq!(reservoir.format(3), -12);
        assert_eq!(reservoir.format(4), VARIETY_FLOAT);
        assert_eq!(reservoir.format(5), VARIETY_EMPTY);
    }

    #[test]
    fn test_set_value_and_transition() {
        let mut reservoir = TestReservoir::new(2, 1);
        reservoir.register_unsigned(1, 10, 5, 8);
        // Registration leaves the transition bit set.
        assert_eq!(reservoir.transition(10), Some(true));
        reservoir.reset_transitions();
        assert_eq!(reservoir.transition(10), Some(false));

        assert!(reservoir.set_value(10, 250u64));
        assert_eq!(reservoir.value(10), StateValue::Unsigned(250));
        assert_eq!(reservoir.transition(10), Some(true));

        reservoir.reset_transitions();
        // Writing the same bits is a no-op for the transition bit.
        assert!(reservoir.set_value(10, 250u64));
        assert_eq!(reservoir.transition(10), Some(false));

        assert_eq!(reservoir.transition(999), None);
    }

    #[test]
    fn test_reset_transitions_idempotent() {
        let mut reservoir = TestReservoir::new(1, 1);
        reservoir.register_bool(1, 1, true);
        reservoir.reset_transitions();
        reservoir.reset_transitions();
        assert_eq!(reservoir.transition(1), Some(false));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut reservoir = TestReservoir::new(4, 1);
        reservoir.register_bool(1, 1, false);
        reservoir.register_unsigned(1, 2, 0, 8);
        reservoir.register_float(1, 3, 0.0);

        // Non-bool into bool.
        assert!(!reservoir.set_value(1, 1u64));
        // Bool into float.
        assert!(!reservoir.set_value(3, true));
        // Non-integer into integer.
        assert!(!reservoir.set_value(2, 1.5f64));
        assert!(!reservoir.set_value(2, true));

        // Nothing changed.
        assert_eq!(reservoir.value(1), StateValue::Bool(false));
        assert_eq!(reservoir.value(2), StateValue::Unsigned(0));
        assert_eq!(reservoir.value(3), StateValue::Float(0.0));
    }

    #[test]
    fn test_signed_boundaries() {
        let mut reservoir = TestReservoir::new(1, 1);
        assert!(reservoir.register_signed(1, 11, -1, 8));
        assert_eq!(reservoir.value(11), StateValue::Signed(-1));
        assert!(reservoir.set_value(11, -128i64));
        assert_eq!(reservoir.value(11), StateValue::Signed(-128));
        assert!(reservoir.set_value(11, 127i64));
        assert_eq!(reservoir.value(11), StateValue::Signed(127));
    }

    #[test]
    fn test_float_round_trip() {
        let mut reservoir = TestReservoir::new(1, 1);
        assert!(reservoir.register_float(1, 12, 1.5));
        assert_eq!(reservoir.value(12), StateValue::Float(1.5));
        assert!(reservoir.set_value(12, -0.25f64));
        assert_eq!(reservoir.value(12), StateValue::Float(-0.25));
        // Integers that fit exactly may be written to float states.
        assert!(reservoir.set_value(12, 3u64));
        assert_eq!(reservoir.value(12), StateValue::Float(3.0));
    }

    #[test]
    fn test_full_width_varieties_stay_distinct() {
        let mut reservoir = TestReservoir::new(2, 1);
        assert!(reservoir.register_unsigned(1, 1, u64::MAX, 64));
        assert!(reservoir.register_signed(1, 2, -1, 64));
        // Both fields hold the same 64 one-bits; only the variety code
        // tells them apart.
        assert_eq!(reservoir.format(1), 64);
        assert_eq!(reservoir.format(2), -64);
        assert_eq!(reservoir.value(1), StateValue::Unsigned(u64::MAX));
        assert_eq!(reservoir.value(2), StateValue::Signed(-1));
    }

    #[test]
    fn test_wide_states_share_a_chunk() {
        let mut reservoir = TestReservoir::new(2, 1);
        assert!(reservoir.register_unsigned(1, 1, u64::MAX, 64));
        assert!(reservoir.register_signed(1, 2, i64::MIN >> 1, 63));
        assert_eq!(reservoir.value(1), StateValue::Unsigned(u64::MAX));
        assert_eq!(reservoir.value(2), StateValue::Signed(i64::MIN >> 1));
    }

    #[test]
    fn test_one_bit_states_pack_densely() {
        let mut reservoir = TestReservoir::new(128, 1);
        for key in 0..128u32 {
            assert!(reservoir.register_bool(1, key, key % 2 == 0));
        }
        for key in 0..128u32 {
            assert_eq!(reservoir.value(key), StateValue::Bool(key % 2 == 0));
        }
        // 128 one-bit fields fit exactly in two 64-bit blocks.
        assert_eq!(reservoir.chunks[0].blocks.len(), 2);
    }

    #[test]
    fn test_mixed_width_packing_reuses_gaps() {
        let mut reservoir = TestReservoir::new(4, 1);
        reservoir.register_unsigned(1, 1, 0, 32);
        reservoir.register_unsigned(1, 2, 0, 16);
        reservoir.register_unsigned(1, 3, 0, 16);
        // 32 + 16 + 16 fill one block exactly.
        assert_eq!(reservoir.chunks[0].blocks.len(), 1);
        assert!(reservoir.chunks[0].empty_fields.is_empty());
    }

    #[test]
    fn test_shrink_to_fit_preserves_values() {
        let mut reservoir = TestReservoir::new(8, 2);
        reservoir.register_bool(1, 1, true);
        reservoir.register_unsigned(1, 2, 1234, 16);
        reservoir.register_signed(2, 3, -77, 10);
        reservoir.register_float(2, 4, 2.75);
        reservoir.set_value(2, 4321u64);

        reservoir.shrink_to_fit();

        assert_eq!(reservoir.value(1), StateValue::Bool(true));
        assert_eq!(reservoir.value(2), StateValue::Unsigned(4321));
        assert_eq!(reservoir.value(3), StateValue::Signed(-77));
        assert_eq!(reservoir.value(4), StateValue::Float(2.75));
    }

    #[test]
    fn test_remove_chunk() {
        let mut reservoir = TestReservoir::new(4, 2);
        reservoir.register_bool(1, 1, true);
        reservoir.register_bool(2, 2, true);
        assert!(reservoir.remove_chunk(1));
        assert_eq!(reservoir.value(1), StateValue::Empty);
        assert_eq!(reservoir.value(2), StateValue::Bool(true));
        assert!(!reservoir.remove_chunk(1));
    }

    #[test]
    fn test_chunk_serialize_round_trip() {
        let mut reservoir = TestReservoir::new(4, 1);
        reservoir.register_unsigned(7, 1, 42, 8);
        reservoir.register_signed(7, 2, -5, 8);
        reservoir.register_float(7, 3, 0.5);

        let bytes = reservoir.serialize_chunk(7).unwrap();
        assert!(reservoir.remove_chunk(7));
        assert_eq!(reservoir.value(1), StateValue::Empty);

        // Restore under a different chunk key.
        assert!(reservoir.deserialize_chunk(9, &bytes));
        assert_eq!(reservoir.value(1), StateValue::Unsigned(42));
        assert_eq!(reservoir.value(2), StateValue::Signed(-5));
        assert_eq!(reservoir.value(3), StateValue::Float(0.5));

        // Packing state survived too: new registrations reuse the chunk.
        assert!(reservoir.register_bool(9, 4, true));
        assert_eq!(reservoir.value(4), StateValue::Bool(true));
    }

    #[test]
    fn test_deserialize_rejects_duplicates() {
        let mut reservoir = TestReservoir::new(4, 2);
        reservoir.register_unsigned(7, 1, 42, 8);
        let bytes = reservoir.serialize_chunk(7).unwrap();

        // Status key 1 still registered: restore must fail atomically.
        assert!(!reservoir.deserialize_chunk(9, &bytes));
        assert_eq!(reservoir.chunk_count(), 1);

        // Same chunk key: also rejected.
        assert!(!reservoir.deserialize_chunk(7, &bytes));

        assert!(!reservoir.deserialize_chunk(9, b"not a chunk image"));
    }

    #[test]
    fn test_packing_reuse_after_remove_and_register() {
        let mut reservoir = TestReservoir::new(4, 2);
        reservoir.register_unsigned(1, 1, 9, 8);
        reservoir.register_unsigned(1, 2, 9, 8);
        assert!(reservoir.remove_chunk(1));
        // Keys are free again after their chunk is removed.
        assert!(reservoir.register_unsigned(1, 1, 11, 8));
        assert_eq!(reservoir.value(1), StateValue::Unsigned(11));
    }
}
