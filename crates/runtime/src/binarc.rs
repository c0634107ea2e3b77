//! BINARC: a read-only, zero-copy binary archive of tagged words.
//!
//! An archive is a flat run of little-endian 32-bit words. Word 0 is a
//! sentinel carrying the `'pbon'` magic; word 1 is the root tag. Every tag
//! packs a 4-bit format into its top bits and a 28-bit payload below:
//!
//! ```text
//! tag = [format:4 | payload:28]
//!
//! format            payload
//! NIL               unused
//! BOOLEAN           0 or 1
//! UNSIGNED_IMM      the value itself
//! NEGATIVE_IMM      low 28 bits of the value (top 4 bits restored on read)
//! UNSIGNED_32/64    word index of the numeric body
//! NEGATIVE_32/64    word index of the numeric body
//! FLOATING_32/64    word index of the IEEE-754 body
//! STRING            word index of {size:u32, hash:u32} + bytes
//! EXTENDED          word index of {size:u32, hash:u32, kind:u32} + bytes
//! ARRAY             word index of {size:u32} + size child tags
//! MAP               word index of {size:u32} + size value tags, followed
//!                   immediately by a sibling key container sorted by
//!                   (hash, format) ascending
//! ```
//!
//! Readers never allocate and never panic on malformed input: an
//! out-of-range cursor or word index reads as Nil / `None`. Construction
//! validates base alignment, length, and the sentinel up front.

use tarn_core::hash::{fnv1_32, fold_u64};

/// Archive word type.
pub type Word = u32;

const WORD_BYTES: usize = 4;
pub(crate) const FORMAT_SHIFT: u32 = 28;
pub(crate) const PAYLOAD_MASK: Word = (1 << FORMAT_SHIFT) - 1;
/// Top four tag bits, OR-ed back in when sign-extending a negative
/// immediate.
pub(crate) const FORMAT_BITS: Word = !PAYLOAD_MASK;
const ROOT_WORD: usize = 1;

/// Sentinel magic in word 0 (`'pbon'` as a big-endian character constant).
pub const MAGIC: Word = 0x7062_6f6e;

// Storage formats. The public `Kind` collapses the width variants.
pub(crate) const FORMAT_NIL: u8 = 0;
pub(crate) const FORMAT_BOOLEAN: u8 = 1;
pub(crate) const FORMAT_STRING: u8 = 2;
pub(crate) const FORMAT_EXTENDED: u8 = 3;
pub(crate) const FORMAT_ARRAY: u8 = 4;
pub(crate) const FORMAT_MAP: u8 = 5;
pub(crate) const FORMAT_UNSIGNED_IMMEDIATE: u8 = 6;
pub(crate) const FORMAT_UNSIGNED_32: u8 = 7;
pub(crate) const FORMAT_UNSIGNED_64: u8 = 8;
pub(crate) const FORMAT_NEGATIVE_IMMEDIATE: u8 = 9;
pub(crate) const FORMAT_NEGATIVE_32: u8 = 10;
pub(crate) const FORMAT_NEGATIVE_64: u8 = 11;
pub(crate) const FORMAT_FLOATING_32: u8 = 12;
pub(crate) const FORMAT_FLOATING_64: u8 = 13;

/// Kind of the value a cursor points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Nil,
    Boolean,
    String,
    Extended,
    Array,
    Map,
    Unsigned,
    Negative,
    Floating,
}

fn kind_of_format(format: u8) -> Kind {
    match format {
        FORMAT_BOOLEAN => Kind::Boolean,
        FORMAT_STRING => Kind::String,
        FORMAT_EXTENDED => Kind::Extended,
        FORMAT_ARRAY => Kind::Array,
        FORMAT_MAP => Kind::Map,
        FORMAT_UNSIGNED_IMMEDIATE | FORMAT_UNSIGNED_32 | FORMAT_UNSIGNED_64 => Kind::Unsigned,
        FORMAT_NEGATIVE_IMMEDIATE | FORMAT_NEGATIVE_32 | FORMAT_NEGATIVE_64 => Kind::Negative,
        FORMAT_FLOATING_32 | FORMAT_FLOATING_64 => Kind::Floating,
        _ => Kind::Nil,
    }
}

/// Why a byte slice was rejected as an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive base address is not 8-byte aligned")]
    UnalignedBase,
    #[error("archive length {0} is not a multiple of the word size")]
    OddLength(usize),
    #[error("archive has no sentinel word")]
    MissingSentinel,
    #[error("archive sentinel 0x{0:08x} does not carry the expected magic")]
    BadMagic(Word),
}

/// A position inside an archive (a word index). Cursors are cheap copies;
/// all dereferencing goes through [`Archive`] methods and is bounds
/// checked there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(pub(crate) usize);

/// A contiguous run of container elements, produced by
/// [`Archive::container_slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slice {
    begin: usize,
    end: usize,
}

impl Slice {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// Cursor of the `index`-th element of the slice.
    pub fn at(&self, index: usize) -> Option<Cursor> {
        if index < self.len() {
            Some(Cursor(self.begin + index))
        } else {
            None
        }
    }

    /// Move a cursor by `count` elements (negative moves backward),
    /// failing when the result leaves the slice.
    pub fn advance(&self, cursor: Cursor, count: isize) -> Option<Cursor> {
        let moved = cursor.0.checked_add_signed(count)?;
        if self.begin <= moved && moved < self.end {
            Some(Cursor(moved))
        } else {
            None
        }
    }
}

/// Result of a numeric read: the converted value plus whether the
/// conversion was lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exact<T> {
    pub value: T,
    pub exact: bool,
}

mod sealed {
    pub trait Sealed {}
}

// `2^64` and `2^63`, both exactly representable in `f64`. Conversion
// exactness checks need explicit bounds because `u64::MAX as f64` rounds
// up to `2^64` and the saturating cast back would spuriously round-trip.
const U64_BOUND: f64 = 18446744073709551616.0;
const I64_BOUND: f64 = 9223372036854775808.0;

/// Host numeric types an archive value can be read into.
pub trait Numeric: Copy + sealed::Sealed {
    #[doc(hidden)]
    fn from_unsigned(value: u64) -> (Self, bool);
    #[doc(hidden)]
    fn from_signed(value: i64) -> (Self, bool);
    #[doc(hidden)]
    fn from_f32(value: f32) -> (Self, bool);
    #[doc(hidden)]
    fn from_f64(value: f64) -> (Self, bool);
}

macro_rules! impl_numeric_unsigned {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Numeric for $t {
            fn from_unsigned(value: u64) -> (Self, bool) {
                let out = value as $t;
                (out, out as u64 == value)
            }
            fn from_signed(value: i64) -> (Self, bool) {
                let out = value as $t;
                (out, value >= 0 && out as i64 == value)
            }
            fn from_f32(value: f32) -> (Self, bool) {
                Self::from_f64(f64::from(value))
            }
            fn from_f64(value: f64) -> (Self, bool) {
                let out = value as $t;
                // Exact iff integral and inside [0, 2^bits); the cast
                // itself saturates and cannot be trusted at the bounds.
                let exact = value.trunc() == value
                    && value >= 0.0
                    && value < (<$t>::MAX as u128 + 1) as f64;
                (out, exact)
            }
        }
    )*};
}

macro_rules! impl_numeric_signed {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Numeric for $t {
            fn from_unsigned(value: u64) -> (Self, bool) {
                let out = value as $t;
                (out, out >= 0 && out as u64 == value)
            }
            fn from_signed(value: i64) -> (Self, bool) {
                let out = value as $t;
                (out, out as i64 == value)
            }
            fn from_f32(value: f32) -> (Self, bool) {
                Self::from_f64(f64::from(value))
            }
            fn from_f64(value: f64) -> (Self, bool) {
                let out = value as $t;
                // Exact iff integral and inside [-2^(bits-1), 2^(bits-1)).
                let exact = value.trunc() == value
                    && value >= <$t>::MIN as f64
                    && value < (<$t>::MAX as u128 + 1) as f64;
                (out, exact)
            }
        }
    )*};
}

impl_numeric_unsigned!(u8, u16, u32, u64, usize);
impl_numeric_signed!(i8, i16, i32, i64, isize);

impl sealed::Sealed for f32 {}
impl Numeric for f32 {
    fn from_unsigned(value: u64) -> (Self, bool) {
        let out = value as f32;
        (out, f64::from(out) < U64_BOUND && out as u64 == value)
    }
    fn from_signed(value: i64) -> (Self, bool) {
        let out = value as f32;
        (out, f64::from(out) < I64_BOUND && out as i64 == value)
    }
    fn from_f32(value: f32) -> (Self, bool) {
        (value, true)
    }
    fn from_f64(value: f64) -> (Self, bool) {
        let out = value as f32;
        (out, f64::from(out) == value)
    }
}

impl sealed::Sealed for f64 {}
impl Numeric for f64 {
    fn from_unsigned(value: u64) -> (Self, bool) {
        let out = value as f64;
        (out, out < U64_BOUND && out as u64 == value)
    }
    fn from_signed(value: i64) -> (Self, bool) {
        let out = value as f64;
        (out, out < I64_BOUND && out as i64 == value)
    }
    fn from_f32(value: f32) -> (Self, bool) {
        (f64::from(value), true)
    }
    fn from_f64(value: f64) -> (Self, bool) {
        (value, true)
    }
}

// ---------------------------------------------------------------------------
// Map keys

/// A search key for map lookup, pre-classified into the storage format the
/// archive would have used for the same value. Ordering in the key
/// container is by `(hash, format)` ascending; lookup is a lower bound on
/// that pair followed by a short linear scan of the equal-hash run.
#[derive(Debug, Clone, Copy)]
pub struct MapKey<'k> {
    pub(crate) hash: u32,
    pub(crate) format: u8,
    body: KeyBody<'k>,
}

#[derive(Debug, Clone, Copy)]
enum KeyBody<'k> {
    Bits32(u32),
    Bits64(u64),
    Raw { data: &'k [u8], kind: Option<Word> },
}

impl<'k> MapKey<'k> {
    pub fn from_bool(value: bool) -> Self {
        let bits = Word::from(value);
        Self {
            hash: bits,
            format: FORMAT_BOOLEAN,
            body: KeyBody::Bits32(bits),
        }
    }

    pub fn from_unsigned(value: u64) -> Self {
        if value > u64::from(u32::MAX) {
            Self {
                hash: fold_u64(value),
                format: FORMAT_UNSIGNED_64,
                body: KeyBody::Bits64(value),
            }
        } else {
            let bits = value as u32;
            Self {
                hash: bits,
                format: if bits > PAYLOAD_MASK {
                    FORMAT_UNSIGNED_32
                } else {
                    FORMAT_UNSIGNED_IMMEDIATE
                },
                body: KeyBody::Bits32(bits),
            }
        }
    }

    pub fn from_signed(value: i64) -> Self {
        if value >= 0 {
            return Self::from_unsigned(value as u64);
        }
        if value < i64::from(i32::MIN) {
            Self {
                hash: fold_u64(value as u64),
                format: FORMAT_NEGATIVE_64,
                body: KeyBody::Bits64(value as u64),
            }
        } else {
            let bits = value as i32 as u32;
            Self {
                hash: bits,
                // A negative that fits 28 bits (top four bits all set)
                // would have been stored as an immediate.
                format: if bits < FORMAT_BITS {
                    FORMAT_NEGATIVE_32
                } else {
                    FORMAT_NEGATIVE_IMMEDIATE
                },
                body: KeyBody::Bits32(bits),
            }
        }
    }

    pub fn from_float(value: f64) -> Self {
        // Whole-valued floats demote to integer keys, matching how the
        // writer classifies them.
        let as_int = value as i64;
        if value == as_int as f64 {
            return Self::from_signed(as_int);
        }
        let narrowed = value as f32;
        if f64::from(narrowed) == value {
            let bits = narrowed.to_bits();
            Self {
                hash: bits,
                format: FORMAT_FLOATING_32,
                body: KeyBody::Bits32(bits),
            }
        } else {
            let bits = value.to_bits();
            Self {
                hash: fold_u64(bits),
                format: FORMAT_FLOATING_64,
                body: KeyBody::Bits64(bits),
            }
        }
    }

    pub fn from_bytes(data: &'k [u8]) -> Self {
        Self {
            hash: fnv1_32(data),
            format: FORMAT_STRING,
            body: KeyBody::Raw { data, kind: None },
        }
    }

    pub fn from_extended(data: &'k [u8], kind: Word) -> Self {
        Self {
            hash: fnv1_32(data),
            format: FORMAT_EXTENDED,
            body: KeyBody::Raw { data, kind: Some(kind) },
        }
    }
}

impl From<bool> for MapKey<'_> {
    fn from(value: bool) -> Self {
        MapKey::from_bool(value)
    }
}

impl From<u64> for MapKey<'_> {
    fn from(value: u64) -> Self {
        MapKey::from_unsigned(value)
    }
}

impl From<u32> for MapKey<'_> {
    fn from(value: u32) -> Self {
        MapKey::from_unsigned(u64::from(value))
    }
}

impl From<i64> for MapKey<'_> {
    fn from(value: i64) -> Self {
        MapKey::from_signed(value)
    }
}

impl From<i32> for MapKey<'_> {
    fn from(value: i32) -> Self {
        MapKey::from_signed(i64::from(value))
    }
}

impl From<f64> for MapKey<'_> {
    fn from(value: f64) -> Self {
        MapKey::from_float(value)
    }
}

impl<'k> From<&'k str> for MapKey<'k> {
    fn from(value: &'k str) -> Self {
        MapKey::from_bytes(value.as_bytes())
    }
}

impl<'k> From<&'k [u8]> for MapKey<'k> {
    fn from(value: &'k [u8]) -> Self {
        MapKey::from_bytes(value)
    }
}

/// Outcome of comparing a search key against one stored key tag.
enum KeyCompare {
    /// The stored key equals the search key.
    Match,
    /// Same hash and format, different value; keep scanning.
    Mismatch,
    /// Past the equal-hash run; stop scanning.
    RangeEnd,
}

// ---------------------------------------------------------------------------

/// An owned, 8-byte-aligned backing buffer for archive bytes.
///
/// `Archive::new` insists on an 8-aligned base address; a plain `Vec<u8>`
/// cannot promise that. This buffer stores words in `u64` storage and
/// hands out a correctly aligned byte view.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBytes {
    storage: Vec<u64>,
    len: usize,
}

impl ArchiveBytes {
    /// Copy raw bytes (e.g. read from a file) into aligned storage.
    pub fn copy_from(bytes: &[u8]) -> Self {
        let mut storage = vec![0u64; (bytes.len() + 7) / 8];
        // Safety-free byte copy into the u64 backing store.
        for (index, chunk) in bytes.chunks(8).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            storage[index] = u64::from_le_bytes(word);
        }
        Self {
            storage,
            len: bytes.len(),
        }
    }

    pub(crate) fn from_words(words: &[Word]) -> Self {
        let mut bytes = Vec::with_capacity(words.len() * WORD_BYTES);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        Self::copy_from(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // Safety: u64 storage reinterpreted as bytes; length never exceeds
        // the allocation.
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ---------------------------------------------------------------------------

/// A validated read-only archive over a borrowed byte slice.
///
/// Immutable after construction and freely shareable across threads.
#[derive(Debug, Clone, Copy)]
pub struct Archive<'a> {
    bytes: &'a [u8],
}

impl<'a> Archive<'a> {
    /// Validate and wrap a byte slice. The base address must be 8-byte
    /// aligned, the length a multiple of 4, and word 0 must carry the
    /// `'pbon'` magic.
    pub fn new(bytes: &'a [u8]) -> Result<Self, ArchiveError> {
        if bytes.as_ptr() as usize % 8 != 0 {
            return Err(ArchiveError::UnalignedBase);
        }
        if bytes.len() % WORD_BYTES != 0 {
            return Err(ArchiveError::OddLength(bytes.len()));
        }
        let archive = Self { bytes };
        let Some(sentinel) = archive.word(0) else {
            return Err(ArchiveError::MissingSentinel);
        };
        if sentinel != MAGIC {
            tracing::warn!(sentinel, "rejecting archive with bad magic");
            return Err(ArchiveError::BadMagic(sentinel));
        }
        Ok(archive)
    }

    /// Number of words in the archive, sentinel included.
    pub fn word_count(&self) -> usize {
        self.bytes.len() / WORD_BYTES
    }

    /// Cursor of the root value.
    pub fn root(&self) -> Cursor {
        Cursor(ROOT_WORD)
    }

    fn word(&self, index: usize) -> Option<Word> {
        let offset = index.checked_mul(WORD_BYTES)?;
        let bytes = self.bytes.get(offset..offset + WORD_BYTES)?;
        Some(Word::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn word_u64(&self, index: usize) -> Option<u64> {
        let offset = index.checked_mul(WORD_BYTES)?;
        let bytes = self.bytes.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn tag(&self, cursor: Cursor) -> Word {
        self.word(cursor.0).unwrap_or(0)
    }

    fn format(&self, cursor: Cursor) -> u8 {
        (self.tag(cursor) >> FORMAT_SHIFT) as u8
    }

    /// Kind of the value at `cursor`. Out-of-range cursors read as Nil.
    pub fn kind(&self, cursor: Cursor) -> Kind {
        kind_of_format(self.format(cursor))
    }

    // -- numerics -----------------------------------------------------------

    /// Whether `cursor` points at a numeric value.
    pub fn is_numeric(&self, cursor: Cursor) -> bool {
        self.format(cursor) >= FORMAT_UNSIGNED_IMMEDIATE
    }

    /// Read the numeric at `cursor` as `T`, reporting exactness.
    /// `None` when the cursor does not point at a numeric.
    pub fn read_numeric<T: Numeric>(&self, cursor: Cursor) -> Option<Exact<T>> {
        let tag = self.tag(cursor);
        let payload = tag & PAYLOAD_MASK;
        let (value, exact) = match (tag >> FORMAT_SHIFT) as u8 {
            FORMAT_UNSIGNED_IMMEDIATE => T::from_unsigned(u64::from(payload)),
            FORMAT_UNSIGNED_32 => T::from_unsigned(u64::from(self.word(payload as usize)?)),
            FORMAT_UNSIGNED_64 => T::from_unsigned(self.word_u64(payload as usize)?),
            FORMAT_NEGATIVE_IMMEDIATE => {
                T::from_signed(i64::from((payload | FORMAT_BITS) as i32))
            }
            FORMAT_NEGATIVE_32 => {
                T::from_signed(i64::from(self.word(payload as usize)? as i32))
            }
            FORMAT_NEGATIVE_64 => T::from_signed(self.word_u64(payload as usize)? as i64),
            FORMAT_FLOATING_32 => T::from_f32(f32::from_bits(self.word(payload as usize)?)),
            FORMAT_FLOATING_64 => T::from_f64(f64::from_bits(self.word_u64(payload as usize)?)),
            _ => return None,
        };
        Some(Exact { value, exact })
    }

    /// Read the numeric at `cursor`, falling back to `default` when the
    /// cursor is not numeric.
    pub fn numeric_or<T: Numeric>(&self, cursor: Cursor, default: T) -> T {
        self.read_numeric(cursor)
            .map(|exact| exact.value)
            .unwrap_or(default)
    }

    // -- booleans -----------------------------------------------------------

    /// Read the boolean at `cursor`; `None` when it is not a boolean.
    pub fn boolean(&self, cursor: Cursor) -> Option<bool> {
        let tag = self.tag(cursor);
        if (tag >> FORMAT_SHIFT) as u8 == FORMAT_BOOLEAN {
            Some(tag & PAYLOAD_MASK != 0)
        } else {
            None
        }
    }

    // -- strings and extended bytes -----------------------------------------

    /// Bytes of the string at `cursor`; `None` when it is not a string.
    pub fn string_data(&self, cursor: Cursor) -> Option<&'a [u8]> {
        let body = self.body_index(cursor, FORMAT_STRING)?;
        self.raw_data(body, 2)
    }

    /// Byte length of the string at `cursor`; zero when it is not a string.
    pub fn string_size(&self, cursor: Cursor) -> usize {
        self.body_index(cursor, FORMAT_STRING)
            .and_then(|body| self.word(body))
            .map(|size| size as usize)
            .unwrap_or(0)
    }

    /// Bytes and kind word of the extended value at `cursor`.
    pub fn extended_data(&self, cursor: Cursor) -> Option<(&'a [u8], Word)> {
        let body = self.body_index(cursor, FORMAT_EXTENDED)?;
        let kind = self.word(body + 2)?;
        Some((self.raw_data(body, 3)?, kind))
    }

    /// Byte length of the extended value; zero when not extended.
    pub fn extended_size(&self, cursor: Cursor) -> usize {
        self.body_index(cursor, FORMAT_EXTENDED)
            .and_then(|body| self.word(body))
            .map(|size| size as usize)
            .unwrap_or(0)
    }

    /// Kind word of the extended value; zero when not extended.
    pub fn extended_kind(&self, cursor: Cursor) -> Word {
        self.body_index(cursor, FORMAT_EXTENDED)
            .and_then(|body| self.word(body + 2))
            .unwrap_or(0)
    }

    fn body_index(&self, cursor: Cursor, expected_format: u8) -> Option<usize> {
        let tag = self.tag(cursor);
        if (tag >> FORMAT_SHIFT) as u8 != expected_format {
            return None;
        }
        Some((tag & PAYLOAD_MASK) as usize)
    }

    /// Payload bytes of a raw body whose header spans `header_words`.
    fn raw_data(&self, body: usize, header_words: usize) -> Option<&'a [u8]> {
        let size = self.word(body)? as usize;
        let offset = (body + header_words).checked_mul(WORD_BYTES)?;
        self.bytes.get(offset..offset.checked_add(size)?)
    }

    // -- containers ---------------------------------------------------------

    /// Whether `cursor` points at an array or map.
    pub fn is_container(&self, cursor: Cursor) -> bool {
        matches!(self.format(cursor), FORMAT_ARRAY | FORMAT_MAP)
    }

    /// Element count of the container; zero when not a container.
    pub fn container_size(&self, cursor: Cursor) -> usize {
        self.container_header(cursor)
            .and_then(|header| self.word(header))
            .map(|size| size as usize)
            .unwrap_or(0)
    }

    /// Cursor of the `index`-th element of the container.
    pub fn container_at(&self, container: Cursor, index: usize) -> Option<Cursor> {
        let header = self.container_header(container)?;
        let size = self.word(header)? as usize;
        if index < size {
            Some(Cursor(header + 1 + index))
        } else {
            None
        }
    }

    /// Index of `element` within the container, when it is one of its
    /// elements.
    pub fn container_index(&self, container: Cursor, element: Cursor) -> Option<usize> {
        let header = self.container_header(container)?;
        let size = self.word(header)? as usize;
        let begin = header + 1;
        if begin <= element.0 && element.0 < begin + size {
            Some(element.0 - begin)
        } else {
            None
        }
    }

    /// Sub-range of a container. Non-negative offsets count from the
    /// front; a negative `front_offset` and a non-positive `back_offset`
    /// count from the back. An invalid range yields the empty slice.
    pub fn container_slice(&self, container: Cursor, front_offset: isize, back_offset: isize) -> Slice {
        let Some(header) = self.container_header(container) else {
            return Slice::default();
        };
        let Some(size) = self.word(header) else {
            return Slice::default();
        };
        let start = (header + 1) as isize;
        let size = size as isize;
        let mut begin = start + front_offset;
        if front_offset < 0 {
            begin += size;
        }
        let mut end = start + back_offset;
        if back_offset <= 0 {
            end += size;
        }
        if start <= begin && begin < end && end <= start + size {
            Slice {
                begin: begin as usize,
                end: end as usize,
            }
        } else {
            Slice::default()
        }
    }

    fn container_header(&self, cursor: Cursor) -> Option<usize> {
        let tag = self.tag(cursor);
        match (tag >> FORMAT_SHIFT) as u8 {
            FORMAT_ARRAY | FORMAT_MAP => Some((tag & PAYLOAD_MASK) as usize),
            _ => None,
        }
    }

    // -- maps ---------------------------------------------------------------

    /// Cursor of the `index`-th key of the map.
    pub fn map_key_at(&self, map: Cursor, index: usize) -> Option<Cursor> {
        let (_, _, key_header) = self.map_headers(map)?;
        let size = self.word(key_header)? as usize;
        if index < size {
            Some(Cursor(key_header + 1 + index))
        } else {
            None
        }
    }

    /// Cursor of the key paired with a value element of the map.
    pub fn map_key_of(&self, map: Cursor, value: Cursor) -> Option<Cursor> {
        let (value_header, size, key_header) = self.map_headers(map)?;
        let begin = value_header + 1;
        if begin <= value.0 && value.0 < begin + size {
            Some(Cursor(key_header + 1 + (value.0 - begin)))
        } else {
            None
        }
    }

    /// Look up the value stored under `key`.
    ///
    /// Lower-bounds the sorted key container by `(hash, format)`, then
    /// scans the equal-hash run comparing stored values. `None` when the
    /// cursor is not a map or the key is absent.
    pub fn map_value<'k>(&self, map: Cursor, key: impl Into<MapKey<'k>>) -> Option<Cursor> {
        self.lookup_map(map, &key.into())
    }

    /// Look up a value using a key referenced by a cursor into this
    /// archive.
    pub fn map_value_by_cursor(&self, map: Cursor, key: Cursor) -> Option<Cursor> {
        self.map_value_from(map, key, self)
    }

    /// Look up a value using a key referenced by a cursor into another
    /// archive.
    ///
    /// Container-valued keys are unsupported and yield `None`.
    pub fn map_value_from(&self, map: Cursor, key: Cursor, key_archive: &Archive<'_>) -> Option<Cursor> {
        match key_archive.format(key) {
            FORMAT_BOOLEAN => {
                self.lookup_map(map, &MapKey::from_bool(key_archive.boolean(key)?))
            }
            FORMAT_UNSIGNED_IMMEDIATE | FORMAT_UNSIGNED_32 | FORMAT_UNSIGNED_64 => {
                let read = key_archive.read_numeric::<u64>(key)?;
                self.lookup_map(map, &MapKey::from_unsigned(read.value))
            }
            FORMAT_NEGATIVE_IMMEDIATE | FORMAT_NEGATIVE_32 | FORMAT_NEGATIVE_64 => {
                let read = key_archive.read_numeric::<i64>(key)?;
                self.lookup_map(map, &MapKey::from_signed(read.value))
            }
            FORMAT_FLOATING_32 | FORMAT_FLOATING_64 => {
                let read = key_archive.read_numeric::<f64>(key)?;
                self.lookup_map(map, &MapKey::from_float(read.value))
            }
            FORMAT_STRING => {
                self.lookup_map(map, &MapKey::from_bytes(key_archive.string_data(key)?))
            }
            FORMAT_EXTENDED => {
                let (data, kind) = key_archive.extended_data(key)?;
                self.lookup_map(map, &MapKey::from_extended(data, kind))
            }
            _ => None,
        }
    }

    /// Value header index, element count, and key header index of a map.
    fn map_headers(&self, map: Cursor) -> Option<(usize, usize, usize)> {
        let tag = self.tag(map);
        if (tag >> FORMAT_SHIFT) as u8 != FORMAT_MAP {
            return None;
        }
        let value_header = (tag & PAYLOAD_MASK) as usize;
        let size = self.word(value_header)? as usize;
        // The key container directly follows the last value element.
        Some((value_header, size, value_header + 1 + size))
    }

    fn lookup_map(&self, map: Cursor, key: &MapKey<'_>) -> Option<Cursor> {
        let (value_header, size, key_header) = self.map_headers(map)?;
        let key_size = (self.word(key_header)? as usize).min(size);
        let key_begin = key_header + 1;

        // Lower bound on (hash, format) over the key tags.
        let mut low = 0usize;
        let mut high = key_size;
        while low < high {
            let middle = (low + high) / 2;
            let tag = self.word(key_begin + middle)?;
            if self.compare_hash(key, tag) == std::cmp::Ordering::Greater {
                low = middle + 1;
            } else {
                high = middle;
            }
        }

        // Linear scan of the equal-hash run.
        for index in low..key_size {
            let tag = self.word(key_begin + index)?;
            match self.compare_key_value(key, tag) {
                KeyCompare::Match => return Some(Cursor(value_header + 1 + index)),
                KeyCompare::Mismatch => continue,
                KeyCompare::RangeEnd => break,
            }
        }
        None
    }

    /// Order a search key against a stored key tag by `(hash, format)`.
    fn compare_hash(&self, key: &MapKey<'_>, tag: Word) -> std::cmp::Ordering {
        let stored_hash = self.hash_of_tag(tag);
        let stored_format = (tag >> FORMAT_SHIFT) as u8;
        (key.hash, key.format).cmp(&(stored_hash, stored_format))
    }

    /// Full value comparison after the lower bound positioned the scan.
    fn compare_key_value(&self, key: &MapKey<'_>, tag: Word) -> KeyCompare {
        let format = (tag >> FORMAT_SHIFT) as u8;
        if format != key.format {
            // Keys are sorted by (hash, format): a format change inside
            // the scan means the equal run is over.
            return KeyCompare::RangeEnd;
        }
        let payload = tag & PAYLOAD_MASK;
        match format {
            FORMAT_BOOLEAN | FORMAT_UNSIGNED_IMMEDIATE => {
                let KeyBody::Bits32(bits) = key.body else {
                    return KeyCompare::RangeEnd;
                };
                if payload == bits {
                    KeyCompare::Match
                } else {
                    KeyCompare::RangeEnd
                }
            }
            FORMAT_NEGATIVE_IMMEDIATE => {
                let KeyBody::Bits32(bits) = key.body else {
                    return KeyCompare::RangeEnd;
                };
                if payload | FORMAT_BITS == bits {
                    KeyCompare::Match
                } else {
                    KeyCompare::RangeEnd
                }
            }
            FORMAT_UNSIGNED_32 | FORMAT_NEGATIVE_32 | FORMAT_FLOATING_32 => {
                let (KeyBody::Bits32(bits), Some(body)) = (key.body, self.word(payload as usize))
                else {
                    return KeyCompare::RangeEnd;
                };
                if body == bits {
                    KeyCompare::Match
                } else {
                    KeyCompare::RangeEnd
                }
            }
            FORMAT_UNSIGNED_64 | FORMAT_NEGATIVE_64 | FORMAT_FLOATING_64 => {
                let (KeyBody::Bits64(bits), Some(body)) =
                    (key.body, self.word_u64(payload as usize))
                else {
                    return KeyCompare::RangeEnd;
                };
                if key.hash != fold_u64(body) {
                    KeyCompare::RangeEnd
                } else if body == bits {
                    KeyCompare::Match
                } else {
                    KeyCompare::Mismatch
                }
            }
            FORMAT_STRING | FORMAT_EXTENDED => {
                let KeyBody::Raw { data, kind } = key.body else {
                    return KeyCompare::RangeEnd;
                };
                let body = payload as usize;
                let Some(stored_hash) = self.word(body + 1) else {
                    return KeyCompare::RangeEnd;
                };
                if key.hash != stored_hash {
                    return KeyCompare::RangeEnd;
                }
                let Some(stored_size) = self.word(body) else {
                    return KeyCompare::RangeEnd;
                };
                if stored_size as usize != data.len() {
                    return KeyCompare::Mismatch;
                }
                let header_words = if format == FORMAT_EXTENDED {
                    if kind != self.word(body + 2) {
                        return KeyCompare::Mismatch;
                    }
                    3
                } else {
                    2
                };
                // Equal hash and equal size imply equal bytes; verified
                // in debug builds only.
                debug_assert_eq!(self.raw_data(body, header_words), Some(data));
                let _ = header_words;
                KeyCompare::Match
            }
            _ => KeyCompare::RangeEnd,
        }
    }

    /// Hash of the value a key tag points at, per the storage format.
    fn hash_of_tag(&self, tag: Word) -> u32 {
        let format = (tag >> FORMAT_SHIFT) as u8;
        let payload = tag & PAYLOAD_MASK;
        match format {
            FORMAT_BOOLEAN | FORMAT_UNSIGNED_IMMEDIATE => payload,
            FORMAT_NEGATIVE_IMMEDIATE => payload | FORMAT_BITS,
            FORMAT_UNSIGNED_32 | FORMAT_NEGATIVE_32 | FORMAT_FLOATING_32 => {
                self.word(payload as usize).unwrap_or(u32::MAX)
            }
            FORMAT_UNSIGNED_64 | FORMAT_NEGATIVE_64 | FORMAT_FLOATING_64 => self
                .word_u64(payload as usize)
                .map(fold_u64)
                .unwrap_or(u32::MAX),
            FORMAT_STRING | FORMAT_EXTENDED => {
                self.word(payload as usize + 1).unwrap_or(u32::MAX)
            }
            _ => u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binarc_build::Node;

    fn archive_of(node: &Node) -> ArchiveBytes {
        crate::binarc_build::build(node)
    }

    #[test]
    fn test_rejects_bad_input() {
        // Odd length.
        let buffer = ArchiveBytes::copy_from(&[0u8; 7]);
        assert!(matches!(
            Archive::new(buffer.as_bytes()),
            Err(ArchiveError::OddLength(7))
        ));
        // Empty (aligned) input has no sentinel word.
        let empty = ArchiveBytes::copy_from(&[]);
        assert!(matches!(
            Archive::new(empty.as_bytes()),
            Err(ArchiveError::MissingSentinel)
        ));
        // Wrong magic.
        let buffer = ArchiveBytes::copy_from(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(
            Archive::new(buffer.as_bytes()),
            Err(ArchiveError::BadMagic(_))
        ));
    }

    #[test]
    fn test_root_kinds() {
        let cases: Vec<(Node, Kind)> = vec![
            (Node::Nil, Kind::Nil),
            (Node::Bool(true), Kind::Boolean),
            (Node::Unsigned(7), Kind::Unsigned),
            (Node::Signed(-7), Kind::Negative),
            (Node::Float(0.5), Kind::Floating),
            (Node::from("hi"), Kind::String),
            (Node::Array(vec![]), Kind::Array),
            (Node::Map(vec![]), Kind::Map),
        ];
        for (node, kind) in cases {
            let buffer = archive_of(&node);
            let archive = Archive::new(buffer.as_bytes()).unwrap();
            assert_eq!(archive.kind(archive.root()), kind, "{node:?}");
        }
    }

    #[test]
    fn test_numeric_formats_round_trip() {
        for value in [0u64, 1, 0x0fff_ffff, 0x1000_0000, u64::from(u32::MAX), u64::MAX] {
            let buffer = archive_of(&Node::Unsigned(value));
            let archive = Archive::new(buffer.as_bytes()).unwrap();
            let read = archive.read_numeric::<u64>(archive.root()).unwrap();
            assert_eq!(read.value, value);
            assert!(read.exact);
        }
        for value in [-1i64, -0x1000_0000, -0x1000_0001, i64::from(i32::MIN), i64::MIN] {
            let buffer = archive_of(&Node::Signed(value));
            let archive = Archive::new(buffer.as_bytes()).unwrap();
            let read = archive.read_numeric::<i64>(archive.root()).unwrap();
            assert_eq!(read.value, value);
            assert!(read.exact);
        }
    }

    #[test]
    fn test_numeric_exactness() {
        let buffer = archive_of(&Node::Unsigned(300));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        // Narrowing to u8 is lossy and flagged.
        let read = archive.read_numeric::<u8>(archive.root()).unwrap();
        assert!(!read.exact);
        assert_eq!(read.value, 44);

        let buffer = archive_of(&Node::Signed(-5));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        // Negative into unsigned is lossy.
        assert!(!archive.read_numeric::<u32>(archive.root()).unwrap().exact);
        // Negative into wider signed is exact.
        assert!(archive.read_numeric::<i8>(archive.root()).unwrap().exact);

        let buffer = archive_of(&Node::Float(0.5));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        assert_eq!(archive.numeric_or(archive.root(), 0.0f64), 0.5);
        assert!(!archive.read_numeric::<u32>(archive.root()).unwrap().exact);
    }

    #[test]
    fn test_boolean() {
        let buffer = archive_of(&Node::Bool(true));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        assert_eq!(archive.boolean(archive.root()), Some(true));
        assert_eq!(archive.read_numeric::<u32>(archive.root()), None);

        let buffer = archive_of(&Node::Unsigned(1));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        assert_eq!(archive.boolean(archive.root()), None);
    }

    #[test]
    fn test_string_body() {
        let buffer = archive_of(&Node::from("hello binarc"));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();
        assert_eq!(archive.string_data(root), Some(&b"hello binarc"[..]));
        assert_eq!(archive.string_size(root), 12);
        assert_eq!(archive.extended_size(root), 0);
    }

    #[test]
    fn test_extended_body() {
        let node = Node::Extended {
            kind: 42,
            data: vec![1, 2, 3, 4, 5],
        };
        let buffer = archive_of(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();
        let (data, kind) = archive.extended_data(root).unwrap();
        assert_eq!(data, &[1, 2, 3, 4, 5]);
        assert_eq!(kind, 42);
        assert_eq!(archive.extended_kind(root), 42);
        assert_eq!(archive.string_data(root), None);
    }

    #[test]
    fn test_array_access() {
        let node = Node::Array(vec![Node::Unsigned(10), Node::Unsigned(20), Node::Unsigned(30)]);
        let buffer = archive_of(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();

        assert!(archive.is_container(root));
        assert_eq!(archive.container_size(root), 3);
        for index in 0..3 {
            let element = archive.container_at(root, index).unwrap();
            assert_eq!(archive.numeric_or(element, 0u32), 10 * (index as u32 + 1));
            assert_eq!(archive.container_index(root, element), Some(index));
        }
        assert!(archive.container_at(root, 3).is_none());
    }

    #[test]
    fn test_container_slice() {
        let node = Node::Array((0..5u64).map(Node::Unsigned).collect());
        let buffer = archive_of(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();

        let full = archive.container_slice(root, 0, 0);
        assert_eq!(full.len(), 5);
        let middle = archive.container_slice(root, 1, -1);
        assert_eq!(middle.len(), 3);
        assert_eq!(archive.numeric_or(middle.at(0).unwrap(), 9u64), 1);

        // Walking with advance visits every element in order.
        let mut cursor = full.at(0).unwrap();
        let mut seen = vec![archive.numeric_or(cursor, 99u64)];
        while let Some(next) = full.advance(cursor, 1) {
            cursor = next;
            seen.push(archive.numeric_or(cursor, 99u64));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_map_lookup_by_string() {
        let node = Node::Map(vec![
            (Node::from("a"), Node::Unsigned(1)),
            (Node::from("b"), Node::Unsigned(2)),
        ]);
        let buffer = archive_of(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();

        let value = archive.map_value(root, "b").unwrap();
        assert_eq!(archive.numeric_or(value, 0u32), 2);
        let value = archive.map_value(root, "a").unwrap();
        assert_eq!(archive.numeric_or(value, 0u32), 1);
        assert!(archive.map_value(root, "c").is_none());
    }

    #[test]
    fn test_map_lookup_by_numerics() {
        let node = Node::Map(vec![
            (Node::Unsigned(7), Node::from("seven")),
            (Node::Signed(-7), Node::from("minus")),
            (Node::Float(2.5), Node::from("half")),
            (Node::Bool(true), Node::from("yes")),
        ]);
        let buffer = archive_of(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();

        let at = |cursor| String::from_utf8(archive.string_data(cursor).unwrap().to_vec()).unwrap();
        assert_eq!(at(archive.map_value(root, 7u64).unwrap()), "seven");
        assert_eq!(at(archive.map_value(root, -7i64).unwrap()), "minus");
        assert_eq!(at(archive.map_value(root, 2.5f64).unwrap()), "half");
        assert_eq!(at(archive.map_value(root, true).unwrap()), "yes");
        // A whole float key demotes to the integer key.
        assert_eq!(at(archive.map_value(root, 7.0f64).unwrap()), "seven");
        assert!(archive.map_value(root, 8u64).is_none());
    }

    #[test]
    fn test_map_keys_pair_with_values() {
        let node = Node::Map(vec![
            (Node::from("x"), Node::Unsigned(1)),
            (Node::from("y"), Node::Unsigned(2)),
        ]);
        let buffer = archive_of(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();

        for index in 0..2 {
            let key = archive.map_key_at(root, index).unwrap();
            let value = archive.map_value_by_cursor(root, key).unwrap();
            let paired_key = archive.map_key_of(root, value).unwrap();
            assert_eq!(key, paired_key);
        }
        assert!(archive.map_key_at(root, 2).is_none());
    }

    #[test]
    fn test_map_lookup_is_not_container_lookup() {
        let buffer = archive_of(&Node::Array(vec![Node::Unsigned(1)]));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        // An array is not a map.
        assert!(archive.map_value(archive.root(), 0u64).is_none());
        assert!(archive.map_key_at(archive.root(), 0).is_none());
    }

    #[test]
    fn test_nested_structure() {
        let node = Node::Map(vec![
            (
                Node::from("config"),
                Node::Map(vec![
                    (Node::from("speed"), Node::Float(1.25)),
                    (Node::from("lives"), Node::Unsigned(3)),
                ]),
            ),
            (
                Node::from("levels"),
                Node::Array(vec![Node::from("intro"), Node::from("cave")]),
            ),
        ]);
        let buffer = archive_of(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();

        let config = archive.map_value(root, "config").unwrap();
        let speed = archive.map_value(config, "speed").unwrap();
        assert_eq!(archive.numeric_or(speed, 0.0f64), 1.25);
        let lives = archive.map_value(config, "lives").unwrap();
        assert_eq!(archive.numeric_or(lives, 0u8), 3);

        let levels = archive.map_value(root, "levels").unwrap();
        assert_eq!(archive.container_size(levels), 2);
        let cave = archive.container_at(levels, 1).unwrap();
        assert_eq!(archive.string_data(cave), Some(&b"cave"[..]));
    }
}
