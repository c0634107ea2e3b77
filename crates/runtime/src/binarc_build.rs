//! BINARC writer: builds well-formed archives from a value tree.
//!
//! The reader side is the product surface; this builder exists for
//! tooling and tests that need real archives without an offline pipeline.
//! It mirrors the reader's classification rules exactly: the smallest
//! numeric format wins, map keys sort by `(hash, format)` ascending, and
//! the key container directly follows its value container.

use tarn_core::hash::fnv1_32;

use crate::binarc::{ArchiveBytes, MapKey, Word, MAGIC};
use crate::binarc::{
    FORMAT_ARRAY, FORMAT_BITS, FORMAT_BOOLEAN, FORMAT_EXTENDED, FORMAT_FLOATING_32,
    FORMAT_FLOATING_64, FORMAT_MAP, FORMAT_NEGATIVE_32, FORMAT_NEGATIVE_64,
    FORMAT_NEGATIVE_IMMEDIATE, FORMAT_SHIFT, FORMAT_STRING, FORMAT_UNSIGNED_32,
    FORMAT_UNSIGNED_64, FORMAT_UNSIGNED_IMMEDIATE, PAYLOAD_MASK,
};

/// A value tree to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Nil,
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Str(String),
    Extended { kind: Word, data: Vec<u8> },
    Array(Vec<Node>),
    /// Entries in insertion order; the builder sorts the on-disk key
    /// container itself.
    Map(Vec<(Node, Node)>),
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Str(value.to_owned())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Str(value)
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Bool(value)
    }
}

impl From<u64> for Node {
    fn from(value: u64) -> Self {
        Node::Unsigned(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Signed(value)
    }
}

impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Node::Float(value)
    }
}

/// Encode a value tree into an aligned archive buffer.
pub fn build(root: &Node) -> ArchiveBytes {
    let mut writer = Writer {
        // Word 0 carries the magic; word 1 is patched with the root tag.
        words: vec![MAGIC, 0],
    };
    let root_tag = writer.write_node(root);
    writer.words[1] = root_tag;
    ArchiveBytes::from_words(&writer.words)
}

struct Writer {
    words: Vec<Word>,
}

impl Writer {
    /// Encode one node, appending any body words, and return its tag.
    fn write_node(&mut self, node: &Node) -> Word {
        match node {
            Node::Nil => 0,
            Node::Bool(value) => tag(FORMAT_BOOLEAN, Word::from(*value)),
            Node::Unsigned(value) => self.write_unsigned(*value),
            Node::Signed(value) => self.write_signed(*value),
            Node::Float(value) => self.write_float(*value),
            Node::Str(value) => {
                let body = self.write_raw_body(value.as_bytes(), None);
                tag(FORMAT_STRING, body)
            }
            Node::Extended { kind, data } => {
                let body = self.write_raw_body(data, Some(*kind));
                tag(FORMAT_EXTENDED, body)
            }
            Node::Array(children) => {
                let child_tags: Vec<Word> =
                    children.iter().map(|child| self.write_node(child)).collect();
                let header = self.here();
                self.words.push(child_tags.len() as Word);
                self.words.extend_from_slice(&child_tags);
                tag(FORMAT_ARRAY, header)
            }
            Node::Map(entries) => self.write_map(entries),
        }
    }

    fn write_unsigned(&mut self, value: u64) -> Word {
        if value <= u64::from(PAYLOAD_MASK) {
            tag(FORMAT_UNSIGNED_IMMEDIATE, value as Word)
        } else if value <= u64::from(u32::MAX) {
            let body = self.push_word(value as Word);
            tag(FORMAT_UNSIGNED_32, body)
        } else {
            let body = self.push_u64(value);
            tag(FORMAT_UNSIGNED_64, body)
        }
    }

    fn write_signed(&mut self, value: i64) -> Word {
        if value >= 0 {
            return self.write_unsigned(value as u64);
        }
        if value >= i64::from(i32::MIN) {
            let bits = value as i32 as u32;
            if bits >= FORMAT_BITS {
                // The top four bits are all ones: recoverable from the
                // 28-bit payload by sign extension.
                tag(FORMAT_NEGATIVE_IMMEDIATE, bits & PAYLOAD_MASK)
            } else {
                let body = self.push_word(bits);
                tag(FORMAT_NEGATIVE_32, body)
            }
        } else {
            let body = self.push_u64(value as u64);
            tag(FORMAT_NEGATIVE_64, body)
        }
    }

    fn write_float(&mut self, value: f64) -> Word {
        let narrowed = value as f32;
        if f64::from(narrowed) == value {
            let body = self.push_word(narrowed.to_bits());
            tag(FORMAT_FLOATING_32, body)
        } else {
            let body = self.push_u64(value.to_bits());
            tag(FORMAT_FLOATING_64, body)
        }
    }

    /// Body: `{size, hash[, kind]}` header plus data padded to whole
    /// words. Returns the header's word index.
    fn write_raw_body(&mut self, data: &[u8], kind: Option<Word>) -> Word {
        let header = self.here();
        self.words.push(data.len() as Word);
        self.words.push(fnv1_32(data));
        if let Some(kind) = kind {
            self.words.push(kind);
        }
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.words.push(Word::from_le_bytes(word));
        }
        header
    }

    fn write_map(&mut self, entries: &[(Node, Node)]) -> Word {
        // Sort by the same (hash, format) pair the reader's lower bound
        // uses. Container and nil keys get pushed to the end; they are
        // stored but never found by lookup.
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by_key(|&index| key_rank(&entries[index].0));

        let value_tags: Vec<Word> = order
            .iter()
            .map(|&index| self.write_node(&entries[index].1))
            .collect();
        let key_tags: Vec<Word> = order
            .iter()
            .map(|&index| self.write_node(&entries[index].0))
            .collect();

        // The two containers must be contiguous: values, then keys.
        let value_header = self.here();
        self.words.push(value_tags.len() as Word);
        self.words.extend_from_slice(&value_tags);
        self.words.push(key_tags.len() as Word);
        self.words.extend_from_slice(&key_tags);
        tag(FORMAT_MAP, value_header)
    }

    fn here(&self) -> Word {
        debug_assert!(self.words.len() as u64 <= u64::from(PAYLOAD_MASK));
        self.words.len() as Word
    }

    fn push_word(&mut self, word: Word) -> Word {
        let at = self.here();
        self.words.push(word);
        at
    }

    /// 64-bit bodies sit at 8-byte-aligned offsets (even word indices).
    fn push_u64(&mut self, value: u64) -> Word {
        if self.words.len() % 2 != 0 {
            self.words.push(0);
        }
        let at = self.here();
        self.words.push(value as Word);
        self.words.push((value >> 32) as Word);
        at
    }
}

fn tag(format: u8, payload: Word) -> Word {
    debug_assert!(payload <= PAYLOAD_MASK);
    (Word::from(format) << FORMAT_SHIFT) | (payload & PAYLOAD_MASK)
}

/// Sort rank of a map key: the (hash, format) pair the reader compares.
fn key_rank(node: &Node) -> (u32, u8) {
    let key = match node {
        Node::Bool(value) => MapKey::from_bool(*value),
        Node::Unsigned(value) => MapKey::from_unsigned(*value),
        Node::Signed(value) => MapKey::from_signed(*value),
        Node::Float(value) => MapKey::from_float(*value),
        Node::Str(value) => MapKey::from_bytes(value.as_bytes()),
        Node::Extended { kind, data } => MapKey::from_extended(data, *kind),
        Node::Nil | Node::Array(_) | Node::Map(_) => return (u32::MAX, u8::MAX),
    };
    (key.hash, key.format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binarc::{Archive, Kind};

    #[test]
    fn test_smallest_format_wins() {
        // Each value/expected-format pair exercises one classifier branch.
        let probe = |node: &Node| {
            let buffer = build(node);
            let archive = Archive::new(buffer.as_bytes()).unwrap();
            (archive.kind(archive.root()), buffer.len())
        };

        // Immediates need no body: sentinel + root tag only.
        assert_eq!(probe(&Node::Unsigned(1)), (Kind::Unsigned, 8));
        assert_eq!(probe(&Node::Signed(-1)), (Kind::Negative, 8));
        assert_eq!(probe(&Node::Bool(false)), (Kind::Boolean, 8));
        // One extra body word.
        assert_eq!(probe(&Node::Unsigned(0x1000_0000)), (Kind::Unsigned, 12));
        assert_eq!(probe(&Node::Signed(-0x1000_0001)), (Kind::Negative, 12));
        assert_eq!(probe(&Node::Float(0.5)), (Kind::Floating, 12));
    }

    #[test]
    fn test_u64_bodies_are_aligned() {
        // An odd word count before the body forces a pad word.
        let node = Node::Array(vec![Node::Unsigned(u64::MAX), Node::Unsigned(u64::MAX)]);
        let buffer = build(&node);
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();
        for index in 0..2 {
            let element = archive.container_at(root, index).unwrap();
            let read = archive.read_numeric::<u64>(element).unwrap();
            assert_eq!(read.value, u64::MAX);
        }
    }

    #[test]
    fn test_map_entries_sorted_for_lookup() {
        // Many keys in arbitrary insertion order; every one must be
        // findable, which requires the sorted key container.
        let entries: Vec<(Node, Node)> = (0..32u64)
            .map(|index| (Node::Str(format!("key-{index}")), Node::Unsigned(index)))
            .collect();
        let buffer = build(&Node::Map(entries));
        let archive = Archive::new(buffer.as_bytes()).unwrap();
        let root = archive.root();
        for index in 0..32u64 {
            let name = format!("key-{index}");
            let value = archive.map_value(root, name.as_str()).unwrap();
            assert_eq!(archive.numeric_or(value, u64::MAX), index);
        }
    }

    #[test]
    fn test_string_padding() {
        for length in 0..9usize {
            let text: String = "x".repeat(length);
            let buffer = build(&Node::Str(text.clone()));
            let archive = Archive::new(buffer.as_bytes()).unwrap();
            if length == 0 {
                assert_eq!(archive.string_data(archive.root()), Some(&b""[..]));
            } else {
                assert_eq!(
                    archive.string_data(archive.root()),
                    Some(text.as_bytes())
                );
            }
        }
    }
}
