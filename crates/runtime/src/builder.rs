//! Status builder: seeds a reservoir from a parsed text table.
//!
//! Content teams describe initial state in a table with three attribute
//! columns: the state's name, its kind, and its initial value:
//!
//! ```text
//! KEY        KIND         VALUE
//! health     UNSIGNED_16  100
//! alive      BOOL         true
//! speed      FLOAT        2.5
//! delta      SIGNED_8     -5
//! ```
//!
//! The builder walks the rows, mints status keys from the name cells
//! through an injected hash function, and registers each state into one
//! chunk. Rows that fail to parse are skipped and logged; everything
//! else registers.

use crate::reservoir::{Key, Reservoir};
use crate::table::{ParseCell, StringTable};

/// Default header names of the three attribute columns.
pub const COLUMN_KEY: &str = "KEY";
pub const COLUMN_KIND: &str = "KIND";
pub const COLUMN_VALUE: &str = "VALUE";

/// Parsed form of a KIND cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusKind {
    Bool,
    Float,
    Unsigned(u8),
    Signed(u8),
}

/// Parse a kind cell: `BOOL`, `FLOAT`, `UNSIGNED_<N>`, or `SIGNED_<N>`
/// with a bit width of 2..=64.
fn parse_kind(cell: &str) -> Option<StatusKind> {
    let cell = cell.trim();
    match cell {
        "BOOL" => return Some(StatusKind::Bool),
        "FLOAT" => return Some(StatusKind::Float),
        _ => {}
    }
    if let Some(bits) = cell.strip_prefix("UNSIGNED_") {
        let bits: u8 = bits.parse().ok()?;
        return (2..=64).contains(&bits).then_some(StatusKind::Unsigned(bits));
    }
    if let Some(bits) = cell.strip_prefix("SIGNED_") {
        let bits: u8 = bits.parse().ok()?;
        return (2..=64).contains(&bits).then_some(StatusKind::Signed(bits));
    }
    None
}

/// Seeds reservoirs from tables. Holds the attribute column names so
/// hosts with different header conventions can rename them.
#[derive(Debug, Clone)]
pub struct StatusBuilder {
    key_column: String,
    kind_column: String,
    value_column: String,
}

impl Default for StatusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBuilder {
    pub fn new() -> Self {
        Self {
            key_column: COLUMN_KEY.to_owned(),
            kind_column: COLUMN_KIND.to_owned(),
            value_column: COLUMN_VALUE.to_owned(),
        }
    }

    /// Use custom attribute column names.
    pub fn with_columns(key: &str, kind: &str, value: &str) -> Self {
        Self {
            key_column: key.to_owned(),
            kind_column: kind.to_owned(),
            value_column: value.to_owned(),
        }
    }

    /// Register every well-formed row of `table` into `chunk_key`.
    ///
    /// `hash` mints a status key from a name cell. Returns how many
    /// states registered; rows with an empty name, an unknown kind, an
    /// unparseable value, or a duplicate key are skipped.
    pub fn build<S, C, T, H>(
        &self,
        reservoir: &mut Reservoir<S, C>,
        chunk_key: C,
        table: &T,
        hash: H,
    ) -> usize
    where
        S: Key,
        C: Key,
        T: StringTable + ?Sized,
        H: Fn(&str) -> S,
    {
        let Some(key_column) = table.find_column(&self.key_column) else {
            tracing::warn!(column = %self.key_column, "status table lacks the key column");
            return 0;
        };
        let Some(kind_column) = table.find_column(&self.kind_column) else {
            tracing::warn!(column = %self.kind_column, "status table lacks the kind column");
            return 0;
        };
        let Some(value_column) = table.find_column(&self.value_column) else {
            tracing::warn!(column = %self.value_column, "status table lacks the value column");
            return 0;
        };

        let mut registered = 0;
        for row in 0..table.row_count() {
            let name = table.cell(row, key_column).trim();
            if name.is_empty() {
                continue;
            }
            let Some(kind) = parse_kind(table.cell(row, kind_column)) else {
                tracing::warn!(row, name, "status row has an unknown kind");
                continue;
            };
            let status_key = hash(name);
            let value_cell = table.cell(row, value_column);
            let ok = match kind {
                StatusKind::Bool => bool::parse_cell(value_cell)
                    .map(|value| reservoir.register_bool(chunk_key, status_key, value)),
                StatusKind::Float => f64::parse_cell(value_cell)
                    .map(|value| reservoir.register_float(chunk_key, status_key, value)),
                StatusKind::Unsigned(bits) => u64::parse_cell(value_cell)
                    .map(|value| reservoir.register_unsigned(chunk_key, status_key, value, bits)),
                StatusKind::Signed(bits) => i64::parse_cell(value_cell)
                    .map(|value| reservoir.register_signed(chunk_key, status_key, value, bits)),
            };
            match ok {
                Some(true) => registered += 1,
                Some(false) => {
                    tracing::warn!(row, name, "status row failed to register");
                }
                None => {
                    tracing::warn!(row, name, "status row has an unparseable value");
                }
            }
        }
        tracing::debug!(registered, rows = table.row_count(), "status table built");
        registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTable;
    use tarn_core::hash::fnv1_32;
    use tarn_core::value::StateValue;

    fn hash(name: &str) -> u32 {
        fnv1_32(name.as_bytes())
    }

    fn status_table() -> MemoryTable {
        let mut table = MemoryTable::new(["KEY", "KIND", "VALUE"]);
        table.push_row(["health", "UNSIGNED_16", "100"]);
        table.push_row(["alive", "BOOL", "true"]);
        table.push_row(["speed", "FLOAT", "2.5"]);
        table.push_row(["delta", "SIGNED_8", "-5"]);
        table
    }

    #[test]
    fn test_build_registers_each_kind() {
        let mut reservoir = Reservoir::new(8, 1);
        let built = StatusBuilder::new().build(&mut reservoir, 1u32, &status_table(), hash);
        assert_eq!(built, 4);
        assert_eq!(reservoir.value(hash("health")), StateValue::Unsigned(100));
        assert_eq!(reservoir.value(hash("alive")), StateValue::Bool(true));
        assert_eq!(reservoir.value(hash("speed")), StateValue::Float(2.5));
        assert_eq!(reservoir.value(hash("delta")), StateValue::Signed(-5));
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let mut table = status_table();
        table.push_row(["", "BOOL", "true"]);
        table.push_row(["bad-kind", "INT", "1"]);
        table.push_row(["bad-width", "UNSIGNED_65", "1"]);
        table.push_row(["bad-value", "UNSIGNED_8", "lots"]);
        table.push_row(["health", "UNSIGNED_16", "1"]);

        let mut reservoir = Reservoir::new(8, 1);
        let built = StatusBuilder::new().build(&mut reservoir, 1u32, &table, hash);
        // Only the four original rows registered; the duplicate kept its
        // first value.
        assert_eq!(built, 4);
        assert_eq!(reservoir.value(hash("health")), StateValue::Unsigned(100));
        assert_eq!(reservoir.value(hash("bad-kind")), StateValue::Empty);
    }

    #[test]
    fn test_missing_column_builds_nothing() {
        let mut table = MemoryTable::new(["NAME", "KIND", "VALUE"]);
        table.push_row(["health", "UNSIGNED_16", "100"]);
        let mut reservoir = Reservoir::<u32, u32>::new(4, 1);
        assert_eq!(StatusBuilder::new().build(&mut reservoir, 1, &table, hash), 0);

        // Renamed columns make the same table usable.
        let built =
            StatusBuilder::with_columns("NAME", "KIND", "VALUE").build(&mut reservoir, 1, &table, hash);
        assert_eq!(built, 1);
    }
}
