//! Operation records: comparisons and assignments over reservoir states.
//!
//! Rule engines are built from rows of three cells (a state key, an
//! operator token, and a right-hand operand) evaluated against a
//! reservoir. These records are those rows, parsed once and replayed
//! every frame. The right-hand side is either a literal value or a
//! reference to another state.

use tarn_core::value::StateValue;

use crate::reservoir::{Key, Reservoir};
use crate::table::{parse_state_cell, StringTable};

/// Comparison operator tokens as they appear in rule tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl ComparisonOperator {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Self::Equal),
            "!=" => Some(Self::NotEqual),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterEqual),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
        }
    }
}

/// Assignment operator tokens as they appear in rule tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOperator {
    Copy,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Or,
    Xor,
    And,
}

impl AssignmentOperator {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            ":=" => Some(Self::Copy),
            "+=" => Some(Self::Add),
            "-=" => Some(Self::Sub),
            "*=" => Some(Self::Mul),
            "/=" => Some(Self::Div),
            "%=" => Some(Self::Mod),
            "|=" => Some(Self::Or),
            "^=" => Some(Self::Xor),
            "&=" => Some(Self::And),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Copy => ":=",
            Self::Add => "+=",
            Self::Sub => "-=",
            Self::Mul => "*=",
            Self::Div => "/=",
            Self::Mod => "%=",
            Self::Or => "|=",
            Self::Xor => "^=",
            Self::And => "&=",
        }
    }
}

/// Right-hand side of an operation: a literal or another state's value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand<S> {
    Value(StateValue),
    State(S),
}

impl<S: Key> Operand<S> {
    fn resolve<C: Key>(&self, reservoir: &Reservoir<S, C>) -> StateValue {
        match self {
            Operand::Value(value) => *value,
            Operand::State(key) => reservoir.value(*key),
        }
    }

    /// Parse an operand cell: a literal when the cell parses as one,
    /// otherwise a state reference minted through `hash`.
    fn from_cell(cell: &str, hash: impl Fn(&str) -> S) -> Option<Self> {
        if let Some(value) = parse_state_cell(cell) {
            return Some(Operand::Value(value));
        }
        let cell = cell.trim();
        if cell.is_empty() {
            return None;
        }
        Some(Operand::State(hash(cell)))
    }
}

/// A parsed comparison row: `left-state operator operand`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison<S> {
    pub key: S,
    pub operator: ComparisonOperator,
    pub operand: Operand<S>,
}

impl<S: Key> Comparison<S> {
    pub fn new(key: S, operator: ComparisonOperator, operand: Operand<S>) -> Self {
        Self {
            key,
            operator,
            operand,
        }
    }

    /// Parse from three adjacent cells starting at `(row, column)`.
    /// `hash` mints state keys from cell text.
    pub fn from_table<T: StringTable + ?Sized>(
        table: &T,
        row: usize,
        column: usize,
        hash: impl Fn(&str) -> S,
    ) -> Option<Self> {
        let key_cell = table.cell(row, column).trim();
        if key_cell.is_empty() {
            return None;
        }
        let operator = ComparisonOperator::from_token(table.cell(row, column + 1).trim())?;
        let operand = Operand::from_cell(table.cell(row, column + 2), &hash)?;
        Some(Self::new(hash(key_cell), operator, operand))
    }

    /// Evaluate against a reservoir. `None` when either side is absent
    /// or the two values cannot be ordered.
    pub fn evaluate<C: Key>(&self, reservoir: &Reservoir<S, C>) -> Option<bool> {
        use std::cmp::Ordering;
        let left = reservoir.value(self.key);
        let right = self.operand.resolve(reservoir);
        let ordering = left.compare(&right)?;
        Some(match self.operator {
            ComparisonOperator::Equal => ordering == Ordering::Equal,
            ComparisonOperator::NotEqual => ordering != Ordering::Equal,
            ComparisonOperator::Less => ordering == Ordering::Less,
            ComparisonOperator::LessEqual => ordering != Ordering::Greater,
            ComparisonOperator::Greater => ordering == Ordering::Greater,
            ComparisonOperator::GreaterEqual => ordering != Ordering::Less,
        })
    }
}

/// A parsed assignment row: `left-state operator operand`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment<S> {
    pub key: S,
    pub operator: AssignmentOperator,
    pub operand: Operand<S>,
}

impl<S: Key> Assignment<S> {
    pub fn new(key: S, operator: AssignmentOperator, operand: Operand<S>) -> Self {
        Self {
            key,
            operator,
            operand,
        }
    }

    /// Parse from three adjacent cells starting at `(row, column)`.
    pub fn from_table<T: StringTable + ?Sized>(
        table: &T,
        row: usize,
        column: usize,
        hash: impl Fn(&str) -> S,
    ) -> Option<Self> {
        let key_cell = table.cell(row, column).trim();
        if key_cell.is_empty() {
            return None;
        }
        let operator = AssignmentOperator::from_token(table.cell(row, column + 1).trim())?;
        let operand = Operand::from_cell(table.cell(row, column + 2), &hash)?;
        Some(Self::new(hash(key_cell), operator, operand))
    }

    /// Apply to a reservoir. Fails (leaving the state untouched) when
    /// either side is absent, the kinds do not combine under the
    /// operator, or the arithmetic overflows / divides by zero.
    pub fn apply<C: Key>(&self, reservoir: &mut Reservoir<S, C>) -> bool {
        let current = reservoir.value(self.key);
        let operand = self.operand.resolve(reservoir);
        let Some(next) = combine(current, self.operator, operand) else {
            return false;
        };
        reservoir.set_value(self.key, next)
    }
}

/// Combine the stored value with the operand; `None` when the operation
/// is not defined for the pair.
fn combine(current: StateValue, operator: AssignmentOperator, operand: StateValue) -> Option<StateValue> {
    use AssignmentOperator::*;
    if operator == Copy {
        return match operand {
            StateValue::Empty => None,
            other => Some(other),
        };
    }
    match current {
        StateValue::Bool(_) | StateValue::Empty => None,
        StateValue::Unsigned(left) => {
            let right = match operand {
                StateValue::Unsigned(value) => value,
                StateValue::Signed(value) if value >= 0 => value as u64,
                _ => return None,
            };
            let next = match operator {
                Add => left.checked_add(right)?,
                Sub => left.checked_sub(right)?,
                Mul => left.checked_mul(right)?,
                Div => left.checked_div(right)?,
                Mod => left.checked_rem(right)?,
                Or => left | right,
                Xor => left ^ right,
                And => left & right,
                Copy => unreachable!(),
            };
            Some(StateValue::Unsigned(next))
        }
        StateValue::Signed(left) => {
            let right = match operand {
                StateValue::Signed(value) => value,
                StateValue::Unsigned(value) => i64::try_from(value).ok()?,
                _ => return None,
            };
            let next = match operator {
                Add => left.checked_add(right)?,
                Sub => left.checked_sub(right)?,
                Mul => left.checked_mul(right)?,
                Div => left.checked_div(right)?,
                Mod => left.checked_rem(right)?,
                Or => left | right,
                Xor => left ^ right,
                And => left & right,
                Copy => unreachable!(),
            };
            Some(StateValue::Signed(next))
        }
        StateValue::Float(left) => {
            let right = match operand {
                StateValue::Float(value) => value,
                StateValue::Unsigned(value) => value as f64,
                StateValue::Signed(value) => value as f64,
                _ => return None,
            };
            let next = match operator {
                Add => left + right,
                Sub => left - right,
                Mul => left * right,
                Div | Mod if right == 0.0 => return None,
                Div => left / right,
                Mod => left % right,
                Or | Xor | And => return None,
                Copy => unreachable!(),
            };
            Some(StateValue::Float(next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTable;
    use tarn_core::hash::fnv1_32;

    fn hash(name: &str) -> u32 {
        fnv1_32(name.as_bytes())
    }

    fn fixture() -> Reservoir<u32, u32> {
        let mut reservoir = Reservoir::new(8, 1);
        assert!(reservoir.register_unsigned(1, hash("health"), 100, 16));
        assert!(reservoir.register_unsigned(1, hash("threshold"), 25, 16));
        assert!(reservoir.register_signed(1, hash("delta"), -5, 8));
        assert!(reservoir.register_float(1, hash("speed"), 2.0));
        assert!(reservoir.register_bool(1, hash("alive"), true));
        reservoir
    }

    #[test]
    fn test_operator_tokens_round_trip() {
        for token in ["==", "!=", "<", "<=", ">", ">="] {
            assert_eq!(ComparisonOperator::from_token(token).unwrap().token(), token);
        }
        for token in [":=", "+=", "-=", "*=", "/=", "%=", "|=", "^=", "&="] {
            assert_eq!(AssignmentOperator::from_token(token).unwrap().token(), token);
        }
        assert!(ComparisonOperator::from_token("=").is_none());
        assert!(AssignmentOperator::from_token("=").is_none());
    }

    #[test]
    fn test_comparison_against_literal() {
        let reservoir = fixture();
        let compare = |operator, value: u64| {
            Comparison::new(
                hash("health"),
                operator,
                Operand::Value(StateValue::Unsigned(value)),
            )
            .evaluate(&reservoir)
        };
        assert_eq!(compare(ComparisonOperator::Equal, 100), Some(true));
        assert_eq!(compare(ComparisonOperator::Less, 100), Some(false));
        assert_eq!(compare(ComparisonOperator::LessEqual, 100), Some(true));
        assert_eq!(compare(ComparisonOperator::Greater, 25), Some(true));
    }

    #[test]
    fn test_comparison_against_state() {
        let reservoir = fixture();
        let comparison = Comparison::new(
            hash("health"),
            ComparisonOperator::Greater,
            Operand::State(hash("threshold")),
        );
        assert_eq!(comparison.evaluate(&reservoir), Some(true));
    }

    #[test]
    fn test_comparison_failures() {
        let reservoir = fixture();
        // Absent left-hand state.
        let absent = Comparison::new(
            hash("missing"),
            ComparisonOperator::Equal,
            Operand::Value(StateValue::Unsigned(0)),
        );
        assert_eq!(absent.evaluate(&reservoir), None);
        // Bool against a number cannot be ordered.
        let mismatched = Comparison::new(
            hash("alive"),
            ComparisonOperator::Equal,
            Operand::Value(StateValue::Unsigned(1)),
        );
        assert_eq!(mismatched.evaluate(&reservoir), None);
    }

    #[test]
    fn test_assignment_arithmetic() {
        let mut reservoir = fixture();
        let apply = |reservoir: &mut Reservoir<u32, u32>, operator, value: u64| {
            Assignment::new(
                hash("health"),
                operator,
                Operand::Value(StateValue::Unsigned(value)),
            )
            .apply(reservoir)
        };
        assert!(apply(&mut reservoir, AssignmentOperator::Sub, 30));
        assert_eq!(reservoir.value(hash("health")), StateValue::Unsigned(70));
        assert!(apply(&mut reservoir, AssignmentOperator::Div, 7));
        assert_eq!(reservoir.value(hash("health")), StateValue::Unsigned(10));
        assert!(apply(&mut reservoir, AssignmentOperator::Or, 5));
        assert_eq!(reservoir.value(hash("health")), StateValue::Unsigned(15));

        // Division by zero and underflow fail without mutating.
        assert!(!apply(&mut reservoir, AssignmentOperator::Div, 0));
        assert!(!apply(&mut reservoir, AssignmentOperator::Sub, 100));
        assert_eq!(reservoir.value(hash("health")), StateValue::Unsigned(15));
    }

    #[test]
    fn test_assignment_copy_and_float() {
        let mut reservoir = fixture();
        let copied = Assignment::new(
            hash("speed"),
            AssignmentOperator::Copy,
            Operand::Value(StateValue::Float(4.5)),
        );
        assert!(copied.apply(&mut reservoir));
        assert_eq!(reservoir.value(hash("speed")), StateValue::Float(4.5));

        let scaled = Assignment::new(
            hash("speed"),
            AssignmentOperator::Mul,
            Operand::Value(StateValue::Unsigned(2)),
        );
        assert!(scaled.apply(&mut reservoir));
        assert_eq!(reservoir.value(hash("speed")), StateValue::Float(9.0));

        // Bitwise on a float is undefined.
        let masked = Assignment::new(
            hash("speed"),
            AssignmentOperator::And,
            Operand::Value(StateValue::Unsigned(1)),
        );
        assert!(!masked.apply(&mut reservoir));
    }

    #[test]
    fn test_assignment_from_state_operand() {
        let mut reservoir = fixture();
        let assignment = Assignment::new(
            hash("delta"),
            AssignmentOperator::Add,
            Operand::State(hash("delta")),
        );
        assert!(assignment.apply(&mut reservoir));
        assert_eq!(reservoir.value(hash("delta")), StateValue::Signed(-10));
    }

    #[test]
    fn test_parse_rows_from_table() {
        let mut table = MemoryTable::new(["LEFT", "OP", "RIGHT"]);
        table.push_row(["health", ">=", "threshold"]);
        table.push_row(["health", "-=", "10"]);
        table.push_row(["", "==", "1"]);
        table.push_row(["health", "??", "1"]);

        let reservoir = fixture();
        let comparison = Comparison::from_table(&table, 0, 0, hash).unwrap();
        assert_eq!(comparison.operand, Operand::State(hash("threshold")));
        assert_eq!(comparison.evaluate(&reservoir), Some(true));

        let assignment = Assignment::from_table(&table, 1, 0, hash).unwrap();
        assert_eq!(assignment.operator, AssignmentOperator::Sub);
        assert_eq!(
            assignment.operand,
            Operand::Value(StateValue::Unsigned(10))
        );

        // Empty key cell and unknown operator both fail to parse.
        assert!(Comparison::from_table(&table, 2, 0, hash).is_none());
        assert!(Comparison::from_table(&table, 3, 0, hash).is_none());
        assert!(Assignment::from_table(&table, 3, 0, hash).is_none());
    }
}
