//! Query results returned by a backend.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::sql::{Expr, Literal};

/// A single cell.
///
/// Equality, ordering and hashing are total: floats compare by
/// `f64::total_cmp` and hash by bit pattern, so values can key a map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Column type of a result, as far as [`Value`] distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
}

impl Value {
    /// Interpret a cell received as text from a column of type `kind`.
    ///
    /// Text columns stay text verbatim, so `'007'` is not read as a number.
    /// A cell that does not parse as its declared numeric type is kept as
    /// text rather than dropped.
    pub fn parse(text: Option<&str>, kind: ValueKind) -> Self {
        let Some(s) = text else {
            return Value::Null;
        };
        match kind {
            ValueKind::Text => Value::Text(s.to_string()),
            ValueKind::Int => s.parse().map_or_else(|_| Value::Text(s.to_string()), Value::Int),
            ValueKind::Float => s.parse().map_or_else(|_| Value::Text(s.to_string()), Value::Float),
            ValueKind::Bool => match s {
                "t" | "true" => Value::Bool(true),
                "f" | "false" => Value::Bool(false),
                _ => Value::Text(s.to_string()),
            },
        }
    }

    /// The kind of this value, `None` for NULL.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Float(_) => Some(ValueKind::Float),
            Value::Text(_) => Some(ValueKind::Text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.parse().ok(),
            Value::Bool(_) | Value::Null => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// SQL literal for this value. Non-finite floats become NULL.
    pub fn to_literal(&self) -> Expr {
        let lit = match self {
            Value::Null => Literal::Null,
            Value::Bool(b) => Literal::Bool(*b),
            Value::Int(i) => Literal::Number(i.to_string()),
            Value::Float(f) if f.is_finite() => Literal::Number(format!("{f:?}")),
            Value::Float(_) => Literal::Null,
            Value::Text(s) => Literal::String(s.clone()),
        };
        Expr::Literal(lit)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            // Ints and floats that compare equal must hash equal.
            Value::Int(i) => (*i as f64).to_bits().hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Rows returned by a query, with column names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        QueryResult { columns, rows }
    }

    pub fn empty() -> Self {
        QueryResult::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// The first cell of the first row, for single-value queries.
    pub fn scalar(&self) -> Option<&Value> {
        self.get(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_follows_column_kind() {
        assert_eq!(Value::parse(Some("42"), ValueKind::Int), Value::Int(42));
        assert_eq!(Value::parse(Some("4.5"), ValueKind::Float), Value::Float(4.5));
        assert_eq!(Value::parse(Some("t"), ValueKind::Bool), Value::Bool(true));
        assert_eq!(Value::parse(None, ValueKind::Int), Value::Null);
    }

    #[test]
    fn test_parse_keeps_text_verbatim() {
        assert_eq!(
            Value::parse(Some("007"), ValueKind::Text),
            Value::Text("007".into())
        );
        assert_eq!(
            Value::parse(Some("NaN"), ValueKind::Text),
            Value::Text("NaN".into())
        );
        assert_eq!(Value::parse(Some("12"), ValueKind::Text).kind(), Some(ValueKind::Text));
    }

    #[test]
    fn test_parse_float_column_reads_nan() {
        assert!(matches!(
            Value::parse(Some("NaN"), ValueKind::Float),
            Value::Float(f) if f.is_nan()
        ));
    }

    #[test]
    fn test_int_and_float_compare_and_hash_equal() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        let mut set = HashSet::new();
        set.insert(Value::Int(3));
        assert!(set.contains(&Value::Float(3.0)));
    }

    #[test]
    fn test_ordering_is_total() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::Float(f64::NAN),
            Value::Int(1),
            Value::Null,
            Value::Float(0.5),
        ];
        values.sort();
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[1], Value::Float(0.5));
        assert_eq!(values[2], Value::Int(1));
        assert_eq!(values[4], Value::Text("b".into()));
    }

    #[test]
    fn test_to_literal() {
        assert_eq!(
            Value::Float(2.0).to_literal(),
            Expr::Literal(Literal::Number("2.0".into()))
        );
        assert_eq!(
            Value::Float(f64::INFINITY).to_literal(),
            Expr::Literal(Literal::Null)
        );
        assert_eq!(
            Value::Text("x".into()).to_literal(),
            Expr::Literal(Literal::String("x".into()))
        );
    }

    #[test]
    fn test_scalar_and_column_index() {
        let r = QueryResult::new(vec!["n".into()], vec![vec![Value::Int(7)]]);
        assert_eq!(r.scalar(), Some(&Value::Int(7)));
        assert_eq!(r.column_index("n"), Some(0));
        assert_eq!(r.column_index("m"), None);
        assert!(QueryResult::empty().scalar().is_none());
    }
}
