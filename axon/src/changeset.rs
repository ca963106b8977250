use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use pg_escape::quote_literal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChangesetError {
    #[error("unknown changeset action: {0}")]
    UnknownAction(String),

    #[error("changeset values for column map are not a json object")]
    ValuesNotAnObject,

    #[error("changeset has no value for primary key column {0}")]
    MissingPrimaryKey(String),
}

/// The kind of row mutation a changeset describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetKind {
    Insert,
    Update,
    Delete,
}

impl ChangesetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetKind::Insert => "INSERT",
            ChangesetKind::Update => "UPDATE",
            ChangesetKind::Delete => "DELETE",
        }
    }
}

impl FromStr for ChangesetKind {
    type Err = ChangesetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INSERT" => Ok(ChangesetKind::Insert),
            "UPDATE" => Ok(ChangesetKind::Update),
            "DELETE" => Ok(ChangesetKind::Delete),
            other => Err(ChangesetError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for ChangesetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dynamically typed column value.
///
/// Values captured by the trigger arrive as the column's PostgreSQL text form
/// wrapped in JSON ([`Cell::Text`]), which round-trips every type including
/// arrays and jsonb. The wal2json decode path additionally produces the typed
/// variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(String),
    Array(Vec<Cell>),
}

impl Cell {
    pub fn from_json(value: &serde_json::Value) -> Cell {
        match value {
            serde_json::Value::Null => Cell::Null,
            serde_json::Value::Bool(b) => Cell::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => Cell::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Cell::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Cell::Array(items.iter().map(Cell::from_json).collect())
            }
            serde_json::Value::Object(_) => Cell::Json(value.to_string()),
        }
    }

    /// Renders the value as a self-contained SQL literal.
    ///
    /// Text literals are untyped on the wire, so PostgreSQL coerces them to
    /// the column type of the statement they appear in.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Cell::Null => "NULL".to_string(),
            Cell::Bool(b) => b.to_string(),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => f.to_string(),
            Cell::Text(s) => quote_literal(s).to_string(),
            Cell::Json(s) => quote_literal(s).to_string(),
            Cell::Array(items) => {
                let mut text = String::new();
                render_array_text(items, &mut text);
                quote_literal(&text).to_string()
            }
        }
    }

    /// The value as an integer, if it holds or parses as one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(i) => Some(*i),
            Cell::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("NULL"),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Int(i) => write!(f, "{i}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(s) | Cell::Json(s) => f.write_str(s),
            Cell::Array(items) => {
                let mut text = String::new();
                render_array_text(items, &mut text);
                f.write_str(&text)
            }
        }
    }
}

// PostgreSQL array input syntax: elements inside braces, strings quoted with
// double quotes, backslash escaping for quotes and backslashes.
fn render_array_text(items: &[Cell], out: &mut String) {
    out.push('{');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Cell::Null => out.push_str("NULL"),
            Cell::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Cell::Int(v) => out.push_str(&v.to_string()),
            Cell::Float(v) => out.push_str(&v.to_string()),
            Cell::Text(s) | Cell::Json(s) => {
                out.push('"');
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
            Cell::Array(nested) => render_array_text(nested, out),
        }
    }
    out.push('}');
}

/// Column name to value pairs in capture order.
pub type ColumnValues = Vec<(String, Cell)>;

/// Decodes a capture-table JSONB column map into [`ColumnValues`].
///
/// `None` (SQL NULL, e.g. `old_values` of an insert) decodes to an empty map.
pub fn column_values_from_json(
    value: Option<&serde_json::Value>,
) -> Result<ColumnValues, ChangesetError> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Object(map)) => Ok(map
            .iter()
            .map(|(name, value)| (name.clone(), Cell::from_json(value)))
            .collect()),
        Some(_) => Err(ChangesetError::ValuesNotAnObject),
    }
}

/// One captured row mutation.
#[derive(Debug, Clone)]
pub struct Changeset {
    /// Monotonically increasing id assigned by the source; the replication cursor.
    pub id: i64,
    /// Capture timestamp.
    pub ts: DateTime<Utc>,
    pub kind: ChangesetKind,
    pub schema: String,
    pub table: String,
    /// Row image after the mutation; empty for deletes.
    pub new_values: ColumnValues,
    /// Row image before the mutation; empty for inserts, at minimum the
    /// primary key columns for updates and deletes.
    pub old_values: ColumnValues,
}

impl Changeset {
    /// Projects `old_values` onto the table's primary key columns.
    pub fn primary_key_projection(
        &self,
        pkey_fields: &[String],
    ) -> Result<ColumnValues, ChangesetError> {
        let mut key = Vec::with_capacity(pkey_fields.len());
        for field in pkey_fields {
            let cell = self
                .old_values
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, cell)| cell.clone())
                .ok_or_else(|| ChangesetError::MissingPrimaryKey(field.clone()))?;
            key.push((field.clone(), cell));
        }
        Ok(key)
    }
}

/// Formats a key projection for log output, e.g. `id=42`.
pub fn format_key(key: &ColumnValues) -> String {
    key.iter()
        .map(|(name, cell)| format!("{name}={cell}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changeset_with_old_values(old_values: ColumnValues) -> Changeset {
        Changeset {
            id: 1,
            ts: Utc::now(),
            kind: ChangesetKind::Update,
            schema: "public".to_string(),
            table: "users".to_string(),
            new_values: Vec::new(),
            old_values,
        }
    }

    #[test]
    fn kind_parses_capture_and_wal2json_spellings() {
        assert_eq!("INSERT".parse::<ChangesetKind>().unwrap(), ChangesetKind::Insert);
        assert_eq!("update".parse::<ChangesetKind>().unwrap(), ChangesetKind::Update);
        assert_eq!("delete".parse::<ChangesetKind>().unwrap(), ChangesetKind::Delete);
        assert!("TRUNCATE".parse::<ChangesetKind>().is_err());
    }

    #[test]
    fn cell_from_json_covers_all_value_shapes() {
        assert_eq!(Cell::from_json(&json!(null)), Cell::Null);
        assert_eq!(Cell::from_json(&json!(true)), Cell::Bool(true));
        assert_eq!(Cell::from_json(&json!(42)), Cell::Int(42));
        assert_eq!(Cell::from_json(&json!(1.5)), Cell::Float(1.5));
        assert_eq!(Cell::from_json(&json!("row-1")), Cell::Text("row-1".to_string()));
        assert_eq!(
            Cell::from_json(&json!([1, 2])),
            Cell::Array(vec![Cell::Int(1), Cell::Int(2)])
        );
        assert_eq!(
            Cell::from_json(&json!({"a": 1})),
            Cell::Json("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(Cell::Null.to_sql_literal(), "NULL");
        assert_eq!(Cell::Int(7).to_sql_literal(), "7");
        assert_eq!(Cell::Bool(false).to_sql_literal(), "false");
        assert_eq!(Cell::Text("it's".to_string()).to_sql_literal(), "'it''s'");
        assert_eq!(
            Cell::Json("{\"a\":\"b\"}".to_string()).to_sql_literal(),
            "'{\"a\":\"b\"}'"
        );
    }

    #[test]
    fn array_literal_uses_postgres_text_form() {
        let cell = Cell::Array(vec![
            Cell::Int(1),
            Cell::Null,
            Cell::Text("a \"quoted\" value".to_string()),
        ]);
        assert_eq!(
            cell.to_sql_literal(),
            "'{1,NULL,\"a \\\"quoted\\\" value\"}'"
        );
    }

    #[test]
    fn nested_array_literal() {
        let cell = Cell::Array(vec![
            Cell::Array(vec![Cell::Int(1), Cell::Int(2)]),
            Cell::Array(vec![Cell::Int(3), Cell::Int(4)]),
        ]);
        assert_eq!(cell.to_sql_literal(), "'{{1,2},{3,4}}'");
    }

    #[test]
    fn column_values_decode_preserves_names() {
        let map = json!({"id": "1", "v": "row-1", "deleted_at": null});
        let values = column_values_from_json(Some(&map)).unwrap();
        assert_eq!(values.len(), 3);
        assert!(values
            .iter()
            .any(|(name, cell)| name == "v" && *cell == Cell::Text("row-1".to_string())));
        assert!(values
            .iter()
            .any(|(name, cell)| name == "deleted_at" && cell.is_null()));
    }

    #[test]
    fn column_values_reject_non_objects() {
        assert!(column_values_from_json(Some(&json!([1, 2]))).is_err());
        assert!(column_values_from_json(None).unwrap().is_empty());
    }

    #[test]
    fn primary_key_projection_extracts_in_field_order() {
        let change = changeset_with_old_values(vec![
            ("v".to_string(), Cell::Text("a".to_string())),
            ("id".to_string(), Cell::Text("1".to_string())),
            ("region".to_string(), Cell::Text("eu".to_string())),
        ]);
        let key = change
            .primary_key_projection(&["id".to_string(), "region".to_string()])
            .unwrap();
        assert_eq!(
            key,
            vec![
                ("id".to_string(), Cell::Text("1".to_string())),
                ("region".to_string(), Cell::Text("eu".to_string())),
            ]
        );
    }

    #[test]
    fn primary_key_projection_reports_missing_column() {
        let change = changeset_with_old_values(vec![("v".to_string(), Cell::Int(1))]);
        let err = change
            .primary_key_projection(&["id".to_string()])
            .unwrap_err();
        assert!(matches!(err, ChangesetError::MissingPrimaryKey(column) if column == "id"));
    }
}
