use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;

use crate::changeset::{Cell, Changeset, ChangesetError, ColumnValues};

#[derive(Debug, Error)]
pub enum Wal2JsonError {
    #[error("invalid wal2json document: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Changeset(#[from] ChangesetError),

    #[error("change has {names} column names but {values} values")]
    ColumnCountMismatch { names: usize, values: usize },
}

/// One document emitted by the wal2json logical decoding plugin.
#[derive(Debug, Deserialize)]
pub struct Wal2JsonMessage {
    #[serde(rename = "change", default)]
    pub changes: Vec<Wal2JsonChange>,
    #[serde(rename = "nextlsn", default)]
    pub next_lsn: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Wal2JsonChange {
    #[serde(default)]
    pub id: i64,
    pub kind: String,
    pub schema: String,
    pub table: String,
    #[serde(rename = "columnnames", default)]
    pub column_names: Vec<String>,
    #[serde(rename = "columntypes", default)]
    pub column_types: Vec<String>,
    #[serde(rename = "columnvalues", default)]
    pub column_values: Vec<serde_json::Value>,
    #[serde(rename = "oldkeys", default)]
    pub old_keys: Option<Wal2JsonOldKeys>,
}

#[derive(Debug, Deserialize)]
pub struct Wal2JsonOldKeys {
    #[serde(rename = "keynames", default)]
    pub key_names: Vec<String>,
    #[serde(rename = "keytypes", default)]
    pub key_types: Vec<String>,
    #[serde(rename = "keyvalues", default)]
    pub key_values: Vec<serde_json::Value>,
}

impl Wal2JsonMessage {
    pub fn parse(document: &str) -> Result<Wal2JsonMessage, Wal2JsonError> {
        Ok(serde_json::from_str(document)?)
    }

    /// Converts every change in the document into the changeset entity the
    /// applier consumes, in document order.
    pub fn into_changesets(self) -> Result<Vec<Changeset>, Wal2JsonError> {
        self.changes
            .into_iter()
            .map(Wal2JsonChange::into_changeset)
            .collect()
    }
}

impl Wal2JsonChange {
    pub fn into_changeset(self) -> Result<Changeset, Wal2JsonError> {
        let kind = self.kind.parse()?;
        let new_values = zip_columns(&self.column_names, &self.column_values)?;
        let old_values = match &self.old_keys {
            Some(old_keys) => zip_columns(&old_keys.key_names, &old_keys.key_values)?,
            None => Vec::new(),
        };

        Ok(Changeset {
            id: self.id,
            ts: Utc::now(),
            kind,
            schema: self.schema,
            table: self.table,
            new_values,
            old_values,
        })
    }
}

fn zip_columns(
    names: &[String],
    values: &[serde_json::Value],
) -> Result<ColumnValues, Wal2JsonError> {
    if names.len() != values.len() {
        return Err(Wal2JsonError::ColumnCountMismatch {
            names: names.len(),
            values: values.len(),
        });
    }

    Ok(names
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.clone(), Cell::from_json(value)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangesetKind;

    const SAMPLE: &str = r#"{
        "change": [
            {
                "id": 7,
                "kind": "insert",
                "schema": "public",
                "table": "users",
                "columnnames": ["id", "full_name", "active"],
                "columntypes": ["bigint", "text", "boolean"],
                "columnvalues": [1, "ada", true]
            },
            {
                "id": 8,
                "kind": "delete",
                "schema": "public",
                "table": "users",
                "oldkeys": {
                    "keynames": ["id"],
                    "keytypes": ["bigint"],
                    "keyvalues": [1]
                }
            }
        ],
        "nextlsn": "0/16D1CF8"
    }"#;

    #[test]
    fn document_decodes_into_changesets() {
        let message = Wal2JsonMessage::parse(SAMPLE).unwrap();
        assert_eq!(message.next_lsn.as_deref(), Some("0/16D1CF8"));

        let changesets = message.into_changesets().unwrap();
        assert_eq!(changesets.len(), 2);

        let insert = &changesets[0];
        assert_eq!(insert.id, 7);
        assert_eq!(insert.kind, ChangesetKind::Insert);
        assert_eq!(insert.schema, "public");
        assert_eq!(insert.table, "users");
        assert_eq!(insert.new_values[0], ("id".to_string(), Cell::Int(1)));
        assert_eq!(
            insert.new_values[1],
            ("full_name".to_string(), Cell::Text("ada".to_string()))
        );
        assert!(insert.old_values.is_empty());

        let delete = &changesets[1];
        assert_eq!(delete.kind, ChangesetKind::Delete);
        assert!(delete.new_values.is_empty());
        assert_eq!(delete.old_values[0], ("id".to_string(), Cell::Int(1)));
    }

    #[test]
    fn mismatched_column_arities_are_rejected() {
        let document = r#"{
            "change": [{
                "kind": "insert",
                "schema": "public",
                "table": "t",
                "columnnames": ["a", "b"],
                "columntypes": ["int", "int"],
                "columnvalues": [1]
            }]
        }"#;

        let message = Wal2JsonMessage::parse(document).unwrap();
        assert!(matches!(
            message.into_changesets(),
            Err(Wal2JsonError::ColumnCountMismatch { names: 2, values: 1 })
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let document = r#"{
            "change": [{
                "kind": "truncate",
                "schema": "public",
                "table": "t"
            }]
        }"#;

        let message = Wal2JsonMessage::parse(document).unwrap();
        assert!(message.into_changesets().is_err());
    }
}
