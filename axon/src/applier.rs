use pg_escape::{quote_identifier, quote_literal};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, SimpleQueryMessage};
use tracing::{debug, error, warn};

use crate::changeset::{format_key, Changeset, ChangesetKind, ColumnValues};
use crate::metadata::TargetMetadata;

/// Replays changesets against the target database, one statement per change.
///
/// The applier is deliberately forgiving: a changeset that cannot be applied
/// is logged and skipped so the pipeline never wedges on a single bad row.
/// Duplicates from an at-least-once listener restart surface as unique
/// violations on insert and are downgraded to warnings; replayed updates and
/// deletes are naturally idempotent.
pub struct Applier {
    client: Client,
    metadata: TargetMetadata,
    target_schema: Option<String>,
}

impl Applier {
    pub fn new(client: Client, metadata: TargetMetadata, target_schema: Option<String>) -> Self {
        Applier {
            client,
            metadata,
            target_schema,
        }
    }

    /// Applies one changeset. Failures are logged, never returned; the caller
    /// advances the cursor unconditionally.
    pub async fn apply(&self, change: &Changeset) {
        let schema = self
            .target_schema
            .as_deref()
            .unwrap_or(change.schema.as_str());

        match change.kind {
            ChangesetKind::Insert => self.apply_insert(schema, change).await,
            ChangesetKind::Update => self.apply_update(schema, change).await,
            ChangesetKind::Delete => self.apply_delete(schema, change).await,
        }
    }

    async fn apply_insert(&self, schema: &str, change: &Changeset) {
        let Some(statement) = build_insert(schema, &change.table, &change.new_values) else {
            warn!(
                change_id = change.id,
                schema,
                table = %change.table,
                "skipping INSERT with no column values"
            );
            return;
        };

        match self.run_statement(&statement).await {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                warn!(
                    change_id = change.id,
                    schema,
                    table = %change.table,
                    "duplicate key on replayed INSERT, row was already applied"
                );
            }
            Err(e) => {
                error!(
                    change_id = change.id,
                    schema,
                    table = %change.table,
                    "failed to INSERT row: {e}"
                );
                return;
            }
        }

        self.advance_sequences(schema, change).await;
    }

    /// Advances every sequence owned by an inserted column so that inserts
    /// originating on the target cannot collide with replicated ids.
    async fn advance_sequences(&self, schema: &str, change: &Changeset) {
        let Some(descriptor) = self.metadata.table(schema, &change.table) else {
            return;
        };

        for (column, sequence) in &descriptor.column_sequences {
            let Some(value) = change
                .new_values
                .iter()
                .find(|(name, _)| name == column)
                .and_then(|(_, cell)| cell.as_i64())
            else {
                continue;
            };

            let statement = format!(
                "SELECT setval({}, GREATEST({value}, (SELECT last_value FROM {sequence})))",
                quote_literal(sequence)
            );
            if let Err(e) = self.run_statement(&statement).await {
                warn!(
                    change_id = change.id,
                    schema,
                    table = %change.table,
                    %sequence,
                    "failed to advance sequence: {e}"
                );
            }
        }
    }

    async fn apply_update(&self, schema: &str, change: &Changeset) {
        let Some(descriptor) = self.metadata.table(schema, &change.table) else {
            warn!(
                change_id = change.id,
                schema,
                table = %change.table,
                "skipping UPDATE for a table unknown to the target"
            );
            return;
        };

        let key = match change.primary_key_projection(&descriptor.pkey_fields) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    change_id = change.id,
                    schema,
                    table = %change.table,
                    "unable to process UPDATE, {e}"
                );
                return;
            }
        };

        let Some(statement) = build_update(schema, &change.table, &key, &change.new_values) else {
            debug!(
                change_id = change.id,
                schema,
                table = %change.table,
                "skipping UPDATE with no non-key assignments"
            );
            return;
        };

        if let Err(e) = self.run_statement(&statement).await {
            error!(
                change_id = change.id,
                schema,
                table = %change.table,
                key = %format_key(&key),
                "failed to UPDATE row: {e}"
            );
        }
    }

    async fn apply_delete(&self, schema: &str, change: &Changeset) {
        let Some(descriptor) = self.metadata.table(schema, &change.table) else {
            warn!(
                change_id = change.id,
                schema,
                table = %change.table,
                "skipping DELETE for a table unknown to the target"
            );
            return;
        };

        let key = match change.primary_key_projection(&descriptor.pkey_fields) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    change_id = change.id,
                    schema,
                    table = %change.table,
                    "unable to process DELETE, {e}"
                );
                return;
            }
        };

        let statement = build_delete(schema, &change.table, &key);
        match self.run_statement(&statement).await {
            Ok(0) => {
                warn!(
                    change_id = change.id,
                    schema,
                    table = %change.table,
                    key = %format_key(&key),
                    "DELETE matched no row"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    change_id = change.id,
                    schema,
                    table = %change.table,
                    key = %format_key(&key),
                    "failed to DELETE row: {e}"
                );
            }
        }
    }

    /// Runs one rendered statement over the simple-query protocol, so its
    /// embedded text literals stay untyped and coerce to the column types.
    /// Returns the affected row count.
    async fn run_statement(&self, statement: &str) -> Result<u64, tokio_postgres::Error> {
        let messages = self.client.simple_query(statement).await?;
        Ok(messages
            .iter()
            .find_map(|message| match message {
                SimpleQueryMessage::CommandComplete(rows) => Some(*rows),
                _ => None,
            })
            .unwrap_or(0))
    }
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

fn build_insert(schema: &str, table: &str, new_values: &ColumnValues) -> Option<String> {
    if new_values.is_empty() {
        return None;
    }

    let columns = new_values
        .iter()
        .map(|(name, _)| quote_identifier(name).to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let values = new_values
        .iter()
        .map(|(_, cell)| cell.to_sql_literal())
        .collect::<Vec<_>>()
        .join(", ");

    Some(format!(
        "INSERT INTO {} ({columns}) VALUES ({values})",
        qualified_table(schema, table)
    ))
}

fn build_update(
    schema: &str,
    table: &str,
    key: &ColumnValues,
    new_values: &ColumnValues,
) -> Option<String> {
    let assignments = new_values
        .iter()
        .filter(|(name, _)| !key.iter().any(|(k, _)| k == name))
        .map(|(name, cell)| format!("{} = {}", quote_identifier(name), cell.to_sql_literal()))
        .collect::<Vec<_>>();

    if assignments.is_empty() {
        return None;
    }

    Some(format!(
        "UPDATE {} SET {} WHERE {}",
        qualified_table(schema, table),
        assignments.join(", "),
        key_predicate(key)
    ))
}

fn build_delete(schema: &str, table: &str, key: &ColumnValues) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        qualified_table(schema, table),
        key_predicate(key)
    )
}

fn key_predicate(key: &ColumnValues) -> String {
    key.iter()
        .map(|(name, cell)| format!("{} = {}", quote_identifier(name), cell.to_sql_literal()))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Cell;

    fn values(pairs: &[(&str, Cell)]) -> ColumnValues {
        pairs
            .iter()
            .map(|(name, cell)| (name.to_string(), cell.clone()))
            .collect()
    }

    #[test]
    fn insert_statement_lists_all_captured_columns() {
        let statement = build_insert(
            "public",
            "users",
            &values(&[
                ("id", Cell::Text("1".to_string())),
                ("full_name", Cell::Text("ada".to_string())),
                ("deleted_at", Cell::Null),
            ]),
        )
        .unwrap();

        assert_eq!(
            statement,
            "INSERT INTO public.users (id, full_name, deleted_at) VALUES ('1', 'ada', NULL)"
        );
    }

    #[test]
    fn insert_with_no_values_is_skipped() {
        assert!(build_insert("public", "users", &Vec::new()).is_none());
    }

    #[test]
    fn update_excludes_key_columns_from_assignments() {
        let key = values(&[("id", Cell::Text("1".to_string()))]);
        let new_values = values(&[
            ("id", Cell::Text("1".to_string())),
            ("v", Cell::Text("b".to_string())),
        ]);

        let statement = build_update("public", "t", &key, &new_values).unwrap();
        assert_eq!(statement, "UPDATE public.t SET v = 'b' WHERE id = '1'");
    }

    #[test]
    fn key_only_update_is_a_no_op() {
        let key = values(&[("id", Cell::Text("1".to_string()))]);
        let new_values = values(&[("id", Cell::Text("1".to_string()))]);
        assert!(build_update("public", "t", &key, &new_values).is_none());
    }

    #[test]
    fn update_with_composite_key() {
        let key = values(&[
            ("tenant_id", Cell::Text("7".to_string())),
            ("id", Cell::Text("1".to_string())),
        ]);
        let new_values = values(&[
            ("tenant_id", Cell::Text("7".to_string())),
            ("id", Cell::Text("1".to_string())),
            ("v", Cell::Text("x".to_string())),
        ]);

        let statement = build_update("public", "t", &key, &new_values).unwrap();
        assert_eq!(
            statement,
            "UPDATE public.t SET v = 'x' WHERE tenant_id = '7' AND id = '1'"
        );
    }

    #[test]
    fn delete_uses_the_full_key_predicate() {
        let key = values(&[
            ("tenant_id", Cell::Text("7".to_string())),
            ("id", Cell::Text("1".to_string())),
        ]);

        assert_eq!(
            build_delete("mirror", "t", &key),
            "DELETE FROM mirror.t WHERE tenant_id = '7' AND id = '1'"
        );
    }

    #[test]
    fn literals_in_statements_are_escaped() {
        let statement = build_insert(
            "public",
            "notes",
            &values(&[("body", Cell::Text("it's a test".to_string()))]),
        )
        .unwrap();

        assert_eq!(
            statement,
            "INSERT INTO public.notes (body) VALUES ('it''s a test')"
        );
    }
}
