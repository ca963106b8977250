use std::collections::HashMap;

use thiserror::Error;
use tokio_postgres::Client;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Cached shape of one target table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    /// Primary key column names in constraint order.
    pub pkey_fields: Vec<String>,
    /// Column name to the fully qualified sequence it draws defaults from.
    pub column_sequences: HashMap<String, String>,
}

/// Read-only metadata loaded once at applier startup.
///
/// Lookups are by `(schema, table)`; reloading requires a restart.
#[derive(Debug, Default)]
pub struct TargetMetadata {
    tables: HashMap<(String, String), TableDescriptor>,
    /// Source sequences not owned by any column default, e.g. sequences used
    /// through explicit `nextval` calls.
    pub orphan_sequences: Vec<String>,
}

impl TargetMetadata {
    /// Loads primary keys and column sequences from the target, and orphan
    /// sequences from the source.
    pub async fn load(target: &Client, source: &Client) -> Result<TargetMetadata, MetadataError> {
        let mut metadata = TargetMetadata::default();
        metadata.load_primary_keys(target).await?;
        metadata.load_column_sequences(target).await?;
        metadata.orphan_sequences = load_orphan_sequences(source).await?;

        info!(
            tables = metadata.tables.len(),
            orphan_sequences = metadata.orphan_sequences.len(),
            "loaded target metadata"
        );

        Ok(metadata)
    }

    pub fn table(&self, schema: &str, name: &str) -> Option<&TableDescriptor> {
        self.tables
            .get(&(schema.to_string(), name.to_string()))
    }

    async fn load_primary_keys(&mut self, target: &Client) -> Result<(), MetadataError> {
        let rows = target
            .query(
                "SELECT kcu.table_schema, kcu.table_name, kcu.column_name
                   FROM information_schema.table_constraints tc
                   JOIN information_schema.key_column_usage kcu
                     ON kcu.constraint_name = tc.constraint_name
                    AND kcu.table_schema = tc.table_schema
                  WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema NOT IN ('pg_catalog', 'information_schema', 'warp_pipe')
                  ORDER BY kcu.table_schema, kcu.table_name, kcu.ordinal_position",
                &[],
            )
            .await?;

        for row in rows {
            let schema: String = row.try_get(0)?;
            let name: String = row.try_get(1)?;
            let column: String = row.try_get(2)?;
            self.descriptor_mut(schema, name).pkey_fields.push(column);
        }
        Ok(())
    }

    async fn load_column_sequences(&mut self, target: &Client) -> Result<(), MetadataError> {
        let rows = target
            .query(
                "SELECT c.table_schema, c.table_name, c.column_name,
                        pg_get_serial_sequence(
                            quote_ident(c.table_schema) || '.' || quote_ident(c.table_name),
                            c.column_name
                        ) AS sequence_name
                   FROM information_schema.columns c
                  WHERE c.column_default LIKE 'nextval(%'
                    AND c.table_schema NOT IN ('pg_catalog', 'information_schema', 'warp_pipe')",
                &[],
            )
            .await?;

        for row in rows {
            let schema: String = row.try_get(0)?;
            let name: String = row.try_get(1)?;
            let column: String = row.try_get(2)?;
            let sequence: Option<String> = row.try_get(3)?;
            if let Some(sequence) = sequence {
                debug!(%schema, table = %name, %column, %sequence, "column draws from sequence");
                self.descriptor_mut(schema, name)
                    .column_sequences
                    .insert(column, sequence);
            }
        }
        Ok(())
    }

    fn descriptor_mut(&mut self, schema: String, name: String) -> &mut TableDescriptor {
        self.tables
            .entry((schema.clone(), name.clone()))
            .or_insert_with(|| TableDescriptor {
                schema,
                name,
                pkey_fields: Vec::new(),
                column_sequences: HashMap::new(),
            })
    }
}

/// Sequences with no owning column, discovered through `pg_depend`.
async fn load_orphan_sequences(source: &Client) -> Result<Vec<String>, MetadataError> {
    let rows = source
        .query(
            "SELECT quote_ident(n.nspname) || '.' || quote_ident(c.relname)
               FROM pg_class c
               JOIN pg_namespace n ON n.oid = c.relnamespace
              WHERE c.relkind = 'S'
                AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'warp_pipe')
                AND NOT EXISTS (
                    SELECT 1
                      FROM pg_depend d
                     WHERE d.objid = c.oid
                       AND d.deptype = 'a'
                )
              ORDER BY 1",
            &[],
        )
        .await?;

    rows.iter().map(|row| Ok(row.try_get(0)?)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_by_schema_and_table() {
        let mut metadata = TargetMetadata::default();
        metadata
            .descriptor_mut("public".to_string(), "users".to_string())
            .pkey_fields
            .push("id".to_string());

        assert!(metadata.table("public", "users").is_some());
        assert!(metadata.table("mirror", "users").is_none());
        assert!(metadata.table("public", "orders").is_none());
    }

    #[test]
    fn pkey_fields_keep_constraint_order() {
        let mut metadata = TargetMetadata::default();
        let descriptor = metadata.descriptor_mut("public".to_string(), "events".to_string());
        descriptor.pkey_fields.push("tenant_id".to_string());
        descriptor.pkey_fields.push("event_id".to_string());

        let descriptor = metadata.table("public", "events").unwrap();
        assert_eq!(descriptor.pkey_fields, vec!["tenant_id", "event_id"]);
    }
}
