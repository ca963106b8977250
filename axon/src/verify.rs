use std::collections::HashMap;

use pg_escape::quote_identifier;
use thiserror::Error;
use tokio_postgres::Client;
use tracing::info;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("table \"{schema}\".\"{table}\" has no primary key, cannot guarantee checksum match")]
    NoPrimaryKey { schema: String, table: String },

    #[error("table \"{schema}\".\"{table}\" differs")]
    Mismatch { schema: String, table: String },
}

#[derive(Debug, Default, Clone)]
pub struct VerifyOptions {
    pub schemas: Vec<String>,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
}

/// Compares per-table checksums between source and target.
///
/// Each row is serialized to its text form and hashed with md5; row hashes
/// are folded by a commutative XOR aggregate, so the result is independent of
/// physical row order. The query still orders by the full primary key to keep
/// per-row hashing deterministic. The first mismatching table aborts the run.
pub async fn verify(
    source: &Client,
    target: &Client,
    options: &VerifyOptions,
) -> Result<(), VerifyError> {
    prepare_integrity_checks(source).await?;
    prepare_integrity_checks(target).await?;

    let schemas = if options.schemas.is_empty() {
        vec!["public".to_string()]
    } else {
        options.schemas.clone()
    };

    let tables = list_tables(source, &schemas).await?;
    let primary_keys = load_primary_keys(source, &schemas).await?;

    for (schema, table) in tables {
        if !options.include_tables.is_empty() && !options.include_tables.contains(&table) {
            continue;
        }
        if options.exclude_tables.contains(&table) {
            continue;
        }

        let pkey_fields = primary_keys
            .get(&(schema.clone(), table.clone()))
            .filter(|fields| !fields.is_empty())
            .ok_or_else(|| VerifyError::NoPrimaryKey {
                schema: schema.clone(),
                table: table.clone(),
            })?;

        info!(%schema, %table, "verifying checksum");

        let query = checksum_query(&schema, &table, pkey_fields);
        let source_checksum: String = source.query_one(&query, &[]).await?.try_get(0)?;
        let target_checksum: String = target.query_one(&query, &[]).await?.try_get(0)?;

        if source_checksum != target_checksum {
            return Err(VerifyError::Mismatch { schema, table });
        }
    }

    Ok(())
}

/// Installs the order-invariant hash aggregate used by the checksum queries.
async fn prepare_integrity_checks(client: &Client) -> Result<(), VerifyError> {
    let zero_state = "0".repeat(128);
    let sql = format!(
        r#"
CREATE SCHEMA IF NOT EXISTS warp_pipe;

DROP AGGREGATE IF EXISTS warp_pipe.md5_hashagg(text);

CREATE OR REPLACE FUNCTION warp_pipe.md5_xor(state bit(128), next_hash text)
RETURNS bit(128)
LANGUAGE sql IMMUTABLE
AS $fn$ SELECT state # ('x' || next_hash)::bit(128) $fn$;

CREATE AGGREGATE warp_pipe.md5_hashagg(text) (
    SFUNC = warp_pipe.md5_xor,
    STYPE = bit(128),
    INITCOND = '{zero_state}'
);
"#
    );
    client.batch_execute(&sql).await?;
    Ok(())
}

async fn list_tables(
    client: &Client,
    schemas: &[String],
) -> Result<Vec<(String, String)>, VerifyError> {
    let rows = client
        .query(
            "SELECT t.table_schema, t.table_name
               FROM information_schema.tables t
              WHERE t.table_type = 'BASE TABLE'
                AND t.table_schema = ANY($1)
              ORDER BY t.table_schema, t.table_name",
            &[&schemas],
        )
        .await?;

    rows.iter()
        .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
        .collect()
}

async fn load_primary_keys(
    client: &Client,
    schemas: &[String],
) -> Result<HashMap<(String, String), Vec<String>>, VerifyError> {
    let rows = client
        .query(
            "SELECT kcu.table_schema, kcu.table_name, kcu.column_name
               FROM information_schema.table_constraints tc
               JOIN information_schema.key_column_usage kcu
                 ON kcu.constraint_name = tc.constraint_name
                AND kcu.table_schema = tc.table_schema
              WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = ANY($1)
              ORDER BY kcu.table_schema, kcu.table_name, kcu.ordinal_position",
            &[&schemas],
        )
        .await?;

    let mut primary_keys: HashMap<(String, String), Vec<String>> = HashMap::new();
    for row in rows {
        let schema: String = row.try_get(0)?;
        let table: String = row.try_get(1)?;
        let column: String = row.try_get(2)?;
        primary_keys.entry((schema, table)).or_default().push(column);
    }
    Ok(primary_keys)
}

fn checksum_query(schema: &str, table: &str, pkey_fields: &[String]) -> String {
    let qualified = format!("{}.{}", quote_identifier(schema), quote_identifier(table));
    let order_by = pkey_fields
        .iter()
        .map(|column| format!("{qualified}.{}", quote_identifier(column)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "SELECT (warp_pipe.md5_hashagg(md5(CAST(({qualified}.*) AS TEXT)) ORDER BY {order_by}))::text FROM {qualified}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_query_orders_by_the_full_primary_key() {
        let query = checksum_query(
            "public",
            "events",
            &["tenant_id".to_string(), "event_id".to_string()],
        );
        assert_eq!(
            query,
            "SELECT (warp_pipe.md5_hashagg(md5(CAST((public.events.*) AS TEXT)) \
             ORDER BY public.events.tenant_id, public.events.event_id))::text FROM public.events"
        );
    }
}
