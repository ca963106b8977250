use std::collections::BTreeSet;

use pg_escape::{quote_identifier, quote_literal};
use thiserror::Error;
use tokio_postgres::{Client, SimpleQueryMessage};
use tracing::{info, warn};

/// The auxiliary schema installed on the source database.
pub const CAPTURE_SCHEMA: &str = "warp_pipe";

/// Notification channel the trigger function signals on every captured change.
pub const CHANGESET_CHANNEL: &str = "warp_pipe_new_changeset";

/// Name of the per-table capture trigger.
const TRIGGER_NAME: &str = "warp_pipe_on_modify";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture setup failed: {0}")]
    Setup(#[from] tokio_postgres::Error),
}

const CREATE_CAPTURE_SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS warp_pipe;

CREATE EXTENSION IF NOT EXISTS hstore;

CREATE TABLE IF NOT EXISTS warp_pipe.changesets (
    id          BIGSERIAL PRIMARY KEY,
    ts          TIMESTAMPTZ NOT NULL DEFAULT now(),
    action      TEXT NOT NULL CHECK (action IN ('INSERT', 'UPDATE', 'DELETE')),
    schema_name TEXT NOT NULL,
    table_name  TEXT NOT NULL,
    new_values  JSONB,
    old_values  JSONB
);

CREATE INDEX IF NOT EXISTS changesets_table_idx
    ON warp_pipe.changesets (schema_name, table_name);
"#;

// hstore serialization keeps every value in its PostgreSQL text form, so
// arrays, timestamps and jsonb round-trip through the capture table without
// drift when the applier replays them as literals.
const CREATE_TRIGGER_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION warp_pipe.on_modify() RETURNS trigger
LANGUAGE plpgsql
AS $fn$
DECLARE
    changeset_id bigint;
BEGIN
    IF TG_OP = 'INSERT' THEN
        INSERT INTO warp_pipe.changesets (action, schema_name, table_name, new_values, old_values)
        VALUES (TG_OP, TG_TABLE_SCHEMA, TG_TABLE_NAME, hstore_to_jsonb(hstore(NEW)), NULL)
        RETURNING id INTO changeset_id;
    ELSIF TG_OP = 'UPDATE' THEN
        INSERT INTO warp_pipe.changesets (action, schema_name, table_name, new_values, old_values)
        VALUES (TG_OP, TG_TABLE_SCHEMA, TG_TABLE_NAME, hstore_to_jsonb(hstore(NEW)), hstore_to_jsonb(hstore(OLD)))
        RETURNING id INTO changeset_id;
    ELSE
        INSERT INTO warp_pipe.changesets (action, schema_name, table_name, new_values, old_values)
        VALUES (TG_OP, TG_TABLE_SCHEMA, TG_TABLE_NAME, NULL, hstore_to_jsonb(hstore(OLD)))
        RETURNING id INTO changeset_id;
    END IF;
    PERFORM pg_notify('warp_pipe_new_changeset', changeset_id::text);
    RETURN NULL;
END;
$fn$;
"#;

/// Installs the capture schema and triggers on the source database.
///
/// Idempotent: a re-run converges to the same installed state, and a re-run
/// with a different `ignore_tables` set drops the triggers of tables that left
/// the set and adds the newly included ones. Tables without a primary key are
/// skipped with a warning since their updates and deletes cannot be replayed.
pub async fn setup_capture(
    client: &Client,
    schema_to_track: &str,
    ignore_tables: &[String],
) -> Result<(), CaptureError> {
    client.batch_execute(CREATE_CAPTURE_SCHEMA).await?;
    client.batch_execute(CREATE_TRIGGER_FUNCTION).await?;

    let mut tracked = BTreeSet::new();
    for (table, has_pkey) in list_candidate_tables(client, schema_to_track).await? {
        if ignore_tables.contains(&table) {
            continue;
        }
        if !has_pkey {
            warn!(
                schema = schema_to_track,
                %table, "table has no primary key, skipping capture trigger"
            );
            continue;
        }
        tracked.insert(table);
    }

    let existing = list_existing_triggers(client, schema_to_track).await?;
    let (to_create, to_drop) = reconcile_triggers(&tracked, &existing);

    for table in &to_drop {
        client
            .batch_execute(&format!(
                "DROP TRIGGER IF EXISTS {TRIGGER_NAME} ON {}.{};",
                quote_identifier(schema_to_track),
                quote_identifier(table)
            ))
            .await?;
        info!(schema = schema_to_track, %table, "dropped capture trigger");
    }

    for table in &to_create {
        let qualified = format!(
            "{}.{}",
            quote_identifier(schema_to_track),
            quote_identifier(table)
        );
        client
            .batch_execute(&format!(
                "DROP TRIGGER IF EXISTS {TRIGGER_NAME} ON {qualified};
                 CREATE TRIGGER {TRIGGER_NAME}
                     AFTER INSERT OR UPDATE OR DELETE ON {qualified}
                     FOR EACH ROW EXECUTE PROCEDURE warp_pipe.on_modify();"
            ))
            .await?;
    }

    info!(
        schema = schema_to_track,
        tables = tracked.len(),
        "capture setup complete"
    );

    Ok(())
}

/// Returns `(table_name, has_primary_key)` for every base table in the schema.
async fn list_candidate_tables(
    client: &Client,
    schema: &str,
) -> Result<Vec<(String, bool)>, tokio_postgres::Error> {
    let query = format!(
        "SELECT t.table_name,
                EXISTS (
                    SELECT 1
                      FROM information_schema.table_constraints tc
                     WHERE tc.table_schema = t.table_schema
                       AND tc.table_name = t.table_name
                       AND tc.constraint_type = 'PRIMARY KEY'
                ) AS has_pkey
           FROM information_schema.tables t
          WHERE t.table_schema = {}
            AND t.table_type = 'BASE TABLE'
          ORDER BY t.table_name;",
        quote_literal(schema)
    );

    let mut tables = vec![];
    for message in client.simple_query(&query).await? {
        if let SimpleQueryMessage::Row(row) = message {
            let name = row.get("table_name").unwrap_or_default().to_string();
            let has_pkey = row.get("has_pkey") == Some("t");
            tables.push((name, has_pkey));
        }
    }
    Ok(tables)
}

async fn list_existing_triggers(
    client: &Client,
    schema: &str,
) -> Result<BTreeSet<String>, tokio_postgres::Error> {
    let query = format!(
        "SELECT DISTINCT event_object_table
           FROM information_schema.triggers
          WHERE trigger_name = {}
            AND event_object_schema = {};",
        quote_literal(TRIGGER_NAME),
        quote_literal(schema)
    );

    let mut tables = BTreeSet::new();
    for message in client.simple_query(&query).await? {
        if let SimpleQueryMessage::Row(row) = message {
            if let Some(table) = row.get("event_object_table") {
                tables.insert(table.to_string());
            }
        }
    }
    Ok(tables)
}

fn reconcile_triggers(
    tracked: &BTreeSet<String>,
    existing: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let to_create = tracked.iter().cloned().collect();
    let to_drop = existing.difference(tracked).cloned().collect();
    (to_create, to_drop)
}
