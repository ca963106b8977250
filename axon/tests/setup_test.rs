mod common;

use axon::capture::setup_capture;
use tokio_postgres::Client;

use crate::common::TestDatabase;

async fn capture_triggers(client: &Client) -> Vec<String> {
    client
        .query(
            "SELECT DISTINCT event_object_table
               FROM information_schema.triggers
              WHERE trigger_name = 'warp_pipe_on_modify'
              ORDER BY 1",
            &[],
        )
        .await
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn setup_is_idempotent() {
    let source = TestDatabase::spawn().await;
    source
        .execute("CREATE TABLE users (id SERIAL PRIMARY KEY, v TEXT)")
        .await;
    source
        .execute("CREATE TABLE orders (id SERIAL PRIMARY KEY, total INT)")
        .await;

    setup_capture(&source.client, "public", &[]).await.unwrap();
    let first = capture_triggers(&source.client).await;

    setup_capture(&source.client, "public", &[]).await.unwrap();
    let second = capture_triggers(&source.client).await;

    assert_eq!(first, vec!["orders".to_string(), "users".to_string()]);
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread")]
async fn rerun_reconciles_the_ignore_set() {
    let source = TestDatabase::spawn().await;
    source
        .execute("CREATE TABLE users (id SERIAL PRIMARY KEY, v TEXT)")
        .await;
    source
        .execute("CREATE TABLE audit (id SERIAL PRIMARY KEY, note TEXT)")
        .await;

    setup_capture(&source.client, "public", &[]).await.unwrap();
    assert_eq!(
        capture_triggers(&source.client).await,
        vec!["audit".to_string(), "users".to_string()]
    );

    // Second run ignores `audit`: its trigger must be dropped.
    setup_capture(&source.client, "public", &["audit".to_string()])
        .await
        .unwrap();
    assert_eq!(
        capture_triggers(&source.client).await,
        vec!["users".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_without_primary_keys_are_skipped() {
    let source = TestDatabase::spawn().await;
    source
        .execute("CREATE TABLE users (id SERIAL PRIMARY KEY, v TEXT)")
        .await;
    source.execute("CREATE TABLE no_pkey (v TEXT)").await;

    setup_capture(&source.client, "public", &[]).await.unwrap();

    assert_eq!(
        capture_triggers(&source.client).await,
        vec!["users".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn captured_changesets_record_row_images() {
    let source = TestDatabase::spawn().await;
    source
        .execute("CREATE TABLE users (id SERIAL PRIMARY KEY, v TEXT)")
        .await;
    setup_capture(&source.client, "public", &[]).await.unwrap();

    source.execute("INSERT INTO users (v) VALUES ('a')").await;
    source.execute("UPDATE users SET v = 'b' WHERE id = 1").await;
    source.execute("DELETE FROM users WHERE id = 1").await;

    let rows = source
        .client
        .query(
            "SELECT action, new_values, old_values
               FROM warp_pipe.changesets
              ORDER BY id",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);

    let insert_new: serde_json::Value = rows[0].get(1);
    assert_eq!(rows[0].get::<_, String>(0), "INSERT");
    assert_eq!(insert_new["v"], "a");
    assert!(rows[0].get::<_, Option<serde_json::Value>>(2).is_none());

    let update_old: serde_json::Value = rows[1].get(2);
    assert_eq!(rows[1].get::<_, String>(0), "UPDATE");
    assert_eq!(update_old["id"], "1");
    assert_eq!(update_old["v"], "a");

    let delete_old: serde_json::Value = rows[2].get(2);
    assert_eq!(rows[2].get::<_, String>(0), "DELETE");
    assert_eq!(delete_old["v"], "b");
    assert!(rows[2].get::<_, Option<serde_json::Value>>(1).is_none());
}
