use axon::config::AxonConfig;
use axon::shutdown::Shutdown;
use axon::Axon;
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

const TEST_HOST: &str = "localhost";
const TEST_PORT: u16 = 5430;
const TEST_USER: &str = "postgres";
const TEST_PASSWORD: &str = "postgres";

/// A freshly created database on the test PostgreSQL server.
pub struct TestDatabase {
    pub name: String,
    pub client: Client,
}

impl TestDatabase {
    /// Creates a database with a random name and connects to it.
    pub async fn spawn() -> TestDatabase {
        let name = Uuid::new_v4().to_string();

        let admin = connect_to("postgres").await;
        admin
            .execute(&format!(r#"CREATE DATABASE "{name}""#), &[])
            .await
            .expect("failed to create test database");

        let client = connect_to(&name).await;
        TestDatabase { name, client }
    }

    pub async fn execute(&self, sql: &str) {
        self.client
            .batch_execute(sql)
            .await
            .unwrap_or_else(|e| panic!("statement failed: {e}\n{sql}"));
    }

    pub async fn count(&self, table: &str) -> i64 {
        self.client
            .query_one(&format!("SELECT COUNT(*) FROM {table}"), &[])
            .await
            .expect("count query failed")
            .get(0)
    }
}

async fn connect_to(database: &str) -> Client {
    let mut config = tokio_postgres::Config::new();
    config
        .host(TEST_HOST)
        .port(TEST_PORT)
        .dbname(database)
        .user(TEST_USER)
        .password(TEST_PASSWORD);

    let (client, connection) = config
        .connect(NoTls)
        .await
        .expect("failed to connect to the test PostgreSQL server");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });

    client
}

/// Connection configuration for a test database.
pub fn pg_config(database: &TestDatabase) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(TEST_HOST)
        .port(TEST_PORT)
        .dbname(&database.name)
        .user(TEST_USER)
        .password(TEST_PASSWORD);
    config
}

/// Pipeline configuration wired to a test source/target pair, in drain mode
/// with a fast poll interval.
pub fn drain_config(source: &TestDatabase, target: &TestDatabase) -> AxonConfig {
    AxonConfig {
        source_db_host: TEST_HOST.to_string(),
        source_db_port: TEST_PORT,
        source_db_name: source.name.clone(),
        source_db_user: TEST_USER.to_string(),
        source_db_pass: TEST_PASSWORD.to_string(),
        target_db_host: TEST_HOST.to_string(),
        target_db_port: TEST_PORT,
        target_db_name: target.name.clone(),
        target_db_user: TEST_USER.to_string(),
        target_db_pass: TEST_PASSWORD.to_string(),
        target_db_schema: "public".to_string(),
        shutdown_after_last_changeset: true,
        start_from_id: 0,
        poll_interval_ms: 100,
        listener_batch_size: 500,
        channel_capacity: 64,
        connect_timeout_secs: 10,
        max_reconnect_attempts: 3,
        checkpoint_file: None,
    }
}

/// Runs the pipeline until drain mode observes the newest changeset applied.
pub async fn run_to_drain(config: AxonConfig) {
    Axon::new(config)
        .run(Shutdown::new())
        .await
        .expect("pipeline run failed");
}
