use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_postgres::{AsyncMessage, Client, NoTls, Notification, Row};
use tracing::{debug, info, warn};

use crate::capture::CHANGESET_CHANNEL;
use crate::changeset::{column_values_from_json, Changeset, ChangesetError};
use crate::shutdown::Shutdown;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connecting to the source timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("source connection lost, {attempts} reconnect attempts failed: {last_error}")]
    ReconnectsExhausted { attempts: u32, last_error: String },

    #[error("invalid changeset row: {0}")]
    InvalidChangeset(#[from] ChangesetError),

    #[error("listener is not open")]
    NotOpen,
}

/// Output streams of a running listener.
///
/// `changes` yields changesets in strictly increasing id order; `errors`
/// carries at most one fatal listener error, after which `changes` closes.
pub struct ChangesetStreams {
    pub changes: mpsc::Receiver<Changeset>,
    pub errors: mpsc::Receiver<ListenerError>,
}

/// A source of changesets in monotonic id order, resumable from a cursor.
#[async_trait]
pub trait ChangesetListener {
    /// Establishes the listener's control connection.
    async fn open(&mut self) -> Result<(), ListenerError>;

    /// Starts streaming changesets with ids strictly greater than the
    /// configured floor. The stream stops after the in-flight batch once
    /// `shutdown` fires.
    async fn listen(&mut self, shutdown: Shutdown) -> Result<ChangesetStreams, ListenerError>;

    /// Whether `id` is the current maximum changeset id on the source.
    async fn is_latest(&self, id: i64) -> Result<bool, ListenerError>;

    /// Releases connections and stops background tasks.
    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub pg: tokio_postgres::Config,
    /// Ids up to and including this one are considered already applied.
    pub start_from_id: i64,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub channel_capacity: usize,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

/// Listener over the `warp_pipe.changesets` table, woken by LISTEN/NOTIFY
/// with a poll tick as fallback.
pub struct NotifyListener {
    config: ListenerConfig,
    control: Option<Client>,
    control_driver: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl NotifyListener {
    pub fn new(config: ListenerConfig) -> Self {
        NotifyListener {
            config,
            control: None,
            control_driver: None,
            reader: None,
        }
    }
}

#[async_trait]
impl ChangesetListener for NotifyListener {
    async fn open(&mut self) -> Result<(), ListenerError> {
        let (client, _, driver) = connect(&self.config).await?;
        self.control = Some(client);
        self.control_driver = Some(driver);
        Ok(())
    }

    async fn listen(&mut self, shutdown: Shutdown) -> Result<ChangesetStreams, ListenerError> {
        if self.control.is_none() {
            return Err(ListenerError::NotOpen);
        }

        let (changes_tx, changes_rx) = mpsc::channel(self.config.channel_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let config = self.config.clone();
        self.reader = Some(tokio::spawn(async move {
            run_reader(config, shutdown, changes_tx, errors_tx).await;
        }));

        Ok(ChangesetStreams {
            changes: changes_rx,
            errors: errors_rx,
        })
    }

    async fn is_latest(&self, id: i64) -> Result<bool, ListenerError> {
        let client = self.control.as_ref().ok_or(ListenerError::NotOpen)?;
        let row = client
            .query_one(
                "SELECT COALESCE(MAX(id), 0) FROM warp_pipe.changesets",
                &[],
            )
            .await?;
        let max_id: i64 = row.get(0);
        Ok(id == max_id)
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.control = None;
        if let Some(driver) = self.control_driver.take() {
            driver.abort();
        }
    }
}

/// Connects to the source, subscribes to the changeset channel and forwards
/// notifications from the connection into a channel; the connection itself is
/// driven by the returned task.
async fn connect_listening(
    config: &ListenerConfig,
) -> Result<
    (
        Client,
        mpsc::UnboundedReceiver<Notification>,
        JoinHandle<()>,
    ),
    ListenerError,
> {
    let (client, notify_rx, driver) = connect(config).await?;

    if let Err(e) = client
        .batch_execute(&format!("LISTEN {CHANGESET_CHANNEL};"))
        .await
    {
        driver.abort();
        return Err(e.into());
    }

    Ok((client, notify_rx, driver))
}

/// Connects to the source and drives the connection on a background task.
async fn connect(
    config: &ListenerConfig,
) -> Result<
    (
        Client,
        mpsc::UnboundedReceiver<Notification>,
        JoinHandle<()>,
    ),
    ListenerError,
> {
    let (client, mut connection) = timeout(config.connect_timeout, config.pg.connect(NoTls))
        .await
        .map_err(|_| ListenerError::ConnectTimeout(config.connect_timeout))??;

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(async move {
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    if notify_tx.send(notification).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("source connection terminated: {e}");
                    break;
                }
            }
        }
    });

    Ok((client, notify_rx, driver))
}

async fn run_reader(
    config: ListenerConfig,
    shutdown: Shutdown,
    changes_tx: mpsc::Sender<Changeset>,
    errors_tx: mpsc::Sender<ListenerError>,
) {
    let mut last_emitted = config.start_from_id;
    let mut attempts = 0u32;

    'reconnect: loop {
        let (client, mut notifications, driver) = match connect_listening(&config).await {
            Ok(connected) => {
                attempts = 0;
                connected
            }
            Err(e) => {
                attempts += 1;
                if attempts >= config.max_reconnect_attempts {
                    let _ = errors_tx
                        .send(ListenerError::ReconnectsExhausted {
                            attempts,
                            last_error: e.to_string(),
                        })
                        .await;
                    return;
                }
                let delay = backoff_delay(attempts);
                warn!(attempt = attempts, ?delay, "source connection failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'reconnect,
                    _ = shutdown.fired() => return,
                }
            }
        };

        info!(start_after = last_emitted, "listening for changesets");

        let mut poll = tokio::time::interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            match fetch_batch(&client, last_emitted, config.batch_size).await {
                Ok(batch) => {
                    let full_batch = batch.len() as i64 == config.batch_size;
                    for change in batch {
                        let id = change.id;
                        if changes_tx.send(change).await.is_err() {
                            // Consumer is gone; nothing left to emit to.
                            driver.abort();
                            return;
                        }
                        last_emitted = id;
                    }
                    if full_batch {
                        continue;
                    }
                }
                Err(ListenerError::InvalidChangeset(e)) => {
                    let _ = errors_tx.send(ListenerError::InvalidChangeset(e)).await;
                    driver.abort();
                    return;
                }
                Err(e) => {
                    warn!("failed to read changesets, reconnecting: {e}");
                    driver.abort();
                    continue 'reconnect;
                }
            }

            tokio::select! {
                _ = shutdown.fired() => {
                    // Flush anything that arrived before the signal, then stop.
                    if let Ok(batch) = fetch_batch(&client, last_emitted, config.batch_size).await {
                        for change in batch {
                            let id = change.id;
                            if changes_tx.send(change).await.is_err() {
                                break;
                            }
                            last_emitted = id;
                        }
                    }
                    driver.abort();
                    return;
                }
                _ = poll.tick() => {}
                notification = notifications.recv() => {
                    if notification.is_none() {
                        warn!("source connection closed, reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}

async fn fetch_batch(
    client: &Client,
    after_id: i64,
    batch_size: i64,
) -> Result<Vec<Changeset>, ListenerError> {
    let rows = client
        .query(
            "SELECT id, ts, action, schema_name, table_name, new_values, old_values
               FROM warp_pipe.changesets
              WHERE id > $1
              ORDER BY id ASC
              LIMIT $2",
            &[&after_id, &batch_size],
        )
        .await?;

    rows.iter().map(changeset_from_row).collect()
}

fn changeset_from_row(row: &Row) -> Result<Changeset, ListenerError> {
    let action: String = row.try_get("action")?;
    let new_values: Option<serde_json::Value> = row.try_get("new_values")?;
    let old_values: Option<serde_json::Value> = row.try_get("old_values")?;

    Ok(Changeset {
        id: row.try_get("id")?,
        ts: row.try_get("ts")?,
        kind: action.parse()?,
        schema: row.try_get("schema_name")?,
        table: row.try_get("table_name")?,
        new_values: column_values_from_json(new_values.as_ref())?,
        old_values: column_values_from_json(old_values.as_ref())?,
    })
}

fn backoff_delay(attempt: u32) -> Duration {
    const BASE: Duration = Duration::from_secs(1);
    const CEILING: Duration = Duration::from_secs(32);
    BASE.saturating_mul(1u32 << (attempt - 1).min(5)).min(CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        assert_eq!(backoff_delay(60), Duration::from_secs(32));
    }
}
