use std::time::Duration;

use pg_escape::quote_literal;
use thiserror::Error;
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::applier::Applier;
use crate::checkpoint::{CheckpointError, CheckpointFile};
use crate::config::AxonConfig;
use crate::listener::{
    ChangesetListener, ChangesetStreams, ListenerConfig, ListenerError, NotifyListener,
};
use crate::metadata::{MetadataError, TargetMetadata};
use crate::shutdown::Shutdown;

/// Oldest `server_version_num` the applier is tested against.
const MINIMUM_TARGET_VERSION: i64 = 90600;

/// Bound on how long shutdown waits for in-flight changesets to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connecting to the {role} database timed out after {timeout:?}")]
    ConnectTimeout {
        role: &'static str,
        timeout: Duration,
    },

    #[error("target server_version_num {0} is below the minimum supported 90600")]
    UnsupportedTargetVersion(i64),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// The coordinator: owns connections, wires the listener to the applier and
/// supervises the replication loop until shutdown.
pub struct Axon {
    config: AxonConfig,
}

impl Axon {
    pub fn new(config: AxonConfig) -> Axon {
        Axon { config }
    }

    /// Runs replication until the shutdown signal fires, the listener fails
    /// fatally, or drain mode observes the newest changeset applied.
    ///
    /// Statement-level errors inside the apply loop are logged by the applier
    /// and never terminate the run.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), PipelineError> {
        let connect_timeout = self.config.connect_timeout();
        let source = connect("source", &self.config.source_pg_config(), connect_timeout).await?;
        let target = connect("target", &self.config.target_pg_config(), connect_timeout).await?;

        check_target_version(&target).await?;
        log_source_stats(&source).await?;

        let metadata = TargetMetadata::load(&target, &source).await?;
        mirror_orphan_sequences(&source, &target, &metadata.orphan_sequences).await;

        let checkpoint = self.config.checkpoint_file.as_ref().map(CheckpointFile::new);
        let mut start_from_id = self.config.start_from_id;
        if let Some(checkpoint) = &checkpoint {
            if let Some(id) = checkpoint.load().await? {
                start_from_id = start_from_id.max(id);
            }
        }

        let mut listener = NotifyListener::new(ListenerConfig {
            pg: self.config.source_pg_config(),
            start_from_id,
            poll_interval: self.config.poll_interval(),
            batch_size: self.config.listener_batch_size,
            channel_capacity: self.config.channel_capacity,
            connect_timeout,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
        });
        listener.open().await?;

        // Drain mode with nothing to drain: the loop below only re-checks
        // `is_latest` after an apply, so a fully caught-up source must exit
        // here.
        if self.config.shutdown_after_last_changeset && listener.is_latest(start_from_id).await? {
            info!(start_from_id, "sync is complete, shutting down...");
            listener.close().await;
            return Ok(());
        }

        let ChangesetStreams {
            mut changes,
            mut errors,
        } = listener.listen(shutdown.clone()).await?;

        let applier = Applier::new(
            target,
            metadata,
            self.config.schema_override().map(str::to_string),
        );

        info!(start_from_id, "replication started");

        let mut last_applied = start_from_id;
        let result = loop {
            tokio::select! {
                _ = shutdown.fired() => {
                    info!("shutting down...");
                    let drain = async {
                        while let Some(change) = changes.recv().await {
                            applier.apply(&change).await;
                            last_applied = change.id;
                        }
                    };
                    if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                        warn!("shutdown drain timed out with changesets still in flight");
                    }
                    break Ok(());
                }
                Some(e) = errors.recv() => {
                    break Err(PipelineError::Listener(e));
                }
                maybe_change = changes.recv() => {
                    match maybe_change {
                        Some(change) => {
                            let id = change.id;
                            applier.apply(&change).await;
                            last_applied = id;
                            if self.config.shutdown_after_last_changeset
                                && listener.is_latest(id).await?
                            {
                                info!("sync is complete, shutting down...");
                                break Ok(());
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        if let Some(checkpoint) = &checkpoint {
            if last_applied > start_from_id {
                checkpoint.save(last_applied).await?;
            }
        }

        listener.close().await;
        info!(last_applied, "replication stopped");

        result
    }
}

/// Connects a client and drives its connection on a background task.
pub async fn connect(
    role: &'static str,
    config: &tokio_postgres::Config,
    connect_timeout: Duration,
) -> Result<Client, PipelineError> {
    let (client, connection) = timeout(connect_timeout, config.connect(NoTls))
        .await
        .map_err(|_| PipelineError::ConnectTimeout {
            role,
            timeout: connect_timeout,
        })??;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("{role} connection error: {e}");
        }
    });

    info!("connected to {role} database");
    Ok(client)
}

async fn check_target_version(target: &Client) -> Result<(), PipelineError> {
    let row = target
        .query_one("SELECT current_setting('server_version_num')", &[])
        .await?;
    let version: i64 = row.try_get::<_, String>(0)?.parse().unwrap_or(0);

    if version < MINIMUM_TARGET_VERSION {
        return Err(PipelineError::UnsupportedTargetVersion(version));
    }
    Ok(())
}

async fn log_source_stats(source: &Client) -> Result<(), PipelineError> {
    let row = source
        .query_one(
            "SELECT COUNT(*), COALESCE(MIN(id), 0), COALESCE(MAX(id), 0)
               FROM warp_pipe.changesets",
            &[],
        )
        .await?;

    let changesets: i64 = row.try_get(0)?;
    let min_id: i64 = row.try_get(1)?;
    let max_id: i64 = row.try_get(2)?;
    info!(changesets, min_id, max_id, "source capture statistics");
    Ok(())
}

/// Copies the position of sequences with no owning column from the source to
/// the target, so target-local `nextval` calls continue past replicated ids.
async fn mirror_orphan_sequences(source: &Client, target: &Client, sequences: &[String]) {
    for sequence in sequences {
        let value = match source
            .query_one(&format!("SELECT last_value FROM {sequence}"), &[])
            .await
        {
            Ok(row) => row.get::<_, i64>(0),
            Err(e) => {
                warn!(%sequence, "failed to read source sequence: {e}");
                continue;
            }
        };

        let statement = format!(
            "SELECT setval({}, GREATEST({value}, (SELECT last_value FROM {sequence})))",
            quote_literal(sequence)
        );
        if let Err(e) = target.simple_query(&statement).await {
            warn!(%sequence, "failed to mirror sequence onto target: {e}");
        }
    }
}
