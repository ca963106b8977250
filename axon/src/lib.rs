//! # axon
//!
//! Trigger-based logical replication between PostgreSQL databases.
//!
//! A source database is instrumented ([`capture`]) so that every row-level
//! mutation on tracked tables lands as a changeset in the auxiliary
//! `warp_pipe` schema. The coordinator ([`pipeline::Axon`]) streams those
//! changesets in commit order ([`listener`]) and replays them against a
//! target database ([`applier`]), giving at-least-once delivery with
//! idempotent replay. A checksum verifier ([`verify`]) proves equivalence of
//! source and target tables.

pub mod applier;
pub mod capture;
pub mod changeset;
pub mod checkpoint;
pub mod config;
pub mod listener;
pub mod metadata;
pub mod pipeline;
pub mod shutdown;
pub mod verify;
pub mod wal2json;

pub use config::AxonConfig;
pub use pipeline::Axon;

// re-export tokio_postgres so callers can work with its config and row types
pub use tokio_postgres;
