//! # genq
//!
//! Task scheduling and distributed queue engine for long-running
//! generation jobs.
//!
//! Tasks live in a SQLite-backed store (sqlx). Workers pull them by
//! priority through a [`queue::TaskQueue`], either in-process
//! ([`queue::LocalQueue`]) or over HTTP ([`queue::RemoteQueue`] against
//! [`server::router`]), with OpenTelemetry observability throughout.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod flows;
pub mod model;
pub mod notify;
pub mod queue;
pub mod server;
pub mod telemetry;
pub mod worker;
