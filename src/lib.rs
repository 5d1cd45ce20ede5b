//! Driver-agnostic PostgreSQL access layer.
//!
//! One uniform client surface — `with_pg_client`, `with_transaction`,
//! `query`, `listen` — over three backends with very different concurrency
//! and transaction semantics:
//! - a deadpool-managed tokio-postgres pool (`backend::pooled`)
//! - an sqlx driver instance with its own internal pool (`backend::tagged`)
//! - a single long-lived exclusive connection (`backend::single`)
//!
//! Architecture:
//! - `pool`: the unified `PgPool` handle, variant-tagged configuration,
//!   services and the shared service cache
//! - `client`: the scoped `PgClient`, the settings envelope and the nested
//!   transaction state machine
//! - `statement`: the bounded server-side prepared-statement cache
//! - `subscriber`: LISTEN/NOTIFY fan-out over reference-counted channels
//! - `value` / `settings` / `error`: the dynamic value model, the exact SQL
//!   this layer emits, and the error taxonomy

pub mod backend;
pub mod client;
pub mod error;
pub mod pool;
pub mod settings;
pub mod statement;
pub mod subscriber;
pub mod value;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;

// Public API re-exports for library consumers
pub use backend::{
    ClientBackend, ListenErrorCallback, NotifyCallback, SettingsMode, UnlistenHandle,
};
pub use client::PgClient;
pub use error::{BoxError, PgBridgeError, PgBridgeResult};
pub use pool::{
    acquire_shared_service, make_service, release_shared_service, PgPool, PoolConfig,
    PooledPoolConfig, Service, ServiceConfig, SinglePoolConfig, TaggedPoolConfig,
};
pub use settings::PgSettings;
pub use statement::{
    ClientKey, ConnectionToken, StatementManager, StatementManagerConfig, StatementStats,
};
pub use subscriber::{PgSubscriber, PgSubscription};
pub use value::{PgValue, QueryResult, Row};
