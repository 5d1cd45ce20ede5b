//! Backend adaptors.
//!
//! Each adaptor translates the unified client surface to one concrete
//! driver family:
//! - `pooled`: a deadpool-managed tokio-postgres pool (explicit-SQL
//!   transactions, first-class LISTEN on a dedicated connection)
//! - `tagged`: an sqlx driver instance owning its internal pool (native
//!   transaction primitive, native statement cache, driver-level LISTEN)
//! - `single`: one long-lived tokio-postgres connection behind an exclusive
//!   lock (session-level settings with restore)

pub mod pooled;
pub mod single;
pub mod tagged;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::OwnedMutexGuard;

use crate::error::PgBridgeResult;
use crate::value::{PgValue, QueryResult};

/// How a backend scopes session settings inside `with_pg_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsMode {
    /// `set_config(..., true)`: settings die with the surrounding
    /// transaction.
    TransactionLocal,
    /// `set_config(..., false)` with explicit capture/restore of previous
    /// values: required on a single shared session.
    SessionRestore,
}

/// A logical connection as seen by the envelope, the statement manager and
/// the transaction state machine.
///
/// The default transaction-control methods issue explicit SQL; backends
/// with a native primitive override the top-level transitions.
#[async_trait]
pub trait ClientBackend: Send + Sync {
    /// Execute a statement, returning rows. `array_mode` skips column-name
    /// extraction (rows stay positional).
    async fn query_raw(
        &self,
        sql: &str,
        params: &[PgValue],
        array_mode: bool,
    ) -> PgBridgeResult<QueryResult>;

    /// Execute a statement via the simple protocol, discarding any rows.
    async fn batch_execute(&self, sql: &str) -> PgBridgeResult<()>;

    /// Enter a top-level transaction (the L0 -> L1 boundary).
    async fn begin_top_level(&self) -> PgBridgeResult<()> {
        self.batch_execute("BEGIN").await
    }

    /// Commit a top-level transaction.
    async fn commit_top_level(&self) -> PgBridgeResult<()> {
        self.batch_execute("COMMIT").await
    }

    /// Roll back a top-level transaction.
    async fn rollback_top_level(&self) -> PgBridgeResult<()> {
        self.batch_execute("ROLLBACK").await
    }

    /// How this backend scopes session settings.
    fn settings_mode(&self) -> SettingsMode {
        SettingsMode::TransactionLocal
    }

    /// Lock held for the duration of a settings-scoped envelope.
    ///
    /// The tagged backend returns its pool-wide queue here (settings are
    /// transaction-local, so setting-scoped work must not interleave); the
    /// single backend returns its exclusive-execution lock.
    async fn session_lock(&self) -> Option<OwnedMutexGuard<()>> {
        None
    }

    /// Lock held around a single statement when no session lock is already
    /// held. Only the single-connection backend needs this.
    async fn statement_lock(&self) -> Option<OwnedMutexGuard<()>> {
        None
    }

    /// Whether the L0 -> L1 `with_transaction` boundary must hold the
    /// session lock for the transaction's duration.
    fn transaction_lock_at_top_level(&self) -> bool {
        false
    }
}

/// Callback invoked with each notification payload for a listened channel.
pub type NotifyCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked when a listener's connection errors.
pub type ListenErrorCallback = Arc<dyn Fn(crate::error::PgBridgeError) + Send + Sync>;

/// Handle returned by `listen`; invoking it tears the physical `LISTEN`
/// down and releases the dedicated resources behind it.
pub struct UnlistenHandle {
    teardown: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

impl UnlistenHandle {
    pub(crate) fn new(teardown: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) -> Self {
        Self {
            teardown: Box::new(teardown),
        }
    }

    /// Stop listening. Unlisten errors are swallowed; pending reconnection
    /// attempts are cancelled.
    pub async fn unlisten(self) {
        (self.teardown)().await;
    }
}

impl std::fmt::Debug for UnlistenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlistenHandle").finish_non_exhaustive()
    }
}
