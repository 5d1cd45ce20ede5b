//! The scoped client handle and its transaction machinery.
//!
//! A `PgClient` is only ever handed to `with_pg_client` / `with_transaction`
//! callbacks. It carries the backend connection, the transaction level, and
//! a per-client queue that keeps setting-scoped work from interleaving with
//! other operations on the same connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::backend::{ClientBackend, SettingsMode};
use crate::error::{PgBridgeError, PgBridgeResult};
use crate::settings::{
    apply_settings_sql, reset_sql, settings_parameter, PgSettings, APPLY_SETTINGS_SESSION_SQL,
    CURRENT_SETTING_SQL,
};
use crate::statement::{ClientKey, StatementManager};
use crate::value::{PgValue, QueryResult};

/// A scoped handle to a single logical connection.
///
/// Valid only inside a `with_pg_client` callback (or a `with_transaction`
/// callback nested therein); the borrow-based callback signatures keep it
/// from escaping.
pub struct PgClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    conn: Arc<dyn ClientBackend>,
    statements: Option<Arc<StatementManager>>,
    key: ClientKey,
    /// 0 = no transaction, 1 = top level, >= 2 = savepoint depth.
    level: Arc<AtomicUsize>,
    /// The connection was already inside a transaction when handed to us;
    /// forces a savepoint at the L0 -> L1 boundary.
    pre_existing: bool,
    /// Session-scope lock currently held on behalf of this connection
    /// (settings envelope, or a top-level transaction on the exclusive
    /// backend). Shared across nested handles so inner operations do not
    /// re-acquire it.
    session_guard: Arc<Mutex<Option<OwnedMutexGuard<()>>>>,
    /// Serializes operations issued through this handle. `with_transaction`
    /// holds a slot for its whole duration; the callback receives a child
    /// handle with a fresh queue.
    queue: AsyncMutex<()>,
}

impl PgClient {
    pub(crate) fn new(
        conn: Arc<dyn ClientBackend>,
        statements: Option<Arc<StatementManager>>,
        key: ClientKey,
        pre_existing: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                conn,
                statements,
                key,
                level: Arc::new(AtomicUsize::new(0)),
                pre_existing,
                session_guard: Arc::new(Mutex::new(None)),
                queue: AsyncMutex::new(()),
            }),
        }
    }

    /// A handle sharing this client's connection and transaction state but
    /// owning a fresh queue, for use inside a held transaction slot.
    fn child(&self) -> PgClient {
        PgClient {
            inner: Arc::new(ClientInner {
                conn: Arc::clone(&self.inner.conn),
                statements: self.inner.statements.clone(),
                key: self.inner.key.clone(),
                level: Arc::clone(&self.inner.level),
                pre_existing: self.inner.pre_existing,
                session_guard: Arc::clone(&self.inner.session_guard),
                queue: AsyncMutex::new(()),
            }),
        }
    }

    /// Current transaction level: 0 outside a transaction, 1 at top level,
    /// 2 and above at savepoint depth.
    pub fn transaction_level(&self) -> usize {
        self.inner.level.load(Ordering::SeqCst)
    }

    /// Execute a statement.
    pub async fn query(&self, sql: &str, values: &[PgValue]) -> PgBridgeResult<QueryResult> {
        self.query_named(None, sql, values, false).await
    }

    /// Execute a statement, caching it server-side under `name` when the
    /// backend routes through the statement manager.
    ///
    /// `array_mode` skips column-name extraction; rows stay positional.
    pub async fn query_named(
        &self,
        name: Option<&str>,
        sql: &str,
        values: &[PgValue],
        array_mode: bool,
    ) -> PgBridgeResult<QueryResult> {
        let _slot = self.inner.queue.lock().await;
        let _stmt_guard = self.statement_guard().await;
        match &self.inner.statements {
            Some(manager) => {
                manager
                    .execute_query(
                        &self.inner.key,
                        name,
                        sql,
                        values,
                        &self.inner.conn,
                        array_mode,
                    )
                    .await
            }
            None => self.inner.conn.query_raw(sql, values, array_mode).await,
        }
    }

    /// Run `f` inside a transaction scope.
    ///
    /// At level 0 this is a real `BEGIN` (or `SAVEPOINT tx` on a connection
    /// that was already inside a transaction); at deeper levels it is a
    /// savepoint named after the pre-call level. Success commits or
    /// releases; an error rolls back and propagates unchanged — rollback
    /// failures are logged, never surfaced in place of the original error.
    pub async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<PgBridgeError> + Send,
        F: for<'c> FnOnce(&'c PgClient) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let _slot = self.inner.queue.lock().await;

        let level = self.transaction_level();
        let mut acquired_session = false;
        if level == 0
            && self.inner.conn.transaction_lock_at_top_level()
            && !self.holds_session()
        {
            if let Some(guard) = self.inner.conn.session_lock().await {
                *self.inner.session_guard.lock() = Some(guard);
                acquired_session = true;
            }
        }

        let release_session = |client: &PgClient| {
            if acquired_session {
                client.inner.session_guard.lock().take();
            }
        };

        if let Err(error) = self.enter_transaction(level).await {
            release_session(self);
            return Err(E::from(error));
        }
        self.inner.level.store(level + 1, Ordering::SeqCst);

        let child = self.child();
        let result = f(&child).await;
        drop(child);
        self.inner.level.store(level, Ordering::SeqCst);

        match result {
            Ok(value) => {
                if let Err(error) = self.commit_transaction(level).await {
                    release_session(self);
                    return Err(E::from(error));
                }
                release_session(self);
                Ok(value)
            }
            Err(error) => {
                self.rollback_transaction(level).await;
                release_session(self);
                Err(error)
            }
        }
    }

    /// Apply `pg_settings` and run `f` with this client inside the settings
    /// scope, per the envelope protocol. Called once per `with_pg_client`.
    pub(crate) async fn run_with_settings<T, E, F>(
        &self,
        pg_settings: Option<&PgSettings>,
        f: F,
    ) -> Result<T, E>
    where
        T: Send,
        E: From<PgBridgeError> + Send,
        F: for<'c> FnOnce(&'c PgClient) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let settings = match pg_settings {
            Some(settings) if !settings.is_empty() => settings,
            _ => return f(self).await,
        };

        if let Some(guard) = self.inner.conn.session_lock().await {
            *self.inner.session_guard.lock() = Some(guard);
        }

        let mode = self.inner.conn.settings_mode();
        let result = self.run_settings_scope(settings, mode, f).await;
        self.inner.session_guard.lock().take();
        result
    }

    async fn run_settings_scope<T, E, F>(
        &self,
        settings: &PgSettings,
        mode: SettingsMode,
        f: F,
    ) -> Result<T, E>
    where
        T: Send,
        E: From<PgBridgeError> + Send,
        F: for<'c> FnOnce(&'c PgClient) -> BoxFuture<'c, Result<T, E>> + Send,
    {
        let captured = match mode {
            SettingsMode::SessionRestore => match self.capture_settings(settings).await {
                Ok(captured) => captured,
                Err(error) => return Err(E::from(error)),
            },
            SettingsMode::TransactionLocal => Vec::new(),
        };

        if let Err(error) = self.enter_transaction(0).await {
            self.restore_settings(&captured).await;
            return Err(E::from(error));
        }
        self.inner.level.store(1, Ordering::SeqCst);

        let local = mode == SettingsMode::TransactionLocal;
        let applied = self
            .inner
            .conn
            .query_raw(
                apply_settings_sql(local),
                &[settings_parameter(settings)],
                true,
            )
            .await;

        let result = match applied {
            Ok(_) => f(self).await,
            Err(error) => Err(E::from(error)),
        };

        self.inner.level.store(0, Ordering::SeqCst);
        let result = match result {
            Ok(value) => match self.commit_transaction(0).await {
                Ok(()) => Ok(value),
                Err(error) => Err(E::from(error)),
            },
            Err(error) => {
                self.rollback_transaction(0).await;
                Err(error)
            }
        };

        self.restore_settings(&captured).await;
        result
    }

    /// Record the pre-call value of every key about to be set. NULL (unset)
    /// values are captured as `None` and restored via `RESET`.
    async fn capture_settings(
        &self,
        settings: &PgSettings,
    ) -> PgBridgeResult<Vec<(String, Option<String>)>> {
        let mut captured: Vec<(String, Option<String>)> = Vec::with_capacity(settings.len());
        for (key, _) in settings {
            if captured.iter().any(|(k, _)| k == key) {
                continue;
            }
            let result = self
                .inner
                .conn
                .query_raw(CURRENT_SETTING_SQL, &[PgValue::Text(key.clone())], true)
                .await?;
            let previous = result
                .rows
                .first()
                .and_then(|row| row.first())
                .and_then(|v| v.as_text().map(String::from));
            captured.push((key.clone(), previous));
        }
        Ok(captured)
    }

    async fn restore_settings(&self, captured: &[(String, Option<String>)]) {
        for (key, previous) in captured {
            let result = match previous {
                Some(value) => {
                    let pair = vec![(key.clone(), value.clone())];
                    self.inner
                        .conn
                        .query_raw(APPLY_SETTINGS_SESSION_SQL, &[settings_parameter(&pair)], true)
                        .await
                        .map(|_| ())
                }
                None => self.inner.conn.batch_execute(&reset_sql(key)).await,
            };
            if let Err(error) = result {
                tracing::warn!(setting = %key, error = %error, "failed to restore session setting");
            }
        }
    }

    async fn enter_transaction(&self, level: usize) -> PgBridgeResult<()> {
        match (level, self.inner.pre_existing) {
            (0, false) => self
                .inner
                .conn
                .begin_top_level()
                .await
                .map_err(|e| transaction_error("begin", e)),
            _ => {
                let sql = format!("SAVEPOINT {}", savepoint_name(level));
                self.inner
                    .conn
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| transaction_error("savepoint", e))
            }
        }
    }

    async fn commit_transaction(&self, level: usize) -> PgBridgeResult<()> {
        match (level, self.inner.pre_existing) {
            (0, false) => self
                .inner
                .conn
                .commit_top_level()
                .await
                .map_err(|e| transaction_error("commit", e)),
            _ => {
                let sql = format!("RELEASE SAVEPOINT {}", savepoint_name(level));
                self.inner
                    .conn
                    .batch_execute(&sql)
                    .await
                    .map_err(|e| transaction_error("release savepoint", e))
            }
        }
    }

    /// Roll back to the pre-call level. Failures are logged and swallowed so
    /// the caller's original error is the one that propagates.
    async fn rollback_transaction(&self, level: usize) {
        let result = match (level, self.inner.pre_existing) {
            (0, false) => self.inner.conn.rollback_top_level().await,
            _ => {
                let sql = format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(level));
                self.inner.conn.batch_execute(&sql).await
            }
        };
        if let Err(error) = result {
            tracing::warn!(error = %error, "rollback failed; propagating original error");
        }
    }

    fn holds_session(&self) -> bool {
        self.inner.session_guard.lock().is_some()
    }

    async fn statement_guard(&self) -> Option<OwnedMutexGuard<()>> {
        if self.holds_session() {
            None
        } else {
            self.inner.conn.statement_lock().await
        }
    }
}

impl std::fmt::Debug for PgClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgClient")
            .field("transaction_level", &self.transaction_level())
            .field("pre_existing_transaction", &self.inner.pre_existing)
            .finish_non_exhaustive()
    }
}

fn transaction_error(phase: &'static str, error: PgBridgeError) -> PgBridgeError {
    PgBridgeError::Transaction {
        phase,
        source: Box::new(error),
    }
}

/// Savepoint for the L0 -> L1 boundary of a pre-existing transaction is
/// plain `tx`; deeper savepoints carry the pre-call level.
fn savepoint_name(level: usize) -> String {
    if level == 0 {
        "tx".to_string()
    } else {
        format!("tx{level}")
    }
}
