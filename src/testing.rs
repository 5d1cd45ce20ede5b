//! In-crate test support: a scriptable backend that records every statement
//! it is asked to run.
//!
//! The envelope, transaction state machine and statement manager promise
//! exact SQL on the wire, so tests drive them against this recorder and
//! match the log.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{ClientBackend, SettingsMode};
use crate::error::{PgBridgeError, PgBridgeResult};
use crate::value::{PgValue, QueryResult, Row};

enum Script {
    Rows(Vec<Row>, Vec<String>),
    Fail(String),
    FailOnce(String),
}

/// A backend double that logs SQL and replays scripted responses.
pub(crate) struct MockBackend {
    log: Mutex<Vec<(String, Vec<PgValue>)>>,
    scripts: Mutex<Vec<(String, Script)>>,
    mode: SettingsMode,
    session: Option<Arc<AsyncMutex<()>>>,
    lock_top_level: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            mode: SettingsMode::TransactionLocal,
            session: None,
            lock_top_level: false,
        }
    }

    /// A mock shaped like the single-connection backend: session-restore
    /// settings, an exclusive lock, locking at the top-level boundary.
    pub fn session_restore() -> Self {
        Self {
            mode: SettingsMode::SessionRestore,
            session: Some(Arc::new(AsyncMutex::new(()))),
            lock_top_level: true,
            ..Self::new()
        }
    }

    /// Respond to any statement containing `fragment` with the given rows
    /// (single unnamed column per cell vector).
    pub fn rows_for(&self, fragment: &str, columns: Vec<&str>, rows: Vec<Vec<PgValue>>) {
        let rows = rows.into_iter().map(Row::from_vec).collect();
        self.scripts.lock().push((
            fragment.to_string(),
            Script::Rows(rows, columns.into_iter().map(String::from).collect()),
        ));
    }

    /// Fail every statement containing `fragment` with `message`.
    pub fn fail_for(&self, fragment: &str, message: &str) {
        self.scripts
            .lock()
            .push((fragment.to_string(), Script::Fail(message.to_string())));
    }

    /// Fail the next statement containing `fragment`, then stop failing.
    pub fn fail_once_for(&self, fragment: &str, message: &str) {
        self.scripts
            .lock()
            .push((fragment.to_string(), Script::FailOnce(message.to_string())));
    }

    /// Every statement run so far, in order.
    pub fn sql_log(&self) -> Vec<String> {
        self.log.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// The parameters recorded for the first statement containing `fragment`.
    pub fn params_for(&self, fragment: &str) -> Option<Vec<PgValue>> {
        self.log
            .lock()
            .iter()
            .find(|(sql, _)| sql.contains(fragment))
            .map(|(_, params)| params.clone())
    }

    /// The parameters of every logged statement containing `fragment`.
    pub fn all_params_for(&self, fragment: &str) -> Vec<Vec<PgValue>> {
        self.log
            .lock()
            .iter()
            .filter(|(sql, _)| sql.contains(fragment))
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// How many logged statements contain `fragment`.
    pub fn count_containing(&self, fragment: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(sql, _)| sql.contains(fragment))
            .count()
    }

    fn record_and_reply(&self, sql: &str, params: &[PgValue]) -> PgBridgeResult<QueryResult> {
        self.log
            .lock()
            .push((sql.to_string(), params.to_vec()));

        let mut scripts = self.scripts.lock();
        let mut consumed = None;
        let mut reply = Ok(QueryResult::empty());
        for (i, (fragment, script)) in scripts.iter().enumerate() {
            if !sql.contains(fragment.as_str()) {
                continue;
            }
            reply = match script {
                Script::Rows(rows, columns) => Ok(QueryResult::new(
                    columns.clone(),
                    rows.clone(),
                    rows.len() as u64,
                )),
                Script::Fail(message) => Err(PgBridgeError::query_with_sql(sql, message.clone())),
                Script::FailOnce(message) => {
                    consumed = Some(i);
                    Err(PgBridgeError::query_with_sql(sql, message.clone()))
                }
            };
            break;
        }
        if let Some(i) = consumed {
            scripts.remove(i);
        }
        reply
    }
}

#[async_trait]
impl ClientBackend for MockBackend {
    async fn query_raw(
        &self,
        sql: &str,
        params: &[PgValue],
        _array_mode: bool,
    ) -> PgBridgeResult<QueryResult> {
        self.record_and_reply(sql, params)
    }

    async fn batch_execute(&self, sql: &str) -> PgBridgeResult<()> {
        self.record_and_reply(sql, &[]).map(|_| ())
    }

    fn settings_mode(&self) -> SettingsMode {
        self.mode
    }

    async fn session_lock(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        match &self.session {
            Some(session) => Some(Arc::clone(session).lock_owned().await),
            None => None,
        }
    }

    async fn statement_lock(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.session_lock().await
    }

    fn transaction_lock_at_top_level(&self) -> bool {
        self.lock_top_level
    }
}
