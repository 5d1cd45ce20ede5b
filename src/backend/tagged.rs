//! The driver-native backend: an sqlx `PgPool` instance.
//!
//! The driver owns its internal pool and statement cache, so queries outside
//! a transaction go straight to the pool; the L0 -> L1 boundary uses the
//! driver's native transaction primitive and deeper levels use savepoints on
//! the reserved connection. Setting-scoped envelopes serialize through a
//! pool-wide queue because settings are transaction-local. LISTEN delegates
//! to the driver's listener, which reconnects on its own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Either, Postgres, Row as _, TypeInfo, ValueRef};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};

use crate::backend::{
    ClientBackend, ListenErrorCallback, NotifyCallback, SettingsMode, UnlistenHandle,
};
use crate::error::{PgBridgeError, PgBridgeResult};
use crate::value::{PgValue, QueryResult, Row};

pub(crate) struct TaggedBackend {
    pool: PgPool,
    /// Pool-wide queue for setting-scoped envelopes.
    settings_queue: Arc<AsyncMutex<()>>,
}

impl TaggedBackend {
    /// Build an owned driver instance from a connection string. Connections
    /// are established lazily on first use.
    pub fn connect(connection_string: &str, max_connections: usize) -> PgBridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections as u32)
            .connect_lazy(connection_string)
            .map_err(|e| {
                PgBridgeError::Configuration(format!("invalid connection string: {e}").into())
            })?;
        Ok(Self::from_existing(pool))
    }

    /// Wrap a caller-supplied driver instance. The caller keeps ownership.
    pub fn from_existing(pool: PgPool) -> Self {
        Self {
            pool,
            settings_queue: Arc::new(AsyncMutex::new(())),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// A connection handle for one envelope.
    pub fn connection(&self) -> TaggedConn {
        TaggedConn {
            pool: self.pool.clone(),
            settings_queue: Arc::clone(&self.settings_queue),
            state: AsyncMutex::new(TaggedState::Pool),
        }
    }

    /// Delegate LISTEN to the driver's listener.
    pub async fn listen(
        &self,
        channel: &str,
        on_notify: NotifyCallback,
        on_error: ListenErrorCallback,
    ) -> PgBridgeResult<UnlistenHandle> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| PgBridgeError::Listen {
                channel: channel.to_string(),
                source: Box::new(e),
            })?;
        listener
            .listen(channel)
            .await
            .map_err(|e| PgBridgeError::Listen {
                channel: channel.to_string(),
                source: Box::new(e),
            })?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        if let Err(error) = listener.unlisten(&channel_name).await {
                            tracing::debug!(
                                channel = %channel_name,
                                error = %error,
                                "unlisten failed during teardown"
                            );
                        }
                        return;
                    }
                    notification = listener.recv() => {
                        match notification {
                            Ok(notification) => on_notify(notification.payload()),
                            Err(error) => {
                                // the driver reconnects on the next recv
                                on_error(PgBridgeError::Listen {
                                    channel: channel_name.clone(),
                                    source: Box::new(error),
                                });
                            }
                        }
                    }
                }
            }
        });

        Ok(UnlistenHandle::new(move || {
            Box::pin(async move {
                let _ = shutdown_tx.send(());
                let _ = task.await;
            })
        }))
    }
}

// ============================================================================
// Connection state machine
// ============================================================================

enum TaggedState {
    /// No transaction: statements run against the pool.
    Pool,
    /// Inside the native transaction primitive: statements run on its
    /// reserved connection.
    Transaction(sqlx::Transaction<'static, Postgres>),
}

pub(crate) struct TaggedConn {
    pool: PgPool,
    settings_queue: Arc<AsyncMutex<()>>,
    state: AsyncMutex<TaggedState>,
}

#[async_trait]
impl ClientBackend for TaggedConn {
    async fn query_raw(
        &self,
        sql: &str,
        params: &[PgValue],
        array_mode: bool,
    ) -> PgBridgeResult<QueryResult> {
        let mut state = self.state.lock().await;
        match &mut *state {
            TaggedState::Pool => run_query(&self.pool, sql, params, array_mode).await,
            TaggedState::Transaction(tx) => run_query(&mut **tx, sql, params, array_mode).await,
        }
    }

    async fn batch_execute(&self, sql: &str) -> PgBridgeResult<()> {
        let mut state = self.state.lock().await;
        match &mut *state {
            TaggedState::Pool => run_batch(&self.pool, sql).await,
            TaggedState::Transaction(tx) => run_batch(&mut **tx, sql).await,
        }
    }

    async fn begin_top_level(&self) -> PgBridgeResult<()> {
        let mut state = self.state.lock().await;
        match &*state {
            TaggedState::Pool => {
                let tx = self.pool.begin().await.map_err(PgBridgeError::query)?;
                *state = TaggedState::Transaction(tx);
                Ok(())
            }
            TaggedState::Transaction(_) => Err(PgBridgeError::Transaction {
                phase: "begin",
                source: "native transaction already active".into(),
            }),
        }
    }

    async fn commit_top_level(&self) -> PgBridgeResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, TaggedState::Pool) {
            TaggedState::Transaction(tx) => tx.commit().await.map_err(PgBridgeError::query),
            TaggedState::Pool => Err(PgBridgeError::Transaction {
                phase: "commit",
                source: "no native transaction active".into(),
            }),
        }
    }

    async fn rollback_top_level(&self) -> PgBridgeResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, TaggedState::Pool) {
            TaggedState::Transaction(tx) => tx.rollback().await.map_err(PgBridgeError::query),
            TaggedState::Pool => Err(PgBridgeError::Transaction {
                phase: "rollback",
                source: "no native transaction active".into(),
            }),
        }
    }

    fn settings_mode(&self) -> SettingsMode {
        SettingsMode::TransactionLocal
    }

    async fn session_lock(&self) -> Option<OwnedMutexGuard<()>> {
        Some(Arc::clone(&self.settings_queue).lock_owned().await)
    }
}

// ============================================================================
// Query plumbing
// ============================================================================

async fn run_batch<'c, E>(executor: E, sql: &str) -> PgBridgeResult<()>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    executor
        .execute(sqlx::raw_sql(sql))
        .await
        .map(|_| ())
        .map_err(|e| PgBridgeError::query_with_sql(sql, e))
}

async fn run_query<'e, E>(
    executor: E,
    sql: &str,
    params: &[PgValue],
    array_mode: bool,
) -> PgBridgeResult<QueryResult>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let mut query = sqlx::query(sql);
    for value in params {
        query = bind_value(query, value).map_err(|e| PgBridgeError::query_with_sql(sql, e))?;
    }

    let mut stream = query.fetch_many(executor);
    let mut rows: Vec<PgRow> = Vec::new();
    let mut affected: u64 = 0;
    use futures::TryStreamExt;
    while let Some(item) = stream
        .try_next()
        .await
        .map_err(|e| PgBridgeError::query_with_sql(sql, e))?
    {
        match item {
            Either::Left(done) => affected += done.rows_affected(),
            Either::Right(row) => rows.push(row),
        }
    }

    convert_rows(rows, array_mode, affected, sql)
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_value<'q>(query: PgQuery<'q>, value: &PgValue) -> Result<PgQuery<'q>, String> {
    Ok(match value {
        PgValue::Null => query.bind(Option::<String>::None),
        PgValue::Bool(b) => query.bind(*b),
        PgValue::Int(i) => query.bind(*i),
        PgValue::Float(f) => query.bind(*f),
        PgValue::Text(s) => query.bind(s.clone()),
        PgValue::Timestamp(ts) => query.bind(*ts),
        PgValue::Json(json) => query.bind(json.clone()),
        PgValue::Array(items) => bind_array(query, items)?,
    })
}

/// The driver binds arrays by element type, so only homogeneous arrays of
/// scalars are supported as parameters here.
fn bind_array<'q>(query: PgQuery<'q>, items: &[PgValue]) -> Result<PgQuery<'q>, String> {
    match items.first() {
        None | Some(PgValue::Text(_)) => {
            let values: Result<Vec<String>, String> = items
                .iter()
                .map(|v| match v {
                    PgValue::Text(s) => Ok(s.clone()),
                    other => Err(format!("mixed array element: {other:?}")),
                })
                .collect();
            Ok(query.bind(values?))
        }
        Some(PgValue::Int(_)) => {
            let values: Result<Vec<i64>, String> = items
                .iter()
                .map(|v| match v {
                    PgValue::Int(i) => Ok(*i),
                    other => Err(format!("mixed array element: {other:?}")),
                })
                .collect();
            Ok(query.bind(values?))
        }
        Some(PgValue::Bool(_)) => {
            let values: Result<Vec<bool>, String> = items
                .iter()
                .map(|v| match v {
                    PgValue::Bool(b) => Ok(*b),
                    other => Err(format!("mixed array element: {other:?}")),
                })
                .collect();
            Ok(query.bind(values?))
        }
        Some(PgValue::Float(_)) => {
            let values: Result<Vec<f64>, String> = items
                .iter()
                .map(|v| match v {
                    PgValue::Float(f) => Ok(*f),
                    other => Err(format!("mixed array element: {other:?}")),
                })
                .collect();
            Ok(query.bind(values?))
        }
        Some(other) => Err(format!("unsupported array element type: {other:?}")),
    }
}

fn convert_rows(
    rows: Vec<PgRow>,
    array_mode: bool,
    affected: u64,
    sql: &str,
) -> PgBridgeResult<QueryResult> {
    let columns: Vec<String> = match rows.first() {
        Some(first) if !array_mode => first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
        _ => Vec::new(),
    };

    let mut out: Vec<Row> = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut values = Row::new();
        for i in 0..row.len() {
            values.push(
                convert_cell(row, i).map_err(|e| PgBridgeError::query_with_sql(sql, e))?,
            );
        }
        out.push(values);
    }

    let row_count = if out.is_empty() { affected } else { out.len() as u64 };
    Ok(QueryResult::new(columns, out, row_count))
}

fn convert_cell(row: &PgRow, i: usize) -> Result<PgValue, String> {
    let (is_null, type_name) = {
        let raw = row.try_get_raw(i).map_err(|e| e.to_string())?;
        (raw.is_null(), raw.type_info().name().to_string())
    };
    if is_null {
        return Ok(PgValue::Null);
    }

    let value = match type_name.as_str() {
        "BOOL" => PgValue::Bool(row.try_get::<bool, _>(i).map_err(|e| e.to_string())?),
        "INT2" => PgValue::Int(row.try_get::<i16, _>(i).map_err(|e| e.to_string())? as i64),
        "INT4" => PgValue::Int(row.try_get::<i32, _>(i).map_err(|e| e.to_string())? as i64),
        "INT8" => PgValue::Int(row.try_get::<i64, _>(i).map_err(|e| e.to_string())?),
        "FLOAT4" => PgValue::Float(row.try_get::<f32, _>(i).map_err(|e| e.to_string())? as f64),
        "FLOAT8" => PgValue::Float(row.try_get::<f64, _>(i).map_err(|e| e.to_string())?),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => {
            PgValue::Text(row.try_get::<String, _>(i).map_err(|e| e.to_string())?)
        }
        "JSON" | "JSONB" => PgValue::Json(
            row.try_get::<serde_json::Value, _>(i)
                .map_err(|e| e.to_string())?,
        ),
        "TIMESTAMPTZ" => PgValue::Timestamp(
            row.try_get::<DateTime<Utc>, _>(i)
                .map_err(|e| e.to_string())?,
        ),
        "TIMESTAMP" => PgValue::Timestamp(
            row.try_get::<chrono::NaiveDateTime, _>(i)
                .map_err(|e| e.to_string())?
                .and_utc(),
        ),
        other => return Err(format!("unsupported result type: {other}")),
    };
    Ok(value)
}
