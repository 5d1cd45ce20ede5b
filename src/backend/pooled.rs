//! The pooled TCP backend: deadpool-managed tokio-postgres connections.
//!
//! `with_pg_client` checks a connection out for the callback's duration and
//! returns (not ends) it afterwards. Transactions use explicit SQL. LISTEN
//! gets a dedicated connection that is never returned to the pool while
//! listening, with exponential-backoff reconnection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::{mpsc, watch};
use tokio_postgres::types::ToSql;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification};

use crate::backend::{ClientBackend, ListenErrorCallback, NotifyCallback, UnlistenHandle};
use crate::error::{PgBridgeError, PgBridgeResult};
use crate::settings::escape_identifier;
use crate::statement::ClientKey;
use crate::value::{PgValue, QueryResult, Row};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Reconnection backoff: `min(1000 * 2^attempt, 30_000)` milliseconds.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis((1000u64 << attempt.min(5)).min(30_000))
}

// ============================================================================
// Backend
// ============================================================================

pub(crate) struct PooledBackend {
    pool: Pool,
    /// Parsed connection config, used for dedicated LISTEN connections.
    /// Absent when the pool itself was supplied by the caller.
    pg_config: Option<Config>,
    pool_id: u64,
}

impl PooledBackend {
    /// Build an owned pool from a connection string.
    pub fn connect(connection_string: &str, max_connections: usize) -> PgBridgeResult<Self> {
        let pg_config: Config = connection_string.parse().map_err(
            |e: tokio_postgres::Error| {
                PgBridgeError::Configuration(format!("invalid connection string: {e}").into())
            },
        )?;

        let manager = Manager::from_config(
            pg_config.clone(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                PgBridgeError::Configuration(format!("failed to build pool: {e}").into())
            })?;

        Ok(Self {
            pool,
            pg_config: Some(pg_config),
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Wrap a caller-supplied pool. The caller keeps ownership; `release`
    /// must not close it.
    pub fn from_existing(pool: Pool, pg_config: Option<Config>) -> Self {
        Self {
            pool,
            pg_config,
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// Check a connection out for the duration of one envelope.
    ///
    /// The statement-state key is derived from the physical connection's
    /// identity so prepared statements survive across checkouts of the same
    /// connection.
    pub async fn checkout(&self) -> PgBridgeResult<(PooledConn, ClientKey)> {
        let object = self.pool.get().await.map_err(PgBridgeError::query)?;
        let client: &Client = &object;
        let key = ClientKey::named(format!(
            "pooled-{}-{:x}",
            self.pool_id, client as *const Client as usize
        ));
        Ok((PooledConn { object }, key))
    }

    /// Open a dedicated listening connection for `channel`.
    ///
    /// The initial connect and `LISTEN` run inline so first-time failures
    /// surface from this call; afterwards a supervisor task keeps the
    /// listener alive with bounded backoff.
    pub async fn listen(
        &self,
        channel: &str,
        on_notify: NotifyCallback,
        on_error: ListenErrorCallback,
    ) -> PgBridgeResult<UnlistenHandle> {
        let pg_config = self.pg_config.clone().ok_or_else(|| {
            PgBridgeError::Configuration(
                "listen requires a connection string; the pool was supplied externally".into(),
            )
        })?;

        let escaped = escape_identifier(channel);
        let listen_sql = format!("LISTEN {escaped}");
        let unlisten_sql = format!("UNLISTEN {escaped}");

        let (client, rx) = connect_listener(&pg_config, &listen_sql)
            .await
            .map_err(|e| PgBridgeError::Listen {
                channel: channel.to_string(),
                source: Box::new(e),
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener_loop(ListenerLoop {
            pg_config,
            channel: channel.to_string(),
            listen_sql,
            unlisten_sql,
            client,
            rx,
            on_notify,
            on_error,
            shutdown: shutdown_rx,
        }));

        Ok(UnlistenHandle::new(move || {
            Box::pin(async move {
                let _ = shutdown_tx.send(true);
                let _ = task.await;
            })
        }))
    }
}

// ============================================================================
// Checked-out connection
// ============================================================================

/// One checked-out pool connection; dropped back to the pool on release.
pub(crate) struct PooledConn {
    object: Object,
}

#[async_trait]
impl ClientBackend for PooledConn {
    async fn query_raw(
        &self,
        sql: &str,
        params: &[PgValue],
        array_mode: bool,
    ) -> PgBridgeResult<QueryResult> {
        run_client_query(&self.object, sql, params, array_mode).await
    }

    async fn batch_execute(&self, sql: &str) -> PgBridgeResult<()> {
        let client: &Client = &self.object;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| PgBridgeError::query_with_sql(sql, e))
    }
}

// ============================================================================
// Shared tokio-postgres query plumbing
// ============================================================================

/// Run one statement through the extended protocol, collecting rows and the
/// affected-row count.
pub(crate) async fn run_client_query(
    client: &Client,
    sql: &str,
    params: &[PgValue],
    array_mode: bool,
) -> PgBridgeResult<QueryResult> {
    let dyn_params: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    let stream = client
        .query_raw(sql, dyn_params)
        .await
        .map_err(|e| PgBridgeError::query_with_sql(sql, e))?;
    futures::pin_mut!(stream);

    let mut rows: Vec<tokio_postgres::Row> = Vec::new();
    while let Some(row) = stream
        .try_next()
        .await
        .map_err(|e| PgBridgeError::query_with_sql(sql, e))?
    {
        rows.push(row);
    }
    let affected = stream.rows_affected();

    convert_rows(rows, array_mode, affected, sql)
}

fn convert_rows(
    rows: Vec<tokio_postgres::Row>,
    array_mode: bool,
    affected: Option<u64>,
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
            let value: PgValue = row
                .try_get(i)
                .map_err(|e| PgBridgeError::query_with_sql(sql, e))?;
            values.push(value);
        }
        out.push(values);
    }

    let row_count = affected.unwrap_or(out.len() as u64);
    Ok(QueryResult::new(columns, out, row_count))
}

// ============================================================================
// Dedicated LISTEN connection
// ============================================================================

/// Connect, spawn the message pump, and issue `LISTEN`.
async fn connect_listener(
    config: &Config,
    listen_sql: &str,
) -> Result<
    (
        Client,
        mpsc::UnboundedReceiver<Result<Notification, tokio_postgres::Error>>,
    ),
    tokio_postgres::Error,
> {
    let (client, mut connection) = config.connect(NoTls).await?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut stream = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = stream.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    if tx.send(Ok(notification)).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    let _ = tx.send(Err(error));
                    break;
                }
            }
        }
    });

    client.batch_execute(listen_sql).await?;
    Ok((client, rx))
}

struct ListenerLoop {
    pg_config: Config,
    channel: String,
    listen_sql: String,
    unlisten_sql: String,
    client: Client,
    rx: mpsc::UnboundedReceiver<Result<Notification, tokio_postgres::Error>>,
    on_notify: NotifyCallback,
    on_error: ListenErrorCallback,
    shutdown: watch::Receiver<bool>,
}

/// Supervise one channel's dedicated connection: pump notifications,
/// reconnect on failure, drain on unlisten.
async fn listener_loop(mut ctx: ListenerLoop) {
    let mut attempt: u32 = 0;
    loop {
        // Pump until the connection dies or we are told to stop.
        loop {
            tokio::select! {
                changed = ctx.shutdown.changed() => {
                    if changed.is_ok() && *ctx.shutdown.borrow() {
                        if let Err(error) = ctx.client.batch_execute(&ctx.unlisten_sql).await {
                            tracing::debug!(
                                channel = %ctx.channel,
                                error = %error,
                                "unlisten failed during teardown"
                            );
                        }
                    }
                    return;
                }
                message = ctx.rx.recv() => {
                    match message {
                        Some(Ok(notification)) => (ctx.on_notify)(notification.payload()),
                        Some(Err(error)) => {
                            (ctx.on_error)(PgBridgeError::Listen {
                                channel: ctx.channel.clone(),
                                source: Box::new(error),
                            });
                            break;
                        }
                        None => {
                            (ctx.on_error)(PgBridgeError::Listen {
                                channel: ctx.channel.clone(),
                                source: "listen connection closed".into(),
                            });
                            break;
                        }
                    }
                }
            }
        }

        // Reconnect with bounded backoff, bailing out on shutdown.
        loop {
            let delay = backoff_delay(attempt);
            attempt += 1;
            tokio::select! {
                _ = ctx.shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match connect_listener(&ctx.pg_config, &ctx.listen_sql).await {
                Ok((client, rx)) => {
                    tracing::info!(channel = %ctx.channel, "listener reconnected");
                    ctx.client = client;
                    ctx.rx = rx;
                    attempt = 0;
                    break;
                }
                Err(error) => {
                    (ctx.on_error)(PgBridgeError::Listen {
                        channel: ctx.channel.clone(),
                        source: Box::new(error),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(4), Duration::from_millis(16000));
        // caps at 30s from the fifth retry on
        assert_eq!(backoff_delay(5), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(20), Duration::from_millis(30_000));
    }
}
