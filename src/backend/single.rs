//! The single-connection backend: one long-lived session shared by every
//! caller.
//!
//! Because all work multiplexes onto one wire session, setting-scoped and
//! transactional work runs under an exclusive lock, and session settings are
//! applied session-level with their previous values captured and restored.
//! Notifications arrive on the same connection and fan out to registered
//! listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_postgres::{AsyncMessage, Client, Config, NoTls};

use crate::backend::pooled::run_client_query;
use crate::backend::{
    ClientBackend, ListenErrorCallback, NotifyCallback, SettingsMode, UnlistenHandle,
};
use crate::error::{PgBridgeError, PgBridgeResult};
use crate::settings::escape_identifier;
use crate::statement::ConnectionToken;
use crate::value::{PgValue, QueryResult};

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    on_notify: NotifyCallback,
    on_error: ListenErrorCallback,
}

type ListenerMap = HashMap<String, Vec<ListenerEntry>>;

pub(crate) struct SingleBackend {
    client: Client,
    /// Exclusive-execution primitive: held across settings envelopes and
    /// top-level transactions, and around individual statements otherwise.
    exclusive: Arc<AsyncMutex<()>>,
    token: ConnectionToken,
    listeners: Arc<Mutex<ListenerMap>>,
    next_listener_id: AtomicU64,
}

impl SingleBackend {
    /// Open the backend's one connection and start its message pump.
    pub async fn connect(connection_string: &str) -> PgBridgeResult<Self> {
        let config: Config = connection_string.parse().map_err(
            |e: tokio_postgres::Error| {
                PgBridgeError::Configuration(format!("invalid connection string: {e}").into())
            },
        )?;

        let (client, mut connection) = config
            .connect(NoTls)
            .await
            .map_err(PgBridgeError::query)?;

        let listeners: Arc<Mutex<ListenerMap>> = Arc::new(Mutex::new(HashMap::new()));
        let dispatch = Arc::clone(&listeners);

        tokio::spawn(async move {
            let mut stream = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = stream.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        let entries: Vec<ListenerEntry> = dispatch
                            .lock()
                            .get(notification.channel())
                            .cloned()
                            .unwrap_or_default();
                        for entry in entries {
                            (entry.on_notify)(notification.payload());
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        let message = error.to_string();
                        let entries: Vec<(String, ListenerEntry)> = dispatch
                            .lock()
                            .iter()
                            .flat_map(|(channel, list)| {
                                list.iter().map(|e| (channel.clone(), e.clone()))
                            })
                            .collect();
                        for (channel, entry) in entries {
                            (entry.on_error)(PgBridgeError::Listen {
                                channel,
                                source: message.clone().into(),
                            });
                        }
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client,
            exclusive: Arc::new(AsyncMutex::new(())),
            token: ConnectionToken::new(),
            listeners,
            next_listener_id: AtomicU64::new(0),
        })
    }

    /// Identity of the backing connection, for statement-state keying.
    pub fn token(&self) -> &ConnectionToken {
        &self.token
    }

    /// Register a notification listener; issues a physical `LISTEN` only for
    /// the channel's first registration.
    pub async fn listen(
        self: &Arc<Self>,
        channel: &str,
        on_notify: NotifyCallback,
        on_error: ListenErrorCallback,
    ) -> PgBridgeResult<UnlistenHandle> {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut map = self.listeners.lock();
            let list = map.entry(channel.to_string()).or_default();
            let first = list.is_empty();
            list.push(ListenerEntry {
                id,
                on_notify,
                on_error,
            });
            first
        };

        if first {
            let listen_sql = format!("LISTEN {}", escape_identifier(channel));
            if let Err(error) = self.client.batch_execute(&listen_sql).await {
                let mut map = self.listeners.lock();
                if let Some(list) = map.get_mut(channel) {
                    list.retain(|e| e.id != id);
                    if list.is_empty() {
                        map.remove(channel);
                    }
                }
                return Err(PgBridgeError::Listen {
                    channel: channel.to_string(),
                    source: Box::new(error),
                });
            }
        }

        let backend = Arc::clone(self);
        let channel = channel.to_string();
        Ok(UnlistenHandle::new(move || {
            Box::pin(async move {
                let last = {
                    let mut map = backend.listeners.lock();
                    match map.get_mut(&channel) {
                        Some(list) => {
                            list.retain(|e| e.id != id);
                            let last = list.is_empty();
                            if last {
                                map.remove(&channel);
                            }
                            last
                        }
                        None => false,
                    }
                };
                if last {
                    let unlisten_sql = format!("UNLISTEN {}", escape_identifier(&channel));
                    if let Err(error) = backend.client.batch_execute(&unlisten_sql).await {
                        tracing::debug!(channel = %channel, error = %error, "unlisten failed");
                    }
                }
            })
        }))
    }
}

#[async_trait]
impl ClientBackend for SingleBackend {
    async fn query_raw(
        &self,
        sql: &str,
        params: &[PgValue],
        array_mode: bool,
    ) -> PgBridgeResult<QueryResult> {
        run_client_query(&self.client, sql, params, array_mode).await
    }

    async fn batch_execute(&self, sql: &str) -> PgBridgeResult<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| PgBridgeError::query_with_sql(sql, e))
    }

    fn settings_mode(&self) -> SettingsMode {
        SettingsMode::SessionRestore
    }

    async fn session_lock(&self) -> Option<OwnedMutexGuard<()>> {
        Some(Arc::clone(&self.exclusive).lock_owned().await)
    }

    async fn statement_lock(&self) -> Option<OwnedMutexGuard<()>> {
        Some(Arc::clone(&self.exclusive).lock_owned().await)
    }

    fn transaction_lock_at_top_level(&self) -> bool {
        true
    }
}
