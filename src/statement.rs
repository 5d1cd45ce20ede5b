//! Prepared statement management and caching.
//!
//! Server-side prepared statements (`PREPARE` / `EXECUTE` / `DEALLOCATE`)
//! are cached per connection in a bounded LRU. The manager sits above
//! backends whose drivers do not cache natively and handles:
//! - name minting and the PREPARE-on-miss path
//! - exactly one `DEALLOCATE` eviction per overflowing insertion
//! - downgrade to direct execution when a statement cannot be prepared
//! - recovery when the server reports a cached statement missing
//!
//! Connection state is tracked under two key shapes: identity tokens
//! (reclaimed when the owning connection drops) and strings (kept strongly,
//! bounded, oldest evicted first).

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lru::LruCache;
use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::backend::ClientBackend;
use crate::error::PgBridgeResult;
use crate::value::{PgValue, QueryResult};

/// Strong string-keyed states kept at most this many entries; beyond it the
/// oldest state is dropped.
const MAX_STRING_KEYED_STATES: usize = 100;

/// Process-wide counter distinguishing manager instances in statement names.
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Client keys
// ============================================================================

/// Identity token for a connection whose statement state should be
/// reclaimed once the connection goes away.
///
/// Backends keep the token alive alongside the connection; the manager only
/// holds a weak reference, so dropping the connection reclaims the state.
#[derive(Clone, Default)]
pub struct ConnectionToken(Arc<()>);

impl ConnectionToken {
    pub fn new() -> Self {
        Self(Arc::new(()))
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn downgrade(&self) -> Weak<()> {
        Arc::downgrade(&self.0)
    }
}

impl std::fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionToken({:#x})", self.id())
    }
}

/// The identity under which a connection's prepared-statement state is
/// stored.
#[derive(Debug, Clone)]
pub struct ClientKey(KeyRepr);

#[derive(Debug, Clone)]
enum KeyRepr {
    Token(ConnectionToken),
    Name(Arc<str>),
}

impl ClientKey {
    /// A token-identified key; state lives while the token does.
    pub fn from_token(token: &ConnectionToken) -> Self {
        ClientKey(KeyRepr::Token(token.clone()))
    }

    /// A string-identified key; state is kept strongly, subject to the
    /// oldest-first eviction guard.
    pub fn named(name: impl Into<String>) -> Self {
        ClientKey(KeyRepr::Name(name.into().into()))
    }
}

// ============================================================================
// Per-connection state
// ============================================================================

/// A server-side prepared statement known to exist on its connection.
#[derive(Debug, Clone)]
struct StatementEntry {
    name: String,
    text: String,
    param_count: usize,
}

/// Per-connection bookkeeping.
///
/// `lru` is the bounded recency structure; `statements` is the full map and
/// may briefly exceed the cap while an eviction victim is being located.
struct ConnectionState {
    lru: LruCache<String, ()>,
    statements: HashMap<String, StatementEntry>,
    counter: u64,
    executor: Weak<dyn ClientBackend>,
}

impl ConnectionState {
    fn new(cap: usize, executor: &Arc<dyn ClientBackend>) -> Self {
        Self {
            lru: LruCache::new(NonZeroUsize::new(cap.max(1)).unwrap()),
            statements: HashMap::new(),
            counter: 0,
            executor: Arc::downgrade(executor),
        }
    }

    fn statement_names(&self) -> Vec<String> {
        self.statements.values().map(|e| e.name.clone()).collect()
    }
}

struct TokenEntry {
    weak: Weak<()>,
    state: ConnectionState,
}

#[derive(Default)]
struct StringTable {
    states: HashMap<String, ConnectionState>,
    /// Insertion order, oldest first; drives the eviction guard.
    order: VecDeque<String>,
}

// ============================================================================
// Statement manager
// ============================================================================

/// Configuration for a [`StatementManager`].
#[derive(Debug, Clone)]
pub struct StatementManagerConfig {
    /// Per-connection cap on cached prepared statements. `0` disables
    /// caching entirely: every query executes directly.
    pub max_prepared_statements: usize,
    /// Prefix for minted statement names.
    pub prefix: String,
}

impl Default for StatementManagerConfig {
    fn default() -> Self {
        Self {
            max_prepared_statements: 100,
            prefix: "pgbridge".to_string(),
        }
    }
}

/// Statistics snapshot for monitoring.
///
/// Token-keyed states cannot be enumerated in detail (they are reclaimed
/// behind our back); only a live count is reported for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementStats {
    pub string_keyed_connections: usize,
    pub token_keyed_connections: usize,
    /// Total cached statements across string-keyed connections.
    pub string_keyed_statements: usize,
}

/// The bounded prepared-statement cache shared by the non-native-caching
/// backends.
pub struct StatementManager {
    id: u64,
    config: StatementManagerConfig,
    token_states: Mutex<HashMap<usize, TokenEntry>>,
    string_states: Mutex<StringTable>,
}

impl StatementManager {
    pub fn new(config: StatementManagerConfig) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            token_states: Mutex::new(HashMap::new()),
            string_states: Mutex::new(StringTable::default()),
        }
    }

    /// Execute a query, caching it server-side when it is named.
    ///
    /// Unnamed queries and queries without values skip the cache and
    /// execute directly. `PREPARE` failures downgrade to direct execution;
    /// a statement the server no longer holds is dropped and retried.
    pub async fn execute_query(
        &self,
        key: &ClientKey,
        name: Option<&str>,
        text: &str,
        values: &[PgValue],
        executor: &Arc<dyn ClientBackend>,
        array_mode: bool,
    ) -> PgBridgeResult<QueryResult> {
        if name.is_none() || values.is_empty() || self.config.max_prepared_statements == 0 {
            return executor.query_raw(text, values, array_mode).await;
        }

        let digest = statement_key(text, values.len());

        loop {
            let cached = self.with_state(key, executor, |state| {
                if state.lru.get(&digest).is_some() {
                    state.statements.get(&digest).map(|e| {
                        debug_assert_eq!(e.param_count, values.len());
                        debug_assert_eq!(e.text, text);
                        e.name.clone()
                    })
                } else {
                    None
                }
            });

            let stmt_name = match cached {
                Some(stmt_name) => stmt_name,
                None => {
                    let stmt_name = self.with_state(key, executor, |state| {
                        let n = state.counter;
                        state.counter += 1;
                        format!("{}_{}_{}", self.config.prefix, self.id, n)
                    });

                    let prepare_sql = format!("PREPARE {stmt_name} AS {text}");
                    if let Err(error) = executor.batch_execute(&prepare_sql).await {
                        tracing::debug!(
                            statement = %stmt_name,
                            error = %error,
                            "statement preparation failed; executing directly"
                        );
                        return executor.query_raw(text, values, array_mode).await;
                    }

                    let evicted = self.with_state(key, executor, |state| {
                        state.statements.insert(
                            digest.clone(),
                            StatementEntry {
                                name: stmt_name.clone(),
                                text: text.to_string(),
                                param_count: values.len(),
                            },
                        );
                        insert_and_evict(state, &digest, self.config.max_prepared_statements)
                    });

                    if let Some(victim) = evicted {
                        if let Err(error) =
                            executor.batch_execute(&format!("DEALLOCATE {victim}")).await
                        {
                            tracing::warn!(
                                statement = %victim,
                                error = %error,
                                "failed to deallocate evicted statement"
                            );
                        }
                    }

                    stmt_name
                }
            };

            let execute_sql = build_execute_sql(&stmt_name, values);
            match executor.query_raw(&execute_sql, &[], array_mode).await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_statement_loss() => {
                    tracing::debug!(
                        statement = %stmt_name,
                        "server no longer holds prepared statement; re-preparing"
                    );
                    self.with_state(key, executor, |state| {
                        state.lru.pop(&digest);
                        state.statements.remove(&digest);
                    });
                    continue;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Deallocate every live statement for a connection and drop its state.
    ///
    /// Deallocation failures are logged; the state is dropped regardless.
    pub async fn cleanup_connection(&self, key: &ClientKey) {
        let removed = match &key.0 {
            KeyRepr::Token(token) => {
                let mut map = self.token_states.lock();
                map.remove(&token.id()).map(|entry| entry.state)
            }
            KeyRepr::Name(name) => {
                let mut table = self.string_states.lock();
                table.order.retain(|k| k.as_str() != name.as_ref());
                table.states.remove(name.as_ref())
            }
        };

        if let Some(state) = removed {
            deallocate_all(state).await;
        }
    }

    /// Deallocate and drop every string-keyed state. Token-keyed states are
    /// reclaimed when their connections drop and are left alone here.
    pub async fn cleanup_all(&self) {
        let states: Vec<ConnectionState> = {
            let mut table = self.string_states.lock();
            table.order.clear();
            table.states.drain().map(|(_, state)| state).collect()
        };

        for state in states {
            deallocate_all(state).await;
        }
    }

    /// A monitoring snapshot.
    pub fn get_stats(&self) -> StatementStats {
        let token_keyed_connections = {
            let mut map = self.token_states.lock();
            map.retain(|_, entry| entry.weak.strong_count() > 0);
            map.len()
        };
        let table = self.string_states.lock();
        StatementStats {
            string_keyed_connections: table.states.len(),
            token_keyed_connections,
            string_keyed_statements: table.states.values().map(|s| s.statements.len()).sum(),
        }
    }

    fn with_state<R>(
        &self,
        key: &ClientKey,
        executor: &Arc<dyn ClientBackend>,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> R {
        let cap = self.config.max_prepared_statements;
        match &key.0 {
            KeyRepr::Token(token) => {
                let mut map = self.token_states.lock();
                // Reclaim states whose connections have gone away.
                map.retain(|_, entry| entry.weak.strong_count() > 0);
                let entry = map.entry(token.id()).or_insert_with(|| TokenEntry {
                    weak: token.downgrade(),
                    state: ConnectionState::new(cap, executor),
                });
                f(&mut entry.state)
            }
            KeyRepr::Name(name) => {
                let mut table = self.string_states.lock();
                if !table.states.contains_key(name.as_ref()) {
                    table
                        .states
                        .insert(name.to_string(), ConnectionState::new(cap, executor));
                    table.order.push_back(name.to_string());
                    while table.states.len() > MAX_STRING_KEYED_STATES {
                        if let Some(oldest) = table.order.pop_front() {
                            if table.states.remove(&oldest).is_some() {
                                tracing::warn!(
                                    key = %oldest,
                                    "string-keyed statement state evicted without cleanup"
                                );
                            }
                        } else {
                            break;
                        }
                    }
                }
                f(table
                    .states
                    .get_mut(name.as_ref())
                    .expect("state inserted above"))
            }
        }
    }
}

impl std::fmt::Debug for StatementManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.get_stats();
        f.debug_struct("StatementManager")
            .field("id", &self.id)
            .field("max_prepared_statements", &self.config.max_prepared_statements)
            .field("stats", &stats)
            .finish()
    }
}

async fn deallocate_all(state: ConnectionState) {
    let Some(executor) = state.executor.upgrade() else {
        return;
    };
    for name in state.statement_names() {
        if let Err(error) = executor.batch_execute(&format!("DEALLOCATE {name}")).await {
            tracing::warn!(statement = %name, error = %error, "failed to deallocate statement");
        }
    }
}

/// Put `digest` into the recency structure and locate the eviction victim:
/// a key still present in the statement map that no longer appears in the
/// LRU. At most one victim per insertion.
fn insert_and_evict(state: &mut ConnectionState, digest: &str, cap: usize) -> Option<String> {
    state.lru.put(digest.to_string(), ());
    if state.statements.len() <= cap {
        return None;
    }
    let victim_key = state
        .statements
        .keys()
        .find(|k| !state.lru.contains(k.as_str()))
        .cloned()?;
    state.statements.remove(&victim_key).map(|e| e.name)
}

/// Cache key: first 16 hex chars of `MD5(text ":" param_count)`.
///
/// The truncated digest accepts a small collision probability; the parameter
/// count is folded in so queries differing only in arity never collide.
fn statement_key(text: &str, param_count: usize) -> String {
    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    hasher.update(b":");
    hasher.update(param_count.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn build_execute_sql(name: &str, values: &[PgValue]) -> String {
    let args: Vec<String> = values.iter().map(|v| v.to_literal()).collect();
    format!("EXECUTE {name}({})", args.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_key_is_16_hex_chars() {
        let key = statement_key("SELECT * FROM users WHERE id = $1", 1);
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_statement_key_depends_on_text_and_arity() {
        let a = statement_key("SELECT $1", 1);
        let b = statement_key("SELECT $1", 2);
        let c = statement_key("SELECT $1 + 0", 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, statement_key("SELECT $1", 1));
    }

    #[test]
    fn test_build_execute_sql_formats_literals() {
        let sql = build_execute_sql(
            "pgbridge_0_3",
            &[
                PgValue::Int(1),
                PgValue::Text("o'clock".into()),
                PgValue::Null,
            ],
        );
        assert_eq!(sql, "EXECUTE pgbridge_0_3(1, 'o''clock', NULL)");
    }

    #[test]
    fn test_insert_and_evict_caps_statement_map() {
        let executor: Arc<dyn ClientBackend> = Arc::new(NoopBackend);
        let mut state = ConnectionState::new(2, &executor);

        for (i, digest) in ["k1", "k2", "k3"].iter().enumerate() {
            state.statements.insert(
                digest.to_string(),
                StatementEntry {
                    name: format!("s{i}"),
                    text: String::new(),
                    param_count: 1,
                },
            );
            let evicted = insert_and_evict(&mut state, digest, 2);
            if i < 2 {
                assert_eq!(evicted, None);
            } else {
                // k1 fell out of the LRU; its statement is the victim
                assert_eq!(evicted, Some("s0".to_string()));
            }
        }

        assert_eq!(state.statements.len(), 2);
        assert!(state.statements.contains_key("k2"));
        assert!(state.statements.contains_key("k3"));
    }

    #[test]
    fn test_token_states_reclaimed_when_token_drops() {
        let manager = StatementManager::new(StatementManagerConfig::default());
        let executor: Arc<dyn ClientBackend> = Arc::new(NoopBackend);

        let token = ConnectionToken::new();
        let key = ClientKey::from_token(&token);
        manager.with_state(&key, &executor, |state| state.counter += 1);
        assert_eq!(manager.get_stats().token_keyed_connections, 1);

        drop(key);
        drop(token);
        assert_eq!(manager.get_stats().token_keyed_connections, 0);
    }

    #[test]
    fn test_string_states_evict_oldest_beyond_cap() {
        let manager = StatementManager::new(StatementManagerConfig::default());
        let executor: Arc<dyn ClientBackend> = Arc::new(NoopBackend);

        for i in 0..(MAX_STRING_KEYED_STATES + 5) {
            let key = ClientKey::named(format!("conn-{i}"));
            manager.with_state(&key, &executor, |_| ());
        }

        let stats = manager.get_stats();
        assert_eq!(stats.string_keyed_connections, MAX_STRING_KEYED_STATES);

        // The oldest keys were dropped; the newest survive.
        let table = manager.string_states.lock();
        assert!(!table.states.contains_key("conn-0"));
        assert!(!table.states.contains_key("conn-4"));
        assert!(table.states.contains_key("conn-5"));
        assert!(table
            .states
            .contains_key(&format!("conn-{}", MAX_STRING_KEYED_STATES + 4)));
    }

    #[tokio::test]
    async fn test_cleanup_connection_deallocates_live_statements() {
        let manager = StatementManager::new(StatementManagerConfig::default());
        let mock = Arc::new(crate::testing::MockBackend::new());
        let executor: Arc<dyn ClientBackend> = Arc::clone(&mock) as Arc<dyn ClientBackend>;
        let key = ClientKey::named("cleanup-conn");

        manager
            .execute_query(
                &key,
                Some("q"),
                "select $1",
                &[PgValue::Int(1)],
                &executor,
                false,
            )
            .await
            .unwrap();
        assert_eq!(manager.get_stats().string_keyed_statements, 1);

        manager.cleanup_connection(&key).await;
        assert_eq!(mock.count_containing("DEALLOCATE"), 1);
        assert_eq!(manager.get_stats().string_keyed_connections, 0);
        assert_eq!(manager.get_stats().string_keyed_statements, 0);
    }

    #[tokio::test]
    async fn test_cleanup_all_drops_every_string_state() {
        let manager = StatementManager::new(StatementManagerConfig::default());
        let mock = Arc::new(crate::testing::MockBackend::new());
        let executor: Arc<dyn ClientBackend> = Arc::clone(&mock) as Arc<dyn ClientBackend>;

        for i in 0..3i64 {
            let key = ClientKey::named(format!("conn-{i}"));
            manager
                .execute_query(
                    &key,
                    Some("q"),
                    "select $1",
                    &[PgValue::Int(i)],
                    &executor,
                    false,
                )
                .await
                .unwrap();
        }

        manager.cleanup_all().await;
        assert_eq!(mock.count_containing("DEALLOCATE"), 3);
        assert_eq!(manager.get_stats().string_keyed_connections, 0);
    }

    struct NoopBackend;

    #[async_trait::async_trait]
    impl ClientBackend for NoopBackend {
        async fn query_raw(
            &self,
            _sql: &str,
            _params: &[PgValue],
            _array_mode: bool,
        ) -> PgBridgeResult<QueryResult> {
            Ok(QueryResult::empty())
        }

        async fn batch_execute(&self, _sql: &str) -> PgBridgeResult<()> {
            Ok(())
        }
    }
}
