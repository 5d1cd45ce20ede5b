//! Error types for the access layer.
//!
//! One crate-level error enum covers every backend; driver errors are carried
//! as boxed sources so they surface to callers verbatim.

use std::borrow::Cow;

use thiserror::Error;

/// Type-erased error type carried from the underlying drivers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for access-layer operations.
pub type PgBridgeResult<T, E = PgBridgeError> = Result<T, E>;

/// Errors that can occur in the access layer.
#[derive(Debug, Error)]
#[must_use = "database errors should be handled appropriately"]
pub enum PgBridgeError {
    /// Missing or conflicting configuration, raised before any I/O.
    ///
    /// This includes the "neither a connection string nor a prebuilt driver
    /// instance" case, surfaced on the first `with_pg_client` call.
    #[error("configuration error: {0}")]
    Configuration(Cow<'static, str>),

    /// A query failed in the backend.
    ///
    /// The failing SQL is included when the backend makes it available.
    #[error("query failed{}: {source}", sql_suffix(.sql))]
    Query {
        /// The SQL text that failed, when known.
        sql: Option<String>,
        /// The original driver error.
        #[source]
        source: BoxError,
    },

    /// A transaction control statement failed.
    ///
    /// `phase` names the failing boundary (`begin`, `commit`, `savepoint`,
    /// ...). Rollback failures are never reported through this variant; they
    /// are logged and the original error propagates instead.
    #[error("transaction {phase} failed: {source}")]
    Transaction {
        /// Which transaction boundary failed.
        phase: &'static str,
        /// The original driver error.
        #[source]
        source: BoxError,
    },

    /// Establishing or re-establishing a `LISTEN` failed.
    #[error("listen on channel {channel:?} failed: {source}")]
    Listen {
        /// The channel the listener was bound to.
        channel: String,
        /// The original driver error.
        #[source]
        source: BoxError,
    },

    /// `subscribe` was called on a released subscriber.
    #[error("subscriber has been released")]
    SubscriberReleased,

    /// An operation was attempted on a released pool.
    #[error("pool has been released")]
    PoolReleased,

    /// `release` was called more than once on the same pool.
    #[error("pool released more than once")]
    DoubleRelease,
}

impl PgBridgeError {
    /// Wrap a driver error as a [`PgBridgeError::Query`] without SQL context.
    pub fn query(source: impl Into<BoxError>) -> Self {
        PgBridgeError::Query {
            sql: None,
            source: source.into(),
        }
    }

    /// Wrap a driver error as a [`PgBridgeError::Query`], recording the SQL
    /// that failed.
    pub fn query_with_sql(sql: impl Into<String>, source: impl Into<BoxError>) -> Self {
        PgBridgeError::Query {
            sql: Some(sql.into()),
            source: source.into(),
        }
    }

    /// Whether the server reported a prepared statement as missing.
    ///
    /// The check is textual: every supported driver reports this class of
    /// failure with a `does not exist` message (SQLSTATE 26000 or 42704
    /// depending on path). The statement manager recovers from it by
    /// re-preparing.
    pub fn is_statement_loss(&self) -> bool {
        match self {
            PgBridgeError::Query { source, .. } => source.to_string().contains("does not exist"),
            _ => false,
        }
    }
}

fn sql_suffix(sql: &Option<String>) -> String {
    match sql {
        Some(sql) => format!(" (sql: {sql})"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_loss_detection() {
        let lost = PgBridgeError::query_with_sql(
            "EXECUTE pgbridge_1_0()",
            "prepared statement \"pgbridge_1_0\" does not exist",
        );
        assert!(lost.is_statement_loss());

        let other = PgBridgeError::query("syntax error at or near \"SELCT\"");
        assert!(!other.is_statement_loss());

        assert!(!PgBridgeError::SubscriberReleased.is_statement_loss());
    }

    #[test]
    fn test_query_error_display_includes_sql() {
        let err = PgBridgeError::query_with_sql("SELECT 1", "boom");
        let text = err.to_string();
        assert!(text.contains("SELECT 1"), "display was: {text}");
        assert!(text.contains("boom"));

        let bare = PgBridgeError::query("boom");
        assert!(!bare.to_string().contains("sql:"));
    }
}
