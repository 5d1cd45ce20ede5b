//! Cross-module scenario tests: the statement cache driven through the
//! client surface, asserting the exact SQL reaching the backend.

use std::sync::Arc;

use crate::backend::ClientBackend;
use crate::client::PgClient;
use crate::error::PgBridgeError;
use crate::statement::{ClientKey, StatementManager, StatementManagerConfig};
use crate::testing::MockBackend;
use crate::value::PgValue;

fn manager_with_cap(cap: usize) -> Arc<StatementManager> {
    Arc::new(StatementManager::new(StatementManagerConfig {
        max_prepared_statements: cap,
        ..StatementManagerConfig::default()
    }))
}

fn cached_client(mock: &Arc<MockBackend>, cap: usize) -> PgClient {
    let conn: Arc<dyn ClientBackend> = Arc::clone(mock) as Arc<dyn ClientBackend>;
    PgClient::new(
        conn,
        Some(manager_with_cap(cap)),
        ClientKey::named("scenario-conn"),
        false,
    )
}

fn prepared_name(log_entry: &str) -> &str {
    // "PREPARE {name} AS {text}"
    log_entry
        .strip_prefix("PREPARE ")
        .and_then(|rest| rest.split(' ').next())
        .expect("not a PREPARE statement")
}

#[tokio::test]
async fn test_named_query_is_prepared_then_executed() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 100);

    client
        .query_named(
            Some("fetch_user"),
            "select * from users where id = $1",
            &[PgValue::Int(7)],
            false,
        )
        .await
        .unwrap();

    let log = mock.sql_log();
    assert_eq!(log.len(), 2);
    assert!(log[0].starts_with("PREPARE "));
    assert!(log[0].ends_with(" AS select * from users where id = $1"));
    let name = prepared_name(&log[0]);
    assert_eq!(log[1], format!("EXECUTE {name}(7)"));
}

#[tokio::test]
async fn test_repeat_execution_reuses_prepared_statement() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 100);

    for id in [1i64, 2, 3] {
        client
            .query_named(
                Some("fetch_user"),
                "select * from users where id = $1",
                &[PgValue::Int(id)],
                false,
            )
            .await
            .unwrap();
    }

    assert_eq!(mock.count_containing("PREPARE"), 1);
    assert_eq!(mock.count_containing("EXECUTE"), 3);
}

#[tokio::test]
async fn test_lru_eviction_deallocates_exactly_one() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 2);

    for text in ["select 1 where $1", "select 2 where $1", "select 3 where $1"] {
        client
            .query_named(Some("q"), text, &[PgValue::Bool(true)], false)
            .await
            .unwrap();
    }

    let log = mock.sql_log();
    assert_eq!(mock.count_containing("PREPARE"), 3);
    assert_eq!(mock.count_containing("EXECUTE"), 3);
    assert_eq!(mock.count_containing("DEALLOCATE"), 1);

    // the evicted statement is the first one prepared
    let first_name = prepared_name(&log[0]).to_string();
    assert!(log.contains(&format!("DEALLOCATE {first_name}")));

    // re-executing the evicted query prepares it again
    client
        .query_named(Some("q"), "select 1 where $1", &[PgValue::Bool(true)], false)
        .await
        .unwrap();
    assert_eq!(mock.count_containing("PREPARE"), 4);
    assert_eq!(mock.count_containing("DEALLOCATE"), 2);
}

#[tokio::test]
async fn test_statement_loss_recovers_with_one_reprepare() {
    async fn run(client: &PgClient) -> Result<crate::value::QueryResult, PgBridgeError> {
        client
            .query_named(
                Some("q"),
                "select * from t where id = $1",
                &[PgValue::Int(1)],
                false,
            )
            .await
    }

    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 100);

    run(&client).await.unwrap();
    assert_eq!(mock.count_containing("PREPARE"), 1);

    // the server forgets the statement (connection recycled behind us)
    mock.fail_once_for("EXECUTE", "prepared statement \"x\" does not exist");

    run(&client).await.unwrap();
    assert_eq!(mock.count_containing("PREPARE"), 2);
    // initial execute + failed execute + retry
    assert_eq!(mock.count_containing("EXECUTE"), 3);
}

#[tokio::test]
async fn test_prepare_failure_downgrades_to_direct_execution() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 100);

    mock.fail_for("PREPARE", "permission denied");

    client
        .query_named(
            Some("q"),
            "select * from t where id = $1",
            &[PgValue::Int(9)],
            false,
        )
        .await
        .unwrap();

    let log = mock.sql_log();
    assert_eq!(mock.count_containing("EXECUTE"), 0);
    assert_eq!(log.last().map(String::as_str), Some("select * from t where id = $1"));
    assert_eq!(
        mock.params_for("select * from t").unwrap(),
        vec![PgValue::Int(9)]
    );
}

#[tokio::test]
async fn test_unnamed_or_valueless_queries_skip_the_cache() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 100);

    client
        .query("select * from t where id = $1", &[PgValue::Int(1)])
        .await
        .unwrap();
    client
        .query_named(Some("q"), "select now()", &[], false)
        .await
        .unwrap();

    assert_eq!(mock.count_containing("PREPARE"), 0);
    assert_eq!(mock.count_containing("EXECUTE"), 0);
    assert_eq!(
        mock.sql_log(),
        vec!["select * from t where id = $1", "select now()"]
    );
}

#[tokio::test]
async fn test_cache_size_zero_disables_preparation() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 0);

    client
        .query_named(
            Some("q"),
            "select * from t where id = $1",
            &[PgValue::Int(1)],
            false,
        )
        .await
        .unwrap();

    assert_eq!(mock.count_containing("PREPARE"), 0);
    assert_eq!(mock.sql_log(), vec!["select * from t where id = $1"]);
}

#[tokio::test]
async fn test_query_errors_surface_verbatim() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 100);
    mock.fail_for("select boom", "relation \"boom\" is broken");

    let error = client.query("select boom", &[]).await.unwrap_err();
    let PgBridgeError::Query { sql, source } = error else {
        panic!("expected a query error");
    };
    assert_eq!(sql.as_deref(), Some("select boom"));
    assert!(source.to_string().contains("is broken"));
}

#[tokio::test]
async fn test_named_queries_inside_transaction_share_connection_cache() {
    let mock = Arc::new(MockBackend::new());
    let client = cached_client(&mock, 100);

    client
        .query_named(Some("q"), "select $1", &[PgValue::Int(1)], false)
        .await
        .unwrap();

    let result: Result<(), PgBridgeError> = client
        .with_transaction(|tx| {
            Box::pin(async move {
                tx.query_named(Some("q"), "select $1", &[PgValue::Int(2)], false)
                    .await?;
                Ok(())
            })
        })
        .await;
    result.unwrap();

    // the statement prepared outside the transaction is reused inside it
    assert_eq!(mock.count_containing("PREPARE"), 1);
    assert_eq!(mock.count_containing("EXECUTE"), 2);
}
