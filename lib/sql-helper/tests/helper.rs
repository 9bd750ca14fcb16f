//! Façade behaviour against the scripted backend: connection cleanup,
//! discovery caching, parameter binding and cursor ownership.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    DATA_SOURCE, OTHER_DATA_SOURCE, Script, ScriptedBackend, in_out_param, int_param,
};
use futures::StreamExt;
use sql_helper::{
    Binding, Column, CommandKind, ConnectionOwnership, DataTable, Direction, ParameterCache,
    ParameterDescriptor, Row, SqlHelper, SqlHelperError, SqlType, TransactionExecutor, Value,
};

fn helper(backend: &ScriptedBackend) -> SqlHelper<ScriptedBackend> {
    SqlHelper::new(backend.clone())
}

fn order_rows() -> Script {
    Script::Rows(
        vec![Column::new("FBillNo", "TEXT"), Column::new("FQty", "INT4")],
        vec![
            vec!["SO-001".into(), 12.into()],
            vec!["SO-002".into(), 3.into()],
        ],
    )
}

// ==================== Connection cleanup ====================

#[tokio::test]
async fn test_every_shape_releases_owned_connection() {
    let backend = ScriptedBackend::new();
    backend
        .script("GetOrders", order_rows())
        .script("PublishOrders", Script::Affected(2));
    let helper = helper(&backend);

    let affected = helper
        .procedure("PublishOrders")
        .non_query(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(affected, 2);
    assert_eq!(backend.live_connections(), 0);

    let scalar = helper
        .procedure("GetOrders")
        .scalar(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(scalar, Value::String("SO-001".into()));
    assert_eq!(backend.live_connections(), 0);

    let set = helper
        .procedure("GetOrders")
        .data_set(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(set.tables.len(), 1);
    assert_eq!(backend.live_connections(), 0);

    let table = helper
        .procedure("GetOrders")
        .data_table(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(backend.live_connections(), 0);

    let xml = helper
        .procedure("GetOrders")
        .xml(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(xml.as_str(), "SO-001SO-002");
    assert_eq!(backend.live_connections(), 0);

    let mut cursor = helper
        .procedure("GetOrders")
        .reader(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(cursor.ownership(), ConnectionOwnership::Internal);
    let mut count = 0;
    while let Some(row) = cursor.next().await {
        row.unwrap();
        count += 1;
    }
    assert_eq!(count, 2);
    cursor.close().await.unwrap();
    assert_eq!(backend.live_connections(), 0);
    assert_eq!(backend.opened_connections(), 6);
}

#[tokio::test]
async fn test_failed_execution_closes_owned_connection() {
    let backend = ScriptedBackend::new();
    backend.script(
        "InsertDuplicateOrder",
        Script::Fail("duplicate key value violates unique constraint".into()),
    );
    let helper = helper(&backend);

    let err = helper
        .procedure("InsertDuplicateOrder")
        .non_query(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap_err();

    assert!(matches!(err, SqlHelperError::Execution(ref msg) if msg.contains("duplicate key")));
    assert_eq!(backend.opened_connections(), 1);
    assert_eq!(backend.live_connections(), 0);
}

#[tokio::test]
async fn test_failed_reader_closes_connection_before_returning() {
    let backend = ScriptedBackend::new();
    backend.script("BrokenReport", Script::Fail("relation does not exist".into()));
    let helper = helper(&backend);

    let err = helper
        .procedure("BrokenReport")
        .reader(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap_err();

    assert!(matches!(err, SqlHelperError::Execution(_)));
    assert_eq!(backend.live_connections(), 0);
}

#[tokio::test]
async fn test_dropped_reader_releases_connection() {
    let backend = ScriptedBackend::new();
    backend.script("GetOrders", order_rows());
    let helper = helper(&backend);

    let mut cursor = helper
        .procedure("GetOrders")
        .reader(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(first.get_by_name("FBillNo"), Some(&Value::String("SO-001".into())));
    drop(cursor);

    assert!(backend.wait_until_idle().await);
}

#[tokio::test]
async fn test_external_reader_leaves_connection_to_caller() {
    let backend = ScriptedBackend::new();
    backend.script("GetOrders", order_rows());
    let helper = helper(&backend);

    let mut connection = helper.open(DATA_SOURCE).await.unwrap();
    {
        let cursor = helper
            .procedure("GetOrders")
            .reader(Binding::Connection(&mut connection))
            .await
            .unwrap();
        assert_eq!(cursor.ownership(), ConnectionOwnership::External);
        let table = cursor.into_table().await.unwrap();
        assert_eq!(table.len(), 2);
    }
    assert_eq!(backend.live_connections(), 1);

    // The same connection stays usable after the cursor is gone.
    let value = helper
        .procedure("GetOrders")
        .scalar(Binding::Connection(&mut connection))
        .await
        .unwrap();
    assert_eq!(value, Value::String("SO-001".into()));
    assert_eq!(backend.live_connections(), 1);

    helper.close(connection).await.unwrap();
    assert_eq!(backend.live_connections(), 0);
}

// ==================== Discovery and caching ====================

#[tokio::test]
async fn test_discovery_happens_once_per_key() {
    let backend = ScriptedBackend::new();
    backend.procedure("PublishOrders", vec![int_param("@prodid")]);
    let helper = helper(&backend);

    for prodid in [24, 36] {
        helper
            .procedure("PublishOrders")
            .values([prodid])
            .non_query(Binding::DataSource(DATA_SOURCE))
            .await
            .unwrap();
    }
    assert_eq!(backend.describe_calls(), 1);

    // Including the return value is a separate slot.
    let with_return = helper
        .parameter_set(DATA_SOURCE, "PublishOrders", true)
        .await
        .unwrap();
    assert_eq!(with_return.len(), 2);
    assert_eq!(with_return[0].direction, Direction::ReturnValue);
    assert_eq!(backend.describe_calls(), 2);

    // A different data source never shares an entry.
    helper
        .parameter_set(OTHER_DATA_SOURCE, "PublishOrders", false)
        .await
        .unwrap();
    assert_eq!(backend.describe_calls(), 3);
    assert_eq!(backend.live_connections(), 0);
}

#[tokio::test]
async fn test_concurrent_first_discovery_converges() {
    let backend = ScriptedBackend::new();
    backend
        .procedure("PublishOrders", vec![int_param("@prodid")])
        .slow_describe(Duration::from_millis(50));
    let helper = helper(&backend);

    let (a, b) = tokio::join!(
        helper.parameter_set(DATA_SOURCE, "PublishOrders", false),
        helper.parameter_set(DATA_SOURCE, "PublishOrders", false),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert!(backend.describe_calls() <= 2);
    assert_eq!(helper.cache().len(), 1);
    assert_eq!(helper.cache().get(DATA_SOURCE, "PublishOrders").unwrap(), a);
    assert_eq!(backend.live_connections(), 0);
}

#[tokio::test]
async fn test_concurrent_discovery_across_tasks() {
    let backend = ScriptedBackend::new();
    backend
        .procedure("PublishOrders", vec![int_param("@prodid")])
        .slow_describe(Duration::from_millis(20));
    let helper = helper(&backend);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let helper = helper.clone();
            tokio::spawn(async move {
                helper
                    .procedure("PublishOrders")
                    .values([i])
                    .prepare(DATA_SOURCE)
                    .await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let command = task.await.unwrap().unwrap();
        assert_eq!(command.parameters()[0].value, Some(Value::Int(i as i64)));
    }
    let cached = helper.cache().get(DATA_SOURCE, "PublishOrders").unwrap();
    assert_eq!(cached, vec![int_param("@prodid")]);
}

#[tokio::test]
async fn test_returned_parameters_are_copies() {
    let backend = ScriptedBackend::new();
    backend.procedure("PublishOrders", vec![int_param("@prodid")]);
    let helper = helper(&backend);

    let mut first = helper
        .parameter_set(DATA_SOURCE, "PublishOrders", false)
        .await
        .unwrap();
    first[0].value = Some(Value::Int(99));
    first[0].sql_type = SqlType::String;
    first.clear();

    let second = helper
        .parameter_set(DATA_SOURCE, "PublishOrders", false)
        .await
        .unwrap();
    assert_eq!(second, vec![int_param("@prodid")]);
    assert_eq!(backend.describe_calls(), 1);
}

#[tokio::test]
async fn test_unknown_procedure_is_a_discovery_error_and_not_cached() {
    let backend = ScriptedBackend::new();
    let helper = helper(&backend);

    let err = helper
        .procedure("NoSuchProcedure")
        .values([1])
        .non_query(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap_err();

    assert!(matches!(err, SqlHelperError::Discovery { ref procedure, .. } if procedure == "NoSuchProcedure"));
    assert!(helper.cache().is_empty());
    assert!(backend.executed().is_empty());
    assert_eq!(backend.live_connections(), 0);
}

#[tokio::test]
async fn test_unreachable_data_source() {
    let backend = ScriptedBackend::new();
    backend
        .procedure("PublishOrders", vec![int_param("@prodid")])
        .unreachable(OTHER_DATA_SOURCE);
    let helper = helper(&backend);

    let err = helper
        .procedure("PublishOrders")
        .parameter(ParameterDescriptor::input("@prodid", SqlType::Int, 24))
        .non_query(Binding::DataSource(OTHER_DATA_SOURCE))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlHelperError::Connection(_)));

    // Discovery reports its own failure to connect as a discovery error.
    let err = helper
        .procedure("PublishOrders")
        .values([24])
        .non_query(Binding::DataSource(OTHER_DATA_SOURCE))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlHelperError::Discovery { .. }));
}

#[tokio::test]
async fn test_preseeded_template_skips_discovery() {
    let backend = ScriptedBackend::new();
    let cache = Arc::new(ParameterCache::new());
    cache.put(
        DATA_SOURCE,
        "PublishOrders",
        vec![ParameterDescriptor::new("@prodid", SqlType::Int)],
    );
    let helper = SqlHelper::with_cache(backend.clone(), Arc::clone(&cache));

    let command = helper
        .procedure("PublishOrders")
        .values([24])
        .prepare(DATA_SOURCE)
        .await
        .unwrap();

    assert_eq!(command.parameters()[0].value, Some(Value::Int(24)));
    assert_eq!(backend.describe_calls(), 0);
    assert_eq!(backend.opened_connections(), 0);
}

// ==================== Parameter binding ====================

#[tokio::test]
async fn test_count_mismatch_fails_before_execution() {
    let backend = ScriptedBackend::new();
    backend.procedure("PublishOrders", vec![int_param("@prodid")]);
    let helper = helper(&backend);

    let err = helper
        .procedure("PublishOrders")
        .values([24, 36])
        .non_query(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SqlHelperError::ParameterCountMismatch {
            expected: 1,
            supplied: 2
        }
    ));
    assert!(backend.executed().is_empty());
    // Only the discovery connection was opened.
    assert_eq!(backend.opened_connections(), 1);
    assert_eq!(backend.live_connections(), 0);
}

#[tokio::test]
async fn test_empty_value_list_still_checks_arity() {
    let backend = ScriptedBackend::new();
    backend.procedure("PublishOrders", vec![int_param("@prodid")]);
    let helper = helper(&backend);

    let err = helper
        .procedure("PublishOrders")
        .values(Vec::<Value>::new())
        .scalar(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlHelperError::ParameterCountMismatch { expected: 1, supplied: 0 }));
}

#[tokio::test]
async fn test_positional_values_match_manual_parameters() {
    let backend = ScriptedBackend::new();
    backend
        .procedure("PublishOrders", vec![int_param("@prodid")])
        .script("PublishOrders", Script::Affected(1));
    let helper = helper(&backend);

    helper
        .procedure("PublishOrders")
        .values([24])
        .non_query(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    helper
        .procedure("PublishOrders")
        .parameters(vec![ParameterDescriptor::input("@prodid", SqlType::Int, 24)])
        .non_query(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();

    let executed = backend.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0], executed[1]);
    assert_eq!(executed[0].kind(), CommandKind::StoredProcedure);
    assert_eq!(
        executed[0].parameters(),
        &[ParameterDescriptor::input("@prodid", SqlType::Int, 24)]
    );
}

#[tokio::test]
async fn test_input_output_parameters_bind_explicit_null() {
    let backend = ScriptedBackend::new();
    backend.procedure(
        "ApproveOrder",
        vec![
            ParameterDescriptor::new("@FBillNo", SqlType::String).with_size(50),
            in_out_param("@FResult", SqlType::Int),
        ],
    );
    let helper = helper(&backend);

    // Supplying NULL positionally and leaving it unassigned bind the same way.
    let positional = helper
        .procedure("ApproveOrder")
        .values([Value::from("SO-001"), Value::Null])
        .prepare(DATA_SOURCE)
        .await
        .unwrap();
    let explicit = helper
        .procedure("ApproveOrder")
        .parameter(ParameterDescriptor::input("@FBillNo", SqlType::String, "SO-001").with_size(50))
        .parameter(in_out_param("@FResult", SqlType::Int))
        .prepare(DATA_SOURCE)
        .await
        .unwrap();

    assert_eq!(positional.parameters()[1].value, Some(Value::Null));
    assert_eq!(explicit.parameters()[1].value, Some(Value::Null));
    assert_eq!(positional, explicit);
}

#[tokio::test]
async fn test_text_values_bind_positionally() {
    let backend = ScriptedBackend::new();
    let sql = "SELECT * FROM tm_v_sales_return_notice WHERE fbillno = $1";
    backend.script(sql, order_rows());
    let helper = helper(&backend);

    let table = helper
        .text(sql)
        .values(["SO-001"])
        .data_table(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(table.columns.len(), 2);

    let executed = backend.executed();
    assert_eq!(executed[0].kind(), CommandKind::Text);
    assert_eq!(executed[0].parameters()[0].name, "$1");
    assert_eq!(executed[0].parameters()[0].sql_type, SqlType::String);
    // Text commands never describe anything.
    assert_eq!(backend.describe_calls(), 0);
}

// ==================== End-to-end scenarios ====================

#[tokio::test]
async fn test_scalar_without_parameters() {
    let backend = ScriptedBackend::new();
    backend.script(
        "GetOrderCount",
        Script::Rows(vec![Column::new("count", "INT8")], vec![vec![42.into()]]),
    );
    let helper = helper(&backend);

    let count = helper
        .procedure("GetOrderCount")
        .scalar(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();

    assert_eq!(count.as_i64(), Some(42));
    assert_eq!(backend.describe_calls(), 0);
    assert_eq!(backend.live_connections(), 0);
}

#[tokio::test]
async fn test_scalar_of_empty_result_is_null() {
    let backend = ScriptedBackend::new();
    backend.script("GetOrders", Script::Rows(vec![Column::new("FBillNo", "TEXT")], vec![]));
    let helper = helper(&backend);

    let value = helper
        .procedure("GetOrders")
        .scalar(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert!(value.is_null());
}

#[tokio::test]
async fn test_data_set_keeps_every_result_set() {
    let backend = ScriptedBackend::new();
    let orders = Arc::from(vec![Column::new("FBillNo", "TEXT")]);
    let totals = Arc::from(vec![Column::new("total", "INT8")]);
    backend.script(
        "GetOrderSummary",
        Script::Sets(vec![
            DataTable::from_rows(vec![Row::new(orders, vec!["SO-001".into()])]),
            DataTable::from_rows(vec![Row::new(totals, vec![1.into()])]),
        ]),
    );
    let helper = helper(&backend);

    let set = helper
        .procedure("GetOrderSummary")
        .data_set(Binding::DataSource(DATA_SOURCE))
        .await
        .unwrap();
    assert_eq!(set.tables.len(), 2);
    assert_eq!(set.table(1).unwrap().scalar(), Value::Int(1));
}

#[tokio::test]
async fn test_transaction_binding_does_not_touch_lifecycle() {
    let backend = ScriptedBackend::new();
    backend
        .procedure("PublishOrders", vec![int_param("@prodid")])
        .script("PublishOrders", Script::Affected(1));
    let helper = helper(&backend);

    let mut tx = helper.begin(DATA_SOURCE).await.unwrap();
    let affected = helper
        .procedure("PublishOrders")
        .values([24])
        .non_query(Binding::Transaction(&mut tx))
        .await
        .unwrap();
    assert_eq!(affected, 1);
    // The transaction's connection plus nothing left over from discovery.
    assert_eq!(backend.live_connections(), 1);

    tx.commit().await.unwrap();
    assert_eq!(backend.live_connections(), 0);
    assert_eq!(
        *backend.state.transaction_log.lock(),
        vec!["begin", "commit"]
    );
}

#[tokio::test]
async fn test_default_binding() {
    let backend = ScriptedBackend::new();
    backend.script("PublishOrders", Script::Affected(4));

    let unconfigured = helper(&backend);
    let err = unconfigured
        .procedure("PublishOrders")
        .non_query(Binding::Default)
        .await
        .unwrap_err();
    assert!(matches!(err, SqlHelperError::Connection(_)));

    let configured = helper(&backend).with_default_data_source(DATA_SOURCE);
    let affected = configured
        .procedure("PublishOrders")
        .non_query(Binding::Default)
        .await
        .unwrap();
    assert_eq!(affected, 4);
    assert_eq!(backend.executed()[0].text(), "PublishOrders");
    assert_eq!(backend.live_connections(), 0);
}
