use super::{Event, FakeDatabase, FakeRow, Value, instance, stat_row, update};
use pg_statements_collector::collector::stat_statements::{StatStatementsDescs, UNKNOWN_LABEL, statements_query};
use pg_statements_collector::{
    CollectError, Collector, ConstMetric, ContextError, QueryContext, StatStatementsCollector, StatStatementsConfig, StatementLabel,
    StatementStatRow, ValueType,
};
use std::time::Duration;

fn collector(reset_after_read: bool) -> StatStatementsCollector {
    StatStatementsCollector::new(StatStatementsConfig::new(reset_after_read, StatementLabel::Text).unwrap())
}

fn summary(metrics: &[ConstMetric]) -> Vec<(String, Vec<String>, f64)> {
    metrics.iter().map(|m| (m.desc().fq_name.clone(), m.label_values().to_vec(), m.value())).collect()
}

fn labels(user: &str, datname: &str, query: &str) -> Vec<String> {
    vec![user.to_string(), datname.to_string(), query.to_string()]
}

#[tokio::test]
async fn example_row() {
    let row = StatementStatRow {
        user: Some("app".to_string()),
        database: Some("prod".to_string()),
        statement: Some("SELECT 1".to_string()),
        calls_total: Some(42),
        mean_seconds_total: Some(0.01),
        max_seconds_total: Some(0.02),
        rows_total: Some(1),
        block_read_seconds_total: Some(0.001),
        block_write_seconds_total: None,
    };
    let l = labels("app", "prod", "SELECT 1");
    let expected = vec![
        ("pg_stat_statements_calls_total".to_string(), l.clone(), 42.0),
        ("pg_stat_statements_mean_seconds_total".to_string(), l.clone(), 0.01),
        ("pg_stat_statements_max_seconds_total".to_string(), l.clone(), 0.02),
        ("pg_stat_statements_rows_total".to_string(), l.clone(), 1.0),
        ("pg_stat_statements_block_read_seconds_total".to_string(), l.clone(), 0.001),
        ("pg_stat_statements_block_write_seconds_total".to_string(), l.clone(), 0.0),
    ];
    for reset in [false, true] {
        let instance = instance(FakeDatabase::with_rows(&[row.clone()]));
        let (result, metrics) = update(&collector(reset), &QueryContext::background(), &instance).await;
        result.unwrap();
        assert_eq!(summary(&metrics), expected);
        assert!(metrics.iter().all(|m| m.value_type() == ValueType::Counter));
    }
}

#[tokio::test]
async fn null_columns_use_defaults() {
    let instance = instance(FakeDatabase::with_rows(&[StatementStatRow::default()]));
    let (result, metrics) = update(&collector(false), &QueryContext::background(), &instance).await;
    result.unwrap();
    assert_eq!(metrics.len(), 6);
    for metric in &metrics {
        assert_eq!(metric.label_values(), [UNKNOWN_LABEL, UNKNOWN_LABEL, UNKNOWN_LABEL]);
        assert_eq!(metric.value(), 0.0);
    }

    // Only the missing column falls back
    let row = StatementStatRow { user: None, calls_total: None, ..stat_row("app", "prod", "SELECT 1", 7) };
    assert_eq!(row.labels(), ["unknown".to_string(), "prod".to_string(), "SELECT 1".to_string()]);
    assert_eq!(row.values(), [0.0, 0.5, 1.5, 14.0, 0.25, 0.125]);
}

#[tokio::test]
async fn six_observations_per_row() {
    let rows = [stat_row("a", "db1", "SELECT 1", 1), stat_row("b", "db1", "SELECT 2", 2), stat_row("c", "db2", "SELECT 3", 3)];
    for reset in [false, true] {
        let instance = instance(FakeDatabase::with_rows(&rows));
        let (result, metrics) = update(&collector(reset), &QueryContext::background(), &instance).await;
        result.unwrap();
        assert_eq!(metrics.len(), 18);
        let calls: Vec<f64> = metrics.iter().filter(|m| m.desc().fq_name.ends_with("calls_total")).map(|m| m.value()).collect();
        assert_eq!(calls, vec![1.0, 2.0, 3.0]);
        assert_eq!(metrics[6].label("user"), Some("b"));
        assert_eq!(metrics[17].label("datname"), Some("db2"));
    }
}

#[tokio::test]
async fn read_only_never_resets() {
    let instance = instance(FakeDatabase::with_rows(&[stat_row("app", "prod", "SELECT 1", 1), stat_row("app", "prod", "SELECT 2", 1)]));
    let (result, _) = update(&collector(false), &QueryContext::background(), &instance).await;
    result.unwrap();
    assert_eq!(instance.db().events(), vec![Event::Query, Event::Row, Event::Row, Event::CursorClosed]);
    assert_eq!(instance.db().statements().len(), 1);
}

#[tokio::test]
async fn reset_happens_after_cursor_is_closed() {
    let instance = instance(FakeDatabase::with_rows(&[stat_row("app", "prod", "SELECT 1", 1), stat_row("app", "prod", "SELECT 2", 1)]));
    let (result, metrics) = update(&collector(true), &QueryContext::background(), &instance).await;
    result.unwrap();
    assert_eq!(metrics.len(), 12);
    assert_eq!(instance.db().events(), vec![Event::Query, Event::Row, Event::Row, Event::CursorClosed, Event::Reset]);
    assert_eq!(instance.db().statements()[1], "SELECT pg_stat_statements_reset()");
}

#[tokio::test]
async fn reset_failure_still_emits() {
    let rows = [stat_row("app", "prod", "SELECT 1", 5)];
    let db = FakeDatabase { reset_error: Some("permission denied for function pg_stat_statements_reset".to_string()), ..FakeDatabase::with_rows(&rows) };
    let instance = instance(db);
    let (result, metrics) = update(&collector(true), &QueryContext::background(), &instance).await;
    result.unwrap();
    assert_eq!(metrics.len(), 6);
    assert_eq!(metrics[0].value(), 5.0);
    assert_eq!(instance.db().events().last(), Some(&Event::Reset));
}

#[tokio::test]
async fn deadline_during_reset_still_emits() {
    let rows = [stat_row("app", "prod", "SELECT 1", 5), stat_row("app", "prod", "SELECT 2", 2)];
    let instance = instance(FakeDatabase { hang_reset: true, ..FakeDatabase::with_rows(&rows) });
    let ctx = QueryContext::background().with_timeout(Duration::from_millis(50));
    let (result, metrics) = update(&collector(true), &ctx, &instance).await;
    result.unwrap();
    assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    assert_eq!(metrics.len(), 12);
    assert_eq!(metrics[0].value(), 5.0);
    assert_eq!(metrics[6].value(), 2.0);
    assert_eq!(instance.db().events(), vec![Event::Query, Event::Row, Event::Row, Event::CursorClosed, Event::Reset]);
}

#[tokio::test]
async fn empty_batch() {
    for reset in [false, true] {
        let instance = instance(FakeDatabase::default());
        let (result, metrics) = update(&collector(reset), &QueryContext::background(), &instance).await;
        result.unwrap();
        assert!(metrics.is_empty());
        assert_eq!(instance.db().events().contains(&Event::Reset), reset);
    }
}

#[tokio::test]
async fn finished_context_fails_fast() {
    let (ctx, cancel) = QueryContext::background().with_cancel();
    cancel.cancel();
    let expired = QueryContext::background().with_timeout(Duration::ZERO);
    for (ctx, reason) in [(ctx, ContextError::Canceled), (expired, ContextError::DeadlineExceeded)] {
        for reset in [false, true] {
            let instance = instance(FakeDatabase::with_rows(&[stat_row("app", "prod", "SELECT 1", 1)]));
            let (result, metrics) = update(&collector(reset), &ctx, &instance).await;
            let err = result.unwrap_err();
            assert!(matches!(err, CollectError::Query(_)), "{err}");
            assert_eq!(err.context_error(), Some(reason));
            assert!(metrics.is_empty());
            assert!(instance.db().events().is_empty());
        }
    }
}

#[tokio::test]
async fn cancel_while_query_is_pending() {
    let instance = instance(FakeDatabase { hang_query: true, ..Default::default() });
    let (ctx, cancel) = QueryContext::background().with_cancel();
    let collector = collector(true);
    let cancel_later = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    };
    let ((result, metrics), ()) = tokio::join!(update(&collector, &ctx, &instance), cancel_later);
    assert_eq!(result.unwrap_err().context_error(), Some(ContextError::Canceled));
    assert!(metrics.is_empty());
    assert_eq!(instance.db().events(), vec![Event::Query]);
}

#[tokio::test]
async fn query_error() {
    for reset in [false, true] {
        let db = FakeDatabase { query_error: Some("relation \"pg_stat_statements\" does not exist".to_string()), ..Default::default() };
        let instance = instance(db);
        let (result, metrics) = update(&collector(reset), &QueryContext::background(), &instance).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("does not exist"), "{err}");
        assert!(matches!(err, CollectError::Query(_)));
        assert_eq!(err.context_error(), None);
        assert!(metrics.is_empty());
        assert!(!instance.db().events().contains(&Event::Reset));
    }
}

#[tokio::test]
async fn scan_error() {
    let good = FakeRow::from(&stat_row("app", "prod", "SELECT 1", 1));
    let mut bad = FakeRow::from(&stat_row("app", "prod", "SELECT 2", 1));
    bad.0[3] = Value::Text("many".to_string());

    // Streaming has already pushed the rows before the bad one
    let streaming = instance(FakeDatabase { rows: vec![good.clone(), bad.clone()], ..Default::default() });
    let (result, metrics) = update(&collector(false), &QueryContext::background(), &streaming).await;
    assert!(matches!(result, Err(CollectError::Scan { column: "calls_total", .. })));
    assert_eq!(metrics.len(), 6);

    let buffered = instance(FakeDatabase { rows: vec![good, bad], ..Default::default() });
    let (result, metrics) = update(&collector(true), &QueryContext::background(), &buffered).await;
    assert!(matches!(result, Err(CollectError::Scan { column: "calls_total", .. })));
    assert!(metrics.is_empty());
    assert!(!buffered.db().events().contains(&Event::Reset));
    assert!(buffered.db().events().contains(&Event::CursorClosed));
}

#[tokio::test]
async fn scan_error_names_statement_column() {
    let mut bad = FakeRow::from(&stat_row("app", "prod", "SELECT 1", 1));
    bad.0[2] = Value::Int(42);
    for (label, column) in [(StatementLabel::Text, "query"), (StatementLabel::QueryId, "queryid")] {
        let collector = StatStatementsCollector::new(StatStatementsConfig::new(false, label).unwrap());
        let instance = instance(FakeDatabase { rows: vec![bad.clone()], ..Default::default() });
        let (result, _) = update(&collector, &QueryContext::background(), &instance).await;
        match result {
            Err(CollectError::Scan { column: got, .. }) => assert_eq!(got, column),
            other => panic!("expected a scan error, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn cursor_error() {
    let rows = [stat_row("app", "prod", "SELECT 1", 1), stat_row("app", "prod", "SELECT 2", 1)];
    let instance = instance(FakeDatabase { fail_after: Some(1), ..FakeDatabase::with_rows(&rows) });
    let (result, metrics) = update(&collector(true), &QueryContext::background(), &instance).await;
    let err = result.unwrap_err();
    assert!(matches!(err, CollectError::Query(_)));
    assert!(err.to_string().contains("connection reset"), "{err}");
    assert!(metrics.is_empty());
    assert!(!instance.db().events().contains(&Event::Reset));
}

#[tokio::test]
async fn closed_sink() {
    let instance = instance(FakeDatabase::with_rows(&[stat_row("app", "prod", "SELECT 1", 1)]));
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    drop(rx);
    let result = collector(false).update(&QueryContext::background(), &instance, &tx).await;
    assert!(matches!(result, Err(CollectError::SinkClosed)));
}

#[test]
fn query_text() {
    let sql = statements_query(170002, StatementLabel::Text);
    assert!(sql.contains("pg_stat_statements.shared_blk_read_time / 1000.0"));
    assert!(sql.contains("(pg_stat_statements.mean_plan_time + pg_stat_statements.mean_exec_time) / 1000.0"));
    assert!(sql.contains("NOT LIKE '%pg_setting%'"));
    assert!(sql.contains("JOIN pg_database ON pg_database.oid = pg_stat_statements.dbid"));

    let sql = statements_query(160002, StatementLabel::QueryId);
    assert!(sql.contains("pg_stat_statements.blk_write_time / 1000.0"));
    assert!(!sql.contains("shared_blk"));
    assert!(sql.contains("pg_stat_statements.queryid::text"));

    let sql = statements_query(120010, StatementLabel::Text);
    assert!(sql.contains("pg_stat_statements.max_time / 1000.0"));
    assert!(!sql.contains("exec_time"));
}

#[tokio::test]
async fn query_follows_server_version() {
    let db = FakeDatabase::default();
    let instance = pg_statements_collector::Instance::new(db, 170000);
    let (result, _) = update(&collector(false), &QueryContext::background(), &instance).await;
    result.unwrap();
    assert_eq!(instance.db().statements(), vec![statements_query(170000, StatementLabel::Text)]);
}

#[test]
fn descriptors() {
    let descs = StatStatementsDescs::new(StatementLabel::Text).unwrap();
    let names: Vec<&str> = descs.all().iter().map(|d| d.fq_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "pg_stat_statements_calls_total",
            "pg_stat_statements_mean_seconds_total",
            "pg_stat_statements_max_seconds_total",
            "pg_stat_statements_rows_total",
            "pg_stat_statements_block_read_seconds_total",
            "pg_stat_statements_block_write_seconds_total",
        ]
    );
    assert!(descs.all().iter().all(|d| d.variable_labels == ["user", "datname", "query"]));
    assert_eq!(descs.calls_total.help, "Number of times executed");

    let descs = StatStatementsDescs::new(StatementLabel::QueryId).unwrap();
    assert_eq!(descs.rows_total.variable_labels, ["user", "datname", "queryid"]);

    let collector = collector(false);
    let described = Collector::<FakeDatabase>::describe(&collector);
    assert_eq!(described.len(), 6);
    assert!(std::sync::Arc::ptr_eq(&described[0], &collector.config().descs.calls_total));
}
