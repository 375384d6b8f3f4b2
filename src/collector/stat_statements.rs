//! Per-statement execution counters from the `pg_stat_statements` extension.
//!
//! Each scrape reads the whole aggregate relation and turns every row into six counters labeled by
//! role, database and statement. With `reset_after_read` the collector buffers the snapshot, releases
//! the cursor, clears the server-side aggregates and only then emits, so every scrape reports what
//! accrued since the previous one.
//!
//! Disabled by default: every distinct statement becomes its own set of time series.

use futures::StreamExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Collector, CollectorConfig, Registration};
use crate::context::QueryContext;
use crate::db::{Database, Instance, RowStream, SqlRow};
use crate::error::CollectError;
use crate::metric::{ConstMetric, Desc, MetricError, MetricSender, ValueType, new_desc};

pub const SUBSYSTEM: &str = "stat_statements";

/// Label used for any column that came back NULL.
pub const UNKNOWN_LABEL: &str = "unknown";

const RESET_SQL: &str = "SELECT pg_stat_statements_reset()";

pub fn registration<D: Database + 'static>() -> Registration<D> {
    Registration { name: SUBSYSTEM, default_enabled: false, factory: new_collector::<D> }
}

fn new_collector<D: Database + 'static>(config: &CollectorConfig) -> anyhow::Result<Box<dyn Collector<D>>> {
    Ok(Box::new(StatStatementsCollector::new(config.stat_statements.clone())))
}

/// Which column identifies a statement in the `query` label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatementLabel {
    /// Normalized statement text.
    #[default]
    Text,
    /// The stable `queryid` hash, rendered as text.
    QueryId,
}

impl StatementLabel {
    pub fn label_name(self) -> &'static str {
        match self {
            Self::Text => "query",
            Self::QueryId => "queryid",
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::Text => "pg_stat_statements.query",
            Self::QueryId => "pg_stat_statements.queryid::text",
        }
    }
}

impl std::str::FromStr for StatementLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "query" | "text" => Ok(Self::Text),
            "queryid" => Ok(Self::QueryId),
            _ => anyhow::bail!("unknown statement label {s:?}, expected \"query\" or \"queryid\""),
        }
    }
}

/// The six counter descriptors, built once at startup and shared by every collector instance.
#[derive(Debug, Clone)]
pub struct StatStatementsDescs {
    pub calls_total: Arc<Desc>,
    pub mean_seconds_total: Arc<Desc>,
    pub max_seconds_total: Arc<Desc>,
    pub rows_total: Arc<Desc>,
    pub block_read_seconds_total: Arc<Desc>,
    pub block_write_seconds_total: Arc<Desc>,
}

impl StatStatementsDescs {
    pub fn new(label: StatementLabel) -> Result<Self, MetricError> {
        let labels = ["user", "datname", label.label_name()];
        let desc = |name: &str, help: &str| new_desc(SUBSYSTEM, name, help, &labels);
        Ok(Self {
            calls_total: desc("calls_total", "Number of times executed")?,
            mean_seconds_total: desc("mean_seconds_total", "Mean total time spent in the statement, in seconds")?,
            max_seconds_total: desc("max_seconds_total", "Max total time spent in the statement, in seconds")?,
            rows_total: desc("rows_total", "Total number of rows retrieved or affected by the statement")?,
            block_read_seconds_total: desc("block_read_seconds_total", "Total time the statement spent reading blocks, in seconds")?,
            block_write_seconds_total: desc("block_write_seconds_total", "Total time the statement spent writing blocks, in seconds")?,
        })
    }

    /// In emission order, matching [`StatementStatRow::values`].
    pub fn all(&self) -> [&Arc<Desc>; 6] {
        [
            &self.calls_total,
            &self.mean_seconds_total,
            &self.max_seconds_total,
            &self.rows_total,
            &self.block_read_seconds_total,
            &self.block_write_seconds_total,
        ]
    }
}

#[derive(Debug, Clone)]
pub struct StatStatementsConfig {
    pub reset_after_read: bool,
    pub statement_label: StatementLabel,
    pub descs: Arc<StatStatementsDescs>,
}

impl StatStatementsConfig {
    pub fn new(reset_after_read: bool, statement_label: StatementLabel) -> Result<Self, MetricError> {
        Ok(Self { reset_after_read, statement_label, descs: Arc::new(StatStatementsDescs::new(statement_label)?) })
    }
}

/// Builds the snapshot query for a server version.
///
/// Timing columns were renamed in 13 (plan/exec split) and again in 17 (`shared_blk_*`).
/// All durations are milliseconds on the server and are converted to seconds here.
pub fn statements_query(version: u32, label: StatementLabel) -> String {
    let (mean, max) = if version >= 130000 {
        (
            "(pg_stat_statements.mean_plan_time + pg_stat_statements.mean_exec_time)",
            "(pg_stat_statements.max_plan_time + pg_stat_statements.max_exec_time)",
        )
    } else {
        ("pg_stat_statements.mean_time", "pg_stat_statements.max_time")
    };
    let (blk_read, blk_write) = if version >= 170000 {
        ("pg_stat_statements.shared_blk_read_time", "pg_stat_statements.shared_blk_write_time")
    } else {
        ("pg_stat_statements.blk_read_time", "pg_stat_statements.blk_write_time")
    };
    format!(
        "SELECT
            pg_get_userbyid(userid) AS user,
            pg_database.datname,
            {statement},
            pg_stat_statements.calls AS calls_total,
            {mean} / 1000.0 AS mean_seconds_total,
            {max} / 1000.0 AS max_seconds_total,
            pg_stat_statements.rows AS rows_total,
            {blk_read} / 1000.0 AS block_read_seconds_total,
            {blk_write} / 1000.0 AS block_write_seconds_total
        FROM pg_stat_statements
        JOIN pg_database ON pg_database.oid = pg_stat_statements.dbid
        WHERE pg_stat_statements.query NOT LIKE '%pg_setting%'",
        statement = label.column(),
    )
}

/// One aggregate row as read. Every column is independently nullable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementStatRow {
    pub user: Option<String>,
    pub database: Option<String>,
    pub statement: Option<String>,
    pub calls_total: Option<i64>,
    pub mean_seconds_total: Option<f64>,
    pub max_seconds_total: Option<f64>,
    pub rows_total: Option<i64>,
    pub block_read_seconds_total: Option<f64>,
    pub block_write_seconds_total: Option<f64>,
}

impl StatementStatRow {
    /// Column names in scan order. The statement column is named after the configured [`StatementLabel`].
    pub const COLUMNS: [&'static str; 9] = [
        "user",
        "datname",
        "query",
        "calls_total",
        "mean_seconds_total",
        "max_seconds_total",
        "rows_total",
        "block_read_seconds_total",
        "block_write_seconds_total",
    ];

    /// Decodes a row in [`COLUMNS`][Self::COLUMNS] order, with the statement column read as `label`.
    pub fn scan(row: &impl SqlRow, label: StatementLabel) -> Result<Self, CollectError> {
        let scan_err = |index: usize| {
            let column = if index == 2 { label.label_name() } else { Self::COLUMNS[index] };
            move |source| CollectError::Scan { column, source }
        };
        Ok(Self {
            user: row.get_string(0).map_err(scan_err(0))?,
            database: row.get_string(1).map_err(scan_err(1))?,
            statement: row.get_string(2).map_err(scan_err(2))?,
            calls_total: row.get_i64(3).map_err(scan_err(3))?,
            mean_seconds_total: row.get_f64(4).map_err(scan_err(4))?,
            max_seconds_total: row.get_f64(5).map_err(scan_err(5))?,
            rows_total: row.get_i64(6).map_err(scan_err(6))?,
            block_read_seconds_total: row.get_f64(7).map_err(scan_err(7))?,
            block_write_seconds_total: row.get_f64(8).map_err(scan_err(8))?,
        })
    }

    /// `(user, datname, statement)`, with NULLs replaced by [`UNKNOWN_LABEL`].
    pub fn labels(&self) -> [String; 3] {
        let label = |value: &Option<String>| value.clone().unwrap_or_else(|| UNKNOWN_LABEL.to_string());
        [label(&self.user), label(&self.database), label(&self.statement)]
    }

    /// Counter values in emission order, with NULLs replaced by zero.
    pub fn values(&self) -> [f64; 6] {
        let int = |value: Option<i64>| value.map_or(0.0, |v| v as f64);
        let float = |value: Option<f64>| value.unwrap_or(0.0);
        [
            int(self.calls_total),
            float(self.mean_seconds_total),
            float(self.max_seconds_total),
            int(self.rows_total),
            float(self.block_read_seconds_total),
            float(self.block_write_seconds_total),
        ]
    }
}

/// An open snapshot cursor. Dropping it closes the cursor.
pub struct StatementRows<'a, R> {
    rows: RowStream<'a, R>,
    label: StatementLabel,
    read: usize,
}

impl<'a, R: SqlRow> StatementRows<'a, R> {
    /// Executes `sql`; fails with [`CollectError::Query`] if the server rejects it or `ctx` is done.
    pub async fn open<D: Database<Row = R>>(ctx: &QueryContext, db: &'a D, sql: &'a str, label: StatementLabel) -> Result<Self, CollectError> {
        let rows = ctx.run(db.query_rows(sql)).await?.map_err(CollectError::Query)?;
        Ok(Self { rows, label, read: 0 })
    }

    pub async fn next(&mut self, ctx: &QueryContext) -> Result<Option<StatementStatRow>, CollectError> {
        match ctx.run(self.rows.next()).await? {
            None => Ok(None),
            Some(Err(err)) => Err(CollectError::Query(err)),
            Some(Ok(row)) => {
                self.read += 1;
                StatementStatRow::scan(&row, self.label).map(Some)
            }
        }
    }

    pub fn rows_read(&self) -> usize {
        self.read
    }
}

pub struct StatStatementsCollector {
    config: StatStatementsConfig,
}

impl StatStatementsCollector {
    pub fn new(config: StatStatementsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StatStatementsConfig {
        &self.config
    }

    async fn emit(&self, row: &StatementStatRow, ch: &MetricSender) -> Result<(), CollectError> {
        let labels = row.labels();
        for (desc, value) in self.config.descs.all().into_iter().zip(row.values()) {
            let metric = ConstMetric::new(desc, ValueType::Counter, value, labels.to_vec())?;
            ch.send(metric).await.map_err(|_| CollectError::SinkClosed)?;
        }
        Ok(())
    }

    #[tracing::instrument(name = "stat_statements.update", skip_all, fields(reset_after_read = self.config.reset_after_read))]
    async fn collect<D: Database>(&self, ctx: &QueryContext, instance: &Instance<D>, ch: &MetricSender) -> Result<(), CollectError> {
        let sql = statements_query(instance.version(), self.config.statement_label);
        let db = instance.db();
        let mut rows = StatementRows::open(ctx, db, &sql, self.config.statement_label).await?;

        if !self.config.reset_after_read {
            while let Some(row) = rows.next(ctx).await? {
                self.emit(&row, ch).await?;
            }
            debug!(rows = rows.rows_read(), "emitted statement stats");
            return Ok(());
        }

        let mut batch = Vec::new();
        while let Some(row) = rows.next(ctx).await? {
            batch.push(row);
        }
        // The cursor has to be gone before the reset runs on the same connection.
        drop(rows);

        match ctx.run(db.execute_statement(RESET_SQL)).await {
            Ok(Ok(_)) => debug!(rows = batch.len(), "reset statement stats"),
            Ok(Err(err)) => warn!(error = %CollectError::Reset(err), "statement stats were not reset"),
            Err(err) => warn!(error = %CollectError::Reset(Box::new(err)), "statement stats were not reset"),
        }

        for row in &batch {
            self.emit(row, ch).await?;
        }
        debug!(rows = batch.len(), "emitted statement stats");
        Ok(())
    }
}

impl<D: Database> Collector<D> for StatStatementsCollector {
    fn name(&self) -> &'static str {
        SUBSYSTEM
    }

    fn describe(&self) -> Vec<Arc<Desc>> {
        self.config.descs.all().into_iter().cloned().collect()
    }

    fn update<'a>(&'a self, ctx: &'a QueryContext, instance: &'a Instance<D>, ch: &'a MetricSender) -> BoxFuture<'a, Result<(), CollectError>> {
        Box::pin(self.collect(ctx, instance, ch))
    }
}
