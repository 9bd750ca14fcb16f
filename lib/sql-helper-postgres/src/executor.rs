//! PostgreSQL implementation of Backend.

const DEFAULT_MAX_CONNECTIONS: u32 = 16;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const ROW_BUFFER: usize = 64;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt, TryStreamExt, future};
use parking_lot::RwLock;
use sql_helper::{
    Backend, Column, CommandExecutor, CommandKind, DataSet, DataTable, ParameterDescriptor,
    PreparedCommand, Row, SqlHelperError, TransactionExecutor,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::{Either, Postgres, Transaction};
use tracing::debug;

use crate::bind::{RoutineKind, build_statement, decode_row, row_columns, statement_columns};
use crate::describe::{RoutineKinds, describe_routine};

/// Pool settings applied to every data source the backend connects to.
#[derive(Debug, Clone)]
pub struct PgBackendOptions {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgBackendOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// Size and idle count of a data source's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
}

/// PostgreSQL backend holding one sqlx pool per connection string.
///
/// "Opening" a connection checks one out of the pool and "closing" returns it.
#[derive(Debug, Default)]
pub struct PgBackend {
    pools: RwLock<HashMap<String, sqlx::PgPool>>,
    routines: Arc<RoutineKinds>,
    options: PgBackendOptions,
}

impl PgBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: PgBackendOptions) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            routines: Arc::default(),
            options,
        }
    }

    /// Use an existing pool for a data source.
    pub fn register_pool(&self, data_source: impl Into<String>, pool: sqlx::PgPool) {
        self.pools.write().insert(data_source.into(), pool);
    }

    /// The pool for a data source, created lazily on first use.
    pub fn pool(&self, data_source: &str) -> Result<sqlx::PgPool, SqlHelperError> {
        if let Some(pool) = self.pools.read().get(data_source) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.options.max_connections)
            .acquire_timeout(self.options.acquire_timeout)
            .connect_lazy(data_source)
            .map_err(|e| SqlHelperError::Connection(e.to_string()))?;

        debug!(
            max_connections = self.options.max_connections,
            "created connection pool"
        );
        Ok(self
            .pools
            .write()
            .entry(data_source.to_string())
            .or_insert(pool)
            .clone())
    }

    pub fn pool_status(&self, data_source: &str) -> Option<PoolStatus> {
        self.pools.read().get(data_source).map(|pool| PoolStatus {
            size: pool.size(),
            idle: pool.num_idle(),
        })
    }

    /// Close every pool, waiting for checked-out connections to come back.
    pub async fn close_all(&self) {
        let pools: Vec<sqlx::PgPool> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

/// A pooled connection checked out by [`PgBackend`].
pub struct PgConnection {
    conn: PoolConnection<Postgres>,
    data_source: String,
    routines: Arc<RoutineKinds>,
}

impl PgConnection {
    /// Get the inner sqlx connection.
    pub fn inner(&mut self) -> &mut sqlx::PgConnection {
        &mut self.conn
    }
}

impl Deref for PgConnection {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PgConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// PostgreSQL transaction wrapper.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    data_source: String,
    routines: Arc<RoutineKinds>,
}

fn execution_error(e: sqlx::Error) -> SqlHelperError {
    SqlHelperError::Execution(e.to_string())
}

/// Render a command, resolving whether a stored procedure is a function or
/// a procedure first.
async fn statement_on(
    conn: &mut sqlx::PgConnection,
    routines: &RoutineKinds,
    data_source: &str,
    command: &PreparedCommand,
) -> Result<(String, PgArguments), SqlHelperError> {
    let routine = match command.kind() {
        CommandKind::StoredProcedure => routines.resolve(conn, data_source, command.text()).await?,
        CommandKind::Text => RoutineKind::Function,
    };
    build_statement(command, routine)
}

async fn execute_on(
    conn: &mut sqlx::PgConnection,
    routines: &RoutineKinds,
    data_source: &str,
    command: &PreparedCommand,
) -> Result<u64, SqlHelperError> {
    let (sql, args) = statement_on(&mut *conn, routines, data_source, command).await?;
    let result = sqlx::query_with(&sql, args)
        .execute(conn)
        .await
        .map_err(execution_error)?;
    Ok(result.rows_affected())
}

/// Rows of a batch split into one table per statement.
#[derive(Debug, Default)]
struct ResultSets {
    tables: Vec<DataTable>,
    rows: Vec<Row>,
}

impl ResultSets {
    fn push_row(&mut self, row: Row) {
        self.rows.push(row);
    }

    fn finish_statement(&mut self) {
        self.tables.push(DataTable::from_rows(std::mem::take(&mut self.rows)));
    }

    fn into_data_set(mut self) -> DataSet {
        if !self.rows.is_empty() {
            self.finish_statement();
        }
        DataSet::new(self.tables)
    }
}

async fn data_set_on(
    conn: &mut sqlx::PgConnection,
    routines: &RoutineKinds,
    data_source: &str,
    command: &PreparedCommand,
) -> Result<DataSet, SqlHelperError> {
    // Only the simple protocol returns more than one result set. The server
    // does not say which statements return rows, so every statement gets a
    // table and positions follow the batch.
    if command.kind() == CommandKind::Text && !command.has_parameters() {
        let mut results = sqlx::raw_sql(command.text()).fetch_many(conn);
        let mut sets = ResultSets::default();
        let mut columns: Option<Arc<[Column]>> = None;

        while let Some(item) = results.try_next().await.map_err(execution_error)? {
            match item {
                Either::Left(_) => {
                    sets.finish_statement();
                    columns = None;
                }
                Either::Right(row) => {
                    let shared = columns.get_or_insert_with(|| row_columns(&row));
                    sets.push_row(decode_row(&row, shared)?);
                }
            }
        }
        return Ok(sets.into_data_set());
    }

    let (sql, args) = statement_on(&mut *conn, routines, data_source, command).await?;
    let rows = sqlx::query_with(&sql, args)
        .fetch_all(&mut *conn)
        .await
        .map_err(execution_error)?;

    let table = match rows.first() {
        Some(first) => {
            let columns = row_columns(first);
            let decoded = rows
                .iter()
                .map(|row| decode_row(row, &columns))
                .collect::<Result<Vec<_>, _>>()?;
            DataTable::from_rows(decoded)
        }
        None => DataTable::new(statement_columns(conn, &sql).await?),
    };
    Ok(DataSet::new(vec![table]))
}

/// Stream rows of a command.
///
/// The rendered SQL must outlive the sqlx stream, so a driver future owns
/// both and forwards rows through a channel polled alongside it.
fn rows_on<'c>(
    conn: &'c mut sqlx::PgConnection,
    routines: &'c RoutineKinds,
    data_source: &'c str,
    command: PreparedCommand,
) -> BoxStream<'c, Result<Row, SqlHelperError>> {
    let (mut sender, receiver) = futures::channel::mpsc::channel(ROW_BUFFER);
    let driver = async move {
        let (sql, args) = match statement_on(&mut *conn, routines, data_source, &command).await {
            Ok(statement) => statement,
            Err(e) => {
                // Nobody is listening if the send fails.
                let _ = sender.send(Err(e)).await;
                return;
            }
        };

        let mut rows = sqlx::query_with(&sql, args).fetch(conn);
        let mut columns: Option<Arc<[Column]>> = None;

        while let Some(row) = rows.next().await {
            let item = row.map_err(execution_error).and_then(|row| {
                let shared = columns.get_or_insert_with(|| row_columns(&row));
                decode_row(&row, shared)
            });
            let failed = item.is_err();
            if sender.send(item).await.is_err() || failed {
                break;
            }
        }
    };

    let driver = stream::once(driver).filter_map(|()| future::ready(None));
    stream::select(receiver, driver).boxed()
}

#[async_trait]
impl CommandExecutor for PgConnection {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    async fn execute(&mut self, command: &PreparedCommand) -> Result<u64, SqlHelperError> {
        execute_on(&mut self.conn, &self.routines, &self.data_source, command).await
    }

    async fn fetch_data_set(
        &mut self,
        command: &PreparedCommand,
    ) -> Result<DataSet, SqlHelperError> {
        data_set_on(&mut self.conn, &self.routines, &self.data_source, command).await
    }

    fn fetch_rows<'c>(
        &'c mut self,
        command: PreparedCommand,
    ) -> BoxStream<'c, Result<Row, SqlHelperError>> {
        rows_on(&mut self.conn, &self.routines, &self.data_source, command)
    }
}

#[async_trait]
impl CommandExecutor for PgTransaction {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    async fn execute(&mut self, command: &PreparedCommand) -> Result<u64, SqlHelperError> {
        execute_on(&mut self.tx, &self.routines, &self.data_source, command).await
    }

    async fn fetch_data_set(
        &mut self,
        command: &PreparedCommand,
    ) -> Result<DataSet, SqlHelperError> {
        data_set_on(&mut self.tx, &self.routines, &self.data_source, command).await
    }

    fn fetch_rows<'c>(
        &'c mut self,
        command: PreparedCommand,
    ) -> BoxStream<'c, Result<Row, SqlHelperError>> {
        rows_on(&mut self.tx, &self.routines, &self.data_source, command)
    }
}

#[async_trait]
impl TransactionExecutor for PgTransaction {
    async fn commit(self) -> Result<(), SqlHelperError> {
        self.tx.commit().await.map_err(execution_error)
    }

    async fn rollback(self) -> Result<(), SqlHelperError> {
        self.tx.rollback().await.map_err(execution_error)
    }
}

#[async_trait]
impl Backend for PgBackend {
    type Connection = PgConnection;
    type Transaction = PgTransaction;

    async fn open(&self, data_source: &str) -> Result<PgConnection, SqlHelperError> {
        let conn = self
            .pool(data_source)?
            .acquire()
            .await
            .map_err(|e| SqlHelperError::Connection(e.to_string()))?;
        Ok(PgConnection {
            conn,
            data_source: data_source.to_string(),
            routines: Arc::clone(&self.routines),
        })
    }

    async fn close(&self, connection: PgConnection) -> Result<(), SqlHelperError> {
        // Dropping a pooled connection hands it back to its pool.
        drop(connection);
        Ok(())
    }

    async fn begin(&self, data_source: &str) -> Result<PgTransaction, SqlHelperError> {
        let tx = self
            .pool(data_source)?
            .begin()
            .await
            .map_err(|e| SqlHelperError::Connection(e.to_string()))?;
        Ok(PgTransaction {
            tx,
            data_source: data_source.to_string(),
            routines: Arc::clone(&self.routines),
        })
    }

    async fn derive_parameters(
        &self,
        connection: &mut PgConnection,
        procedure: &str,
    ) -> Result<Vec<ParameterDescriptor>, SqlHelperError> {
        debug!(procedure, "describing routine");
        let (kind, parameters) = describe_routine(&mut connection.conn, procedure).await?;
        self.routines.record(&connection.data_source, procedure, kind);
        Ok(parameters)
    }
}
