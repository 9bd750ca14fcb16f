//! An in-memory backend that plays back scripted results and counts
//! connections, describe requests and executed commands.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use sql_helper::{
    Backend, Column, CommandExecutor, DataSet, DataTable, Direction, ParameterDescriptor,
    PreparedCommand, Row, SqlHelperError, SqlType, TransactionExecutor, Value,
};

pub const DATA_SOURCE: &str = "postgres://localhost/goro_check";
pub const OTHER_DATA_SOURCE: &str = "postgres://replica/goro_check";

/// What a command returns when it runs.
#[derive(Debug, Clone)]
pub enum Script {
    Rows(Vec<Column>, Vec<Vec<Value>>),
    Sets(Vec<DataTable>),
    Affected(u64),
    Fail(String),
}

#[derive(Default)]
pub struct State {
    procedures: Mutex<HashMap<String, Vec<ParameterDescriptor>>>,
    scripts: Mutex<HashMap<String, Script>>,
    unreachable: Mutex<HashSet<String>>,
    describe_delay: Mutex<Option<Duration>>,
    pub executed: Mutex<Vec<PreparedCommand>>,
    pub transaction_log: Mutex<Vec<&'static str>>,
    live: AtomicUsize,
    opened: AtomicUsize,
    describe_calls: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pub state: Arc<State>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure. The return-value slot is added in front.
    pub fn procedure(&self, name: &str, parameters: Vec<ParameterDescriptor>) -> &Self {
        let mut reported = vec![ParameterDescriptor::return_value(
            "@RETURN_VALUE",
            SqlType::Int,
        )];
        reported.extend(parameters);
        self.state
            .procedures
            .lock()
            .insert(name.to_string(), reported);
        self
    }

    pub fn script(&self, command_text: &str, script: Script) -> &Self {
        self.state
            .scripts
            .lock()
            .insert(command_text.to_string(), script);
        self
    }

    pub fn unreachable(&self, data_source: &str) -> &Self {
        self.state
            .unreachable
            .lock()
            .insert(data_source.to_string());
        self
    }

    pub fn slow_describe(&self, delay: Duration) -> &Self {
        *self.state.describe_delay.lock() = Some(delay);
        self
    }

    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn opened_connections(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.state.describe_calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<PreparedCommand> {
        self.state.executed.lock().clone()
    }

    /// Wait for background cursor workers to release their connections.
    pub async fn wait_until_idle(&self) -> bool {
        for _ in 0..100 {
            if self.live_connections() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub struct ScriptedConnection {
    data_source: String,
    state: Arc<State>,
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedConnection {
    fn record(&self, command: &PreparedCommand) -> Option<Script> {
        self.state.executed.lock().push(command.clone());
        self.state.scripts.lock().get(command.text()).cloned()
    }
}

fn rows_of(columns: Vec<Column>, values: Vec<Vec<Value>>) -> Vec<Row> {
    let columns: Arc<[Column]> = Arc::from(columns);
    values
        .into_iter()
        .map(|v| Row::new(Arc::clone(&columns), v))
        .collect()
}

#[async_trait]
impl CommandExecutor for ScriptedConnection {
    fn data_source(&self) -> &str {
        &self.data_source
    }

    async fn execute(&mut self, command: &PreparedCommand) -> Result<u64, SqlHelperError> {
        match self.record(command) {
            Some(Script::Affected(n)) => Ok(n),
            Some(Script::Rows(_, rows)) => Ok(rows.len() as u64),
            Some(Script::Sets(tables)) => Ok(tables.iter().map(|t| t.len() as u64).sum()),
            Some(Script::Fail(msg)) => Err(SqlHelperError::Execution(msg)),
            None => Ok(0),
        }
    }

    async fn fetch_data_set(
        &mut self,
        command: &PreparedCommand,
    ) -> Result<DataSet, SqlHelperError> {
        match self.record(command) {
            Some(Script::Rows(columns, rows)) => {
                let mut table = DataTable::from_rows(rows_of(columns.clone(), rows));
                table.columns = columns;
                Ok(DataSet::new(vec![table]))
            }
            Some(Script::Sets(tables)) => Ok(DataSet::new(tables)),
            Some(Script::Fail(msg)) => Err(SqlHelperError::Execution(msg)),
            Some(Script::Affected(_)) | None => Ok(DataSet::default()),
        }
    }

    fn fetch_rows<'c>(
        &'c mut self,
        command: PreparedCommand,
    ) -> BoxStream<'c, Result<Row, SqlHelperError>> {
        match self.record(&command) {
            Some(Script::Rows(columns, rows)) => {
                stream::iter(rows_of(columns, rows).into_iter().map(Ok)).boxed()
            }
            Some(Script::Sets(tables)) => stream::iter(
                tables
                    .into_iter()
                    .flat_map(|t| t.rows.into_iter())
                    .map(Ok)
                    .collect::<Vec<_>>(),
            )
            .boxed(),
            Some(Script::Fail(msg)) => {
                stream::iter(vec![Err(SqlHelperError::Execution(msg))]).boxed()
            }
            Some(Script::Affected(_)) | None => stream::empty().boxed(),
        }
    }
}

pub struct ScriptedTransaction {
    connection: ScriptedConnection,
}

#[async_trait]
impl CommandExecutor for ScriptedTransaction {
    fn data_source(&self) -> &str {
        self.connection.data_source()
    }

    async fn execute(&mut self, command: &PreparedCommand) -> Result<u64, SqlHelperError> {
        self.connection.execute(command).await
    }

    async fn fetch_data_set(
        &mut self,
        command: &PreparedCommand,
    ) -> Result<DataSet, SqlHelperError> {
        self.connection.fetch_data_set(command).await
    }

    fn fetch_rows<'c>(
        &'c mut self,
        command: PreparedCommand,
    ) -> BoxStream<'c, Result<Row, SqlHelperError>> {
        self.connection.fetch_rows(command)
    }
}

#[async_trait]
impl TransactionExecutor for ScriptedTransaction {
    async fn commit(self) -> Result<(), SqlHelperError> {
        self.connection.state.transaction_log.lock().push("commit");
        Ok(())
    }

    async fn rollback(self) -> Result<(), SqlHelperError> {
        self.connection.state.transaction_log.lock().push("rollback");
        Ok(())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    type Connection = ScriptedConnection;
    type Transaction = ScriptedTransaction;

    async fn open(&self, data_source: &str) -> Result<ScriptedConnection, SqlHelperError> {
        if self.state.unreachable.lock().contains(data_source) {
            return Err(SqlHelperError::Connection(format!(
                "could not connect to {}",
                data_source
            )));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            data_source: data_source.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self, connection: ScriptedConnection) -> Result<(), SqlHelperError> {
        drop(connection);
        Ok(())
    }

    async fn begin(&self, data_source: &str) -> Result<ScriptedTransaction, SqlHelperError> {
        let connection = self.open(data_source).await?;
        self.state.transaction_log.lock().push("begin");
        Ok(ScriptedTransaction { connection })
    }

    async fn derive_parameters(
        &self,
        _connection: &mut ScriptedConnection,
        procedure: &str,
    ) -> Result<Vec<ParameterDescriptor>, SqlHelperError> {
        self.state.describe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.describe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state
            .procedures
            .lock()
            .get(procedure)
            .cloned()
            .ok_or_else(|| {
                SqlHelperError::discovery(procedure, "could not find stored procedure")
            })
    }
}

pub fn int_param(name: &str) -> ParameterDescriptor {
    ParameterDescriptor::new(name, SqlType::Int)
}

pub fn in_out_param(name: &str, sql_type: SqlType) -> ParameterDescriptor {
    ParameterDescriptor::new(name, sql_type).with_direction(Direction::InputOutput)
}
