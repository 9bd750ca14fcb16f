//! The execution façade.
//!
//! One builder covers every combination of binding (connection string, live
//! connection, live transaction), parameter supply (none, explicit
//! descriptors, positional values) and result shape (row count, scalar,
//! data set, row cursor, XML).

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, trace};

use crate::{
    Backend, CommandExecutor, CommandKind, ConnectionConfig, DataSet, DataTable,
    ParameterCache, ParameterDescriptor, PreparedCommand, RowCursor, SqlHelperError, SqlType,
    Value, XmlDocument, assign_values,
};

/// Where a command runs.
pub enum Binding<'a, B: Backend> {
    /// The helper's default data source; the helper owns the connection.
    Default,
    /// A connection string; the helper opens and closes the connection.
    DataSource(&'a str),
    /// A connection the caller owns.
    Connection(&'a mut B::Connection),
    /// A transaction the caller owns.
    Transaction(&'a mut B::Transaction),
}

/// Entry point for running commands against a backend.
///
/// Holds the backend and a parameter cache. Clones share both.
pub struct SqlHelper<B: Backend> {
    backend: Arc<B>,
    cache: Arc<ParameterCache>,
    default_data_source: Option<ConnectionConfig>,
}

impl<B: Backend> Clone for SqlHelper<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            cache: Arc::clone(&self.cache),
            default_data_source: self.default_data_source.clone(),
        }
    }
}

impl<B: Backend> SqlHelper<B> {
    /// A helper with its own, empty parameter cache.
    pub fn new(backend: B) -> Self {
        Self::with_cache(backend, Arc::new(ParameterCache::new()))
    }

    /// A helper sharing an existing parameter cache.
    pub fn with_cache(backend: B, cache: Arc<ParameterCache>) -> Self {
        Self {
            backend: Arc::new(backend),
            cache,
            default_data_source: None,
        }
    }

    /// Set the data source used by [`Binding::Default`].
    pub fn with_default_data_source(mut self, config: impl Into<ConnectionConfig>) -> Self {
        self.default_data_source = Some(config.into());
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<ParameterCache> {
        &self.cache
    }

    pub fn default_data_source(&self) -> Result<&str, SqlHelperError> {
        self.default_data_source
            .as_ref()
            .map(ConnectionConfig::data_source)
            .ok_or_else(|| {
                SqlHelperError::Connection("no default data source configured".to_string())
            })
    }

    pub fn command(&self, kind: CommandKind, text: impl Into<String>) -> Command<'_, B> {
        Command {
            helper: self,
            kind,
            text: text.into(),
            supply: ParameterSupply::None,
            include_return_value: false,
        }
    }

    /// A stored procedure call.
    pub fn procedure(&self, name: impl Into<String>) -> Command<'_, B> {
        self.command(CommandKind::StoredProcedure, name)
    }

    /// A raw SQL command.
    pub fn text(&self, sql: impl Into<String>) -> Command<'_, B> {
        self.command(CommandKind::Text, sql)
    }

    /// The parameter template of a stored procedure, discovered on first use.
    pub async fn parameter_set(
        &self,
        data_source: &str,
        procedure: &str,
        include_return_value: bool,
    ) -> Result<Vec<ParameterDescriptor>, SqlHelperError> {
        self.cache
            .get_or_discover(self.backend.as_ref(), data_source, procedure, include_return_value)
            .await
    }

    /// Open a connection the caller owns.
    pub async fn open(&self, data_source: &str) -> Result<B::Connection, SqlHelperError> {
        self.backend.open(data_source).await
    }

    pub async fn close(&self, connection: B::Connection) -> Result<(), SqlHelperError> {
        self.backend.close(connection).await
    }

    /// Begin a transaction the caller owns.
    pub async fn begin(&self, data_source: &str) -> Result<B::Transaction, SqlHelperError> {
        self.backend.begin(data_source).await
    }
}

#[derive(Debug, Clone)]
enum ParameterSupply {
    None,
    Explicit(Vec<ParameterDescriptor>),
    Positional(Vec<Value>),
}

/// A command being configured. Finish it with one of the result-shape methods.
pub struct Command<'h, B: Backend> {
    helper: &'h SqlHelper<B>,
    kind: CommandKind,
    text: String,
    supply: ParameterSupply,
    include_return_value: bool,
}

impl<'h, B: Backend> Command<'h, B> {
    /// Bind fully formed parameter descriptors.
    pub fn parameters(mut self, parameters: Vec<ParameterDescriptor>) -> Self {
        self.supply = ParameterSupply::Explicit(parameters);
        self
    }

    /// Append one parameter descriptor.
    pub fn parameter(mut self, parameter: ParameterDescriptor) -> Self {
        match &mut self.supply {
            ParameterSupply::Explicit(parameters) => parameters.push(parameter),
            _ => self.supply = ParameterSupply::Explicit(vec![parameter]),
        }
        self
    }

    /// Bind positional values.
    ///
    /// For a stored procedure the values are assigned, in order, to the
    /// procedure's discovered parameters. For text they bind to `$1..$n`.
    pub fn values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.supply = ParameterSupply::Positional(values.into_iter().map(Into::into).collect());
        self
    }

    /// Whether positional values also fill the return-value slot.
    pub fn include_return_value(mut self, include: bool) -> Self {
        self.include_return_value = include;
        self
    }

    /// Resolve the parameters against a data source and prepare the command.
    pub async fn prepare(&self, data_source: &str) -> Result<PreparedCommand, SqlHelperError> {
        let parameters = match &self.supply {
            ParameterSupply::None => Vec::new(),
            ParameterSupply::Explicit(parameters) => parameters.clone(),
            ParameterSupply::Positional(values) => match self.kind {
                CommandKind::StoredProcedure => {
                    let mut template = self
                        .helper
                        .parameter_set(data_source, &self.text, self.include_return_value)
                        .await?;
                    assign_values(&mut template, values.clone())?;
                    template
                }
                CommandKind::Text => values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        ParameterDescriptor::input(format!("${}", i + 1), SqlType::of(v), v.clone())
                    })
                    .collect(),
            },
        };
        Ok(PreparedCommand::prepare(self.kind, self.text.clone(), parameters))
    }

    /// Run the command and return the number of rows affected.
    ///
    /// The count is whatever the backend reports for the statement it runs.
    /// Backends that call routines through a query report the rows that query
    /// returned, not the rows the routine wrote.
    pub async fn non_query(self, binding: Binding<'_, B>) -> Result<u64, SqlHelperError> {
        self.materialize::<NonQuery>(binding).await
    }

    /// Run the command and return the first column of the first row, or NULL.
    pub async fn scalar(self, binding: Binding<'_, B>) -> Result<Value, SqlHelperError> {
        self.materialize::<Scalar>(binding).await
    }

    /// Run the command and materialize every result set.
    pub async fn data_set(self, binding: Binding<'_, B>) -> Result<DataSet, SqlHelperError> {
        self.materialize::<Tabular>(binding).await
    }

    /// Run the command and materialize its first result set.
    pub async fn data_table(self, binding: Binding<'_, B>) -> Result<DataTable, SqlHelperError> {
        Ok(self.data_set(binding).await?.into_first_table())
    }

    /// Run the command and assemble the XML document its rows carry.
    pub async fn xml(self, binding: Binding<'_, B>) -> Result<XmlDocument, SqlHelperError> {
        self.materialize::<Xml>(binding).await
    }

    /// Run the command and return a lazy cursor over its rows.
    ///
    /// With a helper-owned binding the cursor owns the connection: drain or
    /// close it to release the connection.
    pub async fn reader<'a>(self, binding: Binding<'a, B>) -> Result<RowCursor<'a>, SqlHelperError> {
        match binding {
            Binding::Default => {
                let data_source = self.helper.default_data_source()?;
                self.owned_reader(data_source).await
            }
            Binding::DataSource(data_source) => self.owned_reader(data_source).await,
            Binding::Connection(connection) => {
                let command = self.prepare(connection.data_source()).await?;
                trace!(command = command.text(), "opening external cursor");
                Ok(RowCursor::external(connection.fetch_rows(command)))
            }
            Binding::Transaction(transaction) => {
                let command = self.prepare(transaction.data_source()).await?;
                trace!(command = command.text(), "opening external cursor");
                Ok(RowCursor::external(transaction.fetch_rows(command)))
            }
        }
    }

    async fn owned_reader(&self, data_source: &str) -> Result<RowCursor<'static>, SqlHelperError> {
        let command = self.prepare(data_source).await?;
        let connection = self.helper.backend.open(data_source).await?;
        debug!(command = command.text(), "opening owned cursor");
        RowCursor::internal(Arc::clone(&self.helper.backend), connection, command).await
    }

    async fn materialize<S: ResultShape>(
        self,
        binding: Binding<'_, B>,
    ) -> Result<S::Output, SqlHelperError> {
        match binding {
            Binding::Default => {
                let data_source = self.helper.default_data_source()?;
                self.run_owned::<S>(data_source).await
            }
            Binding::DataSource(data_source) => self.run_owned::<S>(data_source).await,
            Binding::Connection(connection) => {
                let command = self.prepare(connection.data_source()).await?;
                trace!(command = command.text(), "executing on caller connection");
                S::run(connection, &command).await
            }
            Binding::Transaction(transaction) => {
                let command = self.prepare(transaction.data_source()).await?;
                trace!(command = command.text(), "executing in caller transaction");
                S::run(transaction, &command).await
            }
        }
    }

    async fn run_owned<S: ResultShape>(&self, data_source: &str) -> Result<S::Output, SqlHelperError> {
        let command = self.prepare(data_source).await?;
        let backend = &self.helper.backend;

        let mut connection = backend.open(data_source).await?;
        debug!(
            command = command.text(),
            parameters = command.parameters().len(),
            "executing on owned connection"
        );
        let result = S::run(&mut connection, &command).await;
        let closed = backend.close(connection).await;

        let output = result?;
        closed?;
        Ok(output)
    }
}

/// How a command's results are collected.
#[async_trait]
trait ResultShape {
    type Output: Send;

    async fn run(
        executor: &mut dyn CommandExecutor,
        command: &PreparedCommand,
    ) -> Result<Self::Output, SqlHelperError>;
}

struct NonQuery;
struct Scalar;
struct Tabular;
struct Xml;

#[async_trait]
impl ResultShape for NonQuery {
    type Output = u64;

    async fn run(
        executor: &mut dyn CommandExecutor,
        command: &PreparedCommand,
    ) -> Result<u64, SqlHelperError> {
        executor.execute(command).await
    }
}

#[async_trait]
impl ResultShape for Scalar {
    type Output = Value;

    async fn run(
        executor: &mut dyn CommandExecutor,
        command: &PreparedCommand,
    ) -> Result<Value, SqlHelperError> {
        let mut rows = executor.fetch_rows(command.clone());
        match rows.next().await {
            Some(row) => Ok(row?.get(0).cloned().unwrap_or(Value::Null)),
            None => Ok(Value::Null),
        }
    }
}

#[async_trait]
impl ResultShape for Tabular {
    type Output = DataSet;

    async fn run(
        executor: &mut dyn CommandExecutor,
        command: &PreparedCommand,
    ) -> Result<DataSet, SqlHelperError> {
        executor.fetch_data_set(command).await
    }
}

#[async_trait]
impl ResultShape for Xml {
    type Output = XmlDocument;

    async fn run(
        executor: &mut dyn CommandExecutor,
        command: &PreparedCommand,
    ) -> Result<XmlDocument, SqlHelperError> {
        let mut rows = executor.fetch_rows(command.clone());
        let mut collected = Vec::new();
        while let Some(row) = rows.next().await {
            collected.push(row?);
        }
        Ok(XmlDocument::from_rows(&collected))
    }
}
