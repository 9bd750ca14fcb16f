//! Traits a database backend implements to be driven by the helper.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{DataSet, ParameterDescriptor, PreparedCommand, Row, SqlHelperError};

/// Something a prepared command can run on: a live connection or a transaction.
///
/// Implementors never open or close anything themselves; lifecycle belongs to
/// whoever owns the executor.
#[async_trait]
pub trait CommandExecutor: Send {
    /// Identity of the data source this executor is bound to (its connection string).
    fn data_source(&self) -> &str;

    /// Run a command that returns no rows. Returns the number of rows affected.
    async fn execute(&mut self, command: &PreparedCommand) -> Result<u64, SqlHelperError>;

    /// Run a command and materialize every result set it produces.
    async fn fetch_data_set(&mut self, command: &PreparedCommand)
    -> Result<DataSet, SqlHelperError>;

    /// Run a command and stream its rows, forward-only.
    fn fetch_rows<'c>(
        &'c mut self,
        command: PreparedCommand,
    ) -> BoxStream<'c, Result<Row, SqlHelperError>>;
}

/// Executor for a transaction in progress.
#[async_trait]
pub trait TransactionExecutor: CommandExecutor {
    /// Commit the transaction.
    async fn commit(self) -> Result<(), SqlHelperError>;

    /// Rollback the transaction.
    async fn rollback(self) -> Result<(), SqlHelperError>;
}

/// A database backend: opens connections and transactions for a data source
/// and answers "describe parameters" requests.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Connection: CommandExecutor + 'static;
    type Transaction: TransactionExecutor;

    /// Open (or check out) a connection to the data source.
    async fn open(&self, data_source: &str) -> Result<Self::Connection, SqlHelperError>;

    /// Close (or return) a connection obtained from `open`.
    async fn close(&self, connection: Self::Connection) -> Result<(), SqlHelperError>;

    /// Begin a transaction on a fresh connection to the data source.
    async fn begin(&self, data_source: &str) -> Result<Self::Transaction, SqlHelperError>;

    /// Ask the database for a routine's parameters, in declaration order.
    ///
    /// The list starts with the return-value slot.
    async fn derive_parameters(
        &self,
        connection: &mut Self::Connection,
        procedure: &str,
    ) -> Result<Vec<ParameterDescriptor>, SqlHelperError>;
}
