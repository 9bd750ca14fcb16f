//! PostgreSQL backend for sql-helper.
//!
//! Connections come from one sqlx pool per connection string. A stored
//! procedure command names a PostgreSQL function or procedure. Functions
//! render as `SELECT * FROM name(arg => $1::type, ...)` and procedures as
//! `CALL name(arg => $1::type, ...)`. Discovery reads the routine's signature
//! from `information_schema`, reporting a synthesized `RETURN_VALUE` slot
//! first.
//!
//! # Affected rows
//!
//! `non_query` reports what the server reports for the rendered statement.
//! A function call is a `SELECT`, so the count is the number of rows the
//! function returned, not the rows it wrote. A `CALL` reports 0. Text
//! commands report the rows their statement affected.
//!
//! # Result sets
//!
//! A text command without parameters runs over the simple protocol and may
//! hold several statements. `data_set` returns one table per statement, in
//! order, including statements that return no rows.
//!
//! # Usage
//!
//! ```text
//! use sql_helper_postgres::{Binding, PgBackend, SqlHelper};
//!
//! let helper = SqlHelper::new(PgBackend::new());
//! let url = std::env::var("DATABASE_URL")?;
//!
//! let count = helper
//!     .procedure("get_order_count")
//!     .values([24])
//!     .scalar(Binding::DataSource(&url))
//!     .await?;
//! ```

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

mod bind;
mod describe;
mod executor;

pub use bind::{RoutineKind, build_statement, pg_type_name, sql_type_from_pg};
pub use describe::{RETURN_VALUE_NAME, RoutineKinds, describe_routine};
pub use executor::{PgBackend, PgBackendOptions, PgConnection, PgTransaction, PoolStatus};

// Re-export core types for convenience
pub use sql_helper::{
    Backend, Binding, Column, Command, CommandExecutor, CommandKind, ConnectionConfig,
    ConnectionOwnership, DataSet, DataTable, Direction, ParameterCache, ParameterDescriptor,
    PreparedCommand, Row, RowCursor, SqlHelper, SqlHelperError, SqlType, TransactionExecutor,
    Value, XmlDocument,
};
