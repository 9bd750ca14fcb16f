//! SQL Helper - stored procedure parameter caching and command execution.
//!
//! This crate provides a database-agnostic execution helper for stored
//! procedures and raw SQL commands. Backends (see `sql-helper-postgres`)
//! implement the connection and discovery traits; the helper handles
//! parameter discovery, caching, binding and connection lifecycle.
//!
//! # Core Concepts
//!
//! - **Parameter discovery**: asking the database for a procedure's
//!   parameters at run time instead of hard-coding them.
//! - **Parameter cache**: discovered parameter templates, keyed by data
//!   source and procedure name, handed out as deep copies.
//! - **Binding**: where a command runs. A connection string (the helper owns
//!   the connection), a caller-owned connection, or a caller-owned
//!   transaction.
//! - **Result shape**: row count, scalar, data set, row cursor or XML.
//!
//! # Traits
//!
//! - [`Backend`]: Opens connections and transactions, describes procedures
//! - [`CommandExecutor`]: Runs prepared commands on a connection or transaction
//! - [`TransactionExecutor`]: Commits or rolls back a transaction
//!
//! # Usage
//!
//! ```text
//! let helper = SqlHelper::new(PgBackend::new()).with_default_data_source(url);
//!
//! // Parameters discovered on first use, then served from the cache
//! let affected = helper
//!     .procedure("publish_orders")
//!     .values([24])
//!     .non_query(Binding::Default)
//!     .await?;
//!
//! let count = helper
//!     .procedure("get_order_count")
//!     .scalar(Binding::DataSource(&url))
//!     .await?;
//! ```

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

mod cache;
mod command;
mod config;
mod cursor;
mod discovery;
mod error;
mod executor;
mod helper;
mod parameter;
mod result;
mod value;

pub use cache::ParameterCache;
pub use command::{CommandKind, PreparedCommand};
pub use config::{ConnectionConfig, DEFAULT_DATA_SOURCE_ENV};
pub use cursor::{ConnectionOwnership, RowCursor};
pub use discovery::discover_parameters;
pub use error::SqlHelperError;
pub use executor::{Backend, CommandExecutor, TransactionExecutor};
pub use helper::{Binding, Command, SqlHelper};
pub use parameter::{Direction, ParameterDescriptor, SqlType, assign_values};
pub use result::{Column, DataSet, DataTable, Row, XmlDocument};
pub use value::Value;
