//! Run-time discovery of stored procedure parameters.

use tracing::debug;

use crate::{Backend, Direction, ParameterDescriptor, SqlHelperError};

/// Ask the database for a procedure's parameters on a short-lived connection.
///
/// The connection is closed on every path. Without `include_return_value`
/// the leading return-value slot is removed; a leading descriptor that is not
/// a return value is left in place.
pub async fn discover_parameters<B: Backend + ?Sized>(
    backend: &B,
    data_source: &str,
    procedure: &str,
    include_return_value: bool,
) -> Result<Vec<ParameterDescriptor>, SqlHelperError> {
    debug!(procedure, include_return_value, "discovering parameters");

    let mut connection = backend
        .open(data_source)
        .await
        .map_err(|e| as_discovery_error(procedure, e))?;
    let derived = backend.derive_parameters(&mut connection, procedure).await;
    let closed = backend.close(connection).await;

    let mut parameters = derived.map_err(|e| as_discovery_error(procedure, e))?;
    closed.map_err(|e| as_discovery_error(procedure, e))?;

    let leading_return = parameters
        .first()
        .is_some_and(|p| p.direction == Direction::ReturnValue);
    if !include_return_value && leading_return {
        parameters.remove(0);
    }

    debug!(procedure, count = parameters.len(), "parameters discovered");
    Ok(parameters)
}

fn as_discovery_error(procedure: &str, error: SqlHelperError) -> SqlHelperError {
    match error {
        SqlHelperError::Discovery { .. } => error,
        SqlHelperError::Connection(reason) | SqlHelperError::Execution(reason) => {
            SqlHelperError::discovery(procedure, reason)
        }
        other => SqlHelperError::discovery(procedure, other),
    }
}
