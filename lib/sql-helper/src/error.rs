use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqlHelperError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Discovery error for {procedure}: {reason}")]
    Discovery { procedure: String, reason: String },

    #[error(
        "Parameter count does not match parameter value count: expected {expected}, supplied {supplied}"
    )]
    ParameterCountMismatch { expected: usize, supplied: usize },

    #[error("Execution error: {0}")]
    Execution(String),
}

impl SqlHelperError {
    pub fn discovery(procedure: impl Into<String>, reason: impl ToString) -> Self {
        SqlHelperError::Discovery {
            procedure: procedure.into(),
            reason: reason.to_string(),
        }
    }
}
