//! Command preparation.

use crate::{Direction, ParameterDescriptor};

/// Whether the command text is raw SQL or the name of a stored procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Text,
    StoredProcedure,
}

/// A command ready to hand to an executor.
///
/// Preparation attaches the parameters and normalizes unassigned
/// input-output values to an explicit NULL. It never executes anything.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCommand {
    kind: CommandKind,
    text: String,
    parameters: Vec<ParameterDescriptor>,
}

impl PreparedCommand {
    pub fn prepare(
        kind: CommandKind,
        text: impl Into<String>,
        parameters: Vec<ParameterDescriptor>,
    ) -> Self {
        let mut parameters = parameters;
        for parameter in parameters.iter_mut() {
            parameter.normalize();
        }
        Self {
            kind,
            text: text.into(),
            parameters,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &[ParameterDescriptor] {
        &self.parameters
    }

    /// Parameters whose values are sent to the server.
    pub fn input_parameters(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.parameters
            .iter()
            .filter(|p| p.direction.accepts_input())
    }

    pub fn has_parameters(&self) -> bool {
        !self.parameters.is_empty()
    }

    pub fn return_parameter(&self) -> Option<&ParameterDescriptor> {
        self.parameters
            .iter()
            .find(|p| p.direction == Direction::ReturnValue)
    }
}
