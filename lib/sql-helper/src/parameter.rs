//! Parameter descriptors for stored procedures and parameterised commands.

use crate::{SqlHelperError, Value};

/// Semantic type of a parameter, independent of the backend's type names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Real,
    Double,
    Decimal,
    String,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Binary,
    Json,
    Xml,
    Uuid,
    /// A backend type with no semantic counterpart, kept by name.
    Other(String),
}

impl SqlType {
    /// The type a bare value binds as when no template describes it.
    pub fn of(value: &Value) -> SqlType {
        match value {
            Value::Null | Value::String(_) => SqlType::String,
            Value::Bool(_) => SqlType::Bool,
            Value::Int(_) => SqlType::BigInt,
            Value::Float(_) => SqlType::Double,
            Value::Decimal(_) => SqlType::Decimal,
            Value::Bytes(_) => SqlType::Binary,
            Value::Date(_) => SqlType::Date,
            Value::Time(_) => SqlType::Time,
            Value::Timestamp(_) => SqlType::Timestamp,
            Value::Datetime(_) => SqlType::TimestampTz,
            Value::Uuid(_) => SqlType::Uuid,
            Value::Json(_) => SqlType::Json,
        }
    }
}

/// Direction of a parameter relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl Direction {
    /// Whether a caller-supplied value is sent for this parameter.
    pub fn accepts_input(self) -> bool {
        matches!(self, Direction::Input | Direction::InputOutput)
    }
}

/// Describes one parameter: its name, type, direction, size and current value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub sql_type: SqlType,
    pub direction: Direction,
    pub size: Option<u32>,
    /// `None` until assigned. `Some(Value::Null)` is an explicit NULL.
    pub value: Option<Value>,
}

impl ParameterDescriptor {
    /// An unassigned input parameter.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            direction: Direction::Input,
            size: None,
            value: None,
        }
    }

    /// An input parameter carrying a value.
    pub fn input(name: impl Into<String>, sql_type: SqlType, value: impl Into<Value>) -> Self {
        Self::new(name, sql_type).with_value(value)
    }

    pub fn output(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::new(name, sql_type).with_direction(Direction::Output)
    }

    pub fn return_value(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::new(name, sql_type).with_direction(Direction::ReturnValue)
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn is_unassigned(&self) -> bool {
        self.value.is_none()
    }

    /// Replace an unassigned input-output value with an explicit NULL.
    ///
    /// A derived output parameter comes back as input-output; leaving it
    /// unassigned would let the driver substitute the routine's default.
    pub(crate) fn normalize(&mut self) {
        if self.direction == Direction::InputOutput && self.value.is_none() {
            self.value = Some(Value::Null);
        }
    }
}

/// Assign positional values to a parameter template, in order.
///
/// Every slot except pure `Output` parameters takes one value. The number of
/// values must match the number of slots exactly.
pub fn assign_values(
    parameters: &mut [ParameterDescriptor],
    values: Vec<Value>,
) -> Result<(), SqlHelperError> {
    let expected = parameters
        .iter()
        .filter(|p| p.direction != Direction::Output)
        .count();
    if expected != values.len() {
        return Err(SqlHelperError::ParameterCountMismatch {
            expected,
            supplied: values.len(),
        });
    }

    let slots = parameters
        .iter_mut()
        .filter(|p| p.direction != Direction::Output);
    for (parameter, value) in slots.zip(values) {
        parameter.value = Some(value);
    }
    Ok(())
}
