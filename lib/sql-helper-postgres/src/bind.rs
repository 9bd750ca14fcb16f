//! Statement rendering, value binding and row decoding for PostgreSQL.
//!
//! Stored procedure commands are rendered as a call with one placeholder per
//! argument, each cast to the parameter's type so routine resolution sees the
//! declared signature. Functions are called with `SELECT * FROM`, procedures
//! with `CALL`.

use std::sync::Arc;

use sql_helper::{
    Column, CommandKind, Direction, ParameterDescriptor, PreparedCommand, Row, SqlHelperError,
    SqlType, Value,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Column as _, Row as _, TypeInfo, ValueRef};

/// What a named routine is in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineKind {
    /// Called with `SELECT * FROM name(...)`.
    Function,
    /// Called with `CALL name(...)`; output arguments are passed as NULL.
    Procedure,
}

impl RoutineKind {
    /// Map `information_schema.routines.routine_type`.
    pub fn from_routine_type(routine_type: Option<&str>) -> Self {
        match routine_type {
            Some("PROCEDURE") => RoutineKind::Procedure,
            _ => RoutineKind::Function,
        }
    }
}

/// Render a prepared command to SQL and bind its values.
///
/// `routine` only matters for stored procedure commands.
pub fn build_statement(
    command: &PreparedCommand,
    routine: RoutineKind,
) -> Result<(String, PgArguments), SqlHelperError> {
    let mut args = PgArguments::default();

    match command.kind() {
        CommandKind::Text => {
            for parameter in command.input_parameters() {
                bind_parameter(&mut args, parameter)?;
            }
            Ok((command.text().to_string(), args))
        }
        CommandKind::StoredProcedure => {
            validate_routine_name(command.text())?;

            let passed: Vec<&ParameterDescriptor> = match routine {
                RoutineKind::Function => command.input_parameters().collect(),
                RoutineKind::Procedure => command
                    .parameters()
                    .iter()
                    .filter(|p| p.direction != Direction::ReturnValue)
                    .collect(),
            };
            let named = passed.iter().all(|p| parameter_name(&p.name).is_some());

            let mut arguments = Vec::with_capacity(passed.len());
            for parameter in passed {
                // Omitted arguments take the routine's declared default.
                if named && parameter.direction == Direction::Input && parameter.is_unassigned() {
                    continue;
                }
                bind_parameter(&mut args, parameter)?;
                let placeholder = format!(
                    "${}::{}",
                    arguments.len() + 1,
                    pg_type_name(&parameter.sql_type)?
                );
                let argument = match parameter_name(&parameter.name) {
                    Some(name) if named => format!("{} => {}", name, placeholder),
                    _ => placeholder,
                };
                arguments.push(argument);
            }

            let sql = match routine {
                RoutineKind::Function => {
                    format!("SELECT * FROM {}({})", command.text(), arguments.join(", "))
                }
                RoutineKind::Procedure => {
                    format!("CALL {}({})", command.text(), arguments.join(", "))
                }
            };
            Ok((sql, args))
        }
    }
}

/// Bind one parameter's value, or a NULL of the parameter's type.
fn bind_parameter(
    args: &mut PgArguments,
    parameter: &ParameterDescriptor,
) -> Result<(), SqlHelperError> {
    match &parameter.value {
        Some(value) if !value.is_null() => bind_value(args, value),
        _ => bind_null(args, &parameter.sql_type),
    }
}

/// Bind a Value to PgArguments.
pub fn bind_value(args: &mut PgArguments, value: &Value) -> Result<(), SqlHelperError> {
    match value {
        Value::Null => args.add(None::<String>),
        Value::Bool(b) => args.add(*b),
        Value::Int(n) => args.add(*n),
        Value::Float(n) => args.add(*n),
        // Cast to numeric by the placeholder
        Value::Decimal(s) | Value::String(s) => args.add(s.as_str()),
        Value::Bytes(bytes) => args.add(bytes.as_slice()),
        Value::Date(d) => args.add(*d),
        Value::Time(t) => args.add(*t),
        Value::Timestamp(ts) => args.add(*ts),
        Value::Datetime(dt) => args.add(*dt),
        Value::Uuid(u) => args.add(*u),
        Value::Json(v) => args.add(v.clone()),
    }
    .map_err(|e| SqlHelperError::Execution(e.to_string()))
}

/// Bind a NULL typed after the parameter so no inference is needed.
fn bind_null(args: &mut PgArguments, sql_type: &SqlType) -> Result<(), SqlHelperError> {
    match sql_type {
        SqlType::Bool => args.add(None::<bool>),
        SqlType::SmallInt => args.add(None::<i16>),
        SqlType::Int => args.add(None::<i32>),
        SqlType::BigInt => args.add(None::<i64>),
        SqlType::Real => args.add(None::<f32>),
        SqlType::Double => args.add(None::<f64>),
        SqlType::Binary => args.add(None::<Vec<u8>>),
        SqlType::Date => args.add(None::<chrono::NaiveDate>),
        SqlType::Time => args.add(None::<chrono::NaiveTime>),
        SqlType::Timestamp => args.add(None::<chrono::NaiveDateTime>),
        SqlType::TimestampTz => args.add(None::<chrono::DateTime<chrono::Utc>>),
        SqlType::Uuid => args.add(None::<uuid::Uuid>),
        SqlType::Json => args.add(None::<serde_json::Value>),
        _ => args.add(None::<String>), // text and anything cast from text
    }
    .map_err(|e| SqlHelperError::Execution(e.to_string()))
}

/// The PostgreSQL type name a placeholder is cast to.
pub fn pg_type_name(sql_type: &SqlType) -> Result<String, SqlHelperError> {
    let name = match sql_type {
        SqlType::Bool => "boolean",
        SqlType::SmallInt => "smallint",
        SqlType::Int => "integer",
        SqlType::BigInt => "bigint",
        SqlType::Real => "real",
        SqlType::Double => "double precision",
        SqlType::Decimal => "numeric",
        SqlType::String => "text",
        SqlType::Date => "date",
        SqlType::Time => "time",
        SqlType::Timestamp => "timestamp",
        SqlType::TimestampTz => "timestamptz",
        SqlType::Binary => "bytea",
        SqlType::Json => "json",
        SqlType::Xml => "xml",
        SqlType::Uuid => "uuid",
        SqlType::Other(name) => {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '.' | '[' | ']'));
            if !valid {
                return Err(SqlHelperError::Execution(format!(
                    "unsupported parameter type: {}",
                    name
                )));
            }
            name.as_str()
        }
    };
    Ok(name.to_string())
}

/// Map an `information_schema` type description to a semantic type.
///
/// `udt_name` names the concrete type for arrays and user-defined types.
pub fn sql_type_from_pg(data_type: &str, udt_name: Option<&str>) -> SqlType {
    match data_type {
        "boolean" => SqlType::Bool,
        "smallint" => SqlType::SmallInt,
        "integer" => SqlType::Int,
        "bigint" => SqlType::BigInt,
        "real" => SqlType::Real,
        "double precision" => SqlType::Double,
        "numeric" => SqlType::Decimal,
        "text" | "character varying" | "character" | "name" => SqlType::String,
        "date" => SqlType::Date,
        "time without time zone" => SqlType::Time,
        "timestamp without time zone" => SqlType::Timestamp,
        "timestamp with time zone" => SqlType::TimestampTz,
        "bytea" => SqlType::Binary,
        "json" => SqlType::Json,
        "xml" => SqlType::Xml,
        "uuid" => SqlType::Uuid,
        // ARRAY, USER-DEFINED and the rest are named by their udt
        other => SqlType::Other(udt_name.unwrap_or(other).to_string()),
    }
}

/// The name used for a parameter in a named-notation call.
///
/// SQL Server style names (`@ProdId`) are folded like unquoted identifiers.
/// Anonymous parameters (`$1`, empty) have no name.
fn parameter_name(name: &str) -> Option<String> {
    let (bare, folded) = match name.strip_prefix('@') {
        Some(bare) => (bare, bare.to_lowercase()),
        None => (name, name.to_string()),
    };
    if bare.is_empty() || bare.starts_with('$') {
        return None;
    }
    if is_plain_identifier(&folded) {
        Some(folded)
    } else {
        Some(quote_identifier(&folded))
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Split a routine name into schema and name, folded the way the server
/// folds identifiers: quoted parts verbatim, unquoted parts lower-cased.
pub fn split_routine_name(text: &str) -> Result<(Option<String>, String), SqlHelperError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut part_was_quoted = false;
    let mut chars = text.trim().chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => {
                quoted = !quoted;
                part_was_quoted = true;
            }
            '.' if !quoted => {
                parts.push(finish_part(&mut current, part_was_quoted, text)?);
                part_was_quoted = false;
            }
            c if quoted => current.push(c),
            c if c.is_ascii_alphanumeric() || c == '_' || c == '$' => current.push(c),
            _ => return Err(invalid_routine_name(text)),
        }
    }
    if quoted {
        return Err(invalid_routine_name(text));
    }
    parts.push(finish_part(&mut current, part_was_quoted, text)?);

    match parts.len() {
        1 => Ok((None, parts.remove(0))),
        2 => {
            let name = parts.remove(1);
            Ok((Some(parts.remove(0)), name))
        }
        _ => Err(invalid_routine_name(text)),
    }
}

fn finish_part(current: &mut String, quoted: bool, text: &str) -> Result<String, SqlHelperError> {
    let part = std::mem::take(current);
    if part.is_empty() {
        return Err(invalid_routine_name(text));
    }
    if !quoted && part.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid_routine_name(text));
    }
    Ok(if quoted { part } else { part.to_lowercase() })
}

fn validate_routine_name(text: &str) -> Result<(), SqlHelperError> {
    split_routine_name(text).map(|_| ())
}

fn invalid_routine_name(text: &str) -> SqlHelperError {
    SqlHelperError::Execution(format!("invalid routine name: {}", text))
}

/// Column metadata for a row, shared by every row of its result set.
pub fn row_columns(row: &PgRow) -> Arc<[Column]> {
    row.columns()
        .iter()
        .map(|c| Column::new(c.name(), c.type_info().name()))
        .collect::<Vec<_>>()
        .into()
}

/// Columns a statement would return, asked of the server without running it.
pub async fn statement_columns(
    conn: &mut sqlx::PgConnection,
    sql: &str,
) -> Result<Vec<Column>, SqlHelperError> {
    let described = sqlx::Executor::describe(conn, sql)
        .await
        .map_err(|e| SqlHelperError::Execution(e.to_string()))?;
    Ok(described
        .columns()
        .iter()
        .map(|c| Column::new(c.name(), c.type_info().name()))
        .collect())
}

/// Decode every column of a PostgreSQL row.
pub fn decode_row(row: &PgRow, columns: &Arc<[Column]>) -> Result<Row, SqlHelperError> {
    let values = (0..row.len())
        .map(|idx| extract_column_value(row, idx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

/// Extract a column value from a row by its PostgreSQL type.
fn extract_column_value(row: &PgRow, idx: usize) -> Result<Value, SqlHelperError> {
    fn get<'r, T>(row: &'r PgRow, idx: usize) -> Result<Option<T>, SqlHelperError>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get(idx)
            .map_err(|e| SqlHelperError::Execution(e.to_string()))
    }

    let raw = row
        .try_get_raw(idx)
        .map_err(|e| SqlHelperError::Execution(e.to_string()))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => get::<bool>(row, idx)?.map(Value::Bool),
        "INT2" => get::<i16>(row, idx)?.map(|n| Value::Int(i64::from(n))),
        "INT4" => get::<i32>(row, idx)?.map(|n| Value::Int(i64::from(n))),
        "INT8" => get::<i64>(row, idx)?.map(Value::Int),
        "FLOAT4" => get::<f32>(row, idx)?.map(|n| Value::Float(f64::from(n))),
        "FLOAT8" => get::<f64>(row, idx)?.map(Value::Float),
        "NUMERIC" => get::<sqlx::types::BigDecimal>(row, idx)?
            .map(|d| Value::Decimal(d.to_string())),
        "BYTEA" => get::<Vec<u8>>(row, idx)?.map(Value::Bytes),
        "DATE" => get::<chrono::NaiveDate>(row, idx)?.map(Value::Date),
        "TIME" => get::<chrono::NaiveTime>(row, idx)?.map(Value::Time),
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, idx)?.map(Value::Timestamp),
        "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(Value::Datetime),
        "UUID" => get::<uuid::Uuid>(row, idx)?.map(Value::Uuid),
        "JSON" | "JSONB" => get::<serde_json::Value>(row, idx)?.map(Value::Json),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => get::<String>(row, idx)?.map(Value::String),
        _ => {
            // Default: xml, enums and the like arrive as text
            let v: Option<String> = row
                .try_get_unchecked(idx)
                .map_err(|e| SqlHelperError::Execution(e.to_string()))?;
            v.map(Value::String)
        }
    };

    Ok(value.unwrap_or(Value::Null))
}
