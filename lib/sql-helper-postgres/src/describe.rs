//! Routine parameter discovery through `information_schema`.

use std::collections::HashMap;

use parking_lot::RwLock;
use sql_helper::{Direction, ParameterDescriptor, SqlHelperError, SqlType};
use sqlx::Row;
use tracing::trace;

use crate::bind::{RoutineKind, split_routine_name, sql_type_from_pg};

/// Name of the synthesized return-value slot.
pub const RETURN_VALUE_NAME: &str = "RETURN_VALUE";

const ROUTINE_SQL: &str = "\
SELECT r.specific_schema::text, r.specific_name::text, r.data_type::text, r.type_udt_name::text, \
r.routine_type::text \
FROM information_schema.routines r \
WHERE r.routine_schema::text = COALESCE($1, current_schema()::text) \
AND r.routine_name::text = $2";

const ROUTINE_TYPE_SQL: &str = "\
SELECT DISTINCT r.routine_type::text \
FROM information_schema.routines r \
WHERE r.routine_schema::text = COALESCE($1, current_schema()::text) \
AND r.routine_name::text = $2";

const PARAMETERS_SQL: &str = "\
SELECT p.parameter_name::text, p.parameter_mode::text, p.data_type::text, p.udt_name::text, \
p.character_maximum_length::int4 \
FROM information_schema.parameters p \
WHERE p.specific_schema::text = $1 AND p.specific_name::text = $2 \
ORDER BY p.ordinal_position";

/// A routine's parameters as reported by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRow {
    pub name: Option<String>,
    pub mode: Option<String>,
    pub data_type: String,
    pub udt_name: Option<String>,
    pub max_length: Option<i32>,
}

/// Describe a routine: its kind, and a return-value slot followed by its
/// parameters in declaration order.
pub async fn describe_routine(
    conn: &mut sqlx::PgConnection,
    procedure: &str,
) -> Result<(RoutineKind, Vec<ParameterDescriptor>), SqlHelperError> {
    let (schema, name) = split_routine_name(procedure)
        .map_err(|_| SqlHelperError::discovery(procedure, "invalid routine name"))?;

    let routines = sqlx::query(ROUTINE_SQL)
        .bind(schema)
        .bind(name)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SqlHelperError::discovery(procedure, e))?;

    let routine = match routines.as_slice() {
        [routine] => routine,
        [] => {
            return Err(SqlHelperError::discovery(
                procedure,
                "could not find stored procedure",
            ));
        }
        _ => {
            return Err(SqlHelperError::discovery(
                procedure,
                "routine is overloaded; call it as text with explicit parameters",
            ));
        }
    };

    let get = |idx: usize| -> Result<Option<String>, SqlHelperError> {
        routine
            .try_get(idx)
            .map_err(|e| SqlHelperError::discovery(procedure, e))
    };
    let specific_schema = get(0)?.unwrap_or_default();
    let specific_name = get(1)?.unwrap_or_default();
    let return_type = get(2)?;
    let return_udt = get(3)?;
    let kind = RoutineKind::from_routine_type(get(4)?.as_deref());

    let rows = sqlx::query(PARAMETERS_SQL)
        .bind(&specific_schema)
        .bind(&specific_name)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| SqlHelperError::discovery(procedure, e))?;

    let parameters = rows
        .iter()
        .map(|row| {
            Ok(ParameterRow {
                name: row.try_get(0)?,
                mode: row.try_get(1)?,
                data_type: row.try_get::<Option<String>, _>(2)?.unwrap_or_default(),
                udt_name: row.try_get(3)?,
                max_length: row.try_get(4)?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| SqlHelperError::discovery(procedure, e))?;

    let descriptors = descriptors(return_type.as_deref(), return_udt.as_deref(), &parameters);
    Ok((kind, descriptors))
}

/// Build descriptors from catalog rows, return-value slot first.
pub fn descriptors(
    return_type: Option<&str>,
    return_udt: Option<&str>,
    parameters: &[ParameterRow],
) -> Vec<ParameterDescriptor> {
    let return_type = match return_type {
        Some(data_type) => sql_type_from_pg(data_type, return_udt),
        None => SqlType::Other("void".to_string()),
    };

    let mut descriptors = Vec::with_capacity(parameters.len() + 1);
    descriptors.push(ParameterDescriptor::return_value(
        RETURN_VALUE_NAME,
        return_type,
    ));

    for (ordinal, row) in parameters.iter().enumerate() {
        let name = match row.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("${}", ordinal + 1),
        };
        let mut descriptor = ParameterDescriptor::new(
            name,
            sql_type_from_pg(&row.data_type, row.udt_name.as_deref()),
        )
        .with_direction(direction(row.mode.as_deref()));
        if let Some(size) = row.max_length.and_then(|n| u32::try_from(n).ok()) {
            descriptor = descriptor.with_size(size);
        }
        descriptors.push(descriptor);
    }

    descriptors
}

/// Kinds of the routines called through a backend, per data source.
///
/// Filled by discovery, and looked up in the catalog the first time a
/// routine is called with explicit parameters.
#[derive(Debug, Default)]
pub struct RoutineKinds {
    kinds: RwLock<HashMap<(String, String), RoutineKind>>,
}

impl RoutineKinds {
    pub fn get(&self, data_source: &str, routine: &str) -> Option<RoutineKind> {
        self.kinds
            .read()
            .get(&(data_source.to_string(), routine.to_string()))
            .copied()
    }

    pub fn record(&self, data_source: &str, routine: &str, kind: RoutineKind) {
        self.kinds
            .write()
            .insert((data_source.to_string(), routine.to_string()), kind);
    }

    /// The routine's kind, asking the catalog on a miss.
    ///
    /// A routine the catalog does not know resolves to a function and is not
    /// recorded, so the server reports the missing routine when it is called.
    pub async fn resolve(
        &self,
        conn: &mut sqlx::PgConnection,
        data_source: &str,
        routine: &str,
    ) -> Result<RoutineKind, SqlHelperError> {
        if let Some(kind) = self.get(data_source, routine) {
            return Ok(kind);
        }

        let (schema, name) = split_routine_name(routine)?;
        let types: Vec<Option<String>> = sqlx::query_scalar(ROUTINE_TYPE_SQL)
            .bind(schema)
            .bind(name)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| SqlHelperError::Execution(e.to_string()))?;

        let kind = match types.as_slice() {
            [] => return Ok(RoutineKind::Function),
            [routine_type] => RoutineKind::from_routine_type(routine_type.as_deref()),
            // A name shared by a function and a procedure resolves like the server
            // would for SELECT.
            _ => RoutineKind::Function,
        };
        trace!(routine, ?kind, "resolved routine kind");
        self.record(data_source, routine, kind);
        Ok(kind)
    }
}

fn direction(mode: Option<&str>) -> Direction {
    match mode {
        Some("OUT") => Direction::Output,
        Some("INOUT") => Direction::InputOutput,
        // IN, VARIADIC
        _ => Direction::Input,
    }
}
