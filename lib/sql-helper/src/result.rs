//! Materialized result shapes: rows, tables, data sets and XML documents.

use std::io::Cursor;
use std::sync::Arc;

use serde::Serialize;

use crate::Value;

/// Column metadata for a result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    /// Backend type name as reported by the driver.
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// One result row. Rows of the same result set share their column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn shared_columns(&self) -> Arc<[Column]> {
        Arc::clone(&self.columns)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Look up a value by column name. Names compare case-insensitively.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// The row as a JSON object keyed by column name, in column order.
    pub fn to_json(&self) -> serde_json::Value {
        let obj: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .zip(self.values.iter())
            .map(|(c, v)| (c.name.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(obj)
    }
}

impl Serialize for Row {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// A fully materialized result set. Safe to hold after the connection is gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataTable {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl DataTable {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from rows, taking the column list from the first row.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows
            .first()
            .map(|r| r.columns().to_vec())
            .unwrap_or_default();
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// First column of the first row, the same value a scalar execution returns.
    pub fn scalar(&self) -> Value {
        self.rows
            .first()
            .and_then(|r| r.get(0))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Values of one column across all rows.
    pub fn column_values(&self, index: usize) -> Vec<Value> {
        self.rows
            .iter()
            .map(|r| r.get(index).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.rows.iter().map(Row::to_json).collect())
    }
}

/// All result sets produced by one command, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataSet {
    pub tables: Vec<DataTable>,
}

impl DataSet {
    pub fn new(tables: Vec<DataTable>) -> Self {
        Self { tables }
    }

    /// The first result set, or an empty table when the command produced none.
    pub fn into_first_table(self) -> DataTable {
        self.tables.into_iter().next().unwrap_or_else(DataTable::empty)
    }

    pub fn table(&self, index: usize) -> Option<&DataTable> {
        self.tables.get(index)
    }
}

/// An XML document produced by a command, assembled from its row fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlDocument(String);

impl XmlDocument {
    /// Concatenate the first column of every row, in order.
    pub fn from_rows(rows: &[Row]) -> Self {
        let mut xml = String::new();
        for row in rows {
            if let Some(fragment) = row.get(0) {
                xml.push_str(&fragment.to_string());
            }
        }
        XmlDocument(xml)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// A `std::io::Read` over the document bytes.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.0.as_bytes())
    }
}

impl AsRef<str> for XmlDocument {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
