//! Table store interface and the in-memory implementation.
//!
//! The batch coordinator stages per-feature partial results as temporary
//! tables, merges them into a cumulative table, and the analysis layer
//! writes the final formatted output through the same interface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ZonalError;

// ── Cells, columns, schemas ───────────────────────────────────────────────────

/// A single table cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Double,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

pub type Row = Vec<Value>;

// ── Store interface ───────────────────────────────────────────────────────────

/// Abstract table collaborator (a geodatabase, scratch workspace, ...).
/// `create_table` on an existing name replaces it; runs always overwrite.
pub trait TableStore {
    fn create_table(&mut self, name: &str, schema: &TableSchema) -> Result<(), ZonalError>;
    fn append_rows(&mut self, name: &str, rows: &[Row]) -> Result<(), ZonalError>;
    fn delete_table(&mut self, name: &str) -> Result<(), ZonalError>;
    fn exists(&self, name: &str) -> bool;
    fn schema(&self, name: &str) -> Result<TableSchema, ZonalError>;
    fn read_rows(&self, name: &str) -> Result<Vec<Row>, ZonalError>;
    fn table_names(&self) -> Vec<String>;
}

// ── In-memory implementation ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Table {
    schema: TableSchema,
    rows: Vec<Row>,
}

/// In-memory table store used by the CLI and the test suite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTableStore {
    tables: BTreeMap<String, Table>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableStore for MemoryTableStore {
    fn create_table(&mut self, name: &str, schema: &TableSchema) -> Result<(), ZonalError> {
        self.tables.insert(
            name.to_string(),
            Table {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    fn append_rows(&mut self, name: &str, rows: &[Row]) -> Result<(), ZonalError> {
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| ZonalError::Table(format!("table `{name}` does not exist")))?;
        for row in rows {
            if row.len() != table.schema.columns.len() {
                return Err(ZonalError::Table(format!(
                    "row width {} does not match `{name}` schema width {}",
                    row.len(),
                    table.schema.columns.len()
                )));
            }
        }
        table.rows.extend_from_slice(rows);
        Ok(())
    }

    fn delete_table(&mut self, name: &str) -> Result<(), ZonalError> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ZonalError::Table(format!("table `{name}` does not exist")))
    }

    fn exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    fn schema(&self, name: &str) -> Result<TableSchema, ZonalError> {
        self.tables
            .get(name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| ZonalError::Table(format!("table `{name}` does not exist")))
    }

    fn read_rows(&self, name: &str) -> Result<Vec<Row>, ZonalError> {
        self.tables
            .get(name)
            .map(|t| t.rows.clone())
            .ok_or_else(|| ZonalError::Table(format!("table `{name}` does not exist")))
    }

    fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}
