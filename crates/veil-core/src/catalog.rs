//! Table and column identities.
//!
//! The real schema lives with the host database. The engine only keeps
//! enough of it to resolve column references and to check that a policy's
//! argument types match the columns it is attached to.

use crate::error::{Error, Result};
use crate::value::DataType;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub String);

impl TableId {
    /// Create a table id.
    pub fn new(name: impl Into<String>) -> Self {
        TableId(name.into())
    }

    /// Table name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(name: &str) -> Self {
        TableId::new(name)
    }
}

/// Column identifier, qualified by its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnId {
    /// Owning table.
    pub table: TableId,
    /// Column name.
    pub column: String,
}

impl ColumnId {
    /// Create a column id.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: TableId::new(table),
            column: column.into(),
        }
    }

    /// Parse `table.column`.
    pub fn parse(qualified: &str) -> Option<Self> {
        let (table, column) = qualified.split_once('.')?;
        if table.is_empty() || column.is_empty() {
            return None;
        }
        Some(Self::new(table, column))
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Registered table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table id.
    pub id: TableId,
    /// Columns in declaration order.
    pub columns: Vec<(String, DataType)>,
}

impl TableDef {
    /// Create an empty table definition.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TableId::new(id),
            columns: Vec::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, name: impl Into<String>, ty: DataType) -> Self {
        self.columns.push((name.into(), ty));
        self
    }

    /// Look up a column's type.
    pub fn column_type(&self, name: &str) -> Option<DataType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
    }
}

/// Registry of known tables.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<HashMap<TableId, TableDef>>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or redefine a table.
    pub fn register(&self, table: TableDef) {
        self.tables.write().insert(table.id.clone(), table);
    }

    /// Get a table definition.
    pub fn table(&self, id: &TableId) -> Result<TableDef> {
        self.tables
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTable(id.to_string()))
    }

    /// Get the declared type of a column.
    pub fn column_type(&self, column: &ColumnId) -> Result<DataType> {
        let tables = self.tables.read();
        let table = tables
            .get(&column.table)
            .ok_or_else(|| Error::UnknownTable(column.table.to_string()))?;
        table
            .column_type(&column.column)
            .ok_or_else(|| Error::UnknownColumn(column.to_string()))
    }

    /// All registered tables.
    pub fn tables(&self) -> Vec<TableDef> {
        let mut tables: Vec<_> = self.tables.read().values().cloned().collect();
        tables.sort_by(|a, b| a.id.cmp(&b.id));
        tables
    }
}
