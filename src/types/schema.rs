//! Table schema: key column, column registry, tombstone marker
//!
//! The schema is established by the first mutation batch addressed to a new
//! table and may only grow afterwards: later batches add previously-unseen
//! columns, and an existing column's type is immutable once set.

use crate::error::{Result, StoreError};
use crate::types::ColumnType;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Reserved marker column. Never a real column; its presence in a mutation
/// record marks the whole record as a full-row delete.
pub const TOMBSTONE_COLUMN: &str = "-";

/// A single column declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Schema descriptor carried by a mutation batch: the key column plus the
/// columns the batch declares. Validated against the table's existing schema
/// before anything is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDesc {
    pub key_column: String,
    pub columns: Vec<ColumnSchema>,
}

/// Validate a column name: alphanumerics plus `-`, `_`, `/`, `:` and space.
/// The bare tombstone marker is reserved and never declarable.
pub fn validate_column_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::validation("column", "column name is empty"));
    }
    if name == TOMBSTONE_COLUMN {
        return Err(StoreError::validation(
            "column",
            format!("'{}' is reserved for tombstone records", TOMBSTONE_COLUMN),
        ));
    }
    for c in name.chars() {
        let ok = c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | ':' | ' ');
        if !ok {
            return Err(StoreError::validation(
                "column",
                format!("invalid character {:?} in column name '{}'", c, name),
            ));
        }
    }
    Ok(())
}

/// Table schema: key column plus the ordered set of declared columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    key_column: String,
    columns: Vec<ColumnSchema>,
    /// Column name -> position, rebuilt after deserialization.
    #[serde(skip)]
    column_map: AHashMap<String, usize>,
}

impl TableSchema {
    /// Build the initial schema from the first batch's descriptor.
    pub fn new(desc: &SchemaDesc) -> Result<Self> {
        if desc.key_column.is_empty() {
            return Err(StoreError::validation("keyColumn", "key column is required"));
        }
        let mut schema = Self {
            key_column: desc.key_column.clone(),
            columns: Vec::with_capacity(desc.columns.len()),
            column_map: AHashMap::with_capacity(desc.columns.len()),
        };
        for col in &desc.columns {
            schema.add_column(col)?;
        }
        if !schema.column_map.contains_key(&schema.key_column) {
            return Err(StoreError::validation(
                "keyColumn",
                format!("key column '{}' is not declared", schema.key_column),
            ));
        }
        Ok(schema)
    }

    /// Extend with a later batch's descriptor. Returns the genuinely new
    /// columns; redeclaring an existing column with the same type is a no-op
    /// and a different type is an error.
    pub fn extend(&mut self, desc: &SchemaDesc) -> Result<Vec<ColumnSchema>> {
        if desc.key_column != self.key_column {
            return Err(StoreError::validation(
                "keyColumn",
                format!(
                    "key column is '{}' and cannot change to '{}'",
                    self.key_column, desc.key_column
                ),
            ));
        }
        let mut added = Vec::new();
        for col in &desc.columns {
            match self.column_type(&col.name) {
                Some(existing) if existing == col.column_type => {}
                Some(existing) => {
                    return Err(StoreError::validation(
                        &col.name,
                        format!(
                            "column is {} and cannot be redeclared as {}",
                            existing.name(),
                            col.column_type.name()
                        ),
                    ));
                }
                None => {
                    self.add_column(col)?;
                    added.push(col.clone());
                }
            }
        }
        Ok(added)
    }

    fn add_column(&mut self, col: &ColumnSchema) -> Result<()> {
        validate_column_name(&col.name)?;
        if col.column_type == ColumnType::Unknown {
            return Err(StoreError::validation(
                &col.name,
                "columns cannot be declared UNKNOWN",
            ));
        }
        if self.column_map.contains_key(&col.name) {
            return Err(StoreError::validation(
                &col.name,
                "duplicate column name",
            ));
        }
        self.column_map.insert(col.name.clone(), self.columns.len());
        self.columns.push(col.clone());
        Ok(())
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn key_type(&self) -> ColumnType {
        self.column_type(&self.key_column)
            .unwrap_or(ColumnType::Unknown)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column_map
            .get(name)
            .map(|&pos| self.columns[pos].column_type)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_map.contains_key(name)
    }

    /// Declared columns in declaration order.
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Rebuild the name map (call after deserialization).
    pub fn rebuild_column_map(&mut self) {
        self.column_map.clear();
        for (pos, col) in self.columns.iter().enumerate() {
            self.column_map.insert(col.name.clone(), pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(key: &str, cols: &[(&str, ColumnType)]) -> SchemaDesc {
        SchemaDesc {
            key_column: key.to_string(),
            columns: cols
                .iter()
                .map(|(n, t)| ColumnSchema::new(*n, *t))
                .collect(),
        }
    }

    #[test]
    fn test_new_schema_requires_declared_key() {
        let err = TableSchema::new(&desc("k", &[("a", ColumnType::Int32)])).unwrap_err();
        assert!(err.to_string().contains("key column"));

        let schema = TableSchema::new(&desc(
            "k",
            &[("k", ColumnType::Int32), ("a", ColumnType::Int32)],
        ))
        .unwrap();
        assert_eq!(schema.key_column(), "k");
        assert_eq!(schema.key_type(), ColumnType::Int32);
        assert_eq!(schema.column_count(), 2);
    }

    #[test]
    fn test_column_name_rules() {
        assert!(validate_column_name("metrics/loss:avg aggregated_1-x").is_ok());
        assert!(validate_column_name("").is_err());
        assert!(validate_column_name("-").is_err());
        assert!(validate_column_name("a.b").is_err());
        assert!(validate_column_name("naïve").is_err());
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let err = TableSchema::new(&desc(
            "k",
            &[("k", ColumnType::Int32), ("k", ColumnType::Int32)],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_extend_adds_only_new_columns() {
        let mut schema =
            TableSchema::new(&desc("k", &[("k", ColumnType::Int32)])).unwrap();

        let added = schema
            .extend(&desc(
                "k",
                &[("k", ColumnType::Int32), ("a", ColumnType::Float64)],
            ))
            .unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name, "a");
        assert_eq!(schema.column_type("a"), Some(ColumnType::Float64));

        // Same type again: no-op.
        let added = schema
            .extend(&desc("k", &[("a", ColumnType::Float64)]))
            .unwrap();
        assert!(added.is_empty());

        // Different type: immutable once set.
        let err = schema
            .extend(&desc("k", &[("a", ColumnType::String)]))
            .unwrap_err();
        assert!(err.to_string().contains("redeclared"));
    }

    #[test]
    fn test_extend_cannot_change_key() {
        let mut schema =
            TableSchema::new(&desc("k", &[("k", ColumnType::Int32)])).unwrap();
        assert!(schema
            .extend(&desc("k2", &[("k2", ColumnType::Int32)]))
            .is_err());
    }

    #[test]
    fn test_rebuild_column_map_after_deserialize() {
        let schema = TableSchema::new(&desc(
            "k",
            &[("k", ColumnType::Int32), ("a", ColumnType::String)],
        ))
        .unwrap();
        let bytes = bincode::serialize(&schema).unwrap();
        let mut restored: TableSchema = bincode::deserialize(&bytes).unwrap();
        restored.rebuild_column_map();
        assert_eq!(restored.column_type("a"), Some(ColumnType::String));
    }
}
