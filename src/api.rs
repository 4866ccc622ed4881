//! Request/response boundary for the table store
//!
//! The five request shapes callers speak: UpdateTable, Query, Scan, Flush
//! and ListTables. Loose JSON trees (filter operands, bound values, revision
//! strings) are decoded exhaustively here into the engine's typed forms and
//! never re-inspected downstream.

use crate::error::{Result, StoreError};
use crate::filter::{FilterNode, FilterOp, Operand};
use crate::query::{OrderBy, QueryOptions, RecordList};
use crate::scan::{ScanOptions, ScanTable};
use crate::store::{StoreStats, TableStore};
use crate::table::InputRecord;
use crate::types::{ColumnSchema, ColumnType, Revision, SchemaDesc, Value};
use crate::StoreConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Column declaration as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// Schema descriptor as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchemaSpec {
    pub key_column: String,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTableRequest {
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub table_schema: Option<TableSchemaSpec>,
    #[serde(default)]
    pub records: Vec<InputRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateTableResponse {
    /// The batch revision as a string of epoch millis.
    pub revision: String,
}

/// Loose filter operand: exactly one of `column`, `value` or `filter` must
/// be set (`value: null` is the null operand).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperandSpec {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    pub op: String,
    #[serde(default)]
    pub operands: Vec<OperandSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBySpec {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub columns: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub filter: Option<FilterSpec>,
    #[serde(default)]
    pub order_by: Vec<OrderBySpec>,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub keep_none: bool,
    #[serde(default)]
    pub raw_result: bool,
    #[serde(default)]
    pub encode_with_type: bool,
    #[serde(default)]
    pub ignore_non_existing_table: bool,
    /// Epoch millis as a string; empty or `"0"` reads the latest state.
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTableSpec {
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub column_prefix: Option<String>,
    #[serde(default)]
    pub columns: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub keep_none: bool,
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    #[serde(default)]
    pub tables: Vec<ScanTableSpec>,
    #[serde(default)]
    pub start: Option<serde_json::Value>,
    #[serde(default)]
    pub start_type: Option<String>,
    #[serde(default)]
    pub start_inclusive: bool,
    #[serde(default)]
    pub end: Option<serde_json::Value>,
    #[serde(default)]
    pub end_type: Option<String>,
    #[serde(default)]
    pub end_inclusive: bool,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub keep_none: bool,
    #[serde(default)]
    pub raw_result: bool,
    #[serde(default)]
    pub encode_with_type: bool,
    #[serde(default)]
    pub ignore_non_existing_table: bool,
}

/// Store handle speaking the request/response shapes.
///
/// Thin wrapper over [`TableStore`]: decodes each request once, delegates to
/// the engines, and never exposes partially-validated state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<TableStore>,
}

impl Store {
    pub fn open(config: StoreConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(TableStore::open(config)?),
        })
    }

    pub fn update_table(&self, request: &UpdateTableRequest) -> Result<UpdateTableResponse> {
        let schema = request
            .table_schema
            .as_ref()
            .map(decode_schema)
            .transpose()?;
        let revision =
            self.inner
                .update_table(&request.table_name, schema.as_ref(), &request.records)?;
        Ok(UpdateTableResponse {
            revision: revision.to_string(),
        })
    }

    pub fn query(&self, request: &QueryRequest) -> Result<RecordList> {
        let options = QueryOptions {
            columns: request.columns.as_ref().map(projection_pairs),
            filter: request.filter.as_ref().map(decode_filter).transpose()?,
            order_by: request
                .order_by
                .iter()
                .map(|o| OrderBy {
                    column: o.column.clone(),
                    descending: o.descending,
                })
                .collect(),
            start: non_negative("start", request.start)?,
            limit: non_negative("limit", request.limit)?,
            keep_none: request.keep_none,
            raw_result: request.raw_result,
            encode_with_type: request.encode_with_type,
            ignore_non_existing_table: request.ignore_non_existing_table,
            revision: Revision::parse(&request.revision)?,
        };
        self.inner.query(&request.table_name, &options)
    }

    pub fn scan(&self, request: &ScanRequest) -> Result<RecordList> {
        let mut specs = Vec::with_capacity(request.tables.len());
        for table in &request.tables {
            specs.push(ScanTable {
                table_name: table.table_name.clone(),
                column_prefix: table.column_prefix.clone(),
                columns: table.columns.as_ref().map(projection_pairs),
                keep_none: table.keep_none,
                revision: Revision::parse(&table.revision)?,
            });
        }
        let options = ScanOptions {
            start: decode_bound("start", &request.start, &request.start_type)?,
            start_inclusive: request.start_inclusive,
            end: decode_bound("end", &request.end, &request.end_type)?,
            end_inclusive: request.end_inclusive,
            limit: non_negative("limit", request.limit)?,
            keep_none: request.keep_none,
            raw_result: request.raw_result,
            encode_with_type: request.encode_with_type,
            ignore_non_existing_table: request.ignore_non_existing_table,
        };
        self.inner.scan(&specs, &options)
    }

    /// Checkpoint all pending mutations to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Table names matching any of the prefixes (all tables when empty).
    pub fn list_tables(&self, prefixes: &[String]) -> Vec<String> {
        self.inner.list_tables(prefixes)
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    /// Direct access for callers that bypass the request shapes.
    pub fn engine(&self) -> &TableStore {
        &self.inner
    }
}

fn projection_pairs(columns: &BTreeMap<String, String>) -> Vec<(String, String)> {
    columns
        .iter()
        .map(|(source, alias)| (source.clone(), alias.clone()))
        .collect()
}

fn non_negative(field: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| StoreError::validation(field, format!("{} must not be negative", field)))
}

fn decode_schema(spec: &TableSchemaSpec) -> Result<SchemaDesc> {
    let mut columns = Vec::with_capacity(spec.columns.len());
    for column in &spec.columns {
        if column.name.is_empty() {
            return Err(StoreError::validation("columns", "column name is missing"));
        }
        columns.push(ColumnSchema::new(
            column.name.clone(),
            ColumnType::parse(&column.column_type)?,
        ));
    }
    Ok(SchemaDesc {
        key_column: spec.key_column.clone(),
        columns,
    })
}

/// Decode a loose filter tree into the validated operand sum type.
pub fn decode_filter(spec: &FilterSpec) -> Result<FilterNode> {
    let op = FilterOp::parse(&spec.op)?;
    let mut operands = Vec::with_capacity(spec.operands.len());
    for operand in &spec.operands {
        operands.push(decode_operand(operand)?);
    }
    Ok(FilterNode::new(op, operands))
}

fn decode_operand(spec: &OperandSpec) -> Result<Operand> {
    match (&spec.column, &spec.value, &spec.filter) {
        (Some(column), None, None) => Ok(Operand::Column(column.clone())),
        (None, None, Some(filter)) => Ok(Operand::Filter(Box::new(decode_filter(filter)?))),
        (None, Some(value), None) => {
            if value.is_null() {
                return Ok(Operand::Null);
            }
            let column_type = match &spec.value_type {
                Some(name) => ColumnType::parse(name)?,
                None => infer_type("operands", value)?,
            };
            let typed = column_type.coerce_json("operands", value)?;
            Ok(Operand::Constant(column_type, typed))
        }
        _ => Err(StoreError::validation(
            "operands",
            "operand must set exactly one of column, value or filter",
        )),
    }
}

fn decode_bound(
    field: &str,
    value: &Option<serde_json::Value>,
    type_name: &Option<String>,
) -> Result<Option<(ColumnType, Value)>> {
    let value = match value {
        None => return Ok(None),
        Some(v) if v.is_null() => return Ok(None),
        Some(v) => v,
    };
    let column_type = match type_name {
        Some(name) => ColumnType::parse(name)?,
        None => infer_type(field, value)?,
    };
    let typed = column_type.coerce_json(field, value)?;
    if typed.is_null() {
        return Err(StoreError::validation(field, "range bound cannot be null"));
    }
    Ok(Some((column_type, typed)))
}

/// Infer a constant's type from its JSON shape when no type is given.
fn infer_type(field: &str, value: &serde_json::Value) -> Result<ColumnType> {
    match value {
        serde_json::Value::Bool(_) => Ok(ColumnType::Bool),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Ok(ColumnType::Int64),
        serde_json::Value::Number(_) => Ok(ColumnType::Float64),
        serde_json::Value::String(_) => Ok(ColumnType::String),
        other => Err(StoreError::validation(
            field,
            format!("cannot infer a scalar type for {}", other),
        )),
    }
}
