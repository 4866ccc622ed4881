//! Point query engine: filter, order, offset/limit, projection
//!
//! Resolves a query against one table's state as of a revision: rows are
//! filtered, stably sorted (ties broken by primary key ascending), paged by
//! offset and a capped limit, then projected and encoded for the boundary.

use crate::config::QUERY_LIMIT;
use crate::error::{Result, StoreError};
use crate::filter::FilterNode;
use crate::table::{Row, Table};
use crate::types::{self, validate_column_name, ColumnType, Revision, TableSchema, Value};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One sort key of an `orderBy` list.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Options for a point query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Projection: source column -> output alias, in output order. `None`
    /// projects every declared column under its own name.
    pub columns: Option<Vec<(String, String)>>,
    pub filter: Option<FilterNode>,
    pub order_by: Vec<OrderBy>,
    /// Offset into the sorted result.
    pub start: usize,
    /// Row cap; `0` and anything above `QUERY_LIMIT` clamp to `QUERY_LIMIT`.
    pub limit: usize,
    /// Emit columns whose stored value is explicit null.
    pub keep_none: bool,
    /// Return the stored scalar's canonical string form instead of the
    /// normalized JSON scalar.
    pub raw_result: bool,
    /// Carry each scalar's type inline instead of a separate `columnTypes`.
    pub encode_with_type: bool,
    /// Querying a non-existent table yields an empty result instead of an
    /// error.
    pub ignore_non_existing_table: bool,
    pub revision: Revision,
}

/// Result rows plus column metadata, shared by query and scan.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordList {
    pub records: Vec<serde_json::Map<String, serde_json::Value>>,
    /// Output column -> declared type; absent when types are encoded inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_types: Option<BTreeMap<String, String>>,
    /// Output columns that resolved to more than one declared type across
    /// the scanned tables, with every type encountered.
    pub column_hints: BTreeMap<String, Vec<String>>,
    /// Primary key of the last row returned; the scan pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_key: Option<serde_json::Value>,
}

pub fn effective_limit(limit: usize) -> usize {
    if limit == 0 {
        QUERY_LIMIT
    } else {
        limit.min(QUERY_LIMIT)
    }
}

/// Encode one stored scalar for the boundary.
pub(crate) fn encode_cell(
    column_type: ColumnType,
    value: &Value,
    raw_result: bool,
    encode_with_type: bool,
) -> serde_json::Value {
    let scalar = if value.is_null() {
        serde_json::Value::Null
    } else if raw_result || encode_with_type {
        serde_json::Value::String(column_type.encode(value))
    } else {
        value.to_json()
    };
    if encode_with_type {
        let mut cell = serde_json::Map::new();
        cell.insert(
            "type".to_string(),
            serde_json::Value::String(column_type.name().to_string()),
        );
        cell.insert("value".to_string(), scalar);
        serde_json::Value::Object(cell)
    } else {
        scalar
    }
}

/// Project and encode one row. Absent columns stay absent; explicit nulls
/// are emitted only under `keep_none`.
pub(crate) fn project_row(
    row: &Row,
    schema: &TableSchema,
    projection: &[(String, String)],
    keep_none: bool,
    raw_result: bool,
    encode_with_type: bool,
) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::new();
    for (source, alias) in projection {
        let value = match row.get(source.as_str()) {
            None => continue,
            Some(Value::Null) if !keep_none => continue,
            Some(value) => value,
        };
        let column_type = schema.column_type(source).unwrap_or(ColumnType::Unknown);
        out.insert(
            alias.clone(),
            encode_cell(column_type, value, raw_result, encode_with_type),
        );
    }
    out
}

/// Resolve the projection list against the schema.
pub(crate) fn resolve_projection(
    schema: &TableSchema,
    columns: &Option<Vec<(String, String)>>,
) -> Result<Vec<(String, String)>> {
    match columns {
        None => Ok(schema
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.name.clone()))
            .collect()),
        Some(columns) => {
            let mut projection = Vec::with_capacity(columns.len());
            for (source, alias) in columns {
                validate_column_name(source)?;
                if !schema.has_column(source) {
                    return Err(StoreError::validation(
                        source,
                        "unknown column in projection".to_string(),
                    ));
                }
                let alias = if alias.is_empty() { source } else { alias };
                projection.push((source.clone(), alias.clone()));
            }
            Ok(projection)
        }
    }
}

/// Run a point query against one table.
pub fn run_query(table: &Table, options: &QueryOptions) -> Result<RecordList> {
    table.with_state(|state| {
        let schema = state
            .schema()
            .ok_or_else(|| StoreError::TableNotFound(table.name().to_string()))?;

        let projection = resolve_projection(schema, &options.columns)?;
        for order in &options.order_by {
            validate_column_name(&order.column)?;
            if !schema.has_column(&order.column) {
                return Err(StoreError::validation(
                    &order.column,
                    "unknown column in orderBy".to_string(),
                ));
            }
        }
        if let Some(filter) = &options.filter {
            filter.validate(schema)?;
        }

        let mut matched: Vec<(&types::KeyValue, &Row)> = Vec::new();
        for (key, row) in state.rows_as_of(options.revision) {
            let keep = match &options.filter {
                Some(filter) => filter.matches(row)?,
                None => true,
            };
            if keep {
                matched.push((key, row));
            }
        }

        // Stable sort; rows arrive in key order, so equal sort keys keep
        // primary-key order and the final tie-break is implicit.
        if !options.order_by.is_empty() {
            matched.sort_by(|(ka, ra), (kb, rb)| {
                for order in &options.order_by {
                    let va = ra.get(order.column.as_str()).unwrap_or(&Value::Null);
                    let vb = rb.get(order.column.as_str()).unwrap_or(&Value::Null);
                    let mut ordering = types::total_order(va, vb);
                    if order.descending {
                        ordering = ordering.reverse();
                    }
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                ka.cmp(kb)
            });
        }

        let records: Vec<_> = matched
            .into_iter()
            .skip(options.start)
            .take(effective_limit(options.limit))
            .map(|(_, row)| {
                project_row(
                    row,
                    schema,
                    &projection,
                    options.keep_none,
                    options.raw_result,
                    options.encode_with_type,
                )
            })
            .collect();

        let column_types = if options.encode_with_type {
            None
        } else {
            Some(
                projection
                    .iter()
                    .filter_map(|(source, alias)| {
                        schema
                            .column_type(source)
                            .map(|t| (alias.clone(), t.name().to_string()))
                    })
                    .collect(),
            )
        };

        Ok(RecordList {
            records,
            column_types,
            column_hints: BTreeMap::new(),
            last_key: None,
        })
    })
}
