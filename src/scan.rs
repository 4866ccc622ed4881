//! Scan engine: multi-table key-range merge with a pagination cursor
//!
//! Each listed table contributes its rows whose primary key falls inside the
//! requested range; the per-table streams are merged by ascending key with a
//! min-heap. Rows sharing a key collapse into one output row, later-listed
//! tables overwriting earlier ones on column-name collisions. The response's
//! `lastKey` is the cursor: callers continue with `start = lastKey,
//! startInclusive = false`.

use crate::error::{Result, StoreError};
use crate::query::{effective_limit, project_row, resolve_projection, RecordList};
use crate::table::Table;
use crate::types::{ColumnType, KeyValue, Revision, Value};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use tracing::debug;

/// One table's slice of a scan.
#[derive(Debug, Clone)]
pub struct ScanTable {
    pub table_name: String,
    /// Select every declared column whose name starts with this prefix, in
    /// addition to (or instead of) the explicit projection.
    pub column_prefix: Option<String>,
    pub columns: Option<Vec<(String, String)>>,
    pub keep_none: bool,
    pub revision: Revision,
}

impl ScanTable {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            column_prefix: None,
            columns: None,
            keep_none: false,
            revision: Revision::LATEST,
        }
    }
}

/// Options for a multi-table range scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Typed range bounds; `None` is unbounded on that side.
    pub start: Option<(ColumnType, Value)>,
    pub start_inclusive: bool,
    pub end: Option<(ColumnType, Value)>,
    pub end_inclusive: bool,
    /// Merged-row cap per page, clamped to `QUERY_LIMIT`.
    pub limit: usize,
    pub keep_none: bool,
    pub raw_result: bool,
    pub encode_with_type: bool,
    pub ignore_non_existing_table: bool,
}

struct HeapItem {
    key: KeyValue,
    source: usize,
    row: serde_json::Map<String, serde_json::Value>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ascending key; equal keys pop in listing order so the overlay is
        // deterministic.
        self.key.cmp(&other.key).then(self.source.cmp(&other.source))
    }
}

/// Run a scan over already-resolved tables (one per listed spec, in listing
/// order).
pub fn run_scan(resolved: &[(&ScanTable, &Table)], options: &ScanOptions) -> Result<RecordList> {
    let mut sources: Vec<std::vec::IntoIter<(KeyValue, serde_json::Map<String, serde_json::Value>)>> =
        Vec::with_capacity(resolved.len());
    let mut alias_types: BTreeMap<String, BTreeSet<&'static str>> = BTreeMap::new();

    for (spec, table) in resolved {
        let rows = table.with_state(|state| {
            let schema = state
                .schema()
                .ok_or_else(|| StoreError::TableNotFound(table.name().to_string()))?;

            let projection = scan_projection(schema, spec)?;
            for (source, alias) in &projection {
                if let Some(column_type) = schema.column_type(source) {
                    alias_types
                        .entry(alias.clone())
                        .or_default()
                        .insert(column_type.name());
                }
            }

            let lower = range_bound(
                &options.start,
                options.start_inclusive,
                "start",
                schema.key_type(),
            )?;
            let upper = range_bound(
                &options.end,
                options.end_inclusive,
                "end",
                schema.key_type(),
            )?;

            let keep_none = spec.keep_none || options.keep_none;
            let rows: Vec<_> = state
                .rows_in_range(lower, upper, spec.revision)
                .map(|(key, row)| {
                    (
                        key.clone(),
                        project_row(
                            row,
                            schema,
                            &projection,
                            keep_none,
                            options.raw_result,
                            options.encode_with_type,
                        ),
                    )
                })
                .collect();
            Ok::<_, StoreError>(rows)
        })?;
        sources.push(rows.into_iter());
    }

    // Seed the heap with each source's first row, then refill from whichever
    // source a popped row came from.
    let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::with_capacity(sources.len());
    for (source, iter) in sources.iter_mut().enumerate() {
        if let Some((key, row)) = iter.next() {
            heap.push(Reverse(HeapItem { key, source, row }));
        }
    }

    let limit = effective_limit(options.limit);
    let mut records = Vec::new();
    let mut last_key: Option<KeyValue> = None;
    let mut current: Option<(KeyValue, serde_json::Map<String, serde_json::Value>)> = None;

    while let Some(Reverse(item)) = heap.pop() {
        if let Some((key, row)) = iter_refill(&mut sources, item.source) {
            heap.push(Reverse(HeapItem {
                key,
                source: item.source,
                row,
            }));
        }
        match current.take() {
            Some((key, mut merged)) if key == item.key => {
                // Same primary key from a later-listed table: its columns
                // overlay the accumulated row.
                merged.extend(item.row);
                current = Some((key, merged));
            }
            Some((key, merged)) => {
                records.push(merged);
                last_key = Some(key);
                if records.len() >= limit {
                    break;
                }
                current = Some((item.key, item.row));
            }
            None => current = Some((item.key, item.row)),
        }
    }
    if let Some((key, merged)) = current {
        if records.len() < limit {
            records.push(merged);
            last_key = Some(key);
        }
    }

    debug!(
        tables = resolved.len(),
        rows = records.len(),
        "scan merge complete"
    );

    let mut column_types = BTreeMap::new();
    let mut column_hints = BTreeMap::new();
    for (alias, types) in alias_types {
        if types.len() == 1 {
            let only = types.iter().next().map(|t| t.to_string());
            column_types.insert(alias, only.unwrap_or_default());
        } else {
            column_hints.insert(alias, types.iter().map(|t| t.to_string()).collect());
        }
    }

    Ok(RecordList {
        records,
        column_types: if options.encode_with_type {
            None
        } else {
            Some(column_types)
        },
        column_hints,
        last_key: last_key.map(|k| k.0.to_json()),
    })
}

fn iter_refill(
    sources: &mut [std::vec::IntoIter<(KeyValue, serde_json::Map<String, serde_json::Value>)>],
    source: usize,
) -> Option<(KeyValue, serde_json::Map<String, serde_json::Value>)> {
    sources.get_mut(source).and_then(|iter| iter.next())
}

fn scan_projection(
    schema: &crate::types::TableSchema,
    spec: &ScanTable,
) -> Result<Vec<(String, String)>> {
    let mut projection: Vec<(String, String)> = Vec::new();
    if let Some(prefix) = &spec.column_prefix {
        for column in schema.columns() {
            if column.name.starts_with(prefix.as_str()) {
                projection.push((column.name.clone(), column.name.clone()));
            }
        }
    }
    match (&spec.columns, &spec.column_prefix) {
        (Some(_), _) => {
            let explicit = resolve_projection(schema, &spec.columns)?;
            for pair in explicit {
                if !projection.contains(&pair) {
                    projection.push(pair);
                }
            }
        }
        (None, None) => projection = resolve_projection(schema, &None)?,
        (None, Some(_)) => {}
    }
    Ok(projection)
}

fn range_bound(
    bound: &Option<(ColumnType, Value)>,
    inclusive: bool,
    field: &str,
    key_type: ColumnType,
) -> Result<std::ops::Bound<KeyValue>> {
    use std::ops::Bound;
    match bound {
        None => Ok(Bound::Unbounded),
        Some((bound_type, value)) => {
            if !ColumnType::is_comparable(*bound_type, key_type) {
                return Err(StoreError::validation(
                    field,
                    format!(
                        "bound of type {} is not comparable with key type {}",
                        bound_type.name(),
                        key_type.name()
                    ),
                ));
            }
            let key = KeyValue(value.clone());
            Ok(if inclusive {
                Bound::Included(key)
            } else {
                Bound::Excluded(key)
            })
        }
    }
}
