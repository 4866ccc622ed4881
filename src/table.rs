//! Table: schema management, mutation batches, revisions, tombstones
//!
//! A table owns its schema, a key-ordered row index, and a strictly
//! increasing revision counter. Every accepted mutation batch is appended to
//! the WAL before its effects become visible; a reader sees the pre-batch or
//! the post-batch state, never anything in between.
//!
//! The row index keeps the full version chain per key, so a read as of an
//! older revision is a lookup, not a replay.

use crate::error::{Result, StoreError};
use crate::types::{KeyValue, Revision, SchemaDesc, TableSchema, Value, TOMBSTONE_COLUMN};
use crate::wal::{WalEntry, WalManager, WalRecord};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Latest row state: column name -> stored scalar. Explicit null is stored;
/// a column never written for the row is simply absent.
pub type Row = AHashMap<String, Value>;

/// A boundary mutation record: column name -> JSON value, not yet typed.
pub type InputRecord = serde_json::Map<String, serde_json::Value>;

/// Version chain for one key, ascending by revision. `None` is a tombstone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowVersions {
    versions: Vec<(Revision, Option<Row>)>,
}

impl RowVersions {
    /// Latest state, if the row is live.
    pub fn live(&self) -> Option<&Row> {
        self.versions.last().and_then(|(_, row)| row.as_ref())
    }

    /// State as of `rev` (latest version at or before it).
    pub fn as_of(&self, rev: Revision) -> Option<&Row> {
        if rev.is_latest() {
            return self.live();
        }
        let idx = self.versions.partition_point(|(r, _)| *r <= rev);
        if idx == 0 {
            return None;
        }
        self.versions[idx - 1].1.as_ref()
    }

    fn push(&mut self, rev: Revision, row: Option<Row>) {
        match self.versions.last_mut() {
            // Several records for one key in the same batch collapse into
            // the batch's single version.
            Some((last, slot)) if *last == rev => *slot = row,
            _ => self.versions.push((rev, row)),
        }
    }
}

/// The serializable heart of a table; what checkpoints persist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableState {
    schema: Option<TableSchema>,
    rows: BTreeMap<KeyValue, RowVersions>,
    last_revision: Revision,
}

impl TableState {
    pub fn schema(&self) -> Option<&TableSchema> {
        self.schema.as_ref()
    }

    pub fn last_revision(&self) -> Revision {
        self.last_revision
    }

    /// Rows live as of `rev`, ascending by key.
    pub fn rows_as_of(&self, rev: Revision) -> impl Iterator<Item = (&KeyValue, &Row)> {
        self.rows
            .iter()
            .filter_map(move |(key, versions)| versions.as_of(rev).map(|row| (key, row)))
    }

    /// Rows live as of `rev` whose key falls within the bounds, ascending.
    pub fn rows_in_range(
        &self,
        lower: Bound<KeyValue>,
        upper: Bound<KeyValue>,
        rev: Revision,
    ) -> impl Iterator<Item = (&KeyValue, &Row)> {
        self.rows
            .range((lower, upper))
            .filter_map(move |(key, versions)| versions.as_of(rev).map(|row| (key, row)))
    }

    pub fn live_row_count(&self) -> usize {
        self.rows.iter().filter(|(_, v)| v.live().is_some()).count()
    }

    /// Rebuild transient schema internals after deserialization.
    pub fn rebuild(&mut self) {
        if let Some(schema) = &mut self.schema {
            schema.rebuild_column_map();
        }
    }

    fn apply(&mut self, schema: TableSchema, revision: Revision, records: &[WalRecord]) {
        self.schema = Some(schema);
        for record in records {
            match record {
                WalRecord::Delete { key } => {
                    self.rows
                        .entry(KeyValue(key.clone()))
                        .or_default()
                        .push(revision, None);
                }
                WalRecord::Put { key, columns } => {
                    let entry = self.rows.entry(KeyValue(key.clone())).or_default();
                    let mut row = entry.live().cloned().unwrap_or_default();
                    for (name, value) in columns {
                        row.insert(name.clone(), value.clone());
                    }
                    entry.push(revision, Some(row));
                }
            }
        }
        if revision > self.last_revision {
            self.last_revision = revision;
        }
    }
}

/// One named relation.
pub struct Table {
    name: String,
    state: RwLock<TableState>,
    /// Serializes mutation batches; the order of acquisitions defines the
    /// table's revision order, which matches WAL append order.
    write_lock: Mutex<()>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(TableState::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_state(name: impl Into<String>, mut state: TableState) -> Self {
        state.rebuild();
        Self {
            name: name.into(),
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A table whose every batch failed validation holds no schema and is
    /// invisible to readers.
    pub fn is_initialized(&self) -> bool {
        self.state.read().schema.is_some()
    }

    /// Run `f` against the current state under the read lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&TableState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn snapshot_state(&self) -> TableState {
        self.state.read().clone()
    }

    /// Apply one mutation batch: validate fully, append to the WAL, then
    /// make the effects visible. All-or-nothing; returns the batch revision.
    pub fn apply_update(
        &self,
        desc: Option<&SchemaDesc>,
        records: &[InputRecord],
        wal: &WalManager,
    ) -> Result<Revision> {
        let _batch = self.write_lock.lock();

        let (schema, schema_delta) = {
            let state = self.state.read();
            self.resolve_schema(&state, desc)?
        };

        let wal_records = Self::validate_records(&schema, records)?;
        let revision = Revision::next_after(self.state.read().last_revision);

        let entry = WalEntry {
            table: self.name.clone(),
            revision,
            schema: schema_delta,
            records: wal_records,
        };
        let guard = wal.append(&entry)?;

        let mut state = self.state.write();
        state.apply(schema, revision, &entry.records);
        drop(state);
        drop(guard);
        Ok(revision)
    }

    /// Reapply a logged batch during startup. The log is trusted, so any
    /// inconsistency is corruption rather than a caller error.
    pub fn replay_entry(&self, entry: &WalEntry) -> Result<()> {
        let _batch = self.write_lock.lock();
        let mut state = self.state.write();
        let schema = match (&state.schema, &entry.schema) {
            (None, Some(desc)) => TableSchema::new(desc),
            (Some(current), Some(desc)) => {
                let mut extended = current.clone();
                extended.extend(desc).map(|_| extended)
            }
            (Some(current), None) => Ok(current.clone()),
            (None, None) => Err(StoreError::validation(
                "tableSchema",
                "first entry for a table carries no schema",
            )),
        }
        .map_err(|e| {
            StoreError::Corruption(format!(
                "WAL entry for table '{}' at revision {} is inconsistent: {}",
                entry.table, entry.revision, e
            ))
        })?;
        state.apply(schema, entry.revision, &entry.records);
        Ok(())
    }

    fn resolve_schema(
        &self,
        state: &TableState,
        desc: Option<&SchemaDesc>,
    ) -> Result<(TableSchema, Option<SchemaDesc>)> {
        match (&state.schema, desc) {
            (None, None) => Err(StoreError::validation(
                "tableSchema",
                format!("table '{}' does not exist and no schema was provided", self.name),
            )),
            (None, Some(desc)) => {
                let schema = TableSchema::new(desc)?;
                let delta = SchemaDesc {
                    key_column: schema.key_column().to_string(),
                    columns: schema.columns().to_vec(),
                };
                Ok((schema, Some(delta)))
            }
            (Some(current), None) => Ok((current.clone(), None)),
            (Some(current), Some(desc)) => {
                let mut extended = current.clone();
                let added = extended.extend(desc)?;
                let delta = if added.is_empty() {
                    None
                } else {
                    Some(SchemaDesc {
                        key_column: extended.key_column().to_string(),
                        columns: added,
                    })
                };
                Ok((extended, delta))
            }
        }
    }

    /// Type-check every record before anything is applied.
    fn validate_records(schema: &TableSchema, records: &[InputRecord]) -> Result<Vec<WalRecord>> {
        let key_column = schema.key_column();
        let key_type = schema.key_type();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let key_json = record.get(key_column).ok_or_else(|| {
                StoreError::validation(
                    key_column,
                    "record is missing the key column".to_string(),
                )
            })?;
            let key = key_type.coerce_json(key_column, key_json)?;
            if key.is_null() {
                return Err(StoreError::validation(key_column, "key column cannot be null"));
            }
            if record.contains_key(TOMBSTONE_COLUMN) {
                // Tombstone wins over anything else in the record.
                out.push(WalRecord::Delete { key });
                continue;
            }
            let mut columns = Vec::with_capacity(record.len());
            for (name, json) in record {
                let column_type = schema.column_type(name).ok_or_else(|| {
                    StoreError::validation(name, "unknown column".to_string())
                })?;
                columns.push((name.clone(), column_type.coerce_json(name, json)?));
            }
            out.push(WalRecord::Put { key, columns });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use crate::types::{ColumnSchema, ColumnType};
    use serde_json::json;

    fn wal(dir: &std::path::Path) -> WalManager {
        WalManager::open(dir, DurabilityLevel::NoSync).unwrap().0
    }

    fn desc(cols: &[(&str, ColumnType)]) -> SchemaDesc {
        SchemaDesc {
            key_column: "k".to_string(),
            columns: cols
                .iter()
                .map(|(n, t)| ColumnSchema::new(*n, *t))
                .collect(),
        }
    }

    fn record(pairs: &[(&str, serde_json::Value)]) -> InputRecord {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    fn int_rows(pairs: &[(i64, i64)]) -> Vec<InputRecord> {
        pairs
            .iter()
            .map(|(k, a)| record(&[("k", json!(k)), ("a", json!(a))]))
            .collect()
    }

    #[test]
    fn test_first_batch_establishes_schema() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let table = Table::new("t1");
        assert!(!table.is_initialized());

        // No schema on a new table is a validation error.
        assert!(table.apply_update(None, &[], &wal).is_err());

        let d = desc(&[("k", ColumnType::Int32), ("a", ColumnType::Int32)]);
        let rev = table
            .apply_update(Some(&d), &int_rows(&[(0, 5), (1, 4)]), &wal)
            .unwrap();
        assert!(table.is_initialized());
        assert!(rev > Revision::LATEST);
        table.with_state(|s| {
            assert_eq!(s.live_row_count(), 2);
            assert_eq!(s.schema().unwrap().key_column(), "k");
        });
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let table = Table::new("t1");
        let d = desc(&[("k", ColumnType::Int32), ("a", ColumnType::Int32)]);
        table.apply_update(Some(&d), &int_rows(&[(0, 5)]), &wal).unwrap();
        let before = table.with_state(|s| s.last_revision());

        // Second record has a non-coercible value; the whole batch fails.
        let bad = vec![
            record(&[("k", json!(1)), ("a", json!(4))]),
            record(&[("k", json!(2)), ("a", json!("not-a-number-x"))]),
        ];
        assert!(table.apply_update(None, &bad, &wal).is_err());
        table.with_state(|s| {
            assert_eq!(s.last_revision(), before);
            assert_eq!(s.live_row_count(), 1);
        });
        assert_eq!(wal.entry_count(), 1);

        // Unknown column also rejects the batch.
        let unknown = vec![record(&[("k", json!(1)), ("zzz", json!(1))])];
        assert!(table.apply_update(None, &unknown, &wal).is_err());
    }

    #[test]
    fn test_merge_and_explicit_null() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let table = Table::new("t1");
        let d = desc(&[
            ("k", ColumnType::Int32),
            ("a", ColumnType::Int32),
            ("b", ColumnType::String),
        ]);
        table
            .apply_update(
                Some(&d),
                &[record(&[("k", json!(1)), ("a", json!(10)), ("b", json!("x"))])],
                &wal,
            )
            .unwrap();
        // Merge: 'a' untouched, 'b' set to explicit null.
        table
            .apply_update(
                None,
                &[record(&[("k", json!(1)), ("b", serde_json::Value::Null)])],
                &wal,
            )
            .unwrap();
        table.with_state(|s| {
            let (_, row) = s.rows_as_of(Revision::LATEST).next().unwrap();
            assert_eq!(row.get("a"), Some(&Value::Int(10)));
            // Explicit null is stored, distinct from absent.
            assert_eq!(row.get("b"), Some(&Value::Null));
        });
    }

    #[test]
    fn test_tombstone_and_time_travel() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let table = Table::new("t1");
        let d = desc(&[("k", ColumnType::Int32), ("a", ColumnType::Int32)]);
        let rev1 = table
            .apply_update(Some(&d), &int_rows(&[(0, 5), (1, 4)]), &wal)
            .unwrap();
        let rev2 = table
            .apply_update(
                None,
                &[record(&[("k", json!(0)), ("-", json!(true))])],
                &wal,
            )
            .unwrap();
        assert!(rev2 > rev1);

        table.with_state(|s| {
            // Tombstoned key is gone from the default view...
            let live: Vec<i64> = s
                .rows_as_of(Revision::LATEST)
                .map(|(k, _)| match &k.0 {
                    Value::Int(i) => *i,
                    _ => unreachable!(),
                })
                .collect();
            assert_eq!(live, vec![1]);
            // ...but recoverable as of the earlier revision.
            let historic: Vec<i64> = s
                .rows_as_of(rev1)
                .map(|(k, _)| match &k.0 {
                    Value::Int(i) => *i,
                    _ => unreachable!(),
                })
                .collect();
            assert_eq!(historic, vec![0, 1]);
            // Before the first revision there is nothing.
            assert_eq!(s.rows_as_of(Revision(rev1.0 - 1)).count(), 0);
        });
    }

    #[test]
    fn test_same_batch_same_key_collapses() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let table = Table::new("t1");
        let d = desc(&[("k", ColumnType::Int32), ("a", ColumnType::Int32)]);
        table
            .apply_update(Some(&d), &int_rows(&[(1, 10), (1, 20)]), &wal)
            .unwrap();
        table.with_state(|s| {
            assert_eq!(s.live_row_count(), 1);
            let (_, row) = s.rows_as_of(Revision::LATEST).next().unwrap();
            // Later record in the batch merges over the earlier one.
            assert_eq!(row.get("a"), Some(&Value::Int(20)));
        });
    }

    #[test]
    fn test_key_range_read() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let table = Table::new("t1");
        let d = desc(&[("k", ColumnType::Int32), ("a", ColumnType::Int32)]);
        table
            .apply_update(
                Some(&d),
                &int_rows(&[(0, 5), (1, 4), (2, 3), (3, 2), (4, 1)]),
                &wal,
            )
            .unwrap();
        table.with_state(|s| {
            let keys: Vec<i64> = s
                .rows_in_range(
                    Bound::Excluded(KeyValue(Value::Int(0))),
                    Bound::Included(KeyValue(Value::Int(3))),
                    Revision::LATEST,
                )
                .map(|(k, _)| match &k.0 {
                    Value::Int(i) => *i,
                    _ => unreachable!(),
                })
                .collect();
            assert_eq!(keys, vec![1, 2, 3]);
        });
    }

    #[test]
    fn test_replay_reproduces_state() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::new("t1");
        {
            let wal = wal(dir.path());
            let d = desc(&[("k", ColumnType::Int32), ("a", ColumnType::Int32)]);
            table
                .apply_update(Some(&d), &int_rows(&[(0, 5), (1, 4), (2, 3)]), &wal)
                .unwrap();
            table
                .apply_update(
                    None,
                    &[record(&[("k", json!(1)), ("-", json!(true))])],
                    &wal,
                )
                .unwrap();
            table
                .apply_update(None, &int_rows(&[(2, 30)]), &wal)
                .unwrap();
        }

        let (_, entries) =
            WalManager::open(dir.path(), DurabilityLevel::NoSync).unwrap();
        let rebuilt = Table::new("t1");
        for entry in &entries {
            rebuilt.replay_entry(entry).unwrap();
        }

        let original = table.snapshot_state();
        let replayed = rebuilt.snapshot_state();
        assert_eq!(original.last_revision(), replayed.last_revision());
        let collect = |s: &TableState| -> Vec<(Value, Vec<(String, Value)>)> {
            s.rows_as_of(Revision::LATEST)
                .map(|(k, row)| {
                    let mut cols: Vec<_> =
                        row.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
                    cols.sort_by(|a, b| a.0.cmp(&b.0));
                    (k.0.clone(), cols)
                })
                .collect()
        };
        assert_eq!(collect(&original), collect(&replayed));
    }
}
