//! Committed table state for ChalkDB
//!
//! A `TableData` is an immutable, versioned row set. Commits never mutate a
//! published `TableData` in place; they build a successor and swap the Arc,
//! so snapshots held by running transactions stay consistent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::catalog::{IndexDef, TableDef};
use crate::error::{Error, Result};
use crate::storage::row::{IndexKey, Row, RowKey};

/// A secondary index over committed rows
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    /// Indexed column positions in schema order
    pub columns: Vec<usize>,
    /// Reject duplicate entries?
    pub unique: bool,
    /// Entry values to row identities
    pub entries: BTreeMap<IndexKey, BTreeSet<RowKey>>,
}

impl SecondaryIndex {
    fn key_for(&self, row: &Row) -> IndexKey {
        IndexKey::composite(
            self.columns
                .iter()
                .map(|&i| row.get(i).cloned().unwrap_or(crate::storage::Value::Null))
                .collect(),
        )
    }

    fn insert(&mut self, table: &str, row_key: &RowKey, row: &Row) -> Result<()> {
        let key = self.key_for(row);
        let bucket = self.entries.entry(key).or_default();
        if self.unique && !bucket.is_empty() && !bucket.contains(row_key) {
            return Err(Error::DuplicateKey {
                table: table.to_string(),
                key: row_key.clone(),
            });
        }
        bucket.insert(row_key.clone());
        Ok(())
    }

    fn remove(&mut self, row_key: &RowKey, row: &Row) {
        let key = self.key_for(row);
        if let Some(bucket) = self.entries.get_mut(&key) {
            bucket.remove(row_key);
            if bucket.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Row identities matching an exact entry value
    pub fn lookup(&self, key: &IndexKey) -> Vec<RowKey> {
        self.entries
            .get(key)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// One table's committed rows plus its secondary indexes
#[derive(Debug, Clone)]
pub struct TableData {
    /// Name, for error context
    name: String,
    /// Monotone version, bumped on every published change
    version: u64,
    /// Committed rows keyed by identity
    rows: BTreeMap<RowKey, Row>,
    /// Secondary indexes by name
    indexes: HashMap<String, SecondaryIndex>,
}

impl TableData {
    /// Create an empty table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            rows: BTreeMap::new(),
            indexes: HashMap::new(),
        }
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Committed version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of committed rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Get a committed row by identity
    pub fn get(&self, key: &RowKey) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Committed rows in key order
    pub fn rows(&self) -> &BTreeMap<RowKey, Row> {
        &self.rows
    }

    /// Get a secondary index by name
    pub fn index(&self, name: &str) -> Option<&SecondaryIndex> {
        self.indexes.get(name)
    }

    /// Build a successor with an additional (backfilled) secondary index
    pub fn with_index(&self, def: &IndexDef, table_def: &TableDef) -> Result<TableData> {
        let columns = def
            .columns
            .iter()
            .map(|c| {
                table_def
                    .schema()
                    .get_column_index(c)
                    .ok_or_else(|| Error::ColumnNotFound(c.clone(), self.name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut index = SecondaryIndex {
            columns,
            unique: def.unique,
            entries: BTreeMap::new(),
        };
        for (key, row) in &self.rows {
            index.insert(&self.name, key, row)?;
        }

        let mut next = self.clone();
        next.indexes.insert(def.name.clone(), index);
        next.version += 1;
        Ok(next)
    }

    /// Build a successor without the named index
    pub fn without_index(&self, name: &str) -> TableData {
        let mut next = self.clone();
        next.indexes.remove(name);
        next.version += 1;
        next
    }

    /// Build a successor with a set of row changes applied. Each change is
    /// `(key, before, after)`: `after = None` deletes, otherwise upserts.
    /// Secondary indexes are maintained in the same pass.
    pub fn with_changes<'a, I>(&self, changes: I) -> Result<TableData>
    where
        I: IntoIterator<Item = (&'a RowKey, Option<&'a Row>, Option<&'a Row>)>,
    {
        let mut next = self.clone();
        for (key, before, after) in changes {
            if let Some(old) = before {
                for index in next.indexes.values_mut() {
                    index.remove(key, old);
                }
            }
            match after {
                Some(row) => {
                    for index in next.indexes.values_mut() {
                        index.insert(&next.name, key, row)?;
                    }
                    next.rows.insert(key.clone(), row.clone());
                }
                None => {
                    next.rows.remove(key);
                }
            }
        }
        next.version += 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Value;

    fn key(i: i32) -> RowKey {
        RowKey::from_values(vec![Value::Integer(i)])
    }

    fn row(i: i32, name: &str) -> Row {
        Row::new(vec![Value::Integer(i), Value::String(name.to_string())])
    }

    #[test]
    fn test_with_changes_upsert_and_delete() {
        let empty = TableData::new("users");
        let k1 = key(1);
        let k2 = key(2);
        let r1 = row(1, "Alice");
        let r2 = row(2, "Bob");

        let v1 = empty
            .with_changes(vec![
                (&k1, None, Some(&r1)),
                (&k2, None, Some(&r2)),
            ])
            .unwrap();
        assert_eq!(v1.row_count(), 2);
        assert_eq!(v1.version(), 1);

        let v2 = v1.with_changes(vec![(&k1, Some(&r1), None)]).unwrap();
        assert_eq!(v2.row_count(), 1);
        assert!(v2.get(&k1).is_none());
        // The predecessor is untouched
        assert_eq!(v1.row_count(), 2);
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let mut index = SecondaryIndex {
            columns: vec![1],
            unique: true,
            entries: BTreeMap::new(),
        };
        index.insert("users", &key(1), &row(1, "same")).unwrap();
        let err = index.insert("users", &key(2), &row(2, "same"));
        assert!(matches!(err, Err(Error::DuplicateKey { .. })));
    }
}
