//! In-process gateway with the store's conditional-write semantics.
//!
//! Backs the test suites and local runs. Tables are declared up front with
//! their key schema, the way a deployment would create them; secondary
//! indexes are emulated by scanning, so the `index` field of a query only
//! changes which attribute the partition equality matches.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::store::{
    Assign, AttrValue, BatchWrite, Condition, QuerySpec, Row, RowKey, StoreError, StoreGateway,
};

struct MemTable {
    partition_attr: &'static str,
    sort_attr: &'static str,
    rows: BTreeMap<(String, String), Row>,
}

/// Hash-map gateway guarded by a [`parking_lot::RwLock`].
///
/// Every operation acquires the lock for the duration of one synchronous
/// mutation, which linearizes conditional updates per row exactly like the
/// real store does.
#[derive(Default)]
pub struct MemoryGateway {
    tables: RwLock<HashMap<String, MemTable>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table and its key schema.
    pub fn create_table(&self, name: impl Into<String>, partition_attr: &'static str, sort_attr: &'static str) {
        self.tables.write().insert(
            name.into(),
            MemTable {
                partition_attr,
                sort_attr,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Direct row lookup, for test assertions.
    pub fn get_row(&self, table: &str, key: &RowKey) -> Option<Row> {
        let tables = self.tables.read();
        tables
            .get(table)
            .and_then(|t| t.rows.get(&map_key(key)).cloned())
    }

    /// Total rows in a table, for test assertions.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }

    fn matching_rows(&self, table: &str, spec: &QuerySpec) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.read();
        let tbl = tables
            .get(table)
            .ok_or_else(|| StoreError::Other(format!("no such table: {table}")))?;

        let rows = tbl
            .rows
            .values()
            .filter(|row| row.get(spec.partition.0) == Some(&spec.partition.1))
            .filter(|row| {
                spec.sort
                    .as_ref()
                    .map_or(true, |(name, value)| row.get(*name) == Some(value))
            })
            .filter(|row| spec.filter.as_ref().map_or(true, |c| c.eval(Some(row))))
            .cloned()
            .collect();
        Ok(rows)
    }
}

fn map_key(key: &RowKey) -> (String, String) {
    (key.partition.1.key_part(), key.sort.1.key_part())
}

fn apply_assigns(row: &mut Row, assigns: &[Assign]) -> Result<(), StoreError> {
    for assign in assigns {
        match assign {
            Assign::Add(name, delta) => {
                let current = match row.get(*name) {
                    Some(AttrValue::N(n)) => *n,
                    Some(AttrValue::S(_)) => {
                        return Err(StoreError::Other(format!(
                            "ADD on non-numeric attribute {name}"
                        )))
                    }
                    None => 0,
                };
                row.insert(name.to_string(), AttrValue::N(current + delta));
            }
            Assign::Set(name, value) => {
                row.insert(name.to_string(), value.clone());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StoreGateway for MemoryGateway {
    async fn update(
        &self,
        table: &str,
        key: RowKey,
        update: Vec<Assign>,
        condition: Option<Condition>,
    ) -> Result<Row, StoreError> {
        let mut tables = self.tables.write();
        let tbl = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Other(format!("no such table: {table}")))?;

        let existing = tbl.rows.get(&map_key(&key));
        if !condition.as_ref().map_or(true, |c| c.eval(existing)) {
            return Err(StoreError::PreconditionFailed);
        }

        // An update on an absent row materializes it with its key attributes.
        let mut row = existing.cloned().unwrap_or_else(|| {
            Row::from([
                (key.partition.0.to_string(), key.partition.1.clone()),
                (key.sort.0.to_string(), key.sort.1.clone()),
            ])
        });
        apply_assigns(&mut row, &update)?;
        tbl.rows.insert(map_key(&key), row.clone());
        Ok(row)
    }

    async fn put(
        &self,
        table: &str,
        item: Row,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let tbl = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Other(format!("no such table: {table}")))?;

        let partition = item
            .get(tbl.partition_attr)
            .ok_or_else(|| StoreError::Other(format!("item missing key attribute {}", tbl.partition_attr)))?;
        let sort = item
            .get(tbl.sort_attr)
            .ok_or_else(|| StoreError::Other(format!("item missing key attribute {}", tbl.sort_attr)))?;
        let map_key = (partition.key_part(), sort.key_part());

        if !condition.as_ref().map_or(true, |c| c.eval(tbl.rows.get(&map_key))) {
            return Err(StoreError::PreconditionFailed);
        }
        tbl.rows.insert(map_key, item);
        Ok(())
    }

    async fn query(&self, table: &str, spec: QuerySpec) -> Result<Vec<Row>, StoreError> {
        self.matching_rows(table, &spec)
    }

    async fn count(&self, table: &str, spec: QuerySpec) -> Result<usize, StoreError> {
        Ok(self.matching_rows(table, &spec)?.len())
    }

    async fn delete(&self, table: &str, key: RowKey) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let tbl = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Other(format!("no such table: {table}")))?;
        tbl.rows.remove(&map_key(&key));
        Ok(())
    }

    async fn batch_write(&self, table: &str, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        for write in writes {
            match write {
                BatchWrite::Put(item) => self.put(table, item, None).await?,
                BatchWrite::Delete(key) => self.delete(table, key).await?,
            }
        }
        Ok(())
    }
}
