//! The narrow seam between the limiter core and the key-value store.
//!
//! [`StoreGateway`] is the only interface the token managers talk to. It
//! exposes exactly the operations the limiters need (conditional update,
//! conditional put, key/index query, delete, batch write) over a typed
//! expression model small enough to be interpreted in-process
//! ([`crate::memory::MemoryGateway`]) or rendered to DynamoDB wire
//! expressions (`tollgate-dynamo`).
//!
//! Gateways never retry: callers own retry policy, so a mutation maps to at
//! most one store call.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Wire-level attribute names shared by every table.
pub mod columns {
    pub const RESOURCE_NAME: &str = "resourceName";
    pub const ACCOUNT_ID: &str = "accountId";

    // Fungible bucket rows
    pub const TOKENS: &str = "tokens";
    pub const LAST_REFILL: &str = "lastRefill";
    pub const LAST_TOKEN: &str = "lastToken";

    // Limit rows
    pub const LIMIT: &str = "limit";
    pub const WINDOW_SEC: &str = "windowSec";
    pub const SERVICE_NAME: &str = "serviceName";
    pub const CONFIG_VERSION: &str = "configVersion";

    // Non-fungible token rows
    pub const RESOURCE_COORDINATE: &str = "resourceCoordinate";
    pub const RESERVATION_ID: &str = "reservationId";
    pub const RESOURCE_ID: &str = "resourceId";
    pub const EXPIRATION_TIME: &str = "expirationTime";
}

/// Errors a gateway surfaces to the managers.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A conditional mutation was rejected by its precondition. Callers
    /// interpret this domain-specifically (capacity exhausted, stale refill,
    /// expired reservation).
    #[error("conditional check failed")]
    PreconditionFailed,

    /// The backend reported transient capacity pressure.
    #[error("store throttled: {0}")]
    Throttled(String),

    /// Any other backend failure.
    #[error("store error: {0}")]
    Other(String),
}

/// A single attribute value. The token tables only ever hold strings and
/// integral numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    N(i64),
    S(String),
}

impl AttrValue {
    pub fn as_n(&self) -> Option<i64> {
        match self {
            AttrValue::N(n) => Some(*n),
            AttrValue::S(_) => None,
        }
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            AttrValue::N(_) => None,
        }
    }

    /// Canonical string form used by the in-memory gateway to key rows.
    pub(crate) fn key_part(&self) -> String {
        match self {
            AttrValue::N(n) => n.to_string(),
            AttrValue::S(s) => s.clone(),
        }
    }

    fn cmp_same_type(&self, other: &AttrValue) -> Option<Ordering> {
        match (self, other) {
            (AttrValue::N(a), AttrValue::N(b)) => Some(a.cmp(b)),
            (AttrValue::S(a), AttrValue::S(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::N(n)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::S(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::S(s)
    }
}

/// One stored row: attribute name to value.
pub type Row = HashMap<String, AttrValue>;

/// Numeric attribute accessor.
pub fn get_n(row: &Row, name: &str) -> Option<i64> {
    row.get(name).and_then(AttrValue::as_n)
}

/// String attribute accessor.
pub fn get_s<'a>(row: &'a Row, name: &str) -> Option<&'a str> {
    row.get(name).and_then(AttrValue::as_s)
}

/// Composite primary key of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub partition: (&'static str, AttrValue),
    pub sort: (&'static str, AttrValue),
}

impl RowKey {
    pub fn new(
        partition_name: &'static str,
        partition: impl Into<AttrValue>,
        sort_name: &'static str,
        sort: impl Into<AttrValue>,
    ) -> Self {
        Self {
            partition: (partition_name, partition.into()),
            sort: (sort_name, sort.into()),
        }
    }
}

/// One step of an update expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Assign {
    /// Arithmetic add (`ADD attr delta`). A missing attribute counts as 0,
    /// so the first consume on a fresh bucket creates the row.
    Add(&'static str, i64),
    /// Plain assignment (`SET attr = value`).
    Set(&'static str, AttrValue),
}

/// A precondition or filter over one row.
///
/// Semantics follow the store's conditional expressions: comparisons against
/// a missing attribute are false, and `NotExists` is true when the whole row
/// is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Gt(&'static str, AttrValue),
    Lt(&'static str, AttrValue),
    Ne(&'static str, AttrValue),
    Exists(&'static str),
    NotExists(&'static str),
    /// Disjunction over the branches, true when any branch is.
    Or(Vec<Condition>),
}

impl Condition {
    /// Evaluate against a row, `None` meaning the row does not exist.
    pub fn eval(&self, row: Option<&Row>) -> bool {
        match self {
            Condition::Gt(name, value) => cmp_attr(row, name, value, Ordering::Greater),
            Condition::Lt(name, value) => cmp_attr(row, name, value, Ordering::Less),
            Condition::Ne(name, value) => row
                .and_then(|r| r.get(*name))
                .is_some_and(|attr| attr != value),
            Condition::Exists(name) => row.is_some_and(|r| r.contains_key(*name)),
            Condition::NotExists(name) => !row.is_some_and(|r| r.contains_key(*name)),
            Condition::Or(branches) => branches.iter().any(|c| c.eval(row)),
        }
    }
}

fn cmp_attr(row: Option<&Row>, name: &str, value: &AttrValue, expected: Ordering) -> bool {
    row.and_then(|r| r.get(name))
        .and_then(|attr| attr.cmp_same_type(value))
        .is_some_and(|ord| ord == expected)
}

/// A key or index query.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    /// Partition-key equality, against the table key or the named index.
    pub partition: (&'static str, AttrValue),
    /// Optional sort-key equality for exact-row lookups.
    pub sort: Option<(&'static str, AttrValue)>,
    /// Secondary index to query instead of the table key.
    pub index: Option<String>,
    /// Post-read filter. Required where the store's TTL reclamation lags the
    /// expiration timestamps.
    pub filter: Option<Condition>,
    /// Strongly consistent read. Only valid against the table key.
    pub consistent: bool,
}

impl QuerySpec {
    pub fn partition(name: &'static str, value: impl Into<AttrValue>) -> Self {
        Self {
            partition: (name, value.into()),
            sort: None,
            index: None,
            filter: None,
            consistent: false,
        }
    }

    pub fn sort_eq(mut self, name: &'static str, value: impl Into<AttrValue>) -> Self {
        self.sort = Some((name, value.into()));
        self
    }

    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.index = Some(name.into());
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = Some(condition);
        self
    }

    pub fn consistent(mut self) -> Self {
        self.consistent = true;
        self
    }
}

/// One element of a batch write. Batch writes carry no preconditions.
#[derive(Debug, Clone)]
pub enum BatchWrite {
    Put(Row),
    Delete(RowKey),
}

/// Narrow interface over the KV store.
///
/// Implementations must not retry internally; every method is at most one
/// round trip (queries may paginate, which is reads, not retries).
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Conditionally update one row and return its new image.
    async fn update(
        &self,
        table: &str,
        key: RowKey,
        update: Vec<Assign>,
        condition: Option<Condition>,
    ) -> Result<Row, StoreError>;

    /// Write a full row, optionally guarded by a condition.
    async fn put(&self, table: &str, item: Row, condition: Option<Condition>)
        -> Result<(), StoreError>;

    /// Rows matching the spec.
    async fn query(&self, table: &str, spec: QuerySpec) -> Result<Vec<Row>, StoreError>;

    /// Post-filter row count (`SELECT COUNT`).
    async fn count(&self, table: &str, spec: QuerySpec) -> Result<usize, StoreError>;

    /// Delete one row. Deleting an absent row is not an error.
    async fn delete(&self, table: &str, key: RowKey) -> Result<(), StoreError>;

    /// Apply a batch of unconditional puts and deletes.
    async fn batch_write(&self, table: &str, writes: Vec<BatchWrite>) -> Result<(), StoreError>;
}
