//! Limit lookup and admission control.

use std::sync::Arc;

use crate::error::RateLimitError;
use crate::store::{columns, get_n, QuerySpec, StoreGateway};

/// Resolved quota for one (resource, account) pair.
///
/// `window_sec` is only meaningful for fungible limits; non-fungible callers
/// leave it at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimit {
    pub limit: i64,
    pub window_sec: i64,
}

/// Resolves (resource, account) to its configured limit.
///
/// Limit rows are written by the admin loader and read-only here. A missing
/// row means the caller's defaults apply; a resolved limit of 0 means the
/// account is blacklisted for the resource.
pub struct LimitDirectory<S> {
    store: Arc<S>,
    table: String,
    resource_name: String,
    defaults: ResourceLimit,
}

impl<S: StoreGateway> LimitDirectory<S> {
    pub fn new(
        store: Arc<S>,
        table: impl Into<String>,
        resource_name: impl Into<String>,
        defaults: ResourceLimit,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            resource_name: resource_name.into(),
            defaults,
        }
    }

    /// Look up the limit for one account.
    ///
    /// Raises `CapacityExhausted` when the resolved limit is 0 or below
    /// (blacklisted), `Throttled` when the store is overloaded.
    pub async fn resolve(&self, account_id: &str) -> Result<ResourceLimit, RateLimitError> {
        let spec = QuerySpec::partition(columns::RESOURCE_NAME, self.resource_name.as_str())
            .sort_eq(columns::ACCOUNT_ID, account_id);
        let rows = self.store.query(&self.table, spec).await?;

        let resolved = match rows.first() {
            Some(row) => ResourceLimit {
                limit: get_n(row, columns::LIMIT).unwrap_or(self.defaults.limit),
                window_sec: get_n(row, columns::WINDOW_SEC).unwrap_or(self.defaults.window_sec),
            },
            None => self.defaults,
        };

        if resolved.limit <= 0 {
            return Err(RateLimitError::CapacityExhausted(format!(
                "{}:{} (blacklisted)",
                self.resource_name, account_id
            )));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;
    use crate::store::{AttrValue, Row, StoreError};

    const LIMITS: &str = "limits";

    fn directory(store: Arc<MemoryGateway>) -> LimitDirectory<MemoryGateway> {
        LimitDirectory::new(
            store,
            LIMITS,
            "emr",
            ResourceLimit {
                limit: 10,
                window_sec: 100,
            },
        )
    }

    async fn store_with_limit(account: &str, limit: i64, window_sec: i64) -> Arc<MemoryGateway> {
        let gw = MemoryGateway::new();
        gw.create_table(LIMITS, columns::RESOURCE_NAME, columns::ACCOUNT_ID);
        let item = Row::from([
            (columns::RESOURCE_NAME.to_string(), AttrValue::S("emr".into())),
            (columns::ACCOUNT_ID.to_string(), AttrValue::S(account.into())),
            (columns::LIMIT.to_string(), AttrValue::N(limit)),
            (columns::WINDOW_SEC.to_string(), AttrValue::N(window_sec)),
            (columns::SERVICE_NAME.to_string(), AttrValue::S("analytics".into())),
        ]);
        gw.put(LIMITS, item, None).await.unwrap();
        Arc::new(gw)
    }

    #[tokio::test]
    async fn configured_row_wins_over_defaults() {
        let store = store_with_limit("acct-1", 25, 60).await;
        let resolved = directory(store).resolve("acct-1").await.unwrap();
        assert_eq!(
            resolved,
            ResourceLimit {
                limit: 25,
                window_sec: 60
            }
        );
    }

    #[tokio::test]
    async fn missing_row_falls_back_to_defaults() {
        let gw = Arc::new(MemoryGateway::new());
        gw.create_table(LIMITS, columns::RESOURCE_NAME, columns::ACCOUNT_ID);
        let resolved = directory(gw).resolve("acct-unknown").await.unwrap();
        assert_eq!(
            resolved,
            ResourceLimit {
                limit: 10,
                window_sec: 100
            }
        );
    }

    #[tokio::test]
    async fn zero_limit_is_blacklisted() {
        let store = store_with_limit("acct-bad", 0, 60).await;
        let err = directory(store).resolve("acct-bad").await.unwrap_err();
        assert!(matches!(err, RateLimitError::CapacityExhausted(_)));
    }

    #[tokio::test]
    async fn store_failure_wraps_as_store_error() {
        // No table created, so the query fails.
        let gw = Arc::new(MemoryGateway::new());
        let err = directory(gw).resolve("acct-1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Store(StoreError::Other(_))));
    }
}
