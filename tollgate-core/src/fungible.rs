//! Fungible token accounting: a sliding-window token bucket per
//! (resource, account), stored as one row and driven entirely by conditional
//! writes.
//!
//! A token is taken by conditionally decrementing the balance; a rejected
//! update is the rate limit. One of three conditions must hold for the
//! decrement to apply:
//!
//! 1. The balance is greater than 0.
//! 2. More than one token's worth of wall time has passed since the last
//!    successful consume. This failsafe keeps clients admitted when refills
//!    have been lost; keying it on `lastToken` rather than `lastRefill`
//!    means a stretch of failed refills unlocks one token per interval, not
//!    unlimited consumption.
//! 3. The `tokens` attribute does not exist, meaning the bucket row has not
//!    been created yet.
//!
//! After a successful consume the manager adds back the tokens accumulated
//! since the last refill, conditioned on `lastRefill` still being older than
//! this call's timestamp so stale refills lose. Refill is best-effort: the
//! consume already counted, so refill failures are logged and swallowed and
//! the next acquirer repairs the balance.

use std::sync::Arc;

use tracing::warn;

use crate::clock::now_utc_ms;
use crate::error::RateLimitError;
use crate::limits::{LimitDirectory, ResourceLimit};
use crate::store::{columns, get_n, Assign, AttrValue, Condition, Row, RowKey, StoreError, StoreGateway};

/// Token-bucket state machine for a single resource.
pub struct FungibleTokenManager<S> {
    store: Arc<S>,
    limits: LimitDirectory<S>,
    token_table: String,
    resource_name: String,
}

impl<S: StoreGateway> FungibleTokenManager<S> {
    pub fn new(
        store: Arc<S>,
        token_table: impl Into<String>,
        limit_table: impl Into<String>,
        resource_name: impl Into<String>,
        default_limit: i64,
        default_window_sec: i64,
    ) -> Self {
        let resource_name = resource_name.into();
        let limits = LimitDirectory::new(
            Arc::clone(&store),
            limit_table,
            resource_name.clone(),
            ResourceLimit {
                limit: default_limit,
                window_sec: default_window_sec,
            },
        );
        Self {
            store,
            limits,
            token_table: token_table.into(),
            resource_name,
        }
    }

    /// Take one token on behalf of the account.
    ///
    /// Success returns quietly: not being rate limited is the result. Raises
    /// `CapacityExhausted` when the bucket is empty or the account is
    /// blacklisted, `Throttled` when the store itself is overloaded.
    pub async fn acquire(&self, account_id: &str) -> Result<(), RateLimitError> {
        self.acquire_at(account_id, now_utc_ms()).await
    }

    async fn acquire_at(&self, account_id: &str, exec_time_ms: i64) -> Result<(), RateLimitError> {
        let limit = self.limits.resolve(account_id).await?;
        let window_ms = limit.window_sec * 1000;
        let ms_per_token = (window_ms / limit.limit).max(1);

        let bucket = self.consume(account_id, exec_time_ms, ms_per_token).await?;

        let current_tokens = get_n(&bucket, columns::TOKENS).unwrap_or(0);
        let last_refill = get_n(&bucket, columns::LAST_REFILL).unwrap_or(0);
        let refill_tokens = compute_refill_amount(
            current_tokens,
            exec_time_ms - last_refill,
            limit.limit,
            window_ms,
        );
        self.refill(account_id, refill_tokens, exec_time_ms).await;
        Ok(())
    }

    /// Conditionally take a token and return the bucket's new state.
    async fn consume(
        &self,
        account_id: &str,
        exec_time_ms: i64,
        ms_per_token: i64,
    ) -> Result<Row, RateLimitError> {
        let update = vec![
            Assign::Add(columns::TOKENS, -1),
            Assign::Set(columns::LAST_TOKEN, AttrValue::N(exec_time_ms)),
        ];
        let condition = Condition::Or(vec![
            Condition::Gt(columns::TOKENS, AttrValue::N(0)),
            Condition::Lt(columns::LAST_TOKEN, AttrValue::N(exec_time_ms - ms_per_token)),
            Condition::NotExists(columns::TOKENS),
        ]);

        match self
            .store
            .update(&self.token_table, self.bucket_key(account_id), update, Some(condition))
            .await
        {
            Ok(row) => Ok(row),
            Err(StoreError::PreconditionFailed) => Err(RateLimitError::CapacityExhausted(
                format!("{}:{}", self.resource_name, account_id),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Write back the accumulated balance. Failures are swallowed: a stale
    /// refill must not overwrite a newer one, and the consume has already
    /// counted.
    async fn refill(&self, account_id: &str, tokens: i64, refill_time_ms: i64) {
        let update = vec![
            Assign::Set(columns::TOKENS, AttrValue::N(tokens)),
            Assign::Set(columns::LAST_REFILL, AttrValue::N(refill_time_ms)),
        ];
        let condition = Condition::Or(vec![
            Condition::Lt(columns::LAST_REFILL, AttrValue::N(refill_time_ms)),
            Condition::NotExists(columns::LAST_REFILL),
        ]);

        match self
            .store
            .update(&self.token_table, self.bucket_key(account_id), update, Some(condition))
            .await
        {
            Ok(_) => {}
            Err(StoreError::PreconditionFailed) => {
                warn!(
                    resource = %self.resource_name,
                    account = %account_id,
                    "skipping refill, another writer applied more current state"
                );
            }
            Err(err) => {
                warn!(
                    resource = %self.resource_name,
                    account = %account_id,
                    error = %err,
                    "failed to refill bucket"
                );
            }
        }
    }

    fn bucket_key(&self, account_id: &str) -> RowKey {
        RowKey::new(
            columns::RESOURCE_NAME,
            self.resource_name.as_str(),
            columns::ACCOUNT_ID,
            account_id,
        )
    }
}

/// Tokens the bucket holds after adding everything accumulated since the
/// last refill, capped at `limit - 1` (this call's token is already spent).
///
/// The balance can be negative right after bucket creation or after a
/// prolonged refill outage; accumulation starts from 0 in that case.
fn compute_refill_amount(current_tokens: i64, elapsed_ms: i64, limit: i64, window_ms: i64) -> i64 {
    let tokens = current_tokens.max(0);
    let tokens_per_ms = limit as f64 / window_ms as f64;
    let accumulated = (tokens_per_ms * elapsed_ms as f64) as i64;
    (tokens + accumulated).min(limit - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;

    const TOKENS_TABLE: &str = "fungible-tokens";
    const LIMITS_TABLE: &str = "limits";

    const LIMIT: i64 = 10;
    const WINDOW_SEC: i64 = 100;
    const WINDOW_MS: i64 = WINDOW_SEC * 1000;
    const MS_PER_TOKEN: i64 = WINDOW_MS / LIMIT;

    fn manager() -> (Arc<MemoryGateway>, FungibleTokenManager<MemoryGateway>) {
        let gw = Arc::new(MemoryGateway::new());
        gw.create_table(TOKENS_TABLE, columns::RESOURCE_NAME, columns::ACCOUNT_ID);
        gw.create_table(LIMITS_TABLE, columns::RESOURCE_NAME, columns::ACCOUNT_ID);
        let manager = FungibleTokenManager::new(
            Arc::clone(&gw),
            TOKENS_TABLE,
            LIMITS_TABLE,
            "emr",
            LIMIT,
            WINDOW_SEC,
        );
        (gw, manager)
    }

    fn bucket_key(account: &str) -> RowKey {
        RowKey::new(columns::RESOURCE_NAME, "emr", columns::ACCOUNT_ID, account)
    }

    async fn seed_bucket(gw: &MemoryGateway, account: &str, tokens: i64, last_refill: i64, last_token: i64) {
        gw.update(
            TOKENS_TABLE,
            bucket_key(account),
            vec![
                Assign::Set(columns::TOKENS, AttrValue::N(tokens)),
                Assign::Set(columns::LAST_REFILL, AttrValue::N(last_refill)),
                Assign::Set(columns::LAST_TOKEN, AttrValue::N(last_token)),
            ],
            None,
        )
        .await
        .unwrap();
    }

    #[test]
    fn refill_accumulates_since_last_refill() {
        // 10 tokens per 100s, 5 on hand, 30s since refill: 5 + 3 = 8.
        assert_eq!(compute_refill_amount(5, 30_000, LIMIT, WINDOW_MS), 8);
    }

    #[test]
    fn refill_clamps_to_limit_minus_one() {
        // 1_530_111_500_000 - 1_530_100_000_000 = 11_500_000 ms of lag.
        assert_eq!(compute_refill_amount(0, 11_500_000, LIMIT, WINDOW_MS), LIMIT - 1);
    }

    #[test]
    fn refill_starts_from_zero_on_negative_balance() {
        assert_eq!(compute_refill_amount(-7, 30_000, LIMIT, WINDOW_MS), 3);
    }

    #[tokio::test]
    async fn first_acquire_creates_the_bucket() {
        let (gw, manager) = manager();
        manager.acquire("acct-1").await.unwrap();

        let row = gw.get_row(TOKENS_TABLE, &bucket_key("acct-1")).unwrap();
        // Consume decremented to -1, then the refill wrote limit - 1.
        assert_eq!(get_n(&row, columns::TOKENS), Some(LIMIT - 1));
        assert!(get_n(&row, columns::LAST_REFILL).is_some());
        assert!(get_n(&row, columns::LAST_TOKEN).is_some());
    }

    #[tokio::test]
    async fn empty_bucket_with_recent_token_is_exhausted() {
        let (gw, manager) = manager();
        let now = now_utc_ms();
        seed_bucket(&gw, "acct-1", 0, now, now).await;

        let err = manager.acquire("acct-1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::CapacityExhausted(_)));
    }

    #[tokio::test]
    async fn failsafe_admits_after_one_token_interval() {
        let (gw, manager) = manager();
        let now = now_utc_ms();
        // Empty bucket, but the last consume was more than ms_per_token ago.
        seed_bucket(&gw, "acct-1", 0, now, now - MS_PER_TOKEN - 1).await;

        manager.acquire("acct-1").await.unwrap();
    }

    #[tokio::test]
    async fn drains_to_exhaustion_then_recovers_on_refill() {
        let (gw, manager) = manager();
        let now = now_utc_ms();
        // Freshly refilled full bucket: consume limit - 1 times, then the
        // next acquire must be rejected.
        seed_bucket(&gw, "acct-1", LIMIT - 1, now, now).await;

        for _ in 0..LIMIT - 1 {
            manager.acquire("acct-1").await.unwrap();
        }
        let err = manager.acquire("acct-1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::CapacityExhausted(_)));

        // A token's worth of wall time accrues one token.
        let row = gw.get_row(TOKENS_TABLE, &bucket_key("acct-1")).unwrap();
        let last_refill = get_n(&row, columns::LAST_REFILL).unwrap();
        seed_bucket(&gw, "acct-1", 0, last_refill - MS_PER_TOKEN, now - MS_PER_TOKEN - 1).await;
        manager.acquire("acct-1").await.unwrap();
    }

    #[tokio::test]
    async fn stale_refill_is_dropped() {
        let (gw, manager) = manager();
        let now = now_utc_ms();
        // lastRefill pinned in the future: the consume goes through on the
        // balance, but this call's refill write must lose.
        let future_refill = now + WINDOW_MS;
        seed_bucket(&gw, "acct-1", 5, future_refill, 0).await;

        manager.acquire("acct-1").await.unwrap();

        let row = gw.get_row(TOKENS_TABLE, &bucket_key("acct-1")).unwrap();
        assert_eq!(get_n(&row, columns::LAST_REFILL), Some(future_refill));
        assert_eq!(get_n(&row, columns::TOKENS), Some(4));
    }

    #[tokio::test]
    async fn blacklisted_account_is_rejected_regardless_of_bucket() {
        let (gw, manager) = manager();
        let now = now_utc_ms();
        seed_bucket(&gw, "acct-bad", LIMIT - 1, now, now).await;
        let limit_row = Row::from([
            (columns::RESOURCE_NAME.to_string(), AttrValue::S("emr".into())),
            (columns::ACCOUNT_ID.to_string(), AttrValue::S("acct-bad".into())),
            (columns::LIMIT.to_string(), AttrValue::N(0)),
            (columns::WINDOW_SEC.to_string(), AttrValue::N(WINDOW_SEC)),
        ]);
        gw.put(LIMITS_TABLE, limit_row, None).await.unwrap();

        let err = manager.acquire("acct-bad").await.unwrap_err();
        assert!(matches!(err, RateLimitError::CapacityExhausted(_)));
    }

    #[tokio::test]
    async fn per_account_limit_row_overrides_defaults() {
        let (gw, manager) = manager();
        let limit_row = Row::from([
            (columns::RESOURCE_NAME.to_string(), AttrValue::S("emr".into())),
            (columns::ACCOUNT_ID.to_string(), AttrValue::S("acct-small".into())),
            (columns::LIMIT.to_string(), AttrValue::N(2)),
            (columns::WINDOW_SEC.to_string(), AttrValue::N(WINDOW_SEC)),
        ]);
        gw.put(LIMITS_TABLE, limit_row, None).await.unwrap();

        // First acquire refills to limit - 1 = 1; the second drains it; the
        // third is rejected.
        manager.acquire("acct-small").await.unwrap();
        manager.acquire("acct-small").await.unwrap();
        let err = manager.acquire("acct-small").await.unwrap_err();
        assert!(matches!(err, RateLimitError::CapacityExhausted(_)));
    }
}
