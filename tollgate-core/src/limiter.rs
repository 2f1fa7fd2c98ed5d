//! Top-level limiter facades.
//!
//! Thin glue over the token managers: construction (explicit table names or
//! environment resolution) plus the `acquire` / `acquire_reservation`
//! primitives call sites use.

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::config::{
    resolve_table_name, FUNGIBLE_TABLE_ENV_VAR, FUNGIBLE_TABLE_SUFFIX, LIMIT_TABLE_ENV_VAR,
    LIMIT_TABLE_SUFFIX, NON_FUNGIBLE_TABLE_ENV_VAR, NON_FUNGIBLE_TABLE_SUFFIX,
};
use crate::error::RateLimitError;
use crate::fungible::FungibleTokenManager;
use crate::nonfungible::{NonFungibleTokenManager, TokenReservation};
use crate::store::StoreGateway;

/// Sliding-window admission for interchangeable work units.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tollgate_core::{FungibleLimiter, MemoryGateway};
///
/// # async fn example() -> Result<(), tollgate_core::RateLimitError> {
/// let store = Arc::new(MemoryGateway::new());
/// let limiter = FungibleLimiter::new(store, "emr", 10, 100, "fungible-tokens", "limits");
/// limiter.acquire("acct-1234").await?;
/// // Not being rate limited is the success path; run the work now.
/// # Ok(())
/// # }
/// ```
pub struct FungibleLimiter<S> {
    manager: FungibleTokenManager<S>,
}

impl<S: StoreGateway> FungibleLimiter<S> {
    pub fn new(
        store: Arc<S>,
        resource_name: impl Into<String>,
        default_limit: i64,
        default_window_sec: i64,
        token_table: impl Into<String>,
        limit_table: impl Into<String>,
    ) -> Self {
        Self {
            manager: FungibleTokenManager::new(
                store,
                token_table,
                limit_table,
                resource_name,
                default_limit,
                default_window_sec,
            ),
        }
    }

    /// Construct with table names resolved from the environment.
    pub fn from_env(
        store: Arc<S>,
        resource_name: impl Into<String>,
        default_limit: i64,
        default_window_sec: i64,
    ) -> Result<Self, RateLimitError> {
        let token_table =
            resolve_table_name(None, FUNGIBLE_TABLE_ENV_VAR, FUNGIBLE_TABLE_SUFFIX)?;
        let limit_table = resolve_table_name(None, LIMIT_TABLE_ENV_VAR, LIMIT_TABLE_SUFFIX)?;
        Ok(Self::new(
            store,
            resource_name,
            default_limit,
            default_window_sec,
            token_table,
            limit_table,
        ))
    }

    /// Admit one unit of work, or raise `CapacityExhausted`.
    pub async fn acquire(&self, account_id: &str) -> Result<(), RateLimitError> {
        self.manager.acquire(account_id).await
    }
}

/// Capped admission for long-lived, one-per-resource tokens.
pub struct NonFungibleLimiter<S> {
    manager: NonFungibleTokenManager<S>,
}

impl<S: StoreGateway> NonFungibleLimiter<S> {
    pub fn new(
        store: Arc<S>,
        resource_name: impl Into<String>,
        default_limit: i64,
        token_table: impl Into<String>,
        limit_table: impl Into<String>,
    ) -> Self {
        Self {
            manager: NonFungibleTokenManager::new(
                store,
                token_table,
                limit_table,
                resource_name,
                default_limit,
            ),
        }
    }

    /// Construct with table names resolved from the environment.
    pub fn from_env(
        store: Arc<S>,
        resource_name: impl Into<String>,
        default_limit: i64,
    ) -> Result<Self, RateLimitError> {
        let token_table =
            resolve_table_name(None, NON_FUNGIBLE_TABLE_ENV_VAR, NON_FUNGIBLE_TABLE_SUFFIX)?;
        let limit_table = resolve_table_name(None, LIMIT_TABLE_ENV_VAR, LIMIT_TABLE_SUFFIX)?;
        Ok(Self::new(
            store,
            resource_name,
            default_limit,
            token_table,
            limit_table,
        ))
    }

    /// Reserve quota ahead of creating the external resource.
    pub async fn acquire_reservation(
        &self,
        account_id: &str,
    ) -> Result<TokenReservation<S>, RateLimitError> {
        self.manager.acquire_reservation(account_id).await
    }

    /// Scoped acquisition: reserve, run the caller's future with a handle
    /// clone, and cancel the reservation if it fails.
    ///
    /// On success the reservation is left as the caller's future put it:
    /// promoted tokens belong to the termination pipeline, unpromoted ones
    /// fall to the reservation TTL.
    pub async fn with_reservation<T, F, Fut>(
        &self,
        account_id: &str,
        f: F,
    ) -> Result<T, RateLimitError>
    where
        F: FnOnce(TokenReservation<S>) -> Fut,
        Fut: Future<Output = Result<T, RateLimitError>>,
    {
        let reservation = self.acquire_reservation(account_id).await?;
        match f(reservation.clone()).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Err(cancel_err) = reservation.cancel().await {
                    warn!(
                        reservation = %reservation.id(),
                        error = %cancel_err,
                        "failed to cancel reservation while unwinding"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;
    use crate::nonfungible::ReservationState;
    use crate::store::columns;

    const FUNGIBLE_TABLE: &str = "fungible-tokens";
    const NON_FUNGIBLE_TABLE: &str = "non-fungible-tokens";
    const LIMITS_TABLE: &str = "limits";

    fn store() -> Arc<MemoryGateway> {
        let gw = MemoryGateway::new();
        gw.create_table(FUNGIBLE_TABLE, columns::RESOURCE_NAME, columns::ACCOUNT_ID);
        gw.create_table(NON_FUNGIBLE_TABLE, columns::RESOURCE_COORDINATE, columns::RESERVATION_ID);
        gw.create_table(LIMITS_TABLE, columns::RESOURCE_NAME, columns::ACCOUNT_ID);
        Arc::new(gw)
    }

    #[tokio::test]
    async fn fungible_facade_admits_work() {
        let limiter = FungibleLimiter::new(store(), "emr", 10, 100, FUNGIBLE_TABLE, LIMITS_TABLE);
        limiter.acquire("acct-1").await.unwrap();
    }

    #[tokio::test]
    async fn with_reservation_keeps_promoted_token_on_success() {
        let gw = store();
        let limiter =
            NonFungibleLimiter::new(Arc::clone(&gw), "emr", 5, NON_FUNGIBLE_TABLE, LIMITS_TABLE);

        let state = limiter
            .with_reservation("acct-1", |reservation| async move {
                reservation.promote("j-123").await?;
                Ok(reservation.state())
            })
            .await
            .unwrap();

        assert_eq!(state, ReservationState::Promoted);
        assert_eq!(gw.row_count(NON_FUNGIBLE_TABLE), 1);
    }

    #[tokio::test]
    async fn with_reservation_cancels_on_error() {
        let gw = store();
        let limiter =
            NonFungibleLimiter::new(Arc::clone(&gw), "emr", 5, NON_FUNGIBLE_TABLE, LIMITS_TABLE);

        let err = limiter
            .with_reservation("acct-1", |_reservation| async move {
                Err::<(), _>(RateLimitError::InvalidEvent("launch failed".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RateLimitError::InvalidEvent(_)));
        assert_eq!(gw.row_count(NON_FUNGIBLE_TABLE), 0);
    }

    #[tokio::test]
    async fn with_reservation_propagates_capacity_exhausted() {
        let gw = store();
        let limiter =
            NonFungibleLimiter::new(Arc::clone(&gw), "emr", 1, NON_FUNGIBLE_TABLE, LIMITS_TABLE);
        let _held = limiter.acquire_reservation("acct-1").await.unwrap();

        let err = limiter
            .with_reservation("acct-1", |_reservation| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::CapacityExhausted(_)));
    }
}
