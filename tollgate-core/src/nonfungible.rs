//! Non-fungible token accounting: one long-lived token per external resource
//! instance, capped per (resource, account).
//!
//! Tokens are obtained in two phases. A short-lived reservation row is
//! written once the current holdings are counted under the cap; the caller
//! promotes it to a real token after the external resource id is known, or
//! cancels it. Abandoned reservations expire through the store's row TTL.
//!
//! The count and the create are two store calls, so two callers racing at
//! the boundary can both be admitted; the overshoot is bounded by the
//! number of concurrent callers and accepted.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::clock::now_utc_sec;
use crate::error::RateLimitError;
use crate::limits::{LimitDirectory, ResourceLimit};
use crate::store::{
    columns, Assign, AttrValue, Condition, QuerySpec, Row, RowKey, StoreError, StoreGateway,
};

/// Lifetime of an unpromoted reservation. Longer than any caller should
/// take between acquiring and learning the external resource id.
pub const RESERVATION_TTL_SEC: i64 = 300;

/// Token lifetime after promotion, unless the caller overrides it.
pub const DEFAULT_TOKEN_TTL_SEC: i64 = 28_800;

/// Admission counter and reservation issuer for a single resource.
pub struct NonFungibleTokenManager<S> {
    store: Arc<S>,
    limits: LimitDirectory<S>,
    token_table: String,
    resource_name: String,
}

impl<S: StoreGateway> NonFungibleTokenManager<S> {
    pub fn new(
        store: Arc<S>,
        token_table: impl Into<String>,
        limit_table: impl Into<String>,
        resource_name: impl Into<String>,
        default_limit: i64,
    ) -> Self {
        let resource_name = resource_name.into();
        let limits = LimitDirectory::new(
            Arc::clone(&store),
            limit_table,
            resource_name.clone(),
            ResourceLimit {
                limit: default_limit,
                window_sec: 0,
            },
        );
        Self {
            store,
            limits,
            token_table: token_table.into(),
            resource_name,
        }
    }

    /// Reserve one unit of quota for the account.
    ///
    /// Counts the account's live rows (reservations and promoted tokens
    /// alike) with a strongly consistent read, filtered on `expirationTime`
    /// because the store reclaims expired rows asynchronously.
    pub async fn acquire_reservation(
        &self,
        account_id: &str,
    ) -> Result<TokenReservation<S>, RateLimitError> {
        self.acquire_reservation_at(account_id, now_utc_sec()).await
    }

    async fn acquire_reservation_at(
        &self,
        account_id: &str,
        exec_time_sec: i64,
    ) -> Result<TokenReservation<S>, RateLimitError> {
        let limit = self.limits.resolve(account_id).await?;
        let coordinate = self.coordinate(account_id);

        let held = self.token_count(&coordinate, exec_time_sec).await?;
        if held as i64 >= limit.limit {
            return Err(RateLimitError::CapacityExhausted(format!(
                "{}:{}",
                self.resource_name, account_id
            )));
        }
        self.build_reservation(account_id, coordinate, exec_time_sec).await
    }

    async fn token_count(&self, coordinate: &str, exec_time_sec: i64) -> Result<usize, RateLimitError> {
        let spec = QuerySpec::partition(columns::RESOURCE_COORDINATE, coordinate)
            .filter(Condition::Gt(columns::EXPIRATION_TIME, AttrValue::N(exec_time_sec)))
            .consistent();
        Ok(self.store.count(&self.token_table, spec).await?)
    }

    async fn build_reservation(
        &self,
        account_id: &str,
        coordinate: String,
        exec_time_sec: i64,
    ) -> Result<TokenReservation<S>, RateLimitError> {
        let id = Uuid::new_v4().to_string();
        let item = Row::from([
            (columns::RESOURCE_COORDINATE.to_string(), AttrValue::S(coordinate.clone())),
            (columns::RESERVATION_ID.to_string(), AttrValue::S(id.clone())),
            (columns::RESOURCE_NAME.to_string(), AttrValue::S(self.resource_name.clone())),
            (columns::ACCOUNT_ID.to_string(), AttrValue::S(account_id.to_string())),
            (columns::RESOURCE_ID.to_string(), AttrValue::S(id.clone())),
            (
                columns::EXPIRATION_TIME.to_string(),
                AttrValue::N(exec_time_sec + RESERVATION_TTL_SEC),
            ),
        ]);
        self.store.put(&self.token_table, item, None).await?;

        Ok(TokenReservation {
            id,
            store: Arc::clone(&self.store),
            table: self.token_table.clone(),
            resource_name: self.resource_name.clone(),
            account_id: account_id.to_string(),
            coordinate,
            state: Arc::new(Mutex::new(ReservationState::Pending)),
        })
    }

    fn coordinate(&self, account_id: &str) -> String {
        format!("{}:{}", self.resource_name, account_id)
    }
}

/// Where a reservation is in its lifecycle. At most one of promote and
/// cancel ever takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Pending,
    Promoted,
    Cancelled,
}

/// Handle owning one reservation row until it is promoted or cancelled.
///
/// The handle is cheaply cloneable; clones share the lifecycle state. It is
/// meant for a single logical caller; promotion transfers ownership of the
/// row to the termination-event pipeline.
pub struct TokenReservation<S> {
    id: String,
    store: Arc<S>,
    table: String,
    resource_name: String,
    account_id: String,
    coordinate: String,
    state: Arc<Mutex<ReservationState>>,
}

impl<S> std::fmt::Debug for TokenReservation<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenReservation")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("resource_name", &self.resource_name)
            .field("account_id", &self.account_id)
            .field("coordinate", &self.coordinate)
            .field("state", &self.state)
            .finish()
    }
}

impl<S> Clone for TokenReservation<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            store: Arc::clone(&self.store),
            table: self.table.clone(),
            resource_name: self.resource_name.clone(),
            account_id: self.account_id.clone(),
            coordinate: self.coordinate.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: StoreGateway> TokenReservation<S> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn coordinate(&self) -> &str {
        &self.coordinate
    }

    pub fn state(&self) -> ReservationState {
        *self.state.lock()
    }

    /// Promote with the default 8-hour token lifetime.
    pub async fn promote(&self, resource_id: &str) -> Result<(), RateLimitError> {
        self.promote_with_ttl(resource_id, DEFAULT_TOKEN_TTL_SEC).await
    }

    /// Turn the reservation into a long-lived token for the given external
    /// resource: rewrite `resourceId` and extend the expiration.
    ///
    /// Raises `ReservationNotFound` when the row has already expired or been
    /// deleted, `InvalidState` when this handle was already promoted or
    /// cancelled.
    pub async fn promote_with_ttl(&self, resource_id: &str, ttl_sec: i64) -> Result<(), RateLimitError> {
        match self.state() {
            ReservationState::Pending => {}
            ReservationState::Promoted => {
                return Err(RateLimitError::InvalidState(format!(
                    "token already created from reservation {}",
                    self.id
                )))
            }
            ReservationState::Cancelled => {
                return Err(RateLimitError::InvalidState(format!(
                    "reservation {} has been cancelled",
                    self.id
                )))
            }
        }

        let update = vec![
            Assign::Set(columns::EXPIRATION_TIME, AttrValue::N(now_utc_sec() + ttl_sec)),
            Assign::Set(columns::RESOURCE_ID, AttrValue::S(resource_id.to_string())),
        ];
        let condition = Condition::Exists(columns::RESOURCE_COORDINATE);

        match self
            .store
            .update(&self.table, self.row_key(), update, Some(condition))
            .await
        {
            Ok(_) => {
                *self.state.lock() = ReservationState::Promoted;
                Ok(())
            }
            Err(StoreError::PreconditionFailed) => Err(RateLimitError::ReservationNotFound(
                format!(
                    "{} for {}:{}, possibly expired",
                    self.id, self.resource_name, self.account_id
                ),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Release the reservation without creating a token. After promotion (or
    /// a previous cancel) this is a warning no-op: the row now belongs to
    /// the termination pipeline.
    pub async fn cancel(&self) -> Result<(), RateLimitError> {
        match self.state() {
            ReservationState::Promoted => {
                warn!(reservation = %self.id, "ignoring cancel, a token was already created");
                return Ok(());
            }
            ReservationState::Cancelled => {
                warn!(reservation = %self.id, "ignoring cancel, reservation already cancelled");
                return Ok(());
            }
            ReservationState::Pending => {}
        }

        self.store.delete(&self.table, self.row_key()).await?;
        *self.state.lock() = ReservationState::Cancelled;
        Ok(())
    }

    fn row_key(&self) -> RowKey {
        RowKey::new(
            columns::RESOURCE_COORDINATE,
            self.coordinate.as_str(),
            columns::RESERVATION_ID,
            self.id.as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGateway;
    use crate::store::get_s;

    const TOKENS_TABLE: &str = "non-fungible-tokens";
    const LIMITS_TABLE: &str = "limits";
    const LIMIT: i64 = 5;

    fn manager() -> (Arc<MemoryGateway>, NonFungibleTokenManager<MemoryGateway>) {
        let gw = Arc::new(MemoryGateway::new());
        gw.create_table(TOKENS_TABLE, columns::RESOURCE_COORDINATE, columns::RESERVATION_ID);
        gw.create_table(LIMITS_TABLE, columns::RESOURCE_NAME, columns::ACCOUNT_ID);
        let manager = NonFungibleTokenManager::new(
            Arc::clone(&gw),
            TOKENS_TABLE,
            LIMITS_TABLE,
            "emr",
            LIMIT,
        );
        (gw, manager)
    }

    async fn seed_token(gw: &MemoryGateway, coordinate: &str, reservation_id: &str, expires: i64) {
        let item = Row::from([
            (columns::RESOURCE_COORDINATE.to_string(), AttrValue::S(coordinate.into())),
            (columns::RESERVATION_ID.to_string(), AttrValue::S(reservation_id.into())),
            (columns::RESOURCE_NAME.to_string(), AttrValue::S("emr".into())),
            (columns::ACCOUNT_ID.to_string(), AttrValue::S("acct-1".into())),
            (columns::RESOURCE_ID.to_string(), AttrValue::S(reservation_id.into())),
            (columns::EXPIRATION_TIME.to_string(), AttrValue::N(expires)),
        ]);
        gw.put(TOKENS_TABLE, item, None).await.unwrap();
    }

    #[tokio::test]
    async fn reservation_writes_one_row() {
        let (gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();

        assert_eq!(reservation.state(), ReservationState::Pending);
        assert_eq!(reservation.coordinate(), "emr:acct-1");
        assert_eq!(gw.row_count(TOKENS_TABLE), 1);

        let row = gw
            .get_row(
                TOKENS_TABLE,
                &RowKey::new(
                    columns::RESOURCE_COORDINATE,
                    "emr:acct-1",
                    columns::RESERVATION_ID,
                    reservation.id(),
                ),
            )
            .unwrap();
        assert_eq!(get_s(&row, columns::RESOURCE_ID), Some(reservation.id()));
        let expires = crate::store::get_n(&row, columns::EXPIRATION_TIME).unwrap();
        assert!(expires > now_utc_sec());
        assert!(expires <= now_utc_sec() + RESERVATION_TTL_SEC);
    }

    #[tokio::test]
    async fn admission_boundary_at_limit() {
        let (gw, manager) = manager();
        let now = now_utc_sec();
        for i in 0..LIMIT {
            seed_token(&gw, "emr:acct-1", &format!("res-{i}"), now + 10_000).await;
        }

        let err = manager.acquire_reservation("acct-1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::CapacityExhausted(_)));

        // Freeing one token frees exactly one admission.
        gw.delete(
            TOKENS_TABLE,
            RowKey::new(
                columns::RESOURCE_COORDINATE,
                "emr:acct-1",
                columns::RESERVATION_ID,
                "res-0",
            ),
        )
        .await
        .unwrap();
        manager.acquire_reservation("acct-1").await.unwrap();
    }

    #[tokio::test]
    async fn expired_rows_do_not_count_against_the_cap() {
        let (gw, manager) = manager();
        let now = now_utc_sec();
        // TTL reclamation lags: expired rows are still visible.
        for i in 0..LIMIT {
            seed_token(&gw, "emr:acct-1", &format!("stale-{i}"), now - 1).await;
        }

        manager.acquire_reservation("acct-1").await.unwrap();
        assert_eq!(gw.row_count(TOKENS_TABLE), LIMIT as usize + 1);
    }

    #[tokio::test]
    async fn promote_rewrites_resource_id_and_extends_ttl() {
        let (gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();

        reservation.promote("j-1YONHTCP3YZKC").await.unwrap();
        assert_eq!(reservation.state(), ReservationState::Promoted);

        let row = gw
            .get_row(
                TOKENS_TABLE,
                &RowKey::new(
                    columns::RESOURCE_COORDINATE,
                    "emr:acct-1",
                    columns::RESERVATION_ID,
                    reservation.id(),
                ),
            )
            .unwrap();
        assert_eq!(get_s(&row, columns::RESOURCE_ID), Some("j-1YONHTCP3YZKC"));
        let expires = crate::store::get_n(&row, columns::EXPIRATION_TIME).unwrap();
        assert!(expires > now_utc_sec() + 28_000);
    }

    #[tokio::test]
    async fn promote_twice_is_invalid() {
        let (_gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();

        reservation.promote("j-1").await.unwrap();
        let err = reservation.promote("j-2").await.unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidState(_)));
    }

    #[tokio::test]
    async fn promote_after_cancel_is_invalid() {
        let (_gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();

        reservation.cancel().await.unwrap();
        let err = reservation.promote("j-1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidState(_)));
    }

    #[tokio::test]
    async fn cancel_after_promote_is_a_noop() {
        let (gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();

        reservation.promote("j-1").await.unwrap();
        reservation.cancel().await.unwrap();

        // The token row survives for the termination pipeline.
        assert_eq!(gw.row_count(TOKENS_TABLE), 1);
        assert_eq!(reservation.state(), ReservationState::Promoted);
    }

    #[tokio::test]
    async fn cancel_deletes_the_row() {
        let (gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();
        assert_eq!(gw.row_count(TOKENS_TABLE), 1);

        reservation.cancel().await.unwrap();
        assert_eq!(gw.row_count(TOKENS_TABLE), 0);
        assert_eq!(reservation.state(), ReservationState::Cancelled);
    }

    #[tokio::test]
    async fn promote_expired_reservation_is_not_found() {
        let (gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();

        // The store's TTL reclaimed the row out from under the handle.
        gw.delete(
            TOKENS_TABLE,
            RowKey::new(
                columns::RESOURCE_COORDINATE,
                "emr:acct-1",
                columns::RESERVATION_ID,
                reservation.id(),
            ),
        )
        .await
        .unwrap();

        let err = reservation.promote("j-1").await.unwrap_err();
        assert!(matches!(err, RateLimitError::ReservationNotFound(_)));
        assert_eq!(reservation.state(), ReservationState::Pending);
    }

    #[tokio::test]
    async fn clones_share_lifecycle_state() {
        let (_gw, manager) = manager();
        let reservation = manager.acquire_reservation("acct-1").await.unwrap();
        let clone = reservation.clone();

        clone.promote("j-1").await.unwrap();
        assert_eq!(reservation.state(), ReservationState::Promoted);
    }
}
