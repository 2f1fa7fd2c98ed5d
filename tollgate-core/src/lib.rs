//! Tollgate Core Library
//!
//! Distributed rate limiting over a transactional key-value store. Quotas
//! are enforced per (account, resource) with two limiter flavors sharing the
//! same infrastructure:
//!
//! - **Fungible**: a sliding-window token bucket. Up to `limit` tokens per
//!   `window_sec` seconds, consumed atomically and regenerated linearly.
//! - **Non-fungible**: at most `limit` simultaneously outstanding long-lived
//!   tokens, one per external resource instance, acquired through a
//!   reserve-then-promote handshake with TTL-based self-healing.
//!
//! All coordination is optimistic: conditional writes against the shared
//! store, no locks, no leases. The store itself sits behind the
//! [`StoreGateway`] trait. `tollgate-dynamo` implements it against DynamoDB,
//! and [`MemoryGateway`] implements it in-process for tests and local runs.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate_core::{MemoryGateway, NonFungibleLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tollgate_core::RateLimitError> {
//!     let store = Arc::new(MemoryGateway::new());
//!     let limiter =
//!         NonFungibleLimiter::new(store, "emr", 5, "non-fungible-tokens", "limits");
//!
//!     let reservation = limiter.acquire_reservation("acct-1234").await?;
//!     // ... launch the cluster ...
//!     reservation.promote("j-1YONHTCP3YZKC").await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod fungible;
pub mod limiter;
pub mod limits;
pub mod loader;
pub mod memory;
pub mod nonfungible;
pub mod store;

// Re-exports
pub use error::{RateLimitError, Result};
pub use fungible::FungibleTokenManager;
pub use limiter::{FungibleLimiter, NonFungibleLimiter};
pub use limits::{LimitDirectory, ResourceLimit};
pub use loader::{load_limits, LimitEntry, LimitsFile};
pub use memory::MemoryGateway;
pub use nonfungible::{
    NonFungibleTokenManager, ReservationState, TokenReservation, DEFAULT_TOKEN_TTL_SEC,
    RESERVATION_TTL_SEC,
};
pub use store::{
    columns, Assign, AttrValue, BatchWrite, Condition, QuerySpec, Row, RowKey, StoreError,
    StoreGateway,
};
