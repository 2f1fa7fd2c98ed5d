//! UTC epoch clock helpers.
//!
//! Fungible buckets keep millisecond timestamps; non-fungible expirations are
//! epoch seconds, matching the store's TTL attribute.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_utc_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

pub fn now_utc_sec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}
