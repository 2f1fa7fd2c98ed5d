//! Table-name resolution.
//!
//! Every component that touches a table accepts an explicit name. When none
//! is given, the per-table environment variable is consulted, and finally a
//! shared base name with a fixed per-table suffix. Construction fails when
//! nothing resolves.

use crate::error::RateLimitError;

/// Base-name variable the per-table suffixes are appended to.
pub const TABLE_BASE_ENV_VAR: &str = "LIMITER_TABLES_BASE_NAME";

pub const FUNGIBLE_TABLE_ENV_VAR: &str = "FUNGIBLE_TABLE";
pub const NON_FUNGIBLE_TABLE_ENV_VAR: &str = "NON_FUNGIBLE_TABLE";
pub const LIMIT_TABLE_ENV_VAR: &str = "LIMIT_TABLE";
pub const LIMIT_SERVICE_INDEX_ENV_VAR: &str = "LIMIT_SERVICE_INDEX";
pub const NON_FUNGIBLE_RES_INDEX_ENV_VAR: &str = "NON_FUNGIBLE_RES_INDEX";

pub const FUNGIBLE_TABLE_SUFFIX: &str = "fungible-tokens";
pub const NON_FUNGIBLE_TABLE_SUFFIX: &str = "non-fungible-tokens";
pub const LIMIT_TABLE_SUFFIX: &str = "limits";
pub const LIMIT_SERVICE_INDEX_SUFFIX: &str = "limits-service-index";
pub const NON_FUNGIBLE_RES_INDEX_SUFFIX: &str = "resource-index";

/// Resolve a table (or index) name.
///
/// Order: the explicit value, the named environment variable, then
/// `LIMITER_TABLES_BASE_NAME` plus the suffix (a trailing `-` on the base is
/// optional).
pub fn resolve_table_name(
    explicit: Option<&str>,
    env_var: &str,
    suffix: &str,
) -> Result<String, RateLimitError> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    if let Ok(name) = std::env::var(env_var) {
        return Ok(name);
    }
    if let Ok(base) = std::env::var(TABLE_BASE_ENV_VAR) {
        let base = if base.ends_with('-') { base } else { format!("{base}-") };
        return Ok(format!("{base}{suffix}"));
    }
    Err(RateLimitError::Config(format!(
        "no table name resolved: pass one explicitly, set {env_var}, or set {TABLE_BASE_ENV_VAR}"
    )))
}
