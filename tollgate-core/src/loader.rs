//! Admin loader for limit rows.
//!
//! Reads a service's limits from a JSON file and reconciles the limit table
//! against it: rows whose `configVersion` already matches are left alone,
//! rows missing from the file are deleted, and the rest are rewritten in one
//! batch.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::config::{
    resolve_table_name, LIMIT_SERVICE_INDEX_ENV_VAR, LIMIT_SERVICE_INDEX_SUFFIX,
    LIMIT_TABLE_ENV_VAR, LIMIT_TABLE_SUFFIX,
};
use crate::error::RateLimitError;
use crate::store::{
    columns, get_s, AttrValue, BatchWrite, Condition, QuerySpec, Row, RowKey, StoreGateway,
};

/// On-disk shape of a service's limits.
#[derive(Debug, Deserialize)]
pub struct LimitsFile {
    pub version: i64,
    pub limits: Vec<LimitEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitEntry {
    pub account_id: String,
    pub resource_name: String,
    pub limit: i64,
    #[serde(default)]
    pub window_sec: i64,
}

/// Reconcile the limit table with the limits file for one service.
///
/// Table and index names may be passed explicitly or resolved from the
/// environment (`LIMIT_TABLE`, `LIMIT_SERVICE_INDEX`, or the shared base
/// name).
pub async fn load_limits<S: StoreGateway>(
    store: &S,
    file_path: impl AsRef<Path>,
    service: &str,
    limit_table: Option<&str>,
    service_index: Option<&str>,
) -> Result<(), RateLimitError> {
    let table = resolve_table_name(limit_table, LIMIT_TABLE_ENV_VAR, LIMIT_TABLE_SUFFIX)?;
    let index = resolve_table_name(
        service_index,
        LIMIT_SERVICE_INDEX_ENV_VAR,
        LIMIT_SERVICE_INDEX_SUFFIX,
    )?;

    let file_path = file_path.as_ref();
    let contents = std::fs::read_to_string(file_path).map_err(|err| {
        RateLimitError::Config(format!(
            "cannot read limits file {}: {err}",
            file_path.display()
        ))
    })?;
    let parsed: LimitsFile = serde_json::from_str(&contents).map_err(|err| {
        RateLimitError::Config(format!(
            "malformed limits file {}: {err}",
            file_path.display()
        ))
    })?;

    // Only rows behind the file's version need touching.
    let outdated = store
        .query(
            &table,
            QuerySpec::partition(columns::SERVICE_NAME, service)
                .index(index)
                .filter(Condition::Ne(
                    columns::CONFIG_VERSION,
                    AttrValue::N(parsed.version),
                )),
        )
        .await?;
    if outdated.is_empty() {
        return Ok(());
    }

    // Index the fresh limits by account + resource to make the diff cheap.
    let mut fresh: HashMap<String, Row> = HashMap::new();
    for entry in parsed.limits {
        let key = format!("{}{}", entry.account_id, entry.resource_name);
        fresh.insert(key, limit_row(entry, service, parsed.version));
    }

    // Rows in the table but not in the file are gone from the service.
    let mut writes = Vec::new();
    for row in &outdated {
        let (Some(account_id), Some(resource_name)) = (
            get_s(row, columns::ACCOUNT_ID),
            get_s(row, columns::RESOURCE_NAME),
        ) else {
            continue;
        };
        if !fresh.contains_key(&format!("{account_id}{resource_name}")) {
            writes.push(BatchWrite::Delete(RowKey::new(
                columns::RESOURCE_NAME,
                resource_name,
                columns::ACCOUNT_ID,
                account_id,
            )));
        }
    }
    writes.extend(fresh.into_values().map(BatchWrite::Put));

    store.batch_write(&table, writes).await?;
    Ok(())
}

fn limit_row(entry: LimitEntry, service: &str, version: i64) -> Row {
    Row::from([
        (
            columns::RESOURCE_NAME.to_string(),
            AttrValue::S(entry.resource_name),
        ),
        (
            columns::ACCOUNT_ID.to_string(),
            AttrValue::S(entry.account_id),
        ),
        (columns::LIMIT.to_string(), AttrValue::N(entry.limit)),
        (columns::WINDOW_SEC.to_string(), AttrValue::N(entry.window_sec)),
        (
            columns::SERVICE_NAME.to_string(),
            AttrValue::S(service.to_string()),
        ),
        (
            columns::CONFIG_VERSION.to_string(),
            AttrValue::N(version),
        ),
    ])
}
