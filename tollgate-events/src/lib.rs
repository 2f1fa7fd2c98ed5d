//! Termination-event processing for non-fungible tokens.
//!
//! Promoted tokens represent live external resources. When a resource goes
//! away, the bus delivers a termination event; this crate translates it into
//! deletion of the matching token row so quota frees up ahead of the TTL.
//!
//! An [`EventProcessorManager`] routes each event by source (and optionally
//! detail-type) to an [`EventProcessor`], which validates the payload with a
//! [`ProcessorPredicate`] tree and extracts the external resource id. The id
//! is looked up through the token table's `resourceId` index and the row is
//! deleted. Processing is best effort and idempotent per manager.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tollgate_core::MemoryGateway;
//! use tollgate_events::{emr_cluster_processor, EventProcessorManager};
//!
//! # async fn example() -> Result<(), tollgate_core::RateLimitError> {
//! let store = Arc::new(MemoryGateway::new());
//! let manager = EventProcessorManager::new(store, Some("non-fungible-tokens"), Some("resource-index"))?
//!     .with_processor(emr_cluster_processor());
//!
//! let event = json!({
//!     "source": "aws.emr",
//!     "detail": {"clusterId": "j-1YONHTCP3YZKC", "state": "TERMINATED"}
//! });
//! manager.process(&event).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;
use tracing::{info, warn};

use tollgate_core::config::{
    resolve_table_name, NON_FUNGIBLE_RES_INDEX_ENV_VAR, NON_FUNGIBLE_RES_INDEX_SUFFIX,
    NON_FUNGIBLE_TABLE_ENV_VAR, NON_FUNGIBLE_TABLE_SUFFIX,
};
use tollgate_core::store::get_s;
use tollgate_core::{columns, QuerySpec, RateLimitError, Row, RowKey, StoreGateway};

// ============================================================================
// FIELD PATHS & PREDICATES
// ============================================================================

/// Parsed dotted path into an event payload, e.g. `detail.clusterId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(path: &str) -> Self {
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }

    /// Descend the payload segment by segment. `None` when any hop is
    /// missing or not an object.
    pub fn lookup<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(event, |value, segment| value.as_object()?.get(segment))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        FieldPath::new(path)
    }
}

type PredicateFn = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// One node of a predicate tree over an event payload.
///
/// The node's own result is its test applied to the value at `key` (false
/// when the path is missing), combined with child predicates: a non-empty
/// conjunctive list is AND-folded when the own result is true; otherwise a
/// non-empty disjunctive list is OR-folded when the own result is false.
/// When both lists are populated the conjunctive fold wins.
pub struct ProcessorPredicate {
    key: FieldPath,
    test_fn: PredicateFn,
    and_preds: Vec<ProcessorPredicate>,
    or_preds: Vec<ProcessorPredicate>,
}

impl ProcessorPredicate {
    pub fn new(key: impl Into<FieldPath>, test_fn: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Self {
            key: key.into(),
            test_fn: Box::new(test_fn),
            and_preds: Vec::new(),
            or_preds: Vec::new(),
        }
    }

    /// Add a conjunctive child.
    pub fn with_and(mut self, pred: ProcessorPredicate) -> Self {
        self.and_preds.push(pred);
        self
    }

    /// Add a disjunctive child.
    pub fn with_or(mut self, pred: ProcessorPredicate) -> Self {
        self.or_preds.push(pred);
        self
    }

    /// Evaluate the whole tree against an event.
    pub fn test(&self, event: &Value) -> bool {
        let own = self
            .key
            .lookup(event)
            .map(|value| (self.test_fn)(value))
            .unwrap_or(false);

        if !self.and_preds.is_empty() && own {
            self.and_preds.iter().all(|pred| pred.test(event))
        } else if !self.or_preds.is_empty() && !own {
            self.or_preds.iter().any(|pred| pred.test(event))
        } else {
            own
        }
    }
}

impl fmt::Debug for ProcessorPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorPredicate")
            .field("key", &self.key)
            .field("and_preds", &self.and_preds)
            .field("or_preds", &self.or_preds)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// EVENT PROCESSORS
// ============================================================================

/// Validates one event shape and extracts its resource id.
#[derive(Debug)]
pub struct EventProcessor {
    source: String,
    id_path: FieldPath,
    predicate: Option<ProcessorPredicate>,
    detail_type: Option<String>,
}

impl EventProcessor {
    pub fn new(source: impl Into<String>, id_path: impl Into<FieldPath>) -> Self {
        Self {
            source: source.into(),
            id_path: id_path.into(),
            predicate: None,
            detail_type: None,
        }
    }

    /// Gate extraction on a predicate tree.
    pub fn with_predicate(mut self, predicate: ProcessorPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Narrow this processor to one event detail-type.
    pub fn with_detail_type(mut self, detail_type: impl Into<String>) -> Self {
        self.detail_type = Some(detail_type.into());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn detail_type(&self) -> Option<&str> {
        self.detail_type.as_deref()
    }

    /// The resource id, when the predicate (if any) accepts the event and
    /// the id path resolves to a string.
    pub fn test_and_get_id(&self, event: &Value) -> Option<String> {
        if let Some(predicate) = &self.predicate {
            if !predicate.test(event) {
                return None;
            }
        }
        self.id_path.lookup(event)?.as_str().map(str::to_string)
    }
}

/// EMR cluster terminations: any terminal cluster state releases the token.
pub fn emr_cluster_processor() -> EventProcessor {
    EventProcessor::new("aws.emr", "detail.clusterId").with_predicate(ProcessorPredicate::new(
        "detail.state",
        |state| state.as_str().is_some_and(|s| s.contains("TERMINATED")),
    ))
}

/// Batch job completions, success or failure.
pub fn batch_job_processor() -> EventProcessor {
    EventProcessor::new("aws.batch", "detail.jobId")
        .with_detail_type("Batch Job State Change")
        .with_predicate(ProcessorPredicate::new("detail.status", |status| {
            status
                .as_str()
                .is_some_and(|s| s == "SUCCEEDED" || s == "FAILED")
        }))
}

// ============================================================================
// MANAGER
// ============================================================================

/// Routes termination events to processors and deletes the tokens they name.
///
/// Routing key is `source`, refined to `source:detail-type` (lowercased,
/// whitespace stripped) when a processor declares a detail-type; the refined
/// key is preferred at lookup. Resource ids already handled by this manager
/// are skipped; the cache is a concurrent append-only set.
pub struct EventProcessorManager<S> {
    store: Arc<S>,
    table_name: String,
    index_name: String,
    processors: HashMap<String, EventProcessor>,
    processed: DashSet<String>,
}

impl<S: StoreGateway> EventProcessorManager<S> {
    /// Table and index names may be passed explicitly or resolved from the
    /// environment (`NON_FUNGIBLE_TABLE`, `NON_FUNGIBLE_RES_INDEX`, or the
    /// shared base name).
    pub fn new(
        store: Arc<S>,
        table_name: Option<&str>,
        index_name: Option<&str>,
    ) -> Result<Self, RateLimitError> {
        let table_name = resolve_table_name(
            table_name,
            NON_FUNGIBLE_TABLE_ENV_VAR,
            NON_FUNGIBLE_TABLE_SUFFIX,
        )?;
        let index_name = resolve_table_name(
            index_name,
            NON_FUNGIBLE_RES_INDEX_ENV_VAR,
            NON_FUNGIBLE_RES_INDEX_SUFFIX,
        )?;
        Ok(Self {
            store,
            table_name,
            index_name,
            processors: HashMap::new(),
            processed: DashSet::new(),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Register a processor, replacing any existing one for the same key.
    pub fn add_processor(&mut self, processor: EventProcessor) {
        let key = processor_key(processor.source(), processor.detail_type());
        self.processors.insert(key, processor);
    }

    /// Builder-style [`add_processor`](Self::add_processor).
    pub fn with_processor(mut self, processor: EventProcessor) -> Self {
        self.add_processor(processor);
        self
    }

    /// Remove the token row the event's resource maps to, if any.
    ///
    /// Raises `InvalidEvent` when the event has no `source`, and
    /// `UnknownSource` when no processor matches. An event the processor
    /// rejects, an already-seen id, or an id with no token row is quietly
    /// skipped.
    pub async fn process(&self, event: &Value) -> Result<(), RateLimitError> {
        let processor = self.processor_for(event)?;
        let Some(resource_id) = processor.test_and_get_id(event) else {
            return Ok(());
        };
        if self.processed.contains(&resource_id) {
            return Ok(());
        }

        match self.resource_token(&resource_id).await? {
            Some(token) => {
                let (Some(coordinate), Some(reservation_id)) = (
                    get_s(&token, columns::RESOURCE_COORDINATE),
                    get_s(&token, columns::RESERVATION_ID),
                ) else {
                    warn!(resource_id = %resource_id, "token row is missing its key attributes");
                    self.processed.insert(resource_id);
                    return Ok(());
                };
                info!(
                    source = %processor.source(),
                    resource_id = %resource_id,
                    table = %self.table_name,
                    "removing token"
                );
                let key = RowKey::new(
                    columns::RESOURCE_COORDINATE,
                    coordinate,
                    columns::RESERVATION_ID,
                    reservation_id,
                );
                self.store.delete(&self.table_name, key).await?;
            }
            None => {
                warn!(resource_id = %resource_id, "no token found for resource");
            }
        }
        self.processed.insert(resource_id);
        Ok(())
    }

    fn processor_for(&self, event: &Value) -> Result<&EventProcessor, RateLimitError> {
        let source = event
            .get("source")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RateLimitError::InvalidEvent(format!("source is a required field: {event}"))
            })?;
        let detail_type = event.get("detail-type").and_then(Value::as_str);

        self.processors
            .get(&processor_key(source, detail_type))
            .or_else(|| self.processors.get(source))
            .ok_or_else(|| RateLimitError::UnknownSource(source.to_string()))
    }

    async fn resource_token(&self, resource_id: &str) -> Result<Option<Row>, RateLimitError> {
        let spec = QuerySpec::partition(columns::RESOURCE_ID, resource_id)
            .index(self.index_name.clone());
        let rows = self.store.query(&self.table_name, spec).await?;
        Ok(rows.into_iter().next())
    }
}

fn processor_key(source: &str, detail_type: Option<&str>) -> String {
    match detail_type {
        Some(detail_type) => {
            let normalized: String = detail_type
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_lowercase();
            format!("{source}:{normalized}")
        }
        None => source.to_string(),
    }
}
