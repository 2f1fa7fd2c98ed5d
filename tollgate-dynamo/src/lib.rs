//! DynamoDB-backed [`StoreGateway`].
//!
//! Renders the core's expression model to DynamoDB wire expressions
//! (`UpdateExpression`, `ConditionExpression`, `FilterExpression` with
//! `#nN`/`:vN` placeholders) and maps SDK failures into the gateway error
//! taxonomy: a rejected condition is `PreconditionFailed`, capacity pressure
//! is `Throttled`, everything else is `Other`.
//!
//! The gateway never retries. Queries paginate internally, which is
//! additional reads, not retries; batch writes go out in 25-item chunks and
//! unprocessed items surface as `Throttled` for the caller to decide.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate_core::FungibleLimiter;
//! use tollgate_dynamo::DynamoGateway;
//!
//! # async fn example() -> Result<(), tollgate_core::RateLimitError> {
//! let store = Arc::new(DynamoGateway::from_env().await);
//! let limiter = FungibleLimiter::from_env(store, "emr", 10, 100)?;
//! limiter.acquire("acct-1234").await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeValue, DeleteRequest, PutRequest, ReturnValue, Select, WriteRequest,
};
use aws_sdk_dynamodb::Client;

use tollgate_core::store::{
    Assign, AttrValue, BatchWrite, Condition, QuerySpec, Row, RowKey, StoreError, StoreGateway,
};

/// DynamoDB's per-request ceiling on batched writes.
const BATCH_WRITE_CHUNK: usize = 25;

/// Thin adapter from the [`StoreGateway`] operations to DynamoDB calls.
///
/// Table names travel with each call, so one gateway serves every limiter
/// table.
#[derive(Debug, Clone)]
pub struct DynamoGateway {
    client: Client,
}

impl DynamoGateway {
    /// Wrap a pre-built DynamoDB client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the standard AWS config chain (environment,
    /// profiles, IMDS).
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

// ============================================================================
// EXPRESSION RENDERING
// ============================================================================

/// Accumulates `#nN` name and `:vN` value placeholders across the update and
/// condition expressions of one request.
#[derive(Default)]
struct ExprContext {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl ExprContext {
    fn name(&mut self, attr: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, a)| a.as_str() == attr) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attr.to_string());
        placeholder
    }

    fn value(&mut self, value: &AttrValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), to_attribute_value(value));
        placeholder
    }
}

fn to_attribute_value(value: &AttrValue) -> AttributeValue {
    match value {
        AttrValue::N(n) => AttributeValue::N(n.to_string()),
        AttrValue::S(s) => AttributeValue::S(s.clone()),
    }
}

fn from_attribute_value(value: &AttributeValue) -> Option<AttrValue> {
    match value {
        AttributeValue::N(n) => n.parse().ok().map(AttrValue::N),
        AttributeValue::S(s) => Some(AttrValue::S(s.clone())),
        _ => None,
    }
}

fn row_from_item(item: &HashMap<String, AttributeValue>) -> Row {
    item.iter()
        .filter_map(|(name, value)| Some((name.clone(), from_attribute_value(value)?)))
        .collect()
}

fn key_item(key: &RowKey) -> HashMap<String, AttributeValue> {
    HashMap::from([
        (key.partition.0.to_string(), to_attribute_value(&key.partition.1)),
        (key.sort.0.to_string(), to_attribute_value(&key.sort.1)),
    ])
}

fn item_from_row(row: &Row) -> HashMap<String, AttributeValue> {
    row.iter()
        .map(|(name, value)| (name.clone(), to_attribute_value(value)))
        .collect()
}

/// Renders `ADD a :v, b :v SET c = :v`, ADD entries first, then SET.
fn render_update(assigns: &[Assign], ctx: &mut ExprContext) -> String {
    let mut adds = Vec::new();
    let mut sets = Vec::new();
    for assign in assigns {
        match assign {
            Assign::Add(attr, delta) => {
                let name = ctx.name(attr);
                let value = ctx.value(&AttrValue::N(*delta));
                adds.push(format!("{name} {value}"));
            }
            Assign::Set(attr, value) => {
                let name = ctx.name(attr);
                let value = ctx.value(value);
                sets.push(format!("{name} = {value}"));
            }
        }
    }

    let mut clauses = Vec::new();
    if !adds.is_empty() {
        clauses.push(format!("ADD {}", adds.join(", ")));
    }
    if !sets.is_empty() {
        clauses.push(format!("SET {}", sets.join(", ")));
    }
    clauses.join(" ")
}

fn render_condition(condition: &Condition, ctx: &mut ExprContext) -> String {
    match condition {
        Condition::Gt(attr, value) => {
            format!("{} > {}", ctx.name(attr), ctx.value(value))
        }
        Condition::Lt(attr, value) => {
            format!("{} < {}", ctx.name(attr), ctx.value(value))
        }
        Condition::Ne(attr, value) => {
            format!("{} <> {}", ctx.name(attr), ctx.value(value))
        }
        Condition::Exists(attr) => format!("attribute_exists({})", ctx.name(attr)),
        Condition::NotExists(attr) => format!("attribute_not_exists({})", ctx.name(attr)),
        Condition::Or(branches) => {
            let rendered: Vec<String> = branches
                .iter()
                .map(|branch| render_condition(branch, ctx))
                .collect();
            format!("({})", rendered.join(" OR "))
        }
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn map_sdk_error<E>(err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match err.code() {
        Some("ConditionalCheckFailedException") => StoreError::PreconditionFailed,
        Some(
            "ProvisionedThroughputExceededException" | "ThrottlingException"
            | "RequestLimitExceeded",
        ) => StoreError::Throttled(format!("{}", DisplayErrorContext(&err))),
        _ => StoreError::Other(format!("{}", DisplayErrorContext(&err))),
    }
}

fn build_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Other(format!("malformed batch request: {err}"))
}

// ============================================================================
// GATEWAY IMPLEMENTATION
// ============================================================================

#[async_trait]
impl StoreGateway for DynamoGateway {
    async fn update(
        &self,
        table: &str,
        key: RowKey,
        update: Vec<Assign>,
        condition: Option<Condition>,
    ) -> Result<Row, StoreError> {
        let mut ctx = ExprContext::default();
        let update_expr = render_update(&update, &mut ctx);
        let condition_expr = condition.as_ref().map(|c| render_condition(c, &mut ctx));

        let mut request = self
            .client
            .update_item()
            .table_name(table)
            .set_key(Some(key_item(&key)))
            .update_expression(update_expr)
            .set_expression_attribute_names(Some(ctx.names))
            .set_expression_attribute_values(Some(ctx.values))
            .return_values(ReturnValue::AllNew);
        if let Some(expr) = condition_expr {
            request = request.condition_expression(expr);
        }

        let output = request.send().await.map_err(map_sdk_error)?;
        Ok(output.attributes().map(row_from_item).unwrap_or_default())
    }

    async fn put(
        &self,
        table: &str,
        item: Row,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let mut ctx = ExprContext::default();
        let condition_expr = condition.as_ref().map(|c| render_condition(c, &mut ctx));

        let mut request = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(item_from_row(&item)));
        if let Some(expr) = condition_expr {
            request = request
                .condition_expression(expr)
                .set_expression_attribute_names(Some(ctx.names));
            if !ctx.values.is_empty() {
                request = request.set_expression_attribute_values(Some(ctx.values));
            }
        }

        request.send().await.map_err(map_sdk_error)?;
        Ok(())
    }

    async fn query(&self, table: &str, spec: QuerySpec) -> Result<Vec<Row>, StoreError> {
        let mut rows = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let output = self
                .query_page(table, &spec, None, start_key.take())
                .await?;
            rows.extend(output.items().iter().map(row_from_item));
            match output.last_evaluated_key() {
                Some(last_key) if !last_key.is_empty() => start_key = Some(last_key.clone()),
                _ => break,
            }
        }
        Ok(rows)
    }

    async fn count(&self, table: &str, spec: QuerySpec) -> Result<usize, StoreError> {
        let mut total: usize = 0;
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;
        loop {
            let output = self
                .query_page(table, &spec, Some(Select::Count), start_key.take())
                .await?;
            total += output.count().max(0) as usize;
            match output.last_evaluated_key() {
                Some(last_key) if !last_key.is_empty() => start_key = Some(last_key.clone()),
                _ => break,
            }
        }
        Ok(total)
    }

    async fn delete(&self, table: &str, key: RowKey) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(table)
            .set_key(Some(key_item(&key)))
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn batch_write(&self, table: &str, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        for chunk in writes.chunks(BATCH_WRITE_CHUNK) {
            let mut requests = Vec::with_capacity(chunk.len());
            for write in chunk {
                let request = match write {
                    BatchWrite::Put(row) => WriteRequest::builder()
                        .put_request(
                            PutRequest::builder()
                                .set_item(Some(item_from_row(row)))
                                .build()
                                .map_err(build_error)?,
                        )
                        .build(),
                    BatchWrite::Delete(key) => WriteRequest::builder()
                        .delete_request(
                            DeleteRequest::builder()
                                .set_key(Some(key_item(key)))
                                .build()
                                .map_err(build_error)?,
                        )
                        .build(),
                };
                requests.push(request);
            }

            let output = self
                .client
                .batch_write_item()
                .request_items(table, requests)
                .send()
                .await
                .map_err(map_sdk_error)?;

            let unprocessed = output
                .unprocessed_items()
                .is_some_and(|items| items.values().any(|batch| !batch.is_empty()));
            if unprocessed {
                return Err(StoreError::Throttled(
                    "batch write returned unprocessed items".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl DynamoGateway {
    async fn query_page(
        &self,
        table: &str,
        spec: &QuerySpec,
        select: Option<Select>,
        start_key: Option<HashMap<String, AttributeValue>>,
    ) -> Result<aws_sdk_dynamodb::operation::query::QueryOutput, StoreError> {
        let mut ctx = ExprContext::default();

        let mut key_condition = format!(
            "{} = {}",
            ctx.name(spec.partition.0),
            ctx.value(&spec.partition.1)
        );
        if let Some((sort_name, sort_value)) = &spec.sort {
            key_condition = format!(
                "{key_condition} AND {} = {}",
                ctx.name(sort_name),
                ctx.value(sort_value)
            );
        }
        let filter_expr = spec.filter.as_ref().map(|c| render_condition(c, &mut ctx));

        let mut request = self
            .client
            .query()
            .table_name(table)
            .key_condition_expression(key_condition)
            .set_expression_attribute_names(Some(ctx.names))
            .set_expression_attribute_values(Some(ctx.values))
            .consistent_read(spec.consistent);
        if let Some(index) = &spec.index {
            request = request.index_name(index);
        }
        if let Some(expr) = filter_expr {
            request = request.filter_expression(expr);
        }
        if let Some(select) = select {
            request = request.select(select);
        }
        if let Some(start_key) = start_key {
            request = request.set_exclusive_start_key(Some(start_key));
        }

        request.send().await.map_err(map_sdk_error)
    }
}
