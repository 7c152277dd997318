//! Record gateway: the surface route handlers call.
//!
//! Every operation runs with a valid session token. A call rejected with
//! HTTP 401 gets exactly one forced token refresh and one more try; a second
//! 401 is returned as `BackendError::AuthorizationFailed`.
//!
//! Reads by id go through a read-through cache so concurrent misses for the
//! same record share one backend call. A missing record is `Ok(None)`,
//! never an error, and is never cached.

use std::sync::Arc;

use encore_cache::{CacheStore, ReadThroughCache};
use encore_core::{
    BackendError, ErrorClass, FieldMap, FindOptions, GatewayError, GatewayResult, Record,
    RecordId, SortDirection, TransportError,
};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendCall};
use crate::config::CacheConfig;
use crate::constants::{FINDS_NAMESPACE, RECORDS_NAMESPACE};
use crate::envelope::{parse_record_id, parse_records, Envelope};
use crate::token::{Token, TokenManager, TokenState};

/// Token-aware call pipeline shared by the gateway and its background fetches.
#[derive(Clone)]
struct Pipeline {
    backend: Arc<dyn Backend>,
    tokens: Arc<TokenManager>,
}

impl Pipeline {
    /// Run one call with the retry-once-on-401 rule.
    async fn call(&self, call: &BackendCall, cancel: &CancellationToken) -> GatewayResult<Envelope> {
        let token = self.tokens.ensure_token(cancel).await?;
        match self.attempt(call, &token, cancel).await {
            Err(e) if e.is_unauthorized() => {
                tracing::info!(
                    request_id = %call.request_id,
                    path = %call.path,
                    generation = token.generation(),
                    "Backend rejected token, refreshing once"
                );
                let fresh = self.tokens.force_refresh(&token, cancel).await?;
                match self.attempt(call, &fresh, cancel).await {
                    Err(e) if e.is_unauthorized() => {
                        tracing::error!(
                            request_id = %call.request_id,
                            path = %call.path,
                            "Backend rejected refreshed token"
                        );
                        Err(BackendError::AuthorizationFailed.into())
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        call: &BackendCall,
        token: &Token,
        cancel: &CancellationToken,
    ) -> GatewayResult<Envelope> {
        let reply = self.backend.execute(call, token.expose(), cancel).await?;
        Envelope::from_reply(reply)
    }

    /// Run a call and log a failure once, at the level its class deserves.
    async fn run(&self, call: BackendCall, cancel: &CancellationToken) -> GatewayResult<Envelope> {
        let result = self.call(&call, cancel).await;
        if let Err(e) = &result {
            let request_id = call.request_id;
            let path = call.path.as_str();
            match e.class() {
                ErrorClass::Cancelled => {
                    tracing::debug!(%request_id, path, "Backend call cancelled by caller")
                }
                ErrorClass::NotFound | ErrorClass::BadRequest => tracing::debug!(
                    %request_id,
                    path,
                    error = %e,
                    code = ?e.backend_code(),
                    "Backend call rejected"
                ),
                _ => tracing::warn!(%request_id, path, error = %e, "Backend call failed"),
            }
        }
        result
    }
}

/// Login-aware record operations over the shared backend chain.
pub struct RecordGateway {
    pipeline: Pipeline,
    records: ReadThroughCache<Record, GatewayError>,
    finds: ReadThroughCache<Vec<Record>, GatewayError>,
    lifetime: CancellationToken,
}

impl RecordGateway {
    pub fn new(backend: Arc<dyn Backend>, tokens: Arc<TokenManager>, cache: &CacheConfig) -> Self {
        let records = CacheStore::builder()
            .namespace(RECORDS_NAMESPACE, cache.records.clone())
            .build();
        let finds = CacheStore::builder()
            .namespace(FINDS_NAMESPACE, cache.finds.clone())
            .build();

        Self {
            pipeline: Pipeline { backend, tokens },
            records: ReadThroughCache::new(Arc::new(records)),
            finds: ReadThroughCache::new(Arc::new(finds)),
            lifetime: CancellationToken::new(),
        }
    }

    /// Make sure a valid session exists.
    pub async fn ensure_token(&self, cancel: &CancellationToken) -> GatewayResult<()> {
        self.pipeline.tokens.ensure_token(cancel).await.map(|_| ())
    }

    pub fn token_state(&self) -> TokenState {
        self.pipeline.tokens.state()
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.pipeline.tokens
    }

    /// Record cache, for sweeping and stats.
    pub fn record_store(&self) -> &Arc<CacheStore<Record>> {
        self.records.store()
    }

    pub fn find_store(&self) -> &Arc<CacheStore<Vec<Record>>> {
        self.finds.store()
    }

    /// Stop shared fetches that are still running for callers.
    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }

    /// Authenticated POST to an arbitrary path; returns the `response` object.
    pub async fn post(
        &self,
        path: &str,
        body: Value,
        cancel: &CancellationToken,
    ) -> GatewayResult<Value> {
        self.pipeline
            .run(BackendCall::post(path, body), cancel)
            .await?
            .into_response()
    }

    /// Read one record. `Ok(None)` when it does not exist.
    pub async fn get_by_id(
        &self,
        layout: &str,
        id: &RecordId,
        cancel: &CancellationToken,
    ) -> GatewayResult<Option<Record>> {
        let key = record_key(layout, id);
        let call = BackendCall::get(format!("layouts/{}/records/{}", layout, id));
        let pipeline = self.pipeline.clone();
        let lifetime = self.lifetime.clone();

        // The shared fetch outlives any single waiter, so it runs under the
        // gateway's lifetime and each waiter races its own cancel.
        let fetch = self.records.fetch_once(RECORDS_NAMESPACE, &key, move || async move {
            let envelope = pipeline.run(call, &lifetime).await?;
            if envelope.is_no_records() {
                return Err(not_found());
            }
            let response = envelope.into_response()?;
            parse_records(&response)?
                .into_iter()
                .next()
                .ok_or_else(not_found)
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            result = fetch => result,
        };

        match result {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.class() == ErrorClass::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Find records matching any entry of `query`, where each entry is an
    /// AND of field predicates. No match is an empty list.
    pub async fn find(
        &self,
        layout: &str,
        query: &[FieldMap],
        options: &FindOptions,
        cancel: &CancellationToken,
    ) -> GatewayResult<Vec<Record>> {
        let call = BackendCall::post(
            format!("layouts/{}/_find", layout),
            find_body(query, options),
        );
        let envelope = self.pipeline.run(call, cancel).await?;
        if envelope.is_no_records() {
            return Ok(Vec::new());
        }
        parse_records(&envelope.into_response()?)
    }

    /// `find` served from the short-TTL find cache when possible.
    pub async fn find_cached(
        &self,
        layout: &str,
        query: &[FieldMap],
        options: &FindOptions,
        cancel: &CancellationToken,
    ) -> GatewayResult<Vec<Record>> {
        let body = find_body(query, options);
        let key = format!("{}:{}", layout, body);
        let call = BackendCall::post(format!("layouts/{}/_find", layout), body);
        let pipeline = self.pipeline.clone();
        let lifetime = self.lifetime.clone();

        let fetch = self.finds.fetch_once(FINDS_NAMESPACE, &key, move || async move {
            let envelope = pipeline.run(call, &lifetime).await?;
            if envelope.is_no_records() {
                return Ok(Vec::new());
            }
            parse_records(&envelope.into_response()?)
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            result = fetch => result,
        }
    }

    /// Create a record and return its id. The record cache is not primed.
    pub async fn create_record(
        &self,
        layout: &str,
        fields: FieldMap,
        cancel: &CancellationToken,
    ) -> GatewayResult<RecordId> {
        let call = BackendCall::post(
            format!("layouts/{}/records", layout),
            json!({ "fieldData": fields }),
        );
        let response = self.pipeline.run(call, cancel).await?.into_response()?;
        let id = parse_record_id(&response)?;
        tracing::debug!(layout, record_id = %id, "Record created");
        Ok(id)
    }

    /// Patch a record's fields and drop any cached copy of it.
    pub async fn update_record(
        &self,
        layout: &str,
        id: &RecordId,
        fields: FieldMap,
        cancel: &CancellationToken,
    ) -> GatewayResult<()> {
        let call = BackendCall::patch(
            format!("layouts/{}/records/{}", layout, id),
            json!({ "fieldData": fields }),
        );
        let result = self
            .pipeline
            .run(call, cancel)
            .await
            .and_then(Envelope::into_response);

        // Invalidate on failure too: the backend may have applied the patch.
        self.records
            .invalidate(RECORDS_NAMESPACE, &record_key(layout, id));
        result.map(|_| ())
    }
}

fn record_key(layout: &str, id: &RecordId) -> String {
    format!("{}/{}", layout, id)
}

fn not_found() -> GatewayError {
    BackendError::Rejected {
        code: crate::constants::CODE_RECORD_MISSING.to_string(),
        message: "Record is missing".to_string(),
    }
    .into()
}

/// Request body for `_find`.
fn find_body(query: &[FieldMap], options: &FindOptions) -> Value {
    let mut body = Map::new();
    let query: Vec<Value> = if query.is_empty() {
        vec![Value::Object(Map::new())]
    } else {
        query.iter().cloned().map(Value::Object).collect()
    };
    body.insert("query".to_string(), Value::Array(query));
    if let Some(limit) = options.limit {
        body.insert("limit".to_string(), json!(limit));
    }
    if let Some(offset) = options.offset {
        body.insert("offset".to_string(), json!(offset));
    }
    if !options.sort.is_empty() {
        let sort: Vec<Value> = options
            .sort
            .iter()
            .map(|s| {
                json!({
                    "fieldName": s.field,
                    "sortOrder": match s.direction {
                        SortDirection::Ascending => "ascend",
                        SortDirection::Descending => "descend",
                    },
                })
            })
            .collect();
        body.insert("sort".to_string(), Value::Array(sort));
    }
    Value::Object(body)
}
