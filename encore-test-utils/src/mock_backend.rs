//! In-memory stand-in for the record store's Data API.
//!
//! Implements [`Backend`] directly, below the throttle and transport, so
//! gateway and accumulator tests run without sockets. Supports create, get,
//! patch, delete and `_find` with `==` exact and substring predicates,
//! sorting, offset and limit. Sessions expire on demand and faults can be
//! queued for the next calls.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use encore_core::{FieldMap, GatewayError, GatewayResult, Record, RecordId, TransportError};
use encore_gateway::{Backend, BackendCall, BackendReply, Envelope, IssuedToken, Method};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";
const DEFAULT_FIND_LIMIT: usize = 100;

/// Failure returned by the next backend call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the call before any reply.
    Transport(TransportError),
    /// Reply with an error envelope.
    Reply {
        status: u16,
        code: String,
        message: String,
    },
    /// HTTP 401, as for an expired session.
    Unauthorized,
}

impl Fault {
    pub fn reply(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Fault::Reply {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Backend busy or unreachable.
    pub fn unavailable() -> Self {
        Self::reply(500, "802", "Unable to open file")
    }

    pub fn timed_out() -> Self {
        Fault::Transport(TransportError::TimedOut { attempts: 1 })
    }

    fn into_reply(self) -> GatewayResult<BackendReply> {
        match self {
            Fault::Transport(e) => Err(e.into()),
            Fault::Reply {
                status,
                code,
                message,
            } => Ok(error_reply(status, code, message)),
            Fault::Unauthorized => Ok(unauthorized_reply()),
        }
    }
}

#[derive(Debug)]
struct StoredRecord {
    mod_id: u64,
    fields: FieldMap,
}

#[derive(Debug, Default)]
struct MockState {
    layouts: HashMap<String, BTreeMap<u64, StoredRecord>>,
    next_record_id: u64,
    tokens: HashSet<String>,
    next_token: u64,
    faults: VecDeque<Fault>,
    login_faults: VecDeque<GatewayError>,
    reject_tokens: bool,
    calls: Vec<(Method, String)>,
}

/// Fake record store backend.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    token_lifetime: Option<Duration>,
    login_delay: Duration,
    call_delay: Duration,
    logins: AtomicU64,
    logouts: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every login, so concurrent callers overlap with it.
    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    /// Delay every call before it is answered.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Report this lifetime with every issued token.
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = Some(lifetime);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------------

    /// Queue a fault for the next non-login call.
    pub fn fail_next(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Queue a failure for the next login.
    pub fn fail_next_login(&self, error: GatewayError) {
        self.lock().login_faults.push_back(error);
    }

    /// Invalidate every open session, as a backend restart would.
    pub fn expire_sessions(&self) {
        self.lock().tokens.clear();
    }

    /// Answer every call with HTTP 401 while set.
    pub fn reject_tokens(&self, reject: bool) {
        self.lock().reject_tokens = reject;
    }

    pub fn insert_record(&self, layout: &str, fields: FieldMap) -> RecordId {
        let mut state = self.lock();
        RecordId::new(state.create(layout, fields).to_string())
    }

    pub fn remove_record(&self, layout: &str, id: &RecordId) -> bool {
        let Ok(id) = id.as_str().parse::<u64>() else {
            return false;
        };
        self.lock()
            .layouts
            .get_mut(layout)
            .is_some_and(|records| records.remove(&id).is_some())
    }

    pub fn record(&self, layout: &str, id: &RecordId) -> Option<FieldMap> {
        let id = id.as_str().parse::<u64>().ok()?;
        self.lock()
            .layouts
            .get(layout)
            .and_then(|records| records.get(&id))
            .map(|r| r.fields.clone())
    }

    /// All records of a layout, oldest first.
    pub fn records(&self, layout: &str) -> Vec<Record> {
        self.lock()
            .layouts
            .get(layout)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, stored)| {
                        let mut record = Record::new(RecordId::new(id.to_string()), stored.fields.clone());
                        record.mod_id = Some(stored.mod_id.to_string());
                        record
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn logout_count(&self) -> u64 {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().tokens.len()
    }

    /// Every non-login call received, in order.
    pub fn calls(&self) -> Vec<(Method, String)> {
        self.lock().calls.clone()
    }

    /// Calls with `method` whose path contains `fragment`.
    pub fn count_calls(&self, method: Method, fragment: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(m, path)| *m == method && path.contains(fragment))
            .count()
    }

    /// Highest number of calls answered concurrently.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl MockState {
    fn create(&mut self, layout: &str, fields: FieldMap) -> u64 {
        self.next_record_id += 1;
        let id = self.next_record_id;
        self.layouts
            .entry(layout.to_string())
            .or_default()
            .insert(id, StoredRecord { mod_id: 0, fields });
        id
    }

    fn route(&mut self, call: &BackendCall) -> BackendReply {
        let segments: Vec<&str> = call.path.trim_matches('/').split('/').collect();
        let fields = call
            .body
            .as_ref()
            .and_then(|b| b.get("fieldData"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        match (call.method, segments.as_slice()) {
            (Method::Post, ["layouts", layout, "records"]) => {
                let id = self.create(layout, fields);
                ok_reply(json!({ "recordId": id.to_string(), "modId": "0" }))
            }
            (Method::Get, ["layouts", layout, "records", id]) => {
                match self.find_record(layout, id) {
                    Some((id, stored)) => ok_reply(json!({ "data": [row(id, stored)] })),
                    None => record_missing(),
                }
            }
            (Method::Patch, ["layouts", layout, "records", id]) => {
                match self.find_record_mut(layout, id) {
                    Some(stored) => {
                        stored.fields.extend(fields);
                        stored.mod_id += 1;
                        ok_reply(json!({ "modId": stored.mod_id.to_string() }))
                    }
                    None => record_missing(),
                }
            }
            (Method::Delete, ["layouts", layout, "records", id]) => {
                let removed = id
                    .parse::<u64>()
                    .ok()
                    .and_then(|id| self.layouts.get_mut(*layout)?.remove(&id));
                match removed {
                    Some(_) => ok_reply(json!({})),
                    None => record_missing(),
                }
            }
            (Method::Post, ["layouts", layout, "_find"]) => {
                self.find(layout, call.body.as_ref().unwrap_or(&Value::Null))
            }
            _ => error_reply(404, "3", "Command is unavailable"),
        }
    }

    fn find_record(&self, layout: &str, id: &str) -> Option<(u64, &StoredRecord)> {
        let id = id.parse::<u64>().ok()?;
        self.layouts.get(layout)?.get(&id).map(|r| (id, r))
    }

    fn find_record_mut(&mut self, layout: &str, id: &str) -> Option<&mut StoredRecord> {
        let id = id.parse::<u64>().ok()?;
        self.layouts.get_mut(layout)?.get_mut(&id)
    }

    fn find(&self, layout: &str, body: &Value) -> BackendReply {
        let queries: Vec<&serde_json::Map<String, Value>> = body
            .get("query")
            .and_then(Value::as_array)
            .map(|q| q.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default();
        if queries.is_empty() {
            return error_reply(500, "8", "Empty find request");
        }

        let mut matched: Vec<(u64, &StoredRecord)> = self
            .layouts
            .get(layout)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, stored)| {
                        queries.iter().any(|query| {
                            query
                                .iter()
                                .all(|(field, p)| matches_predicate(stored.fields.get(field), p))
                        })
                    })
                    .map(|(id, stored)| (*id, stored))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(sort) = body.get("sort").and_then(Value::as_array) {
            matched.sort_by(|(a_id, a), (b_id, b)| {
                for spec in sort {
                    let Some(field) = spec.get("fieldName").and_then(Value::as_str) else {
                        continue;
                    };
                    let descending = spec.get("sortOrder").and_then(Value::as_str) == Some("descend");
                    let mut ordering = compare_fields(a.fields.get(field), b.fields.get(field))
                        .then(a_id.cmp(b_id));
                    if descending {
                        ordering = ordering.reverse();
                    }
                    if ordering != CmpOrdering::Equal {
                        return ordering;
                    }
                }
                a_id.cmp(b_id)
            });
        }

        // Offsets are 1-based on the wire.
        let offset = body
            .get("offset")
            .and_then(Value::as_u64)
            .map(|o| o.saturating_sub(1) as usize)
            .unwrap_or(0);
        let limit = body
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_FIND_LIMIT);

        let rows: Vec<Value> = matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(id, stored)| row(id, stored))
            .collect();
        if rows.is_empty() {
            return error_reply(401, "401", "No records match the request");
        }
        ok_reply(json!({ "data": rows }))
    }
}

fn row(id: u64, stored: &StoredRecord) -> Value {
    json!({
        "recordId": id.to_string(),
        "modId": stored.mod_id.to_string(),
        "fieldData": stored.fields,
    })
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn matches_predicate(stored: Option<&Value>, predicate: &Value) -> bool {
    let stored = stored.map(value_text).unwrap_or_default();
    match predicate {
        Value::String(p) => match p.strip_prefix("==") {
            Some(exact) => stored == exact,
            None => stored.to_lowercase().contains(&p.to_lowercase()),
        },
        other => stored == value_text(other),
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    if let (Some(x), Some(y)) = (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
        return x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal);
    }
    let (x, y) = (
        a.map(value_text).unwrap_or_default(),
        b.map(value_text).unwrap_or_default(),
    );
    match (
        NaiveDateTime::parse_from_str(&x, TIMESTAMP_FORMAT),
        NaiveDateTime::parse_from_str(&y, TIMESTAMP_FORMAT),
    ) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => x.cmp(&y),
    }
}

fn ok_reply(response: Value) -> BackendReply {
    BackendReply::new(200, Envelope::ok(response).to_value())
}

fn error_reply(status: u16, code: impl Into<String>, message: impl Into<String>) -> BackendReply {
    BackendReply::new(status, Envelope::error(code, message).to_value())
}

fn record_missing() -> BackendReply {
    error_reply(500, "101", "Record is missing")
}

fn unauthorized_reply() -> BackendReply {
    error_reply(401, "952", "Invalid Data API token")
}

/// Counts a call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(current)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> GatewayResult<()> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn login(&self, cancel: &CancellationToken) -> GatewayResult<IssuedToken> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        pause(self.login_delay, cancel).await?;

        let mut state = self.lock();
        if let Some(error) = state.login_faults.pop_front() {
            return Err(error);
        }
        state.next_token += 1;
        let token = format!("mock-token-{}", state.next_token);
        state.tokens.insert(token.clone());

        let issued = IssuedToken::new(token);
        Ok(match self.token_lifetime {
            Some(lifetime) => issued.with_lifetime(lifetime),
            None => issued,
        })
    }

    async fn logout(&self, token: &str) -> GatewayResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        self.lock().tokens.remove(token);
        Ok(())
    }

    async fn execute(
        &self,
        call: &BackendCall,
        token: &str,
        cancel: &CancellationToken,
    ) -> GatewayResult<BackendReply> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled.into());
        }
        let _flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        pause(self.call_delay, cancel).await?;

        let mut state = self.lock();
        state.calls.push((call.method, call.path.clone()));
        if let Some(fault) = state.faults.pop_front() {
            return fault.into_reply();
        }
        if state.reject_tokens || !state.tokens.contains(token) {
            return Ok(unauthorized_reply());
        }
        Ok(state.route(call))
    }
}
