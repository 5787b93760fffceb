//! Shared fixtures for the client integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use fieldsync_client::{
    LocalRecordStore, ManualClock, MemoryStore, OperationQueue, StaticToken, SyncScheduler,
    Transport, TransportError, TransportRequest, TransportResponse,
};
use fieldsync_engine::{EntityRef, Fields, Method, RetryPolicy, VersionedEntity};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// What the scripted backend answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, Value),
    Unreachable,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Reply::Status(200, body)
    }
}

/// One request seen by the scripted backend.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub endpoint: String,
    pub payload: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub at: Instant,
}

/// In-process [`Transport`] answering from per-route scripts.
///
/// Replies scripted for `"METHOD endpoint"` are consumed in order; once a
/// route's script is empty the fallback reply is used.
pub struct ScriptedTransport {
    calls: Mutex<Vec<Call>>,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Mutex<Reply>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Self::replying(Reply::ok(json!({})))
    }

    pub fn replying(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(fallback),
            delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, method: Method, endpoint: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(format!("{method} {endpoint}"))
            .or_default()
            .extend(replies);
    }

    pub fn set_fallback(&self, reply: Reply) {
        *self.fallback.lock().unwrap() = reply;
    }

    /// Hold every request for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// `"METHOD endpoint"` of every call, in order.
    pub fn routes(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|call| format!("{} {}", call.method, call.endpoint))
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let route = format!("{} {}", request.method, request.endpoint);
        self.calls.lock().unwrap().push(Call {
            method: request.method,
            endpoint: request.endpoint.clone(),
            payload: request.payload.clone(),
            headers: request.headers.clone(),
            at: Instant::now(),
        });

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&route)
            .and_then(VecDeque::pop_front);
        let reply = scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        match reply {
            Reply::Status(status, body) => Ok(TransportResponse::new(status, body)),
            Reply::Unreachable => Err(TransportError::Unreachable("connection refused".into())),
        }
    }
}

/// A scheduler over an in-memory store, a manual clock and a scripted backend.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<ScriptedTransport>,
    pub scheduler: Arc<SyncScheduler>,
}

impl Harness {
    pub fn new(policy: RetryPolicy, batch_size: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_706_745_600_000));
        let transport = ScriptedTransport::new();
        let queue = Arc::new(OperationQueue::new(store.clone(), policy, clock.clone()));
        let records = Arc::new(LocalRecordStore::new(store.clone()));
        let scheduler = Arc::new(SyncScheduler::new(
            queue,
            records,
            transport.clone(),
            Arc::new(StaticToken::new("test-token")),
            clock.clone(),
            batch_size,
        ));
        Self {
            store,
            clock,
            transport,
            scheduler,
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        self.scheduler.queue()
    }

    pub fn records(&self) -> &LocalRecordStore {
        self.scheduler.records()
    }

    /// Cache a work order as the server last reported it.
    pub fn seed_order(&self, id: &str, value: Value) -> EntityRef {
        let entity_ref = EntityRef::new("work_order", id);
        self.records().put(&entity_ref, &entity(value)).unwrap();
        entity_ref
    }
}

pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

pub fn entity(value: Value) -> VersionedEntity {
    VersionedEntity::from_value(value).unwrap()
}

/// Yield until `condition` holds, failing after a generous timeout.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
