//! Drain scheduler.
//!
//! A drain pass takes every operation that is `Pending` when the pass starts,
//! dispatches them in `(priority, enqueued_at)` order in waves of bounded
//! concurrency, and records each outcome in the queue:
//!
//! - 2xx: the operation is deleted and the cached entity is reconciled
//! - 409: the conflict is captured and the operation held for resolution
//! - anything else: the retry policy decides between a backoff timer and `Failed`
//!
//! A wave never holds two operations for the same entity, so writes to one
//! entity are sent one after another.
//!
//! When a 409 carries no usable server copy and the refetch fails too, the
//! write is not resent. The operation goes back to `Pending` without spending
//! retry budget and its next dispatch only refetches the server copy.
//!
//! At most one pass runs at a time. Backoff timers report through a channel to
//! a retry loop started with [`SyncScheduler::start`]. A timer or reconnect
//! that arrives while a pass is running waits for it to finish and then drains
//! once.

use dashmap::DashMap;
use fieldsync_engine::conflict::version_of;
use fieldsync_engine::{
    ConflictContext, EntityRef, ErrorClass, FailureOutcome, Fields, Method, Operation, OperationId,
    OperationStatus, Timestamp,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::clock::Clock;
use crate::error::Result;
use crate::queue::{OperationQueue, QueueCounts};
use crate::records::LocalRecordStore;
use crate::transport::{
    AuthTokenProvider, Transport, TransportError, TransportRequest, TransportResponse,
};

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Operations that were pending when the pass started
    pub started: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub conflicted: usize,
    /// Left pending: entity blocked by a conflict, backoff not elapsed, or
    /// changed by someone else before dispatch
    pub skipped: usize,
}

impl DrainReport {
    fn record(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Succeeded => self.succeeded += 1,
            Dispatch::Retried => self.retried += 1,
            Dispatch::Failed => self.failed += 1,
            Dispatch::Conflicted => self.conflicted += 1,
            Dispatch::Skipped => self.skipped += 1,
        }
    }
}

/// Result of asking for a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another pass was in flight; nothing was done.
    AlreadyRunning,
    Completed(DrainReport),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::AlreadyRunning => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Draining,
}

/// Sync status published for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub counts: QueueCounts,
    pub last_drain_at: Option<Timestamp>,
}

/// What happened to one operation during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Succeeded,
    Retried,
    Failed,
    Conflicted,
    Skipped,
}

/// Cut drain-ordered operations into waves of at most `batch_size`. A wave
/// ends before the first operation whose entity it already holds.
fn drain_waves(pending: &[Operation], batch_size: usize) -> Vec<&[Operation]> {
    let mut waves = Vec::new();
    let mut start = 0;
    let mut entities: HashSet<&EntityRef> = HashSet::new();
    for (index, op) in pending.iter().enumerate() {
        let repeats = op
            .entity
            .as_ref()
            .is_some_and(|entity| entities.contains(entity));
        if index > start && (index - start >= batch_size || repeats) {
            waves.push(&pending[start..index]);
            start = index;
            entities.clear();
        }
        if let Some(entity) = &op.entity {
            entities.insert(entity);
        }
    }
    if start < pending.len() {
        waves.push(&pending[start..]);
    }
    waves
}

const SERVER_COPY_UNAVAILABLE: &str = "version conflict: server copy unavailable";

fn transport_error_class(err: &TransportError) -> ErrorClass {
    match err {
        TransportError::Unreachable(_) => ErrorClass::NetworkUnreachable,
        TransportError::InvalidRequest(_) => ErrorClass::Client,
    }
}

/// The server copy carried by a 409 body, when the body looks like an entity.
fn body_snapshot(response: &TransportResponse) -> Option<Fields> {
    response
        .body_fields()
        .filter(|fields| fields.contains_key("id") || fields.contains_key("version"))
        .cloned()
}

/// Releases the single-flight flag when a pass ends, however it ends.
struct DrainGuard<'a> {
    scheduler: &'a SyncScheduler,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.draining.store(false, Ordering::SeqCst);
        self.scheduler.idle.notify_waiters();
    }
}

/// Drains the operation queue through the transport.
pub struct SyncScheduler {
    queue: Arc<OperationQueue>,
    records: Arc<LocalRecordStore>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthTokenProvider>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    draining: AtomicBool,
    idle: Notify,
    status: watch::Sender<SyncStatus>,
    /// Earliest re-dispatch time of operations waiting out a backoff
    retry_at: DashMap<OperationId, Instant>,
    /// Operations that hit a 409 without a readable server copy, with the
    /// number of refetches tried so far
    awaiting_copy: DashMap<OperationId, u32>,
    timers: mpsc::UnboundedSender<OperationId>,
    fired: Mutex<Option<mpsc::UnboundedReceiver<OperationId>>>,
}

impl SyncScheduler {
    pub fn new(
        queue: Arc<OperationQueue>,
        records: Arc<LocalRecordStore>,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthTokenProvider>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        let (timers, fired) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            queue,
            records,
            transport,
            auth,
            clock,
            batch_size: batch_size.max(1),
            draining: AtomicBool::new(false),
            idle: Notify::new(),
            status,
            retry_at: DashMap::new(),
            awaiting_copy: DashMap::new(),
            timers,
            fired: Mutex::new(Some(fired)),
        }
    }

    /// Start the retry loop that turns fired backoff timers into drains.
    ///
    /// Returns `None` if the loop was already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let receiver = match self.fired.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut fired) = receiver else {
            tracing::warn!("Retry loop already started");
            return None;
        };

        let scheduler = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(op_id) = fired.recv().await {
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                scheduler.trigger_on_timer(&op_id).await;
            }
            tracing::debug!("Retry loop stopped");
        }))
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn records(&self) -> &Arc<LocalRecordStore> {
        &self.records
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn auth(&self) -> &dyn AuthTokenProvider {
        self.auth.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Number of operations waiting out a backoff delay.
    pub fn backoff_count(&self) -> usize {
        self.retry_at.len()
    }

    /// Current sync status.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to sync status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Recount the queue and publish the status.
    pub fn refresh_status(&self) {
        let state = if self.is_draining() {
            SyncState::Draining
        } else {
            SyncState::Idle
        };
        self.publish(state, None);
    }

    fn publish(&self, state: SyncState, drained_at: Option<Timestamp>) {
        let counts = match self.queue.counts() {
            Ok(counts) => Some(counts),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to count queue");
                None
            }
        };
        self.status.send_modify(|status| {
            status.state = state;
            if let Some(counts) = counts {
                status.counts = counts;
            }
            if drained_at.is_some() {
                status.last_drain_at = drained_at;
            }
        });
    }

    /// Run one drain pass unless one is already running.
    pub async fn drain(&self) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Drain already running");
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = DrainGuard { scheduler: self };

        self.publish(SyncState::Draining, None);
        let report = self.run_pass().await;
        self.publish(SyncState::Idle, Some(self.clock.now()));

        DrainOutcome::Completed(report)
    }

    /// Connectivity came back: retry everything now, ignoring pending backoffs.
    /// If a pass is running, wait for it to end and drain once more.
    pub async fn trigger_on_reconnect(&self) -> DrainOutcome {
        tracing::info!("Connection restored, draining queue");
        self.drain_when_idle(true).await
    }

    /// Explicit user request to sync now.
    pub async fn trigger_manual(&self) -> DrainOutcome {
        tracing::info!("Manual sync requested");
        self.retry_at.clear();
        self.drain().await
    }

    /// A backoff timer fired for `op_id`. If a pass is running, wait for it to
    /// end and drain once more.
    pub async fn trigger_on_timer(&self, op_id: &str) -> DrainOutcome {
        tracing::debug!(op_id = %op_id, "Backoff elapsed");
        self.drain_when_idle(false).await
    }

    async fn drain_when_idle(&self, skip_backoff: bool) -> DrainOutcome {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if skip_backoff {
                self.retry_at.clear();
            }
            match self.drain().await {
                DrainOutcome::AlreadyRunning => idle.await,
                completed => return completed,
            }
        }
    }

    async fn run_pass(&self) -> DrainReport {
        let pending = match self.queue.list_by_status(OperationStatus::Pending) {
            Ok(ops) => ops,
            Err(err) => {
                tracing::error!(error = %err, "Failed to list pending operations");
                return DrainReport::default();
            }
        };
        let blocked = match self.queue.conflicted_entities() {
            Ok(entities) => entities,
            Err(err) => {
                tracing::error!(error = %err, "Failed to list conflicted entities");
                return DrainReport::default();
            }
        };

        self.prune_backoffs(&pending);

        let mut report = DrainReport {
            started: pending.len(),
            ..DrainReport::default()
        };
        if pending.is_empty() {
            return report;
        }
        tracing::info!(pending = pending.len(), "Drain pass started");

        let blocked = Mutex::new(blocked);
        let pass_started = Instant::now();
        for wave in drain_waves(&pending, self.batch_size) {
            let results = join_all(
                wave.iter()
                    .map(|op| self.dispatch(op, &blocked, pass_started)),
            )
            .await;
            for (op, dispatch) in wave.iter().zip(results) {
                // later operations on this entity wait for the next pass
                if matches!(dispatch, Dispatch::Retried | Dispatch::Failed) {
                    if let Some(entity) = &op.entity {
                        Self::block(&blocked, entity);
                    }
                }
                report.record(dispatch);
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            conflicted = report.conflicted,
            skipped = report.skipped,
            "Drain pass finished"
        );
        report
    }

    /// Forget backoff state of operations that are no longer pending
    /// (discarded, cleared or resolved since).
    fn prune_backoffs(&self, pending: &[Operation]) {
        let ids: HashSet<&str> = pending.iter().map(|op| op.id.as_str()).collect();
        self.retry_at.retain(|id, _| ids.contains(id.as_str()));
        self.awaiting_copy.retain(|id, _| ids.contains(id.as_str()));
    }

    fn is_blocked(blocked: &Mutex<HashSet<EntityRef>>, entity: &EntityRef) -> bool {
        match blocked.lock() {
            Ok(set) => set.contains(entity),
            Err(poisoned) => poisoned.into_inner().contains(entity),
        }
    }

    fn block(blocked: &Mutex<HashSet<EntityRef>>, entity: &EntityRef) {
        match blocked.lock() {
            Ok(mut set) => set.insert(entity.clone()),
            Err(poisoned) => poisoned.into_inner().insert(entity.clone()),
        };
    }

    async fn dispatch(
        &self,
        op: &Operation,
        blocked: &Mutex<HashSet<EntityRef>>,
        pass_started: Instant,
    ) -> Dispatch {
        if let Some(entity) = &op.entity {
            if Self::is_blocked(blocked, entity) {
                tracing::debug!(op_id = %op.id, entity = %entity, "Entity has a conflict, skipping");
                return Dispatch::Skipped;
            }
        }
        let backoff_until = self.retry_at.get(&op.id).map(|at| *at);
        if backoff_until.is_some_and(|at| at > pass_started) {
            return Dispatch::Skipped;
        }
        if let Err(err) = self.queue.mark_syncing(&op.id) {
            tracing::debug!(op_id = %op.id, error = %err, "Operation changed before dispatch");
            return Dispatch::Skipped;
        }
        self.retry_at.remove(&op.id);

        if self.awaiting_copy.contains_key(&op.id) {
            let handled = match self.refetch_server_copy(op).await {
                Some(server_data) => self.capture_conflict(op, server_data, blocked),
                None => self.await_server_copy(op),
            };
            return self.settle(op, handled);
        }

        tracing::debug!(
            op_id = %op.id,
            kind = op.kind.as_str(),
            priority = op.priority,
            "Dispatching operation"
        );
        let request = TransportRequest::new(op.method, op.endpoint.clone())
            .with_payload(op.payload.clone())
            .authorized(self.auth.as_ref());

        let handled = match self.transport.execute(request).await {
            Ok(response) => match response.error_class() {
                None => self.on_success(op, &response),
                Some(ErrorClass::VersionConflict) => self.on_conflict(op, &response, blocked).await,
                Some(class) => self.on_failure(op, &response.describe(), class),
            },
            Err(err) => self.on_failure(op, &err.to_string(), transport_error_class(&err)),
        };

        self.settle(op, handled)
    }

    fn settle(&self, op: &Operation, handled: Result<Dispatch>) -> Dispatch {
        handled.unwrap_or_else(|err| {
            tracing::error!(op_id = %op.id, error = %err, "Failed to record operation outcome");
            Dispatch::Failed
        })
    }

    fn on_success(&self, op: &Operation, response: &TransportResponse) -> Result<Dispatch> {
        self.queue.mark_completed(&op.id)?;
        if let Some(entity) = &op.entity {
            self.reconcile_record(op, entity, &response.body);
        }
        tracing::debug!(op_id = %op.id, status = response.status, "Operation synced");
        Ok(Dispatch::Succeeded)
    }

    /// Stamp the cached entity with the server response. While later edits to
    /// the same entity are still queued only the version is taken, so their
    /// optimistic fields survive.
    fn reconcile_record(&self, op: &Operation, entity: &EntityRef, body: &Value) {
        let result = if op.method == Method::Delete {
            self.records.delete(entity).map(|_| ())
        } else if self.queue.has_outstanding(entity).unwrap_or(true) {
            match body.get("version").and_then(Value::as_u64) {
                Some(version) => self.records.observe_version(entity, version).map(|_| ()),
                None => Ok(()),
            }
        } else {
            self.records
                .reconcile(entity, body, self.clock.now())
                .map(|_| ())
        };

        if let Err(err) = result {
            tracing::warn!(op_id = %op.id, entity = %entity, error = %err, "Failed to reconcile cached entity");
        }
    }

    fn on_failure(&self, op: &Operation, error: &str, class: ErrorClass) -> Result<Dispatch> {
        match self.queue.mark_failed(&op.id, error, class)? {
            FailureOutcome::Retry { attempt, delay_ms } => {
                tracing::warn!(
                    op_id = %op.id,
                    attempt,
                    delay_ms,
                    error = %error,
                    "Operation failed, retry scheduled"
                );
                self.schedule_retry(op.id.clone(), delay_ms);
                Ok(Dispatch::Retried)
            }
            FailureOutcome::Exhausted => {
                tracing::error!(op_id = %op.id, error = %error, "Operation failed permanently");
                Ok(Dispatch::Failed)
            }
        }
    }

    fn schedule_retry(&self, op_id: OperationId, delay_ms: u64) {
        let delay = Duration::from_millis(delay_ms);
        self.retry_at.insert(op_id.clone(), Instant::now() + delay);

        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The retry loop is gone once the scheduler is dropped.
            let _ = timers.send(op_id);
        });
    }

    async fn on_conflict(
        &self,
        op: &Operation,
        response: &TransportResponse,
        blocked: &Mutex<HashSet<EntityRef>>,
    ) -> Result<Dispatch> {
        let server_data = match body_snapshot(response) {
            Some(fields) => Some(fields),
            None => self.refetch_server_copy(op).await,
        };
        match server_data {
            Some(server_data) => self.capture_conflict(op, server_data, blocked),
            None => self.await_server_copy(op),
        }
    }

    fn capture_conflict(
        &self,
        op: &Operation,
        server_data: Fields,
        blocked: &Mutex<HashSet<EntityRef>>,
    ) -> Result<Dispatch> {
        let local_data = self.local_snapshot(op);
        let local_version = op
            .payload
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| version_of(&local_data));
        let server_version = version_of(&server_data);
        let context = ConflictContext::new(
            server_data,
            server_version,
            local_data,
            local_version,
            self.clock.now(),
        );
        let requires_attention = context.requires_attention();

        self.queue.mark_conflict(&op.id, context)?;
        self.awaiting_copy.remove(&op.id);
        if let Some(entity) = &op.entity {
            Self::block(blocked, entity);
        }

        tracing::warn!(
            op_id = %op.id,
            local_version,
            server_version,
            requires_attention,
            "Version conflict, operation held for resolution"
        );
        Ok(Dispatch::Conflicted)
    }

    /// Hold a stale write whose server copy could not be read. It goes back to
    /// `Pending` without spending retry budget; the next dispatch refetches
    /// instead of resending.
    fn await_server_copy(&self, op: &Operation) -> Result<Dispatch> {
        self.queue.requeue(&op.id, SERVER_COPY_UNAVAILABLE)?;
        let attempt = {
            let mut attempts = self.awaiting_copy.entry(op.id.clone()).or_insert(0);
            *attempts += 1;
            *attempts
        };
        let delay_ms = self.queue.policy().backoff(attempt);
        tracing::warn!(
            op_id = %op.id,
            attempt,
            delay_ms,
            "Version conflict without server copy, refetch scheduled"
        );
        self.schedule_retry(op.id.clone(), delay_ms);
        Ok(Dispatch::Retried)
    }

    /// The server's current copy through a fresh `GET` of the endpoint.
    async fn refetch_server_copy(&self, op: &Operation) -> Option<Fields> {
        let request =
            TransportRequest::new(Method::Get, op.endpoint.clone()).authorized(self.auth.as_ref());
        match self.transport.execute(request).await {
            Ok(refetched) if refetched.is_success() => refetched.body.as_object().cloned(),
            Ok(refetched) => {
                tracing::warn!(op_id = %op.id, status = refetched.status, "Refetch after conflict failed");
                None
            }
            Err(err) => {
                tracing::warn!(op_id = %op.id, error = %err, "Refetch after conflict failed");
                None
            }
        }
    }

    /// The local side of a conflict: the cached entity, or the payload when the
    /// entity is not cached.
    fn local_snapshot(&self, op: &Operation) -> Fields {
        let cached = op
            .entity
            .as_ref()
            .and_then(|entity| self.records.get(entity).ok().flatten());
        match cached {
            Some(entity) => entity.snapshot(),
            None => op.payload.as_object().cloned().unwrap_or_default(),
        }
    }
}
