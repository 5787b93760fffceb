//! Optimistic entity writes.
//!
//! [`SyncCoordinator::mutate`] applies a patch locally before any network round
//! trip, then either confirms it against the server, queues it, or rolls it
//! back. A stale write (409) is never retried silently: the pre-mutation
//! snapshot is restored, the server copy refetched, and the caller gets
//! [`SyncError::StaleWrite`].

use fieldsync_engine::{
    validate_patch, EntityRef, EntityWrite, ErrorClass, Fields, Method, OperationId,
    OperationKind, Version, VersionedEntity,
};
use std::sync::Arc;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::scheduler::SyncScheduler;
use crate::transport::TransportRequest;

/// A local change to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub method: Method,
    pub endpoint: String,
    pub patch: Fields,
    /// Where to refetch the entity after a stale write; defaults to `endpoint`
    pub fetch_endpoint: Option<String>,
}

impl MutationRequest {
    pub fn new(
        entity: EntityRef,
        kind: OperationKind,
        method: Method,
        endpoint: impl Into<String>,
        patch: Fields,
    ) -> Self {
        Self {
            entity,
            kind,
            method,
            endpoint: endpoint.into(),
            patch,
            fetch_endpoint: None,
        }
    }

    pub fn with_fetch_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.fetch_endpoint = Some(endpoint.into());
        self
    }

    fn fetch_endpoint(&self) -> &str {
        self.fetch_endpoint.as_deref().unwrap_or(&self.endpoint)
    }
}

/// How a mutation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The server accepted the write; the entity is the authoritative copy.
    Confirmed(VersionedEntity),
    /// The write was queued; the entity is the optimistic copy.
    Queued {
        op_id: OperationId,
        entity: VersionedEntity,
    },
}

impl MutationOutcome {
    pub fn entity(&self) -> &VersionedEntity {
        match self {
            MutationOutcome::Confirmed(entity) => entity,
            MutationOutcome::Queued { entity, .. } => entity,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued { .. })
    }
}

/// Entry point for UI-initiated changes.
pub struct SyncCoordinator {
    scheduler: Arc<SyncScheduler>,
    connectivity: ConnectivityMonitor,
}

impl SyncCoordinator {
    pub fn new(scheduler: Arc<SyncScheduler>, connectivity: ConnectivityMonitor) -> Self {
        Self {
            scheduler,
            connectivity,
        }
    }

    /// Current local view of an entity.
    pub fn entity(&self, entity_ref: &EntityRef) -> Result<Option<VersionedEntity>> {
        self.scheduler.records().get(entity_ref)
    }

    /// Every cached entity of a type.
    pub fn load(&self, entity_type: &str) -> Result<Vec<VersionedEntity>> {
        self.scheduler.records().query(entity_type)
    }

    /// Cache server entities for offline reads.
    pub fn seed(&self, entity_type: &str, entities: Vec<VersionedEntity>) -> Result<usize> {
        let count = self.scheduler.records().bulk_put(entity_type, entities)?;
        tracing::debug!(entity_type, count, "Seeded record cache");
        Ok(count)
    }

    /// Apply a change optimistically and sync it.
    ///
    /// Invalid requests fail before anything is written. Offline, or while
    /// earlier changes to the same entity are still queued, the write is
    /// queued. Online, it is sent directly; network and server failures fall
    /// back to the queue.
    pub async fn mutate(&self, request: MutationRequest) -> Result<MutationOutcome> {
        validate_patch(&request.patch)?;
        if !request.method.is_queueable() {
            return Err(SyncError::Validation(format!(
                "{} requests cannot change an entity",
                request.method
            )));
        }

        let records = self.scheduler.records();
        let current = records.get(&request.entity)?.ok_or_else(|| {
            SyncError::Validation(format!("unknown entity {}", request.entity))
        })?;

        let mut write =
            EntityWrite::begin(&current, request.patch.clone(), self.scheduler.clock().now())?;
        records.put(&request.entity, write.optimistic())?;
        tracing::debug!(
            entity = %request.entity,
            version = write.optimistic().version,
            "Optimistic write applied"
        );

        if !self.connectivity.is_online() {
            return self.enqueue(&request, &mut write);
        }
        if self.scheduler.queue().has_outstanding(&request.entity)? {
            tracing::debug!(entity = %request.entity, "Earlier changes queued, keeping order");
            return self.enqueue(&request, &mut write);
        }

        let http = TransportRequest::new(request.method, request.endpoint.clone())
            .with_payload(write.payload())
            .authorized(self.scheduler.auth());

        match self.scheduler.transport().execute(http).await {
            Ok(response) => match response.error_class() {
                None => {
                    let confirmed = write.confirm(&response.body, self.scheduler.clock().now())?;
                    records.put(&request.entity, &confirmed)?;
                    tracing::info!(
                        entity = %request.entity,
                        version = confirmed.version,
                        "Write confirmed"
                    );
                    Ok(MutationOutcome::Confirmed(confirmed))
                }
                Some(ErrorClass::VersionConflict) => {
                    let snapshot = write.roll_back()?;
                    records.put(&request.entity, &snapshot)?;
                    let server_version = self.refetch(&request, &snapshot).await;
                    tracing::warn!(
                        entity = %request.entity,
                        expected = write.expected_version(),
                        server_version = ?server_version,
                        "Stale write rolled back"
                    );
                    Err(SyncError::StaleWrite {
                        entity: request.entity,
                        server_version,
                    })
                }
                Some(class) if self.scheduler.queue().policy().fails_fast(class) => {
                    let snapshot = write.roll_back()?;
                    records.put(&request.entity, &snapshot)?;
                    tracing::warn!(
                        entity = %request.entity,
                        status = response.status,
                        "Write rejected"
                    );
                    Err(SyncError::Rejected {
                        entity: request.entity,
                        status: response.status,
                    })
                }
                Some(_) => {
                    tracing::warn!(
                        entity = %request.entity,
                        error = %response.describe(),
                        "Immediate write failed, queueing"
                    );
                    self.enqueue(&request, &mut write)
                }
            },
            Err(err) => {
                tracing::warn!(entity = %request.entity, error = %err, "Immediate write failed, queueing");
                self.enqueue(&request, &mut write)
            }
        }
    }

    fn enqueue(&self, request: &MutationRequest, write: &mut EntityWrite) -> Result<MutationOutcome> {
        let op_id = self.scheduler.queue().enqueue(
            request.kind.clone(),
            request.method,
            request.endpoint.clone(),
            write.payload(),
            Some(request.entity.clone()),
        )?;
        write.queue()?;
        self.scheduler.refresh_status();

        Ok(MutationOutcome::Queued {
            op_id,
            entity: write.optimistic().clone(),
        })
    }

    /// Replace the local copy with the server's after a stale write. Returns
    /// the server version when the refetch worked.
    async fn refetch(
        &self,
        request: &MutationRequest,
        snapshot: &VersionedEntity,
    ) -> Option<Version> {
        let http = TransportRequest::new(Method::Get, request.fetch_endpoint())
            .authorized(self.scheduler.auth());
        let response = match self.scheduler.transport().execute(http).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                tracing::warn!(entity = %request.entity, status = response.status, "Refetch failed");
                return None;
            }
            Err(err) => {
                tracing::warn!(entity = %request.entity, error = %err, "Refetch failed");
                return None;
            }
        };

        let mut body = response.body;
        if let Some(map) = body.as_object_mut() {
            map.entry("id")
                .or_insert_with(|| request.entity.entity_id.clone().into());
        }
        let server = match VersionedEntity::from_value(body) {
            Ok(server) => server,
            Err(err) => {
                tracing::warn!(entity = %request.entity, error = %err, "Refetched body is not an entity");
                return None;
            }
        };

        match snapshot.accept(server) {
            Ok(server) => {
                let version = server.version;
                if let Err(err) = self.scheduler.records().put(&request.entity, &server) {
                    tracing::warn!(entity = %request.entity, error = %err, "Failed to cache refetched entity");
                }
                Some(version)
            }
            Err(err) => {
                tracing::warn!(entity = %request.entity, error = %err, "Refetched entity is older than local copy");
                None
            }
        }
    }
}
