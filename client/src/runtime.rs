//! Wiring of the sync components for one session.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::coordinator::SyncCoordinator;
use crate::error::Result;
use crate::queue::OperationQueue;
use crate::records::LocalRecordStore;
use crate::resolver::ConflictResolver;
use crate::scheduler::{DrainOutcome, SyncScheduler};
use crate::store::DurableStore;
use crate::transport::{AuthTokenProvider, HttpTransport, Transport};

/// One sync engine instance: queue, scheduler, resolver and coordinator
/// sharing a store and a transport.
///
/// Connectivity starts offline. The host reports the real state with
/// `connectivity().set_online(..)`; going online drains anything left in the
/// queue from earlier sessions.
pub struct SyncRuntime {
    config: SyncConfig,
    scheduler: Arc<SyncScheduler>,
    coordinator: SyncCoordinator,
    resolver: ConflictResolver,
    connectivity: ConnectivityMonitor,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncRuntime {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Result<Self> {
        Self::with_clock(config, store, transport, auth, Arc::new(SystemClock))
    }

    /// Build a runtime that talks HTTP to `config.base_url`.
    pub fn http(
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        auth: Arc<dyn AuthTokenProvider>,
    ) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.base_url.clone()));
        Self::new(config, store, transport, auth)
    }

    pub fn with_clock(
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthTokenProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(OperationQueue::new(
            store.clone(),
            config.retry_policy(),
            clock.clone(),
        ));
        let records = Arc::new(LocalRecordStore::new(store));
        let scheduler = Arc::new(SyncScheduler::new(
            queue,
            records,
            transport,
            auth,
            clock,
            config.batch_size,
        ));
        let connectivity = ConnectivityMonitor::default();

        Ok(Self {
            coordinator: SyncCoordinator::new(scheduler.clone(), connectivity.clone()),
            resolver: ConflictResolver::new(scheduler.clone()),
            config,
            scheduler,
            connectivity,
            tasks: Vec::new(),
        })
    }

    /// Recover interrupted work and start background tasks. Must run inside a
    /// tokio runtime. Returns the number of requeued operations.
    pub fn start(&mut self) -> Result<usize> {
        let requeued = self.scheduler.queue().requeue_interrupted()?;

        if let Some(retry_loop) = self.scheduler.start() {
            self.tasks.push(retry_loop);
        }
        if self.config.reconnect_drain {
            self.tasks
                .push(self.connectivity.spawn_reconnect_listener(&self.scheduler));
        }
        self.scheduler.refresh_status();

        tracing::info!(
            requeued,
            max_retries = self.config.max_retries,
            batch_size = self.config.batch_size,
            "Sync runtime started"
        );
        Ok(requeued)
    }

    /// Stop background tasks. Queued work stays in the store.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("Sync runtime stopped");
    }

    /// Drain now, on explicit user request.
    pub async fn sync_now(&self) -> DrainOutcome {
        self.scheduler.trigger_manual().await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        self.scheduler.queue()
    }

    pub fn records(&self) -> &Arc<LocalRecordStore> {
        self.scheduler.records()
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
