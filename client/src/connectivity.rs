//! Connectivity signal.
//!
//! The host application reports network changes through
//! [`ConnectivityMonitor::set_online`]. A reconnect listener turns every
//! offline -> online edge into exactly one drain.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::scheduler::SyncScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Shared online/offline flag. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state: Arc::new(state),
        }
    }

    /// Publish the current network state. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let next = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(state = ?next, "Connectivity changed");
        }
        changed
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Drain the queue once per offline -> online transition.
    ///
    /// The task ends when the scheduler is dropped or every monitor clone is.
    pub fn spawn_reconnect_listener(&self, scheduler: &Arc<SyncScheduler>) -> JoinHandle<()> {
        let mut changes = self.subscribe();
        let mut previous = *changes.borrow_and_update();
        let scheduler = Arc::downgrade(scheduler);

        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let current = *changes.borrow_and_update();
                let reconnected =
                    previous == Connectivity::Offline && current == Connectivity::Online;
                previous = current;
                if !reconnected {
                    continue;
                }

                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                scheduler.trigger_on_reconnect().await;
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Offline)
    }
}
