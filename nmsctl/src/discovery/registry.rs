use dashmap::DashSet;
use std::sync::Arc;

use crate::types::DiscoveryId;

/// Discovery ids with a pipeline run in flight. A run holds a [`RunGuard`] for its whole
/// lifetime, so one id is never processed twice at the same time.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    running: Arc<DashSet<DiscoveryId>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`, or `None` if a run for it is already in flight.
    pub fn try_acquire(&self, id: DiscoveryId) -> Option<RunGuard> {
        self.running.insert(id).then(|| RunGuard {
            id,
            running: self.running.clone(),
        })
    }

    pub fn is_running(&self, id: DiscoveryId) -> bool {
        self.running.contains(&id)
    }
}

/// Releases its discovery id on drop.
#[derive(Debug)]
pub struct RunGuard {
    id: DiscoveryId,
    running: Arc<DashSet<DiscoveryId>>,
}

impl RunGuard {
    pub fn id(&self) -> DiscoveryId {
        self.id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}
