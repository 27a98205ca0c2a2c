use std::sync::{Arc, PoisonError, RwLock};

use fnv::FnvHashMap;

use crate::domain::repositories::tracker::SyncSender;

/// Remote sync services known to the application, keyed by sync id.
#[derive(Clone, Default)]
pub struct SyncManager {
    senders: Arc<RwLock<FnvHashMap<i64, Arc<dyn SyncSender>>>>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sender: Arc<dyn SyncSender>) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sender.id(), sender);
    }

    pub fn get(&self, sync_id: i64) -> Option<Arc<dyn SyncSender>> {
        self.senders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sync_id)
            .cloned()
    }
}
