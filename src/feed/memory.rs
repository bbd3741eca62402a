//! In-process feed used by the tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use super::Feed;
use crate::device::{DeviceId, DeviceInfo};
use crate::error::FeedError;
use crate::messages::FeedEvent;

#[derive(Default)]
pub struct MemoryFeed {
    routes: Mutex<HashMap<DeviceId, mpsc::UnboundedSender<FeedEvent>>>,
    info: Mutex<HashMap<DeviceId, DeviceInfo>>,
    subscribe_calls: AtomicUsize,
    /// Keep routes alive after unsubscribe, like a remote that is slow to
    /// acknowledge.
    pub lazy_unsubscribe: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl MemoryFeed {
    fn send(&self, device: &DeviceId, event: FeedEvent) -> bool {
        match self.routes.lock().unwrap().get(device) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn push_status(&self, device: &DeviceId, node: Value) -> bool {
        self.send(device, FeedEvent::Status(Some(node)))
    }

    pub fn push_missing(&self, device: &DeviceId) -> bool {
        self.send(device, FeedEvent::Status(None))
    }

    pub fn push_error(&self, device: &DeviceId, reason: &str) -> bool {
        self.send(device, FeedEvent::Error(reason.to_string()))
    }

    pub fn is_routed(&self, device: &DeviceId) -> bool {
        self.routes.lock().unwrap().contains_key(device)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn info(&self, device: &DeviceId) -> Option<DeviceInfo> {
        self.info.lock().unwrap().get(device).cloned()
    }
}

impl Feed for MemoryFeed {
    fn subscribe_status(
        &self,
        device: &DeviceId,
    ) -> Result<mpsc::UnboundedReceiver<FeedEvent>, FeedError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(FeedError::Closed);
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(*device, tx);
        Ok(rx)
    }

    fn unsubscribe_status(&self, device: &DeviceId) {
        if !self.lazy_unsubscribe.load(Ordering::SeqCst) {
            self.routes.lock().unwrap().remove(device);
        }
    }

    async fn write_info(&self, device: &DeviceId, info: &DeviceInfo) -> Result<(), FeedError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FeedError::Closed);
        }
        self.info.lock().unwrap().insert(*device, info.clone());
        Ok(())
    }

    async fn delete_info(&self, device: &DeviceId) -> Result<(), FeedError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FeedError::Closed);
        }
        self.info.lock().unwrap().remove(device);
        Ok(())
    }
}
