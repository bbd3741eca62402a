//! Ties the registry, the status streams and the aggregate together.
//!
//! One `Monitor` is built per hosting process. Registry mutations go
//! through it so subscriptions and the aggregate table are reconciled in
//! the same call that changed the registry.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::broadcast;

use crate::aggregate::{AggregateState, AggregateStateMachine};
use crate::config::AlarmConfig;
use crate::device::{Contact, Device, DeviceId, DeviceInfo};
use crate::error::RegistryError;
use crate::feed::Feed;
use crate::messages::{AlarmEdge, RegistryEvent, StreamEvent};
use crate::registry::DeviceRegistry;
use crate::store::DeviceStore;
use crate::stream::StatusStreamManager;

pub struct Monitor<F: Feed, S: DeviceStore> {
    feed: Arc<F>,
    registry: DeviceRegistry<S>,
    streams: StatusStreamManager<F>,
    aggregate: Arc<AggregateStateMachine>,
    started: bool,
}

impl<F: Feed, S: DeviceStore> Monitor<F, S> {
    pub fn new(feed: Arc<F>, registry: DeviceRegistry<S>, alarm: &AlarmConfig) -> Self {
        let aggregate = Arc::new(AggregateStateMachine::new(alarm.edge_buffer()));
        let streams = StatusStreamManager::new(feed.clone(), aggregate.clone(), alarm.status_buffer());
        Monitor {
            feed,
            registry,
            streams,
            aggregate,
            started: false,
        }
    }

    /// Start watching every registered device. Until this is called the
    /// monitor only edits the registry and the mirrored info.
    pub fn start(&mut self) {
        self.started = true;
        self.reconcile();
        info!("Monitoring {} devices", self.registry.list().len());
    }

    pub async fn add_device(&mut self, name: &str, address: &str) -> Result<DeviceId, RegistryError> {
        let id = self.registry.add(name, address)?;
        self.mirror_info(&id).await;
        self.reconcile();
        Ok(id)
    }

    /// Remove a device. When this returns its subscription is cancelled and
    /// its entry is gone from the aggregate.
    pub async fn remove_device(&mut self, id: &DeviceId) -> Result<Device, RegistryError> {
        let removed = self.registry.remove(id)?;
        // The stream may already be gone (ended, or failed to reopen) while
        // its last record is still in the table
        self.streams.cancel(id);
        self.aggregate.remove(id);
        self.reconcile();
        if let Err(err) = self.feed.delete_info(id).await {
            warn!("Error deleting feed info for {}: {}", id, err);
        }
        Ok(removed)
    }

    pub async fn rename_device(&mut self, id: &DeviceId, name: &str) -> Result<(), RegistryError> {
        self.registry.rename(id, name)?;
        self.mirror_info(id).await;
        Ok(())
    }

    /// Replace the contact list of a device. The feed copy is overwritten
    /// as a whole.
    pub async fn set_contacts(
        &mut self,
        id: &DeviceId,
        contacts: Vec<Contact>,
    ) -> Result<(), RegistryError> {
        self.registry.set_contacts(id, contacts)?;
        self.mirror_info(id).await;
        Ok(())
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.list()
    }

    pub fn is_watching(&self, id: &DeviceId) -> bool {
        self.streams.is_subscribed(id)
    }

    pub fn snapshot(&self) -> AggregateState {
        self.aggregate.snapshot()
    }

    pub fn subscribe_to_alarm_edges(&self) -> broadcast::Receiver<AlarmEdge> {
        self.aggregate.subscribe()
    }

    pub fn subscribe_to_status(&self) -> broadcast::Receiver<StreamEvent> {
        self.streams.subscribe()
    }

    pub fn subscribe_to_registry(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn aggregate(&self) -> Arc<AggregateStateMachine> {
        self.aggregate.clone()
    }

    /// Re-run reconciliation, reopening streams that failed or ended.
    pub fn refresh(&mut self) {
        self.reconcile();
    }

    pub async fn shutdown(&mut self) {
        self.started = false;
        self.streams.shutdown().await;
        info!("Monitor stopped");
    }

    fn reconcile(&mut self) {
        if !self.started {
            return;
        }
        let devices = self.registry.list();
        for id in self.streams.reconcile(&devices) {
            self.aggregate.remove(&id);
        }
    }

    async fn mirror_info(&self, id: &DeviceId) {
        let Some(device) = self.registry.get(id) else {
            return;
        };
        // The registry stays authoritative; the feed copy catches up on the
        // next edit
        if let Err(err) = self.feed.write_info(id, &DeviceInfo::from(device)).await {
            warn!("Error writing feed info for {}: {}", id, err);
        }
    }
}
