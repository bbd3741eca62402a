//! One status subscription per registered device.
//!
//! Each subscription runs its own task that waits on the feed, normalizes
//! every delivery and hands it to the aggregate. Cancelling a subscription
//! flips its liveness flag under the aggregate lock, and the pump checks
//! that flag and publishes its event under the same lock, so nothing for a
//! cancelled device is written or announced once `cancel` has returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::aggregate::AggregateStateMachine;
use crate::device::{Device, DeviceId};
use crate::error::FeedError;
use crate::feed::Feed;
use crate::messages::{FeedEvent, StreamEvent};
use crate::status::normalize_status;

/// Handle for a live status subscription bound to one device.
pub struct Subscription {
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Whether the pump task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    fn cancel(self, aggregate: &AggregateStateMachine) -> JoinHandle<()> {
        aggregate.fenced(|| self.live.store(false, Ordering::SeqCst));
        self.task.abort();
        self.task
    }
}

pub struct StatusStreamManager<F: Feed> {
    feed: Arc<F>,
    aggregate: Arc<AggregateStateMachine>,
    events: broadcast::Sender<StreamEvent>,
    subscriptions: HashMap<DeviceId, Subscription>,
}

impl<F: Feed> StatusStreamManager<F> {
    pub fn new(feed: Arc<F>, aggregate: Arc<AggregateStateMachine>, status_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(status_buffer.max(1));
        StatusStreamManager {
            feed,
            aggregate,
            events,
            subscriptions: HashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub fn is_subscribed(&self, device: &DeviceId) -> bool {
        self.subscriptions.contains_key(device)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Open a subscription for `device`. Returns `Ok(false)` when one is
    /// already open.
    pub fn open(&mut self, device: DeviceId) -> Result<bool, FeedError> {
        if self.subscriptions.contains_key(&device) {
            return Ok(false);
        }

        let rx = match self.feed.subscribe_status(&device) {
            Ok(rx) => rx,
            Err(err) => {
                warn!("Could not subscribe to status of {}: {}", device, err);
                let _ = self.events.send(StreamEvent::StreamError {
                    device,
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let live = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(pump(
            device,
            rx,
            live.clone(),
            self.aggregate.clone(),
            self.events.clone(),
        ));

        self.subscriptions.insert(device, Subscription { live, task });
        info!("Watching status of {}", device);
        Ok(true)
    }

    /// Cancel the subscription for `device`. Once this returns, no status
    /// for `device` reaches the aggregate, even if the feed keeps delivering
    /// while its own unsubscribe completes.
    pub fn cancel(&mut self, device: &DeviceId) -> bool {
        let Some(subscription) = self.subscriptions.remove(device) else {
            return false;
        };
        subscription.cancel(&self.aggregate);
        self.feed.unsubscribe_status(device);
        info!("Stopped watching status of {}", device);
        true
    }

    /// Bring subscriptions in line with `devices`: open what is missing
    /// (or whose stream ended), cancel what is no longer registered.
    /// Returns the devices whose subscriptions were cancelled.
    pub fn reconcile(&mut self, devices: &[Device]) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .subscriptions
            .keys()
            .filter(|id| !devices.iter().any(|d| d.id == **id))
            .copied()
            .collect();
        for id in &stale {
            self.cancel(id);
        }

        for device in devices {
            let ended = self
                .subscriptions
                .get(&device.id)
                .is_some_and(|s| !s.is_running());
            if ended {
                debug!("Reopening ended status stream for {}", device.id);
                self.cancel(&device.id);
            }
            if let Err(err) = self.open(device.id) {
                debug!("Subscription for {} deferred: {}", device.id, err);
            }
        }

        stale
    }

    /// Cancel every subscription and wait for the tasks to wind down.
    pub async fn shutdown(&mut self) {
        let feed = &self.feed;
        let aggregate = &self.aggregate;
        let handles: Vec<JoinHandle<()>> = self
            .subscriptions
            .drain()
            .map(|(device, subscription)| {
                feed.unsubscribe_status(&device);
                subscription.cancel(aggregate)
            })
            .collect();
        debug!("Shutting down {} status streams", handles.len());
        // Aborted tasks resolve to a cancellation error
        let _ = futures::future::join_all(handles).await;
    }
}

async fn pump(
    device: DeviceId,
    mut rx: mpsc::UnboundedReceiver<FeedEvent>,
    live: Arc<AtomicBool>,
    aggregate: Arc<AggregateStateMachine>,
    events: broadcast::Sender<StreamEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            FeedEvent::Status(node) => {
                let update = normalize_status(node.as_ref());
                debug!("Status from {}: {:?}", device, update);

                let applied = aggregate.apply_if_live(
                    device,
                    update.clone(),
                    || live.load(Ordering::SeqCst),
                    || {
                        let _ = events.send(StreamEvent::StatusChanged(device, update));
                    },
                );
                if !applied {
                    debug!("Dropping status for cancelled subscription {}", device);
                    return;
                }
            }
            FeedEvent::Error(reason) => {
                // Last known record stays in the aggregate
                if !report_error(&aggregate, &live, &events, device, reason) {
                    return;
                }
            }
        }
    }

    report_error(
        &aggregate,
        &live,
        &events,
        device,
        "feed closed the subscription".to_string(),
    );
}

fn report_error(
    aggregate: &AggregateStateMachine,
    live: &AtomicBool,
    events: &broadcast::Sender<StreamEvent>,
    device: DeviceId,
    reason: String,
) -> bool {
    aggregate.fenced(|| {
        if !live.load(Ordering::SeqCst) {
            return false;
        }
        warn!("Status stream for {} reported an error: {}", device, reason);
        let _ = events.send(StreamEvent::StreamError { device, reason });
        true
    })
}
