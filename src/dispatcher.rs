//! Drives user-facing alert effects from alarm edges.
//!
//! Every alert channel hangs off one dispatcher reading the single edge
//! stream, so no channel re-derives danger from raw status and the same
//! edge is never started twice.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::aggregate::AggregateStateMachine;
use crate::device::DeviceId;
use crate::feed::MqttFeed;
use crate::messages::AlarmEdge;

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    /// Start alert effects. `cause` is the device that raised the alarm.
    async fn start(&self, cause: DeviceId);

    async fn stop(&self);
}

/// Alerts through the log.
pub struct LogAlert;

#[async_trait]
impl AlertSink for LogAlert {
    fn name(&self) -> &str {
        "log"
    }

    async fn start(&self, cause: DeviceId) {
        warn!("DANGER DETECTED: device {} needs help", cause);
    }

    async fn stop(&self) {
        info!("All devices safe, alarm stopped");
    }
}

/// Publishes the alarm level to the broker for other consumers.
pub struct MqttAlert {
    feed: Arc<MqttFeed>,
}

impl MqttAlert {
    pub fn new(feed: Arc<MqttFeed>) -> Self {
        MqttAlert { feed }
    }
}

#[async_trait]
impl AlertSink for MqttAlert {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn start(&self, cause: DeviceId) {
        if let Err(err) = self.feed.announce_alarm(true, Some(cause)).await {
            error!("Error announcing alarm on MQTT: {}", err);
        }
    }

    async fn stop(&self) {
        if let Err(err) = self.feed.announce_alarm(false, None).await {
            error!("Error announcing alarm on MQTT: {}", err);
        }
    }
}

pub struct AlertDispatcher {
    aggregate: Arc<AggregateStateMachine>,
    sinks: Vec<Box<dyn AlertSink>>,
    active: bool,
}

impl AlertDispatcher {
    pub fn new(aggregate: Arc<AggregateStateMachine>) -> Self {
        AlertDispatcher {
            aggregate,
            sinks: Vec::new(),
            active: false,
        }
    }

    pub fn with_sink(mut self, sink: impl AlertSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Drive the sinks until `shutdown` resolves, then stop any running
    /// alert. An alarm already active when the dispatcher starts is started
    /// immediately.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let (active, mut edges) = self.aggregate.subscribe_with_state();
        if active {
            self.resync().await;
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Alert dispatcher shutting down");
                    break;
                }
                received = edges.recv() => match received {
                    Ok(edge) => self.dispatch(&edge).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Alert dispatcher lagged by {} edges, resyncing", skipped);
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Alarm edge stream closed");
                        break;
                    }
                },
            }
        }

        if self.active {
            self.stop_all().await;
        }
    }

    pub async fn dispatch(&mut self, edge: &AlarmEdge) {
        match edge {
            AlarmEdge::Rising(cause) => {
                if self.active {
                    debug!("Ignoring rising edge while alert already running");
                    return;
                }
                self.start_all(*cause).await;
            }
            AlarmEdge::Falling(_) => {
                if !self.active {
                    return;
                }
                self.stop_all().await;
            }
        }
    }

    async fn resync(&mut self) {
        let snapshot = self.aggregate.snapshot();
        match (snapshot.any_danger(), self.active) {
            (true, false) => {
                if let Some(cause) = snapshot.danger_sources().first() {
                    self.start_all(*cause).await;
                }
            }
            (false, true) => self.stop_all().await,
            _ => {}
        }
    }

    fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    async fn start_all(&mut self, cause: DeviceId) {
        self.active = true;
        debug!("Starting alert sinks: {:?}", self.sink_names());
        join_all(self.sinks.iter().map(|sink| sink.start(cause))).await;
    }

    async fn stop_all(&mut self) {
        self.active = false;
        debug!("Stopping alert sinks: {:?}", self.sink_names());
        join_all(self.sinks.iter().map(|sink| sink.stop())).await;
    }
}
