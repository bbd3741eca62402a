use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::Feed;
use crate::config;
use crate::device::{DeviceId, DeviceInfo};
use crate::error::FeedError;
use crate::messages::FeedEvent;

struct Route {
    device: DeviceId,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

/// Feed backed by an MQTT broker.
///
/// Device data lives under `{topic_path}/{ADDR}/status` and
/// `{topic_path}/{ADDR}/info`; both are expected to be retained so a fresh
/// subscription immediately receives the current node.
pub struct MqttFeed {
    client: rumqttc::AsyncClient,
    topic_path: String,
    reconnect_delay: Duration,
    // Keyed by status topic
    routes: Mutex<HashMap<String, Route>>,
    // Routes added while disconnected are subscribed on the next ConnAck
    connected: AtomicBool,
}

#[derive(Debug, Serialize)]
struct AlarmMqttMessage {
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
}

impl MqttFeed {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "fallwatch".to_string());

        let mut mqttoptions =
            MqttOptions::new(publisher_id, config.host.clone(), config.port.unwrap_or(1883));

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 64);

        (
            MqttFeed {
                client,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "devices".to_string()),
                reconnect_delay: Duration::from_secs(config.reconnect_delay_seconds.unwrap_or(5)),
                routes: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
            },
            eventloop,
        )
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drive the connection until the client disconnects. rumqttc reconnects
    /// on the next poll after an error; every live route is told about the
    /// error and re-subscribed once the broker acknowledges the connection.
    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);
                        self.route(&p.topic, decode_status(&p.payload));
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        self.connected.store(true, Ordering::SeqCst);
                        self.resubscribe();
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("MQTT client disconnected");
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    self.connected.store(false, Ordering::SeqCst);
                    self.broadcast_error(&e.to_string());
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    fn route(&self, topic: &str, event: FeedEvent) {
        let mut routes = self.routes();
        let Some(route) = routes.get(topic) else {
            debug!("Ignoring message on unrouted topic {}", topic);
            return;
        };
        if route.tx.send(event).is_err() {
            debug!("Status receiver for {} is gone, unsubscribing", route.device);
            routes.remove(topic);
            if let Err(err) = self.client.try_unsubscribe(topic) {
                warn!("Error unsubscribing from {}: {:?}", topic, err);
            }
        }
    }

    fn broadcast_error(&self, reason: &str) {
        for route in self.routes().values() {
            let _ = route.tx.send(FeedEvent::Error(reason.to_string()));
        }
    }

    fn resubscribe(&self) {
        let filters: Vec<SubscribeFilter> = self
            .routes()
            .keys()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtLeastOnce))
            .collect();
        if filters.is_empty() {
            return;
        }
        debug!("Re-subscribing {} status topics", filters.len());
        if let Err(err) = self.client.try_subscribe_many(filters) {
            error!("Error subscribing to MQTT topics: {:?}", err);
        }
    }

    /// Publish the current alarm level, retained, under `{topic_path}/alarm`.
    pub async fn announce_alarm(
        &self,
        active: bool,
        cause: Option<DeviceId>,
    ) -> Result<(), FeedError> {
        let message = AlarmMqttMessage {
            active,
            device: cause.map(|id| id.to_string()),
        };
        info!("Announcing alarm (active: {}) on MQTT", message.active);
        self.client
            .publish(
                alarm_topic(&self.topic_path),
                QoS::AtLeastOnce,
                true,
                serde_json::to_vec(&message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), FeedError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await?;
        Ok(())
    }
}

impl Feed for MqttFeed {
    fn subscribe_status(
        &self,
        device: &DeviceId,
    ) -> Result<mpsc::UnboundedReceiver<FeedEvent>, FeedError> {
        let topic = status_topic(&self.topic_path, device);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut routes = self.routes();
        routes.insert(
            topic.clone(),
            Route {
                device: *device,
                tx,
            },
        );
        if !self.connected.load(Ordering::SeqCst) {
            debug!("Routed {}, subscribing once connected", topic);
            return Ok(rx);
        }
        if let Err(err) = self.client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
            routes.remove(&topic);
            return Err(err.into());
        }

        debug!("Subscribed to {}", topic);
        Ok(rx)
    }

    fn unsubscribe_status(&self, device: &DeviceId) {
        let topic = status_topic(&self.topic_path, device);
        if self.routes().remove(&topic).is_none() || !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.client.try_unsubscribe(topic.clone()) {
            warn!("Error unsubscribing from {}: {:?}", topic, err);
        }
    }

    async fn write_info(&self, device: &DeviceId, info: &DeviceInfo) -> Result<(), FeedError> {
        let payload = serde_json::to_vec(info)?;
        self.client
            .publish(
                info_topic(&self.topic_path, device),
                QoS::AtLeastOnce,
                true,
                payload,
            )
            .await?;
        Ok(())
    }

    async fn delete_info(&self, device: &DeviceId) -> Result<(), FeedError> {
        // An empty retained message clears the retained node
        self.client
            .publish(
                info_topic(&self.topic_path, device),
                QoS::AtLeastOnce,
                true,
                Vec::new(),
            )
            .await?;
        Ok(())
    }
}

fn status_topic(topic_path: &str, device: &DeviceId) -> String {
    format!("{}/{}/status", topic_path, device)
}

fn info_topic(topic_path: &str, device: &DeviceId) -> String {
    format!("{}/{}/info", topic_path, device)
}

fn alarm_topic(topic_path: &str) -> String {
    format!("{}/alarm", topic_path)
}

/// An empty payload means the node was cleared. Text that is not JSON is
/// taken as a bare state string.
fn decode_status(payload: &[u8]) -> FeedEvent {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return FeedEvent::Status(None);
    }
    match serde_json::from_slice::<Value>(payload) {
        Ok(node) => FeedEvent::Status(Some(node)),
        Err(_) => match std::str::from_utf8(payload) {
            Ok(text) => FeedEvent::Status(Some(Value::String(text.trim().to_string()))),
            Err(_) => {
                warn!("Dropping non UTF-8 status payload");
                FeedEvent::Status(Some(Value::Object(Default::default())))
            }
        },
    }
}
