//! The external real-time feed devices report to.

use std::future::Future;

use tokio::sync::mpsc;

use crate::device::{DeviceId, DeviceInfo};
use crate::error::FeedError;
use crate::messages::FeedEvent;

#[cfg(test)]
pub(crate) mod memory;
pub mod mqtt;

pub use mqtt::MqttFeed;

pub trait Feed: Send + Sync + 'static {
    /// Start delivering the status node of `device`. Each delivery carries
    /// the whole node. Only one route per device is kept; subscribing again
    /// replaces the previous receiver.
    fn subscribe_status(
        &self,
        device: &DeviceId,
    ) -> Result<mpsc::UnboundedReceiver<FeedEvent>, FeedError>;

    /// Stop routing status for `device`. Returns immediately; the remote
    /// side may still be tearing the subscription down.
    fn unsubscribe_status(&self, device: &DeviceId);

    /// Overwrite the info document of `device`.
    fn write_info(
        &self,
        device: &DeviceId,
        info: &DeviceInfo,
    ) -> impl Future<Output = Result<(), FeedError>> + Send;

    /// Remove the info document of `device`, leaving its status alone.
    fn delete_info(&self, device: &DeviceId) -> impl Future<Output = Result<(), FeedError>> + Send;
}
