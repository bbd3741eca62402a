use crate::device::DeviceId;
use crate::status::StatusUpdate;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    DeviceUpdated(DeviceId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    StatusChanged(DeviceId, StatusUpdate),
    StreamError {
        device: DeviceId,
        reason: String,
    },
}

/// A transition of the global danger flag. Carries the device whose update
/// (or removal) caused the transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlarmEdge {
    Rising(DeviceId),
    Falling(DeviceId),
}

/// Raw delivery from the feed for one status subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// Current contents of the status node; `None` when the node is missing.
    Status(Option<serde_json::Value>),
    Error(String),
}
