use thiserror::Error;

use crate::device::DeviceId;

/// Errors returned synchronously by registry mutations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid hardware address: {0:?}")]
    InvalidAddress(String),

    #[error("device name cannot be empty")]
    EmptyName,

    #[error("a device with address {0} is already registered")]
    DuplicateAddress(DeviceId),

    #[error("no device registered with address {0}")]
    NotFound(DeviceId),

    #[error("device list storage failed: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed device list: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("feed client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("failed to encode feed document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("feed connection closed")]
    Closed,
}
