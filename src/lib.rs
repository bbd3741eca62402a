//! Watches a set of fall-detection sensors through a real-time feed and
//! raises a single global alarm while any of them reports danger.

pub mod aggregate;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod messages;
pub mod monitor;
pub mod registry;
pub mod status;
pub mod store;
pub mod stream;

pub use aggregate::{AggregateState, AggregateStateMachine};
pub use device::{Contact, Device, DeviceId, DeviceInfo};
pub use error::{FeedError, RegistryError, StoreError};
pub use messages::{AlarmEdge, RegistryEvent, StreamEvent};
pub use monitor::Monitor;
pub use status::{DeviceState, DeviceStatusRecord, StatusUpdate};
