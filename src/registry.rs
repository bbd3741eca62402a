use log::{info, warn};
use tokio::sync::broadcast;

use crate::device::{Contact, Device, DeviceId, clean_contacts};
use crate::error::RegistryError;
use crate::messages::RegistryEvent;
use crate::store::{DeviceStore, StoredDevice};

/// The authoritative list of monitored devices.
///
/// Every mutation is applied to a copy, persisted, and only then swapped
/// in, so a storage failure leaves the in-memory list untouched.
pub struct DeviceRegistry<S: DeviceStore> {
    store: S,
    devices: Vec<Device>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<S: DeviceStore> DeviceRegistry<S> {
    /// Load the registry from its backing store. Entries with an invalid
    /// address or a repeated address are skipped with a warning.
    pub fn load(store: S) -> Result<Self, RegistryError> {
        let mut devices: Vec<Device> = Vec::new();

        for entry in store.load()? {
            let id = match DeviceId::parse(&entry.address) {
                Ok(id) => id,
                Err(err) => {
                    warn!("Skipping stored device {:?}: {}", entry.name, err);
                    continue;
                }
            };
            if devices.iter().any(|d| d.id == id) {
                warn!("Skipping duplicate stored device {}", id);
                continue;
            }
            devices.push(Device {
                id,
                name: entry.name.trim().to_string(),
                contacts: clean_contacts(entry.contacts),
            });
        }

        info!("Loaded {} monitored devices", devices.len());
        let (events, _) = broadcast::channel(64);

        Ok(DeviceRegistry {
            store,
            devices,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn list(&self) -> Vec<Device> {
        self.devices.clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == *id)
    }

    pub fn add(&mut self, name: &str, address: &str) -> Result<DeviceId, RegistryError> {
        let id = DeviceId::parse(address)?;
        let name = valid_name(name)?;

        if self.get(&id).is_some() {
            return Err(RegistryError::DuplicateAddress(id));
        }

        let mut next = self.devices.clone();
        next.push(Device {
            id,
            name,
            contacts: Vec::new(),
        });
        self.commit(next, RegistryEvent::DeviceAdded(id))?;

        info!("Registered device {}", id);
        Ok(id)
    }

    pub fn remove(&mut self, id: &DeviceId) -> Result<Device, RegistryError> {
        let index = self.index_of(id)?;

        let mut next = self.devices.clone();
        let removed = next.remove(index);
        self.commit(next, RegistryEvent::DeviceRemoved(*id))?;

        info!("Unregistered device {}", id);
        Ok(removed)
    }

    pub fn rename(&mut self, id: &DeviceId, name: &str) -> Result<&Device, RegistryError> {
        let index = self.index_of(id)?;
        let name = valid_name(name)?;

        let mut next = self.devices.clone();
        next[index].name = name;
        self.commit(next, RegistryEvent::DeviceUpdated(*id))?;

        Ok(&self.devices[index])
    }

    /// Replace the whole contact list of a device.
    pub fn set_contacts(
        &mut self,
        id: &DeviceId,
        contacts: Vec<Contact>,
    ) -> Result<&Device, RegistryError> {
        let index = self.index_of(id)?;

        let mut next = self.devices.clone();
        next[index].contacts = clean_contacts(contacts);
        self.commit(next, RegistryEvent::DeviceUpdated(*id))?;

        Ok(&self.devices[index])
    }

    fn index_of(&self, id: &DeviceId) -> Result<usize, RegistryError> {
        self.devices
            .iter()
            .position(|d| d.id == *id)
            .ok_or(RegistryError::NotFound(*id))
    }

    fn commit(&mut self, next: Vec<Device>, event: RegistryEvent) -> Result<(), RegistryError> {
        let stored: Vec<StoredDevice> = next
            .iter()
            .map(|d| StoredDevice {
                name: d.name.clone(),
                address: d.id.to_string(),
                contacts: d.contacts.clone(),
            })
            .collect();

        if let Err(err) = self.store.save(&stored) {
            warn!("Failed to persist device list: {}", err);
            return Err(err.into());
        }

        self.devices = next;
        // No receivers is fine
        let _ = self.events.send(event);
        Ok(())
    }
}

fn valid_name(name: &str) -> Result<String, RegistryError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RegistryError::EmptyName);
    }
    Ok(name.to_string())
}
