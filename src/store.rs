//! Durable storage for the device list.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use log::debug;
use serde_derive::{Deserialize, Serialize};

use crate::device::Contact;
use crate::error::StoreError;

/// One persisted device entry. Order in the file is the registry order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredDevice {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<Contact>,
}

pub trait DeviceStore: Send + Sync {
    fn load(&self) -> Result<Vec<StoredDevice>, StoreError>;
    fn save(&self, devices: &[StoredDevice]) -> Result<(), StoreError>;
}

/// JSON array on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }
}

impl DeviceStore for JsonFileStore {
    fn load(&self) -> Result<Vec<StoredDevice>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No device list at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, devices: &[StoredDevice]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(devices)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        debug!("Saved {} devices to {}", devices.len(), self.path.display());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("devices.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("devices.json"));
        let devices = vec![
            StoredDevice {
                name: "Nenek".to_string(),
                address: "AABBCCDDEEFF".to_string(),
                contacts: vec![Contact::new("Budi", "0812")],
            },
            StoredDevice {
                name: "Kakek".to_string(),
                address: "001122334455".to_string(),
                contacts: vec![],
            },
        ];
        store.save(&devices).unwrap();
        assert_eq!(store.load().unwrap(), devices);
    }

    #[test]
    fn test_plain_name_address_records_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, r#"[{"name": "Nenek", "address": "aa:bb:cc:dd:ee:ff"}]"#).unwrap();
        let loaded = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].contacts.is_empty());
    }

    #[test]
    fn test_garbage_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonFileStore::new(&path).load(),
            Err(StoreError::Format(_))
        ));
    }
}
