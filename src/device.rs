use std::fmt;
use std::str::FromStr;

use mac_address::MacAddress;
use serde_derive::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Stable identity of a monitored device: its hardware address.
///
/// The canonical text form is twelve uppercase hex digits with no
/// separators, which is also the key the feed files device data under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(MacAddress);

impl DeviceId {
    /// Parse a user- or feed-supplied address. Separators (`:`, `-`, `.`,
    /// whitespace) are ignored and hex digits are case-insensitive.
    pub fn parse(address: &str) -> Result<Self, RegistryError> {
        let digits: Vec<char> = address
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.') && !c.is_whitespace())
            .collect();

        if digits.len() != 12 || !digits.iter().all(|c| c.is_ascii_hexdigit()) {
            return Err(RegistryError::InvalidAddress(address.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, pair) in digits.chunks(2).enumerate() {
            let pair: String = pair.iter().collect();
            bytes[i] = u8::from_str_radix(&pair, 16)
                .map_err(|_| RegistryError::InvalidAddress(address.to_string()))?;
        }

        Ok(DeviceId(MacAddress::new(bytes)))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.bytes() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for DeviceId {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::parse(s)
    }
}

/// An emergency contact attached to a device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub number: String,
}

impl Contact {
    pub fn new(name: impl Into<String>, number: impl Into<String>) -> Self {
        Contact {
            name: name.into(),
            number: number.into(),
        }
    }

    /// Parse the `Name|Number` form used on the command line. A bare number
    /// gets an empty name.
    pub fn parse(entry: &str) -> Option<Self> {
        let (name, number) = match entry.split_once('|') {
            Some((name, number)) => (name.trim(), number.trim()),
            None => ("", entry.trim()),
        };
        if number.is_empty() {
            return None;
        }
        Some(Contact::new(name, number))
    }
}

/// Trim contact fields and drop entries without a number.
pub fn clean_contacts(contacts: Vec<Contact>) -> Vec<Contact> {
    contacts
        .into_iter()
        .map(|c| Contact::new(c.name.trim(), c.number.trim()))
        .filter(|c| !c.number.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub contacts: Vec<Contact>,
}

/// Document mirrored to the feed under `{ADDR}/info`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        DeviceInfo {
            name: device.name.clone(),
            contacts: device.contacts.clone(),
        }
    }
}
