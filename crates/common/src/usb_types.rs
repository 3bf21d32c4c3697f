//! USB identity types shared by the hotplug adapter and the unlock core

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one attached device instance
///
/// Derived from the bus topology at arrival time. Two handles compare equal
/// only if they name the same bus, address and port path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    bus: u8,
    address: u8,
    ports: Vec<u8>,
}

impl DeviceHandle {
    pub fn new(bus: u8, address: u8, ports: Vec<u8>) -> Self {
        Self {
            bus,
            address,
            ports,
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn address(&self) -> u8 {
        self.address
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {:03} addr {:03}", self.bus, self.address)?;
        if !self.ports.is_empty() {
            let path: Vec<String> = self.ports.iter().map(|p| p.to_string()).collect();
            write!(f, " port {}", path.join("."))?;
        }
        Ok(())
    }
}

/// Identity-relevant fields read from an attached device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Manufacturer string (if the device reports one)
    pub manufacturer: Option<String>,
    /// Product string (if the device reports one)
    pub product: Option<String>,
    /// Serial number string (if the device reports one)
    pub serial: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} {} {}",
            self.vendor_id,
            self.product_id,
            self.manufacturer.as_deref().unwrap_or("Unknown Manufacturer"),
            self.product.as_deref().unwrap_or("Unknown Product")
        )
    }
}
