//! Test utilities for usb-unlocker
//!
//! Builders for device descriptors and handles used across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{mock_descriptor, mock_handle};
//!
//! let device = mock_descriptor(0x1234);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(mock_handle(4).address(), 4);
//! ```

use crate::usb_types::{DeviceDescriptor, DeviceHandle};

/// Handle on bus 1 at the given address
pub fn mock_handle(address: u8) -> DeviceHandle {
    DeviceHandle::new(1, address, vec![address % 8])
}

/// Descriptor with every string field populated
pub fn mock_descriptor(vendor_id: u16) -> DeviceDescriptor {
    mock_descriptor_with(vendor_id, "Test Key", "Test Manufacturer", "SN000001")
}

/// Descriptor with explicit product, manufacturer and serial strings
pub fn mock_descriptor_with(
    vendor_id: u16,
    product: &str,
    manufacturer: &str,
    serial: &str,
) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id: 0x0001,
        manufacturer: Some(manufacturer.to_string()),
        product: Some(product.to_string()),
        serial: Some(serial.to_string()),
    }
}

/// Descriptor for a device that reports no string descriptors
pub fn mock_bare_descriptor(vendor_id: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id: 0x0001,
        ..Default::default()
    }
}
