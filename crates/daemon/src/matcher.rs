//! Device identity matching

use common::DeviceDescriptor;
use tracing::debug;

/// The identity a device must present to trigger an unlock
///
/// Vendor id is always compared. Each string field is only compared when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIdentity {
    pub vendor_id: u16,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
}

impl TargetIdentity {
    /// Identity requiring only the vendor id
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            product: None,
            manufacturer: None,
            serial: None,
        }
    }

    /// Snapshot every field a device reports
    pub fn from_device(device: &DeviceDescriptor) -> Self {
        Self {
            vendor_id: device.vendor_id,
            product: device.product.clone(),
            manufacturer: device.manufacturer.clone(),
            serial: device.serial.clone(),
        }
    }

    /// Whether product, manufacturer and serial are all pinned
    pub fn is_complete(&self) -> bool {
        self.product.is_some() && self.manufacturer.is_some() && self.serial.is_some()
    }
}

/// Decide whether `device` is the configured target
///
/// String comparison is byte-exact and case-sensitive. A pinned field that the
/// device does not report is a mismatch.
pub fn matches(device: &DeviceDescriptor, target: &TargetIdentity) -> bool {
    if device.vendor_id != target.vendor_id {
        debug!(
            "vendor mismatch: device {:04x}, target {:04x}",
            device.vendor_id, target.vendor_id
        );
        return false;
    }

    let fields = [
        ("product", &target.product, &device.product),
        ("manufacturer", &target.manufacturer, &device.manufacturer),
        ("serial", &target.serial, &device.serial),
    ];

    for (name, wanted, actual) in fields {
        let Some(wanted) = wanted else { continue };
        if actual.as_deref() != Some(wanted.as_str()) {
            debug!("{} mismatch", name);
            return false;
        }
    }

    true
}
