//! Common utilities for usb-unlocker
//!
//! Shared between the daemon and the control CLI: error types and errno
//! mapping, logging setup, USB identity types, and the channel bridge that
//! carries hotplug events from the USB thread into the async runtime.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{HotplugBridge, HotplugEvent, HotplugSource, create_hotplug_bridge};
pub use error::{Errno, Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceDescriptor, DeviceHandle};
