//! USB host adapter
//!
//! Watches the bus for devices of the configured vendor and turns libusb
//! hotplug callbacks into [`common::HotplugEvent`]s. libusb event handling
//! runs on a dedicated thread so the Tokio runtime never blocks on it.

pub mod manager;
pub mod worker;

pub use manager::HotplugWatcher;
pub use worker::spawn_hotplug_worker;
