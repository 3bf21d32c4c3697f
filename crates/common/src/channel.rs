//! Async channel bridge between the USB hotplug thread and the Tokio runtime

use crate::usb_types::{DeviceDescriptor, DeviceHandle};
use async_channel::{Receiver, Sender, bounded};

/// Hotplug notifications from the USB thread
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    /// A device with the configured vendor id was connected
    Arrived {
        /// Handle identifying this attachment
        handle: DeviceHandle,
        /// Descriptor and string fields read at arrival
        device: DeviceDescriptor,
    },

    /// A previously reported device was removed
    Left {
        /// Handle of the removed device
        handle: DeviceHandle,
    },
}

/// Receiving side (async, Tokio runtime)
#[derive(Clone)]
pub struct HotplugBridge {
    event_rx: Receiver<HotplugEvent>,
}

impl HotplugBridge {
    /// Receive the next hotplug event
    ///
    /// Fails once every [`HotplugSource`] has been dropped.
    pub async fn recv_event(&self) -> crate::Result<HotplugEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Sending side (blocking, USB thread)
#[derive(Clone)]
pub struct HotplugSource {
    event_tx: Sender<HotplugEvent>,
}

impl HotplugSource {
    /// Send an event, blocking while the channel is full
    ///
    /// Events are never dropped: a lost `Left` would strand a binding.
    pub fn send_event(&self, event: HotplugEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between the USB thread and Tokio
///
/// Returns (HotplugBridge for Tokio, HotplugSource for the USB thread)
pub fn create_hotplug_bridge() -> (HotplugBridge, HotplugSource) {
    let (event_tx, event_rx) = bounded(256);

    (HotplugBridge { event_rx }, HotplugSource { event_tx })
}
