//! Hotplug watcher
//!
//! The libusb callback only forwards raw devices over a std channel; opening
//! the device and reading string descriptors happens afterwards on the worker
//! thread, outside libusb's callback context.

use common::{DeviceDescriptor, DeviceHandle, HotplugEvent, HotplugSource};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

enum Notice {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

/// Vendor-filtered view of the USB bus
pub struct HotplugWatcher {
    context: Context,
    vendor_id: u16,
    source: HotplugSource,
    notices: Receiver<Notice>,
    /// (bus, address) -> handle reported on arrival
    known: HashMap<(u8, u8), DeviceHandle>,
    _registration: Registration<Context>,
}

impl HotplugWatcher {
    /// Register for hotplug events of `vendor_id`
    ///
    /// Devices already present are reported as arrivals on the first call to
    /// [`HotplugWatcher::process_pending`].
    pub fn new(vendor_id: u16, source: HotplugSource) -> Result<Self, rusb::Error> {
        if !rusb::has_hotplug() {
            error!("libusb was built without hotplug support");
            return Err(rusb::Error::NotSupported);
        }

        let context = Context::new()?;
        let (tx, notices) = mpsc::channel();

        let registration = HotplugBuilder::new()
            .vendor_id(vendor_id)
            .enumerate(true)
            .register(&context, Box::new(HotplugCallback { tx }))?;

        info!("Watching for USB devices with vendor id {:04x}", vendor_id);

        Ok(Self {
            context,
            vendor_id,
            source,
            notices,
            known: HashMap::new(),
            _registration: registration,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Turn queued callbacks into hotplug events
    ///
    /// Returns an error once the receiving side of the bridge is gone.
    pub fn process_pending(&mut self) -> common::Result<()> {
        loop {
            match self.notices.try_recv() {
                Ok(Notice::Arrived(device)) => self.handle_arrived(device)?,
                Ok(Notice::Left(device)) => self.handle_left(device)?,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn handle_arrived(&mut self, device: Device<Context>) -> common::Result<()> {
        let bus = device.bus_number();
        let address = device.address();

        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    "Failed to read descriptor for bus={}, addr={}: {}",
                    bus, address, e
                );
                return Ok(());
            }
        };

        if descriptor.vendor_id() != self.vendor_id {
            debug!(
                "Ignoring bus={}, addr={}: vendor {:04x}",
                bus,
                address,
                descriptor.vendor_id()
            );
            return Ok(());
        }

        let (manufacturer, product, serial) = read_strings(&device, &descriptor);
        let handle = DeviceHandle::new(bus, address, device.port_numbers().unwrap_or_default());
        let device = DeviceDescriptor {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            manufacturer,
            product,
            serial,
        };

        info!("Device arrived: {} at {}", device, handle);
        self.known.insert((bus, address), handle.clone());
        self.source.send_event(HotplugEvent::Arrived { handle, device })
    }

    fn handle_left(&mut self, device: Device<Context>) -> common::Result<()> {
        let key = (device.bus_number(), device.address());
        match self.known.remove(&key) {
            Some(handle) => {
                info!("Device left: {}", handle);
                self.source.send_event(HotplugEvent::Left { handle })
            }
            None => {
                debug!("Untracked device left: bus={}, addr={}", key.0, key.1);
                Ok(())
            }
        }
    }
}

/// Read manufacturer, product and serial strings
///
/// A device that cannot be opened reports no strings; in enforcement mode
/// such a device never matches a pinned field.
fn read_strings(
    device: &Device<Context>,
    descriptor: &rusb::DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let handle = match device.open() {
        Ok(h) => h,
        Err(e) => {
            warn!(
                "Cannot open bus={}, addr={} to read strings: {}",
                device.bus_number(),
                device.address(),
                e
            );
            return (None, None, None);
        }
    };

    let read =
        |index: Option<u8>| index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}

struct HotplugCallback {
    tx: Sender<Notice>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.send(Notice::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.tx.send(Notice::Left(device));
    }
}
