//! Identity query handler
//!
//! Answers `GetConfig` with the bound device's product, manufacturer and
//! serial strings. The handler knows nothing about sockets; the caller hands
//! it a [`TransferBuffer`] to fill.

use crate::binding::BindingLifecycle;
use common::{DeviceDescriptor, Errno};
use protocol::{ConfigBuffer, DeviceStrings, RequestCode};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("control channel is disabled")]
    Disabled,

    #[error("unknown request code {0:#x}")]
    UnknownRequest(u32),

    #[error("no device is attached")]
    NoDevice,

    #[error("result cannot be copied to the caller")]
    Fault,
}

impl ConfigError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::Disabled => Errno::EPERM,
            Self::UnknownRequest(_) => Errno::EINVAL,
            Self::NoDevice => Errno::ENXIO,
            Self::Fault => Errno::EFAULT,
        }
    }
}

/// Destination for a `GetConfig` result
pub trait TransferBuffer {
    /// Copy the strings out, or fail with [`ConfigError::Fault`]
    fn write_strings(&mut self, strings: &DeviceStrings) -> Result<(), ConfigError>;
}

impl TransferBuffer for DeviceStrings {
    fn write_strings(&mut self, strings: &DeviceStrings) -> Result<(), ConfigError> {
        *self = *strings;
        Ok(())
    }
}

/// Request/response handler for identity queries
#[derive(Clone)]
pub struct ConfigChannel {
    enabled: bool,
    lifecycle: Arc<BindingLifecycle>,
}

impl ConfigChannel {
    /// Channel that answers only if `enabled`; fixed for the process lifetime
    pub fn new(enabled: bool, lifecycle: Arc<BindingLifecycle>) -> Self {
        Self { enabled, lifecycle }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn handle(&self, code: u32, buffer: &mut dyn TransferBuffer) -> Result<(), ConfigError> {
        if !self.enabled {
            debug!("rejecting request {:#x}: channel disabled", code);
            return Err(ConfigError::Disabled);
        }

        match RequestCode::try_from(code) {
            Ok(RequestCode::GetConfig) => {
                let device = self.lifecycle.active_device().ok_or(ConfigError::NoDevice)?;
                buffer.write_strings(&device_strings(&device))
            }
            Err(code) => {
                warn!("unknown control request {:#x}", code);
                Err(ConfigError::UnknownRequest(code))
            }
        }
    }
}

/// Fixed-size, truncated, NUL-terminated copies of the identity strings
pub fn device_strings(device: &DeviceDescriptor) -> DeviceStrings {
    let field = |value: &Option<String>| {
        ConfigBuffer::from_bytes_truncated(value.as_deref().unwrap_or_default().as_bytes())
    };
    DeviceStrings {
        product: field(&device.product),
        manufacturer: field(&device.manufacturer),
        serial: field(&device.serial),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::dispatcher::{DispatchError, DispatchRequest, Dispatcher};
    use crate::secret::SecretMaterial;
    use common::test_utils::{mock_descriptor_with, mock_handle};
    use protocol::{CONFIG_BUFFER_MAX_SIZE, UNLOCKER_GET_CONFIG};
    use tokio_util::sync::CancellationToken;

    struct NoopDispatcher;

    impl Dispatcher for NoopDispatcher {
        fn dispatch(&self, _request: DispatchRequest) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn lifecycle(key: SecretMaterial) -> Arc<BindingLifecycle> {
        Arc::new(BindingLifecycle::new(
            Mode::Discovery { vendor_id: 0x1234 },
            key,
            Arc::new(NoopDispatcher),
            CancellationToken::new(),
        ))
    }

    struct FaultyBuffer;

    impl TransferBuffer for FaultyBuffer {
        fn write_strings(&mut self, _strings: &DeviceStrings) -> Result<(), ConfigError> {
            Err(ConfigError::Fault)
        }
    }

    #[test]
    fn test_disabled_always_eperm() {
        let lifecycle = lifecycle(SecretMaterial::builtin());
        let channel = ConfigChannel::new(false, lifecycle.clone());
        let mut out = DeviceStrings::default();

        assert_eq!(
            channel.handle(UNLOCKER_GET_CONFIG, &mut out),
            Err(ConfigError::Disabled)
        );
        lifecycle
            .attach(mock_handle(1), mock_descriptor_with(0x1234, "P", "M", "S"))
            .unwrap();
        assert_eq!(
            channel.handle(UNLOCKER_GET_CONFIG, &mut out).unwrap_err().errno(),
            Errno::EPERM
        );
        assert_eq!(channel.handle(0xdead, &mut out), Err(ConfigError::Disabled));
    }

    #[test]
    fn test_no_device_is_enxio() {
        let channel = ConfigChannel::new(true, lifecycle(SecretMaterial::builtin()));
        let mut out = DeviceStrings::default();
        let err = channel.handle(UNLOCKER_GET_CONFIG, &mut out).unwrap_err();
        assert_eq!(err, ConfigError::NoDevice);
        assert_eq!(err.errno(), Errno::ENXIO);
    }

    #[test]
    fn test_unknown_code_is_einval() {
        let channel = ConfigChannel::new(true, lifecycle(SecretMaterial::builtin()));
        let mut out = DeviceStrings::default();
        assert_eq!(
            channel.handle(0x42, &mut out).unwrap_err().errno(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_get_config_reports_device() {
        let lifecycle = lifecycle(SecretMaterial::builtin());
        lifecycle
            .attach(
                mock_handle(1),
                mock_descriptor_with(0x1234, "Vault Key", "Acme", "ABC123"),
            )
            .unwrap();
        let channel = ConfigChannel::new(true, lifecycle);

        let mut out = DeviceStrings::default();
        channel.handle(UNLOCKER_GET_CONFIG, &mut out).unwrap();
        assert_eq!(out.product.to_string_lossy(), "Vault Key");
        assert_eq!(out.manufacturer.to_string_lossy(), "Acme");
        assert_eq!(out.serial.to_string_lossy(), "ABC123");
    }

    #[test]
    fn test_copy_failure_is_efault() {
        let lifecycle = lifecycle(SecretMaterial::builtin());
        lifecycle
            .attach(mock_handle(1), mock_descriptor_with(0x1234, "P", "M", "S"))
            .unwrap();
        let channel = ConfigChannel::new(true, lifecycle);
        assert_eq!(
            channel.handle(UNLOCKER_GET_CONFIG, &mut FaultyBuffer).unwrap_err().errno(),
            Errno::EFAULT
        );
    }

    #[test]
    fn test_long_strings_are_truncated() {
        let long = "x".repeat(200);
        let strings = device_strings(&mock_descriptor_with(1, &long, "M", "S"));
        assert_eq!(strings.product.content().len(), CONFIG_BUFFER_MAX_SIZE - 1);
        assert_eq!(strings.product.as_bytes()[CONFIG_BUFFER_MAX_SIZE - 1], 0);
    }

    #[test]
    fn test_key_never_in_response() {
        let key = SecretMaterial::new(b"correct horse battery".to_vec()).unwrap();
        let lifecycle = lifecycle(key);
        lifecycle
            .attach(mock_handle(1), mock_descriptor_with(0x1234, "P", "M", "S"))
            .unwrap();
        let channel = ConfigChannel::new(true, lifecycle);

        let mut out = DeviceStrings::default();
        channel.handle(UNLOCKER_GET_CONFIG, &mut out).unwrap();
        let needle = b"correct horse";
        for field in [&out.product, &out.manufacturer, &out.serial] {
            assert!(!field.as_bytes().windows(needle.len()).any(|w| w == needle));
        }
    }
}
