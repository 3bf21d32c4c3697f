//! Control channel message definitions
//!
//! The control channel is a narrow request/response interface. A caller sends
//! one [`ControlRequest`] carrying a numeric request code and the size of the
//! buffers it is prepared to receive; the daemon answers with a single
//! [`ControlResponse`] holding either the device strings or an errno value.

use crate::version::{CURRENT_VERSION, ProtocolVersion};
use serde::{Deserialize, Serialize};

/// Size of each fixed identity buffer, terminator included
pub const CONFIG_BUFFER_MAX_SIZE: usize = 64;

/// Request code for reading back the attached device's identity strings
pub const UNLOCKER_GET_CONFIG: u32 = 0x5501;

/// Known request codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    /// Return product/manufacturer/serial of the attached device
    GetConfig,
}

impl RequestCode {
    /// Numeric value sent on the wire
    pub fn code(self) -> u32 {
        match self {
            Self::GetConfig => UNLOCKER_GET_CONFIG,
        }
    }
}

impl TryFrom<u32> for RequestCode {
    type Error = u32;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            UNLOCKER_GET_CONFIG => Ok(Self::GetConfig),
            other => Err(other),
        }
    }
}

/// One fixed-size, NUL-terminated string buffer
///
/// Contents longer than `CONFIG_BUFFER_MAX_SIZE - 1` bytes are truncated so the
/// last byte is always a terminator. Unused bytes are zero.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigBuffer(#[serde(with = "serde_bytes")] [u8; CONFIG_BUFFER_MAX_SIZE]);

impl ConfigBuffer {
    /// An all-zero buffer
    pub const fn zeroed() -> Self {
        Self([0u8; CONFIG_BUFFER_MAX_SIZE])
    }

    /// Copy `src`, truncating to leave room for the terminator
    pub fn from_bytes_truncated(src: &[u8]) -> Self {
        let mut buf = [0u8; CONFIG_BUFFER_MAX_SIZE];
        let len = src.len().min(CONFIG_BUFFER_MAX_SIZE - 1);
        buf[..len].copy_from_slice(&src[..len]);
        Self(buf)
    }

    /// Raw buffer bytes
    pub fn as_bytes(&self) -> &[u8; CONFIG_BUFFER_MAX_SIZE] {
        &self.0
    }

    /// Bytes up to (not including) the first NUL
    pub fn content(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(CONFIG_BUFFER_MAX_SIZE);
        &self.0[..end]
    }

    /// Content decoded as UTF-8, replacing invalid sequences
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.content()).into_owned()
    }
}

impl Default for ConfigBuffer {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for ConfigBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConfigBuffer")
            .field(&self.to_string_lossy())
            .finish()
    }
}

/// Identity strings returned by `GetConfig`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStrings {
    pub product: ConfigBuffer,
    pub manufacturer: ConfigBuffer,
    pub serial: ConfigBuffer,
}

/// Request envelope (caller -> daemon)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Protocol version of the caller
    pub version: ProtocolVersion,
    /// Raw request code; unknown codes are answered with EINVAL
    pub code: u32,
    /// Per-field buffer size the caller can accept
    pub buffer_len: u32,
}

impl ControlRequest {
    /// Build a `GetConfig` request with full-size buffers
    pub fn get_config() -> Self {
        Self {
            version: CURRENT_VERSION,
            code: RequestCode::GetConfig.code(),
            buffer_len: CONFIG_BUFFER_MAX_SIZE as u32,
        }
    }
}

/// Response envelope (daemon -> caller)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Protocol version of the daemon
    pub version: ProtocolVersion,
    /// Device strings, or a positive errno value
    pub result: Result<DeviceStrings, i32>,
}

impl ControlResponse {
    pub fn ok(strings: DeviceStrings) -> Self {
        Self {
            version: CURRENT_VERSION,
            result: Ok(strings),
        }
    }

    pub fn err(errno: i32) -> Self {
        Self {
            version: CURRENT_VERSION,
            result: Err(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_code_conversion() {
        assert_eq!(
            RequestCode::try_from(UNLOCKER_GET_CONFIG),
            Ok(RequestCode::GetConfig)
        );
        assert_eq!(RequestCode::try_from(0xdead), Err(0xdead));
        assert_eq!(RequestCode::GetConfig.code(), UNLOCKER_GET_CONFIG);
    }

    #[test]
    fn test_buffer_short_string() {
        let buf = ConfigBuffer::from_bytes_truncated(b"YubiKey");
        assert_eq!(buf.content(), b"YubiKey");
        assert_eq!(buf.as_bytes()[7], 0);
        assert_eq!(buf.to_string_lossy(), "YubiKey");
    }

    #[test]
    fn test_buffer_truncates_and_terminates() {
        let long = vec![b'x'; CONFIG_BUFFER_MAX_SIZE * 2];
        let buf = ConfigBuffer::from_bytes_truncated(&long);
        assert_eq!(buf.content().len(), CONFIG_BUFFER_MAX_SIZE - 1);
        assert_eq!(buf.as_bytes()[CONFIG_BUFFER_MAX_SIZE - 1], 0);
    }

    #[test]
    fn test_buffer_exact_fit_is_truncated_by_one() {
        let exact = vec![b'a'; CONFIG_BUFFER_MAX_SIZE];
        let buf = ConfigBuffer::from_bytes_truncated(&exact);
        assert_eq!(buf.content().len(), CONFIG_BUFFER_MAX_SIZE - 1);
    }

    #[test]
    fn test_get_config_request_defaults() {
        let req = ControlRequest::get_config();
        assert_eq!(req.code, UNLOCKER_GET_CONFIG);
        assert_eq!(req.buffer_len as usize, CONFIG_BUFFER_MAX_SIZE);
        assert_eq!(req.version, CURRENT_VERSION);
    }
}
