//! Control channel protocol for usb-unlocker
//!
//! Defines the request/response messages exchanged between `unlockerctl` and
//! the daemon over the control socket, plus postcard-based framing.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlRequest, ControlResponse, DeviceStrings};
//! use protocol::{decode_framed, encode_framed};
//!
//! let framed = encode_framed(&ControlRequest::get_config()).unwrap();
//! let request: ControlRequest = decode_framed(&framed).unwrap();
//! assert_eq!(request.code, protocol::UNLOCKER_GET_CONFIG);
//!
//! let reply = encode_framed(&ControlResponse::ok(DeviceStrings::default())).unwrap();
//! let reply: ControlResponse = decode_framed(&reply).unwrap();
//! assert!(reply.result.is_ok());
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod version;

pub use codec::{
    MAX_FRAME_SIZE, decode_framed, decode_message, encode_framed, encode_message, read_framed,
    validate_version, write_framed,
};

#[cfg(feature = "async")]
pub use codec::{read_framed_async, write_framed_async};
pub use error::{ProtocolError, Result};
pub use messages::{
    CONFIG_BUFFER_MAX_SIZE, ConfigBuffer, ControlRequest, ControlResponse, DeviceStrings,
    RequestCode, UNLOCKER_GET_CONFIG,
};
pub use version::{CURRENT_VERSION, ProtocolVersion};
