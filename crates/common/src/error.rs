//! Common error types

use thiserror::Error;

/// Platform errno values used at the attach/detach/control boundary
pub use nix::errno::Errno;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Human readable explanation for a control channel errno
pub fn describe_errno(raw: i32) -> String {
    let errno = Errno::from_raw(raw);
    match errno {
        Errno::EPERM => "control channel disabled (daemon runs in enforcement mode)".to_string(),
        Errno::ENXIO => "no matching device is attached".to_string(),
        Errno::EFAULT => "caller buffers cannot hold the result".to_string(),
        Errno::EINVAL => "unknown or malformed request".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_errno_known_codes() {
        assert!(describe_errno(Errno::EPERM as i32).contains("disabled"));
        assert!(describe_errno(Errno::ENXIO as i32).contains("no matching device"));
        assert!(describe_errno(Errno::EFAULT as i32).contains("buffers"));
        assert!(describe_errno(Errno::EINVAL as i32).contains("unknown"));
    }

    #[test]
    fn test_describe_errno_fallback() {
        let text = describe_errno(Errno::EBUSY as i32);
        assert!(text.contains("EBUSY"));
    }
}
