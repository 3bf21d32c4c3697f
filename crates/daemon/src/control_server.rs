//! Control socket
//!
//! Serves [`ConfigChannel`] over a Unix domain socket. Each request is a
//! length-prefixed postcard [`ControlRequest`] answered by one
//! [`ControlResponse`]. Only root and the daemon's own user may query.

use crate::control::{ConfigChannel, ConfigError, TransferBuffer};
use common::Errno;
use protocol::{
    CONFIG_BUFFER_MAX_SIZE, ControlRequest, ControlResponse, DeviceStrings, ProtocolError,
    read_framed_async, validate_version, write_framed_async,
};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Caller-declared buffer of `capacity` bytes per field
#[derive(Debug)]
pub struct SizedBuffer {
    capacity: usize,
    filled: Option<DeviceStrings>,
}

impl SizedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            filled: None,
        }
    }

    pub fn into_strings(self) -> Option<DeviceStrings> {
        self.filled
    }
}

impl TransferBuffer for SizedBuffer {
    fn write_strings(&mut self, strings: &DeviceStrings) -> Result<(), ConfigError> {
        if self.capacity < CONFIG_BUFFER_MAX_SIZE {
            return Err(ConfigError::Fault);
        }
        self.filled = Some(*strings);
        Ok(())
    }
}

/// Build the response for one request
pub fn answer(channel: &ConfigChannel, request: &ControlRequest, authorized: bool) -> ControlResponse {
    if !authorized {
        return ControlResponse::err(Errno::EPERM as i32);
    }

    if let Err(e) = validate_version(&request.version) {
        warn!("{}", e);
        return ControlResponse::err(Errno::EINVAL as i32);
    }

    let mut buffer = SizedBuffer::new(request.buffer_len as usize);
    match channel.handle(request.code, &mut buffer) {
        Ok(()) => match buffer.into_strings() {
            Some(strings) => ControlResponse::ok(strings),
            None => ControlResponse::err(Errno::EFAULT as i32),
        },
        Err(e) => {
            debug!("control request {:#x} failed: {}", request.code, e);
            ControlResponse::err(e.errno() as i32)
        }
    }
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    channel: ConfigChannel,
    allowed_uid: u32,
}

impl ControlServer {
    /// Bind the socket, replacing a stale one, and restrict it to the owner
    pub async fn bind(path: &Path, channel: ConfigChannel) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }

        if path.exists() {
            fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        info!(
            "Control socket listening on {} (channel {})",
            path.display(),
            if channel.is_enabled() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            channel,
            allowed_uid: nix::unistd::getuid().as_raw(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let channel = self.channel.clone();
                        let allowed_uid = self.allowed_uid;
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, channel, allowed_uid).await {
                                debug!("control connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                },
            }
        }
        debug!("Control socket closed");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    channel: ConfigChannel,
    allowed_uid: u32,
) -> Result<(), ProtocolError> {
    let authorized = match stream.peer_cred() {
        Ok(cred) => {
            let uid = cred.uid();
            if uid != 0 && uid != allowed_uid {
                warn!("Refusing control request from uid {}", uid);
            }
            uid == 0 || uid == allowed_uid
        }
        Err(e) => {
            warn!("Cannot read peer credentials: {}", e);
            false
        }
    };

    loop {
        let request: ControlRequest = match read_framed_async(&mut stream).await {
            Ok(request) => request,
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let response = answer(&channel, &request, authorized);
        write_framed_async(&mut stream, &response).await?;
    }
}
