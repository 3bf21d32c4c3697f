//! systemd notification support
//!
//! Speaks the sd_notify datagram protocol on `NOTIFY_SOCKET`. Every call is a
//! no-op when the daemon is not started by systemd.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    Ok(true)
}

/// Tell systemd that startup finished
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Tell systemd that shutdown began
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Watchdog interval requested by systemd, in microseconds
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

/// Send keepalives at half the watchdog interval until `shutdown`
///
/// Returns `None` when no watchdog is configured.
pub fn spawn_watchdog_task(shutdown: CancellationToken) -> Option<JoinHandle<()>> {
    let timeout_usec = get_watchdog_timeout()?;
    let interval = Duration::from_micros(timeout_usec / 2).max(Duration::from_secs(1));
    info!("Systemd watchdog enabled, interval: {:?}", interval);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = notify("WATCHDOG=1") {
                        error!("Failed to send watchdog keepalive: {:#}", e);
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test so no other thread touches the environment concurrently.
    #[test]
    fn test_notify_with_and_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        // SAFETY: no other test in this crate reads or writes these variables
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
            env::remove_var("WATCHDOG_USEC");
        }
        assert!(!is_systemd());
        assert!(notify_ready().is_ok());
        assert!(notify_status("unlocking").is_ok());
        assert!(get_watchdog_timeout().is_none());

        unsafe { env::set_var("NOTIFY_SOCKET", &path) };
        let sent = notify("STATUS=testing");
        unsafe { env::remove_var("NOTIFY_SOCKET") };
        assert!(sent.unwrap());

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS=testing");
    }
}
