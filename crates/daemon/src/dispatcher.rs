//! External unlock helper invocation
//!
//! The helper is run as `helper targetFolder secretKey mode` with a cleared
//! environment. The wait is a polling loop so it can be cut short by host
//! shutdown (a [`CancellationToken`]) or by the configured helper timeout; in
//! both cases the child is killed and reaped before returning.

use crate::secret::SecretMaterial;
use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The only environment the helper ever sees
pub const HELPER_PATH_ENV: &str = "/sbin:/usr/sbin:/bin:/usr/bin";

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction of the folder transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Decrypt,
    Encrypt,
}

impl DispatchMode {
    /// Mode argument understood by the helper
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Decrypt => "0",
            Self::Encrypt => "1",
        }
    }
}

/// One helper invocation; built per dispatch and dropped afterwards
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub target_path: PathBuf,
    pub key: SecretMaterial,
    pub mode: DispatchMode,
}

/// Why a started helper did not run to completion
#[derive(Debug, Error)]
pub enum Interruption {
    #[error("host is shutting down")]
    Cancelled,

    #[error("helper exceeded {0:?}")]
    TimedOut(Duration),

    #[error("waiting on helper failed: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The helper could not be started at all
    #[error("failed to start helper {helper}: {source}")]
    Spawn {
        helper: String,
        #[source]
        source: io::Error,
    },

    /// The helper ran and reported failure
    #[error("helper exited unsuccessfully ({})", describe_exit(.code, .signal))]
    HelperFailed {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The dispatch could not be carried through
    #[error("helper dispatch interrupted: {0}")]
    Interrupted(#[from] Interruption),
}

impl DispatchError {
    /// Whether the attach that issued this dispatch must be torn down
    ///
    /// Start failures and helper failures leave the binding in place so the
    /// detach path still performs teardown; an interrupted dispatch does not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("killed by signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}

/// Performs the privileged folder transform
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError>;
}

/// Runs the configured helper program
#[derive(Debug, Clone)]
pub struct HelperDispatcher {
    helper: PathBuf,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl HelperDispatcher {
    pub fn new(helper: PathBuf, timeout: Option<Duration>, shutdown: CancellationToken) -> Self {
        Self {
            helper,
            timeout,
            shutdown,
        }
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    fn command(&self, request: &DispatchRequest) -> Command {
        let mut command = Command::new(&self.helper);
        command
            .arg(&request.target_path)
            .arg(OsStr::from_bytes(request.key.expose()))
            .arg(request.mode.as_arg())
            .env_clear()
            .env("PATH", HELPER_PATH_ENV)
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    fn wait(&self, mut child: Child) -> Result<ExitStatus, Interruption> {
        let started = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    kill_and_reap(&mut child);
                    return Err(Interruption::Wait(e));
                }
            }

            if self.shutdown.is_cancelled() {
                warn!("killing helper (pid {}) on shutdown", child.id());
                kill_and_reap(&mut child);
                return Err(Interruption::Cancelled);
            }

            if let Some(limit) = self.timeout
                && started.elapsed() >= limit
            {
                warn!("killing helper (pid {}) after {:?}", child.id(), limit);
                kill_and_reap(&mut child);
                return Err(Interruption::TimedOut(limit));
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Dispatcher for HelperDispatcher {
    fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(Interruption::Cancelled.into());
        }

        info!(
            "invoking helper: {} {} <redacted> {}",
            self.helper.display(),
            request.target_path.display(),
            request.mode.as_arg()
        );

        let child = self
            .command(&request)
            .spawn()
            .map_err(|source| DispatchError::Spawn {
                helper: self.helper.display().to_string(),
                source,
            })?;
        drop(request);

        debug!("helper started with pid {}", child.id());
        let status = self.wait(child)?;

        if status.success() {
            info!("helper completed successfully");
            Ok(())
        } else {
            Err(DispatchError::HelperFailed {
                code: status.code(),
                signal: status.signal(),
            })
        }
    }
}

/// Kill the child and wait a bounded time for it to be reaped
fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) if Instant::now() >= deadline => {
                warn!("helper (pid {}) could not be reaped", child.id());
                return;
            }
            Ok(None) => thread::sleep(Duration::from_millis(10)),
        }
    }
}
