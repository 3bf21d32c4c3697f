//! Startup configuration
//!
//! Settings come from a TOML file and are then overridden field by field from
//! the command line. [`UnlockerConfig::validate`] turns the merged settings
//! into an immutable [`RuntimeConfig`]; any missing required field is fatal.

use crate::matcher::TargetIdentity;
use crate::secret::{SecretError, SecretMaterial};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing required parameter: {0}")]
    Missing(&'static str),

    #[error("invalid vendor id '{0}', expected 0x-prefixed hex or decimal in 1..=0xffff")]
    InvalidVendorId(String),

    #[error("invalid log level '{0}', must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("{field} must be an absolute path, got '{path}'")]
    RelativePath { field: &'static str, path: String },

    #[error("no configuration file found in {0:?}")]
    NotFound(Vec<PathBuf>),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config file {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("unlock key: {0}")]
    Secret(#[from] SecretError),
}

/// On-disk configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnlockerConfig {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub unlock: UnlockSettings,
    #[serde(default)]
    pub identity: IdentitySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Service name used in logs and status messages
    pub name: Option<String>,
    #[serde(default = "ServiceSettings::default_log_level")]
    pub log_level: String,
    #[serde(default = "ServiceSettings::default_control_socket")]
    pub control_socket: PathBuf,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: None,
            log_level: Self::default_log_level(),
            control_socket: Self::default_control_socket(),
        }
    }
}

impl ServiceSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_control_socket() -> PathBuf {
        PathBuf::from("/run/usb-unlocker/control.sock")
    }
}

/// Which of the two startup modes to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeSetting {
    /// Accept any device of the vendor and serve identity queries
    #[default]
    Discovery,
    /// Match the full identity and unlock
    Enforcement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockSettings {
    #[serde(default)]
    pub mode: ModeSetting,
    /// Folder handed to the helper
    pub folder: Option<String>,
    /// Absolute path of the helper program
    pub helper: Option<String>,
    /// Upper bound on helper runtime in seconds (0 = unbounded)
    #[serde(default = "UnlockSettings::default_helper_timeout")]
    pub helper_timeout_secs: u64,
    /// File holding the unlock key
    #[serde(default)]
    pub key_file: Option<String>,
}

impl Default for UnlockSettings {
    fn default() -> Self {
        Self {
            mode: ModeSetting::default(),
            folder: None,
            helper: None,
            helper_timeout_secs: Self::default_helper_timeout(),
            key_file: None,
        }
    }
}

impl UnlockSettings {
    fn default_helper_timeout() -> u64 {
        300
    }
}

/// Vendor id as written in TOML: `0x1234` string or plain integer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VendorIdValue {
    Number(u32),
    Text(String),
}

impl VendorIdValue {
    fn parse(&self) -> Result<u16, ConfigurationError> {
        match self {
            Self::Number(n) => u16::try_from(*n)
                .ok()
                .filter(|v| *v != 0)
                .ok_or_else(|| ConfigurationError::InvalidVendorId(n.to_string())),
            Self::Text(s) => parse_vendor_id(s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySettings {
    pub vendor_id: Option<VendorIdValue>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
}

/// Per-field command line overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub mode: Option<ModeSetting>,
    pub name: Option<String>,
    pub folder: Option<String>,
    pub helper: Option<String>,
    pub vendor_id: Option<String>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
    pub log_level: Option<String>,
    pub control_socket: Option<PathBuf>,
    pub key_file: Option<String>,
}

/// Operating mode with the data each mode needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Bind any device of the vendor without unlocking
    Discovery { vendor_id: u16 },
    /// Unlock `folder` when a device matching `target` arrives
    Enforcement {
        target: TargetIdentity,
        folder: PathBuf,
    },
}

impl Mode {
    pub fn vendor_id(&self) -> u16 {
        match self {
            Self::Discovery { vendor_id } => *vendor_id,
            Self::Enforcement { target, .. } => target.vendor_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => "discovery",
            Self::Enforcement { .. } => "enforcement",
        }
    }

    /// The control channel only answers during discovery
    pub fn control_channel_enabled(&self) -> bool {
        matches!(self, Self::Discovery { .. })
    }
}

/// Validated, immutable settings
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub service_name: String,
    pub log_level: String,
    pub control_socket: PathBuf,
    pub folder: PathBuf,
    pub helper: PathBuf,
    pub helper_timeout: Option<Duration>,
    pub key_file: Option<PathBuf>,
    pub mode: Mode,
}

impl RuntimeConfig {
    /// Load the process-wide unlock key
    pub fn load_secret(&self) -> Result<SecretMaterial, ConfigurationError> {
        match &self.key_file {
            Some(path) => Ok(SecretMaterial::from_file(path)?),
            None => {
                warn!("no key_file configured, using the built-in key");
                Ok(SecretMaterial::builtin())
            }
        }
    }
}

impl UnlockerConfig {
    /// Load from `path`, or the first standard location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigurationError> {
        let config_path = match path {
            Some(p) => expand(&p.to_string_lossy()),
            None => {
                let candidates = Self::candidate_paths();
                candidates
                    .iter()
                    .find(|p| p.exists())
                    .cloned()
                    .ok_or(ConfigurationError::NotFound(candidates))?
            }
        };

        let content =
            fs::read_to_string(&config_path).map_err(|source| ConfigurationError::Read {
                path: config_path.clone(),
                source,
            })?;

        let config: UnlockerConfig =
            toml::from_str(&content).map_err(|source| ConfigurationError::Parse {
                path: config_path.clone(),
                source,
            })?;

        info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from a standard location, or start empty if none exists
    ///
    /// Parse errors in an existing file are still fatal.
    pub fn load_or_default() -> Result<Self, ConfigurationError> {
        match Self::load(None) {
            Ok(config) => Ok(config),
            Err(ConfigurationError::NotFound(paths)) => {
                warn!(
                    "No configuration file found in {:?}, relying on command line",
                    paths
                );
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigurationError> {
        let write_err = |reason: String| ConfigurationError::Write {
            path: path.to_path_buf(),
            reason,
        };
        let content = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        fs::write(path, content).map_err(|e| write_err(e.to_string()))?;

        info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Starter file for first-time setup (discovery mode)
    pub fn template() -> Self {
        Self {
            service: ServiceSettings {
                name: Some("usb_unlocker".to_string()),
                ..ServiceSettings::default()
            },
            unlock: UnlockSettings {
                folder: Some("/srv/vault".to_string()),
                helper: Some("/usr/libexec/usb-unlocker-helper".to_string()),
                ..UnlockSettings::default()
            },
            identity: IdentitySettings {
                vendor_id: Some(VendorIdValue::Text("0x0000".to_string())),
                ..IdentitySettings::default()
            },
        }
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-unlocker").join("unlocker.toml")
        } else {
            PathBuf::from(".config/usb-unlocker/unlocker.toml")
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/usb-unlocker/unlocker.toml"),
        ]
    }

    /// Replace file values with any command line values
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(mode) = overrides.mode {
            self.unlock.mode = mode;
        }
        if let Some(name) = overrides.name {
            self.service.name = Some(name);
        }
        if let Some(level) = overrides.log_level {
            self.service.log_level = level;
        }
        if let Some(socket) = overrides.control_socket {
            self.service.control_socket = socket;
        }
        if let Some(folder) = overrides.folder {
            self.unlock.folder = Some(folder);
        }
        if let Some(helper) = overrides.helper {
            self.unlock.helper = Some(helper);
        }
        if let Some(key_file) = overrides.key_file {
            self.unlock.key_file = Some(key_file);
        }
        if let Some(vendor_id) = overrides.vendor_id {
            self.identity.vendor_id = Some(VendorIdValue::Text(vendor_id));
        }
        if let Some(product) = overrides.product {
            self.identity.product = Some(product);
        }
        if let Some(manufacturer) = overrides.manufacturer {
            self.identity.manufacturer = Some(manufacturer);
        }
        if let Some(serial) = overrides.serial {
            self.identity.serial = Some(serial);
        }
    }

    /// Check required fields and build the runtime configuration
    pub fn validate(&self) -> Result<RuntimeConfig, ConfigurationError> {
        if !VALID_LOG_LEVELS.contains(&self.service.log_level.as_str()) {
            return Err(ConfigurationError::InvalidLogLevel(
                self.service.log_level.clone(),
            ));
        }

        let service_name = required(&self.service.name, "service.name")?.to_string();
        let folder = expand(required(&self.unlock.folder, "unlock.folder")?);
        let helper = expand(required(&self.unlock.helper, "unlock.helper")?);
        let vendor_id = self
            .identity
            .vendor_id
            .as_ref()
            .ok_or(ConfigurationError::Missing("identity.vendor_id"))?
            .parse()?;

        absolute(&helper, "unlock.helper")?;
        absolute(&folder, "unlock.folder")?;

        let mode = match self.unlock.mode {
            ModeSetting::Discovery => Mode::Discovery { vendor_id },
            ModeSetting::Enforcement => Mode::Enforcement {
                target: TargetIdentity {
                    vendor_id,
                    product: Some(
                        required(&self.identity.product, "identity.product")?.to_string(),
                    ),
                    manufacturer: Some(
                        required(&self.identity.manufacturer, "identity.manufacturer")?
                            .to_string(),
                    ),
                    serial: Some(required(&self.identity.serial, "identity.serial")?.to_string()),
                },
                folder: folder.clone(),
            },
        };

        let helper_timeout = match self.unlock.helper_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(RuntimeConfig {
            service_name,
            log_level: self.service.log_level.clone(),
            control_socket: expand(&self.service.control_socket.to_string_lossy()),
            folder,
            helper,
            helper_timeout,
            key_file: self.unlock.key_file.as_deref().map(expand),
            mode,
        })
    }
}

/// Parse `0x1234`, `1234h`-free hex with prefix, or decimal
pub fn parse_vendor_id(text: &str) -> Result<u16, ConfigurationError> {
    let trimmed = text.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u16::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse::<u16>().ok()
    };

    parsed
        .filter(|v| *v != 0)
        .ok_or_else(|| ConfigurationError::InvalidVendorId(text.to_string()))
}

fn required<'a>(
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, ConfigurationError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigurationError::Missing(field))
}

fn absolute(path: &Path, field: &'static str) -> Result<(), ConfigurationError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigurationError::RelativePath {
            field,
            path: path.display().to_string(),
        })
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
