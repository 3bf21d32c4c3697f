//! usb-unlocker daemon
//!
//! Unlocks a folder when a specific USB key is plugged in. The core is the
//! attach/detach state machine in [`binding`], guarded by the single-permit
//! [`gate`] and driving the external helper through [`dispatcher`]. The
//! [`usb`] adapter feeds it hotplug events and [`control_server`] exposes the
//! identity query of [`control`] on a Unix socket.

pub mod binding;
pub mod config;
pub mod control;
pub mod control_server;
pub mod controller;
pub mod dispatcher;
pub mod gate;
pub mod matcher;
pub mod secret;
pub mod service;
pub mod usb;

pub use binding::{
    AttachError, AttachOutcome, Binding, BindingId, BindingLifecycle, BindingState, DetachError,
    TornDown,
};
pub use config::{ConfigurationError, Mode, RuntimeConfig, UnlockerConfig};
pub use control::{ConfigChannel, ConfigError, TransferBuffer};
pub use dispatcher::{
    DispatchError, DispatchMode, DispatchRequest, Dispatcher, HelperDispatcher, Interruption,
};
pub use gate::{AdmissionError, ExclusivityGate, GatePermit};
pub use matcher::{TargetIdentity, matches};
pub use secret::{SecretError, SecretMaterial};
