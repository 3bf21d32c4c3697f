//! usb-unlockerd
//!
//! Watches for the configured USB key and runs the unlock helper when it
//! appears. In discovery mode it instead reports the attached key's identity
//! over the control socket so the configuration can be completed.

use anyhow::{Context, Result};
use clap::Parser;
use common::{create_hotplug_bridge, setup_logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use unlocker::config::{ConfigOverrides, ModeSetting};
use unlocker::control_server::ControlServer;
use unlocker::controller::Controller;
use unlocker::usb::spawn_hotplug_worker;
use unlocker::{
    BindingLifecycle, ConfigChannel, HelperDispatcher, Mode, RuntimeConfig, UnlockerConfig,
    service,
};

#[derive(Parser, Debug)]
#[command(name = "usb-unlockerd")]
#[command(author, version, about = "Unlock a folder while a USB key is present")]
#[command(long_about = "
Watches the USB bus for a configured key. In enforcement mode, plugging in a
key with the configured vendor, product, manufacturer and serial runs the
unlock helper on the target folder. In discovery mode any key of the vendor is
accepted and its identity can be read with `unlockerctl get-config`.

EXAMPLES:
    # First-time setup: find out the key's identity
    usb-unlockerd --discovery --vendor-id 0x1234

    # Run with a configuration file
    usb-unlockerd --config /etc/usb-unlocker/unlocker.toml

    # Validate the configuration and exit
    usb-unlockerd --check-config

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-unlocker/unlocker.toml
    3. /etc/usb-unlocker/unlocker.toml
    Command line options override file values.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write a starter configuration and exit
    #[arg(long)]
    save_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Accept any key of the vendor and serve identity queries
    #[arg(long, conflicts_with = "enforce")]
    discovery: bool,

    /// Require the full key identity and unlock on match
    #[arg(long)]
    enforce: bool,

    /// Service name used in logs and status messages
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// Folder handed to the helper
    #[arg(long, value_name = "PATH")]
    folder: Option<String>,

    /// Helper program
    #[arg(long, value_name = "PATH")]
    helper: Option<String>,

    /// File holding the unlock key
    #[arg(long, value_name = "PATH")]
    key_file: Option<String>,

    /// USB vendor id (0x-prefixed hex or decimal)
    #[arg(long, value_name = "ID")]
    vendor_id: Option<String>,

    /// Required product string
    #[arg(long)]
    product: Option<String>,

    /// Required manufacturer string
    #[arg(long)]
    manufacturer: Option<String>,

    /// Required serial number
    #[arg(long)]
    serial: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Control socket path
    #[arg(long, value_name = "PATH")]
    control_socket: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mode = if self.discovery {
            Some(ModeSetting::Discovery)
        } else if self.enforce {
            Some(ModeSetting::Enforcement)
        } else {
            None
        };

        ConfigOverrides {
            mode,
            name: self.name.clone(),
            folder: self.folder.clone(),
            helper: self.helper.clone(),
            vendor_id: self.vendor_id.clone(),
            product: self.product.clone(),
            manufacturer: self.manufacturer.clone(),
            serial: self.serial.clone(),
            log_level: self.log_level.clone(),
            control_socket: self.control_socket.clone(),
            key_file: self.key_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = args.config.clone().unwrap_or_else(UnlockerConfig::default_path);
        UnlockerConfig::template()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = match args.config.clone() {
        Some(path) => UnlockerConfig::load(Some(path)).context("Failed to load configuration")?,
        None => UnlockerConfig::load_or_default().context("Failed to load configuration")?,
    };
    config.apply(args.overrides());

    setup_logging(&config.service.log_level).context("Failed to setup logging")?;

    let runtime = config.validate().context("Invalid configuration")?;
    let key = runtime.load_secret().context("Failed to load unlock key")?;

    info!(
        "{} v{} starting in {} mode",
        runtime.service_name,
        env!("CARGO_PKG_VERSION"),
        runtime.mode.name()
    );

    if args.check_config {
        print_summary(&runtime);
        return Ok(());
    }

    run(runtime, key).await
}

fn print_summary(runtime: &RuntimeConfig) {
    println!("Configuration OK");
    println!("  service:  {}", runtime.service_name);
    println!("  mode:     {}", runtime.mode.name());
    println!("  vendor:   {:04x}", runtime.mode.vendor_id());
    println!("  folder:   {}", runtime.folder.display());
    println!("  helper:   {}", runtime.helper.display());
    println!("  socket:   {}", runtime.control_socket.display());
    match runtime.helper_timeout {
        Some(timeout) => println!("  timeout:  {}s", timeout.as_secs()),
        None => println!("  timeout:  none"),
    }
    if let Mode::Enforcement { target, .. } = &runtime.mode {
        println!("  product:  {}", target.product.as_deref().unwrap_or_default());
        println!(
            "  maker:    {}",
            target.manufacturer.as_deref().unwrap_or_default()
        );
        println!("  serial:   {}", target.serial.as_deref().unwrap_or_default());
    }
}

async fn run(runtime: RuntimeConfig, key: unlocker::SecretMaterial) -> Result<()> {
    let shutdown = CancellationToken::new();

    if !runtime.helper.exists() {
        warn!("Helper {} does not exist yet", runtime.helper.display());
    }

    let dispatcher = Arc::new(HelperDispatcher::new(
        runtime.helper.clone(),
        runtime.helper_timeout,
        shutdown.clone(),
    ));
    let lifecycle = Arc::new(BindingLifecycle::new(
        runtime.mode.clone(),
        key,
        dispatcher,
        shutdown.clone(),
    ));
    let channel = ConfigChannel::new(runtime.mode.control_channel_enabled(), lifecycle.clone());

    let server = ControlServer::bind(&runtime.control_socket, channel)
        .await
        .with_context(|| {
            format!(
                "Failed to bind control socket {}",
                runtime.control_socket.display()
            )
        })?;

    let (bridge, source) = create_hotplug_bridge();
    let vendor_id = runtime.mode.vendor_id();
    let worker_token = shutdown.clone();
    let usb_thread = tokio::task::spawn_blocking(move || {
        spawn_hotplug_worker(vendor_id, source, worker_token)
    })
    .await
    .context("USB startup task failed")?
    .context("Failed to start USB hotplug watcher")?;

    let mut controller =
        tokio::spawn(Controller::new(lifecycle.clone(), bridge, shutdown.clone()).run());
    let server_task = tokio::spawn(server.run(shutdown.clone()));
    let watchdog = service::spawn_watchdog_task(shutdown.clone());

    service::notify_ready().context("Failed to notify systemd ready")?;
    let status = match &runtime.mode {
        Mode::Discovery { .. } => "Discovery - waiting for a key to identify",
        Mode::Enforcement { .. } => "Running - waiting for the key",
    };
    service::notify_status(status).context("Failed to send status to systemd")?;
    info!("Press Ctrl+C to shutdown");

    let mut terminate =
        unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut controller_done = false;
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
        _ = terminate.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        result = &mut controller => {
            controller_done = true;
            if let Err(e) = result {
                error!("Controller task failed: {}", e);
            }
            warn!("Hotplug processing stopped, shutting down");
        }
    }

    if let Err(e) = service::notify_stopping() {
        warn!("{:#}", e);
    }
    shutdown.cancel();

    if !controller_done && let Err(e) = controller.await {
        error!("Controller task failed: {}", e);
    }
    // The controller tears bindings down on exit; this covers an aborted one.
    lifecycle.shutdown();

    if let Err(e) = server_task.await {
        error!("Control socket task failed: {}", e);
    }
    if let Some(watchdog) = watchdog {
        let _ = watchdog.await;
    }

    info!("Shutting down USB subsystem...");
    match tokio::task::spawn_blocking(move || usb_thread.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker thread panicked: {:?}", e),
        Err(e) => error!("Failed to join USB worker thread: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}
