//! unlockerctl
//!
//! Operator tool for a running usb-unlockerd. `get-config` asks the daemon for
//! the identity of the attached key, which is how the enforcement settings are
//! filled in during first-time setup.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::error::describe_errno;
use common::setup_logging;
use protocol::{
    ControlRequest, ControlResponse, DeviceStrings, read_framed_async, write_framed_async,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

const DEFAULT_SOCKET: &str = "/run/usb-unlocker/control.sock";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "unlockerctl")]
#[command(author, version, about = "Query a running usb-unlockerd")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print product, manufacturer and serial of the attached key
    GetConfig {
        /// Control socket path
        #[arg(long, value_name = "PATH", default_value = DEFAULT_SOCKET)]
        socket: PathBuf,

        /// Print an [identity] block ready to paste into the config file
        #[arg(long)]
        toml: bool,
    },
}

#[derive(Serialize)]
struct IdentityFile {
    identity: IdentityBlock,
}

#[derive(Serialize)]
struct IdentityBlock {
    product: String,
    manufacturer: String,
    serial: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level).context("Failed to setup logging")?;

    match cli.command {
        Command::GetConfig { socket, toml } => {
            let response = query(&socket).await?;
            match response.result {
                Ok(strings) => print!("{}", render(&strings, toml)?),
                Err(errno) => bail!("daemon refused the request: {}", describe_errno(errno)),
            }
        }
    }

    Ok(())
}

/// Send one `GetConfig` request and wait for the answer
async fn query(socket: &Path) -> Result<ControlResponse> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("Failed to connect to {}", socket.display()))?;
        debug!("connected to {}", socket.display());

        write_framed_async(&mut stream, &ControlRequest::get_config())
            .await
            .context("Failed to send request")?;
        let response: ControlResponse = read_framed_async(&mut stream)
            .await
            .context("Failed to read response")?;
        debug!("daemon speaks protocol {}", response.version);
        Ok::<_, anyhow::Error>(response)
    };

    tokio::time::timeout(REQUEST_TIMEOUT, exchange)
        .await
        .context("Timed out waiting for the daemon")?
}

fn render(strings: &DeviceStrings, as_toml: bool) -> Result<String> {
    let product = strings.product.to_string_lossy();
    let manufacturer = strings.manufacturer.to_string_lossy();
    let serial = strings.serial.to_string_lossy();

    if as_toml {
        let file = IdentityFile {
            identity: IdentityBlock {
                product,
                manufacturer,
                serial,
            },
        };
        return toml::to_string(&file).context("Failed to render TOML");
    }

    Ok(format!(
        "product:      {}\nmanufacturer: {}\nserial:       {}\n",
        product, manufacturer, serial
    ))
}
