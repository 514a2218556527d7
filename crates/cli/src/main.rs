//! usb-storage
//!
//! Diagnostic front end for the mass-storage engine: finds a device, binds a
//! session to it and runs one block command or reset against it.

mod commands;
mod config;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{DeviceFilter, setup_logging};
use config::CliConfig;
use engine::usb::{StorageDeviceInfo, list_storage_devices, open_session};
use engine::{DeviceSession, SessionConfig};
use protocol::Command;
use rusb::UsbContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-storage")]
#[command(
    author,
    version,
    about = "Send block commands to USB mass-storage devices"
)]
#[command(long_about = "
Talks to a USB mass-storage interface directly through libusb, using the
Bulk-Only, Control/Bulk or Control/Bulk/Interrupt transport the interface
advertises.

EXAMPLES:
    # List attached mass-storage interfaces
    usb-storage --list-devices

    # Identify the first matching device
    usb-storage --device 0781:5567 inquiry

    # Dump the first two blocks
    usb-storage --device 0781:5567 read --lba 0 --blocks 2

    # Reset the device, falling back to a port reset
    usb-storage --device 0781:5567 reset --bus

CONFIGURATION:
    The default configuration lives at ~/.config/usb-storage/config.toml.
    Run with --save-config to write one populated with defaults.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List mass-storage devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device to open, as VID:PID (`*` matches anything)
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<DeviceFilter>,

    /// Logical unit to address
    #[arg(long, value_name = "LUN")]
    lun: Option<u8>,

    /// Seconds to wait for a command before aborting it
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    wait: u64,

    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand, Debug, Clone)]
enum Action {
    /// Print the standard INQUIRY data
    Inquiry,
    /// Check whether the medium is ready
    TestUnitReady,
    /// Print the last LBA and block size
    ReadCapacity,
    /// Read blocks and hex-dump them
    Read {
        #[arg(long)]
        lba: u32,
        #[arg(long, default_value_t = 1)]
        blocks: u16,
        /// Block size in bytes, queried from the device when omitted
        #[arg(long)]
        block_size: Option<u32>,
    },
    /// Reset the device
    Reset {
        /// Allow a port reset when the class reset is not enough
        #[arg(long)]
        bus: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CliConfig::default();
        let path = CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        CliConfig::load(Some(config::expand_path(path))).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-storage v{}", env!("CARGO_PKG_VERSION"));

    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context);
    }

    let Some(action) = args.command.clone() else {
        return Err(anyhow!(
            "No command given, try --list-devices or --help"
        ));
    };

    let filter = args
        .device
        .or(config.device.filter)
        .unwrap_or_default();
    let lun = args.lun.unwrap_or(config.device.lun);
    let wait = Duration::from_secs(args.wait.max(1));

    let session = Arc::new(open_device(context, filter, config.session.clone()).await?);
    info!(
        session = %session.key(),
        protocol = session.protocol_name(),
        max_lun = session.max_lun(),
        "Session ready"
    );
    if lun > session.max_lun() {
        warn!(
            "LUN {} is above the device's highest LUN {}",
            lun,
            session.max_lun()
        );
    }

    let result = run_action(&session, action, lun, wait).await;

    let closing = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || closing.shutdown()).await {
        error!("Session shutdown panicked: {:?}", e);
    }

    result
}

/// List mass-storage interfaces and exit
fn list_devices_mode(context: &rusb::Context) -> Result<()> {
    let devices = list_storage_devices(context).context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No mass-storage devices found.");
        return Ok(());
    }

    println!("Found {} mass-storage device(s):\n", devices.len());
    for device in devices {
        print_device(&device);
    }
    Ok(())
}

fn print_device(device: &StorageDeviceInfo) {
    let interface = &device.interface;
    println!(
        "  [{}] {:04x}:{:04x}",
        device.key, device.vendor_id, device.product_id
    );
    println!(
        "      Interface {} alt {}  protocol: {}  command set: {}",
        interface.number,
        interface.alt_setting,
        interface
            .protocol_kind()
            .map(|kind| kind.to_string())
            .unwrap_or_else(|| format!("unknown ({:#04x})", interface.protocol)),
        interface
            .command_set()
            .map(|set| format!("{:?}", set))
            .unwrap_or_else(|| format!("unknown ({:#04x})", interface.subclass)),
    );
    if interface.interfaces > 1 {
        println!("      Composite device ({} interfaces)", interface.interfaces);
    }
    println!();
}

/// Find the first matching device and bind a session to it
async fn open_device(
    context: rusb::Context,
    filter: DeviceFilter,
    session_config: SessionConfig,
) -> Result<DeviceSession> {
    tokio::task::spawn_blocking(move || {
        let candidates = list_storage_devices(&context).context("Failed to enumerate USB devices")?;
        let info = candidates
            .into_iter()
            .find(|info| filter.matches(info.vendor_id, info.product_id))
            .ok_or_else(|| anyhow!("No mass-storage device matches {}", filter))?;

        let device = context
            .devices()
            .context("Failed to enumerate USB devices")?
            .iter()
            .find(|d| d.bus_number() == info.key.bus && d.address() == info.key.address)
            .ok_or_else(|| anyhow!("Device {} disappeared", info.key))?;

        open_session(&device, &session_config)
            .with_context(|| format!("Failed to open device {}", info.key))
    })
    .await
    .context("Device open task panicked")?
}

async fn run_action(
    session: &Arc<DeviceSession>,
    action: Action,
    lun: u8,
    wait: Duration,
) -> Result<()> {
    match action {
        Action::Inquiry => {
            let cmd = execute(session, commands::inquiry(lun)?, wait).await?;
            println!("{}", commands::describe(&cmd));
            if let Some(inquiry) = commands::InquiryData::parse(&cmd.data.to_vec()) {
                println!("Vendor:    {}", inquiry.vendor);
                println!("Product:   {}", inquiry.product);
                println!("Revision:  {}", inquiry.revision);
                println!("Type:      {}", inquiry.peripheral_name());
                println!("Removable: {}", if inquiry.removable { "yes" } else { "no" });
            }
        }
        Action::TestUnitReady => {
            let cmd = execute(session, commands::test_unit_ready(lun)?, wait).await?;
            println!("{}", commands::describe(&cmd));
        }
        Action::ReadCapacity => {
            let (cmd, capacity) = read_capacity(session, lun, wait).await?;
            println!("{}", commands::describe(&cmd));
            if let Some(capacity) = capacity {
                println!("Last LBA:   {}", capacity.last_lba);
                println!("Block size: {}", capacity.block_size);
                println!(
                    "Capacity:   {} blocks, {} bytes",
                    capacity.blocks(),
                    capacity.total_bytes()
                );
            }
        }
        Action::Read {
            lba,
            blocks,
            block_size,
        } => {
            let block_size = match block_size {
                Some(size) => size,
                None => match read_capacity(session, lun, wait).await? {
                    (_, Some(capacity)) if capacity.block_size > 0 => capacity.block_size,
                    (cmd, _) => {
                        return Err(anyhow!(
                            "Could not determine block size: {}",
                            commands::describe(&cmd)
                        ));
                    }
                },
            };
            let cmd = execute(
                session,
                commands::read_blocks(lun, lba, blocks, block_size)?,
                wait,
            )
            .await?;
            println!("{}", commands::describe(&cmd));
            let data = cmd.data.to_vec();
            print!("{}", commands::hexdump(&data[..cmd.transferred().min(data.len())]));
        }
        Action::Reset { bus } => {
            let session = session.clone();
            tokio::task::spawn_blocking(move || {
                if bus {
                    session.reset_bus()
                } else {
                    session.reset_device()
                }
            })
            .await
            .context("Reset task panicked")?
            .context("Reset failed")?;
            println!("Reset complete");
        }
    }
    Ok(())
}

async fn read_capacity(
    session: &Arc<DeviceSession>,
    lun: u8,
    wait: Duration,
) -> Result<(Command, Option<commands::Capacity>)> {
    let cmd = execute(session, commands::read_capacity(lun)?, wait).await?;
    let capacity = if cmd.status.is_good() {
        commands::Capacity::parse(&cmd.data.to_vec())
    } else {
        None
    };
    Ok((cmd, capacity))
}

/// Submit a command and wait for its completion
///
/// Ctrl-C or running past `wait` aborts the command; the aborted command is
/// still awaited so its completion is observed.
async fn execute(session: &Arc<DeviceSession>, command: Command, wait: Duration) -> Result<Command> {
    let mut rx = session
        .submit(command)
        .map_err(|e| anyhow!("Failed to submit command: {}", e))?;

    tokio::select! {
        result = &mut rx => return result.context("Session dropped the command"),
        _ = tokio::time::sleep(wait) => {
            warn!("Command did not complete within {:?}, aborting", wait);
        }
        _ = signal::ctrl_c() => {
            info!("Interrupted, aborting command");
        }
    }

    let aborting = session.clone();
    tokio::task::spawn_blocking(move || aborting.abort())
        .await
        .context("Abort task panicked")?
        .context("Abort failed")?;

    rx.await.context("Session dropped the command")
}
