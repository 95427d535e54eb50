use std::{fs, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::parse_size;

use dfu::{SessionConfig, UsbDevice, find_dfu_devices};
use error::CliError;
use list::*;
use status::*;
use write::*;

mod error;
mod list;
mod status;
mod write;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Copy, Default)]
struct DeviceFilter {
    /// vendor ID (ex: "0483")
    #[clap(short, long, value_parser=hex_u16)]
    vendor: Option<u16>,
    /// product ID (ex: "df11")
    #[clap(short, long, value_parser=hex_u16)]
    product: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        #[command(flatten)]
        filter: DeviceFilter,
    },
    /// show DFU state of a device
    Status {
        #[command(flatten)]
        filter: DeviceFilter,
    },
    /// write firmware to device
    Write {
        /// raw binary firmware image
        file: PathBuf,
        #[command(flatten)]
        filter: DeviceFilter,
        /// bootloader image written before the firmware
        #[clap(short, long)]
        bootloader: Option<PathBuf>,
        /// start address (ex: 0x08000000)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// transfer size (ex: 1K, 2048)
        #[clap(short, long, value_parser=parse_transfer_size)]
        transfer_size: Option<u16>,
        /// do not skip the bootloader area of the external flash
        #[clap(long)]
        no_reserve: bool,
        /// erase the whole memory region first
        #[clap(long)]
        mass_erase: bool,
        /// milliseconds to wait for the device to reset after download
        #[clap(long, default_value_t = 5000)]
        disconnect_timeout: u64,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            filter: DeviceFilter::default(),
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_transfer_size(s: &str) -> Result<u16, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match cli.command.unwrap_or_default() {
        Commands::List { filter } => {
            list_dfu_devices(filter.vendor, filter.product)
        }
        Commands::Status { filter } => show_status(filter),
        Commands::Write {
            file,
            filter,
            bootloader,
            start_address,
            transfer_size,
            no_reserve,
            mass_erase,
            disconnect_timeout,
        } => {
            let mut config = SessionConfig {
                transfer_size,
                start_address,
                mass_erase,
                disconnect_timeout: Duration::from_millis(disconnect_timeout),
                ..Default::default()
            };
            if no_reserve {
                config.external_flash_reserved = 0;
            }
            write_file(&file, bootloader.as_ref(), filter, config)
        }
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn get_dfu_device(filter: DeviceFilter) -> Result<UsbDevice, CliError> {
    let mut devices = find_dfu_devices(filter.vendor, filter.product)?;
    if devices.len() > 1 {
        return Err(CliError::ManyDFUDevices);
    }
    devices.pop().ok_or(CliError::NoDFUDevice)
}

fn show_status(filter: DeviceFilter) -> Result<(), CliError> {
    let device = get_dfu_device(filter)?;
    print_status(device)
}

fn write_file(
    file: &PathBuf,
    bootloader: Option<&PathBuf>,
    filter: DeviceFilter,
    config: SessionConfig,
) -> Result<(), CliError> {
    let data = fs::read(file)?;
    let mut device = get_dfu_device(filter)?;

    if let Some(bootloader) = bootloader {
        let boot = fs::read(bootloader)?;
        println!("Writing bootloader {}", bootloader.display());
        let boot_config = SessionConfig {
            transfer_size: config.transfer_size,
            ..Default::default()
        };
        download(&boot, device, boot_config)?;
        device = wait_reconnect(filter)?;
    }

    println!("Writing firmware {}", file.display());
    download(&data, device, config)?;
    Ok(())
}
