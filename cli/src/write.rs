use std::{
    io::{self, Write},
    thread,
    time::{Duration, Instant},
};

use dfu::{Manifestation, Session, SessionConfig, UsbDevice, find_dfu_devices};

use crate::{CliError, DeviceFilter};

const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_POLL: Duration = Duration::from_millis(500);

pub(crate) fn download(
    data: &[u8],
    device: UsbDevice,
    config: SessionConfig,
) -> Result<Manifestation, CliError> {
    let mut session = Session::open(device, config)?;

    let outcome = session.download_firmware(data, print_progress)?;
    match outcome {
        Manifestation::Idle => println!("Done"),
        Manifestation::Reset => println!("Done, device is rebooting"),
        Manifestation::Pending => {
            println!("Done, replug the device to start the new firmware")
        }
    }
    session.close();
    Ok(outcome)
}

fn print_progress(sent: usize, total: usize) {
    let (percentage, filled) = if total > 0 {
        ((100 * sent) / total, (60 * sent) / total)
    } else {
        (100, 60)
    };
    print!(
        "\r  Flashing {:3}% [{}]",
        percentage,
        "#".repeat(filled) + &" ".repeat(60 - filled)
    );
    let _ = io::stdout().flush();
    if sent == total {
        println!();
    }
}

pub(crate) fn wait_reconnect(
    filter: DeviceFilter,
) -> Result<UsbDevice, CliError> {
    println!("Waiting for device to reconnect...");
    let start = Instant::now();
    loop {
        let mut devices = find_dfu_devices(filter.vendor, filter.product)?;
        if let Some(device) = devices.pop() {
            println!("Device reconnected");
            return Ok(device);
        }
        if start.elapsed() >= RECONNECT_TIMEOUT {
            return Err(CliError::ReconnectTimeout);
        }
        thread::sleep(RECONNECT_POLL);
    }
}
