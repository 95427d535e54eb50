use dfu::{
    DfuMemSegment, Transport, UsbDevice, find_dfu_devices, find_dfu_interfaces,
};
use log::warn;

use crate::CliError;

pub(crate) fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(devices);
    }
    Ok(())
}

pub(crate) fn print_segment(prefix: &str, segment: &DfuMemSegment) {
    let mut sector_size = segment.sector_size();
    let size_char = if sector_size >= 1024 {
        sector_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:3} sectors of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start_addr(),
        segment.sectors(),
        sector_size,
        size_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}

fn print_devices(devices: Vec<UsbDevice>) {
    for mut device in devices {
        println!(
            "Bus {} Device {:03}: {}",
            device.bus_id(),
            device.device_address(),
            device.device_descriptor(),
        );

        let interfaces = match find_dfu_interfaces(&mut device) {
            Ok(interfaces) => interfaces,
            Err(err) => {
                warn!("Cannot read interfaces: {err}");
                continue;
            }
        };
        device.close();

        for interface in interfaces {
            println!(
                "  {} (cfg={}, intf={}, alt={}): {}",
                interface.mode(),
                interface.configuration_value,
                interface.interface_number,
                interface.alternate_setting,
                interface.name.as_deref().unwrap_or("UNKNOWN"),
            );
            if !interface.name.as_deref().is_some_and(|n| n.starts_with('@')) {
                continue;
            }
            match interface.layout() {
                Some(Ok(layout)) => {
                    for segment in layout.segments.iter() {
                        print_segment("    ", segment);
                    }
                }
                Some(Err(err)) => println!("    {err}"),
                None => {}
            }
        }
    }
}
