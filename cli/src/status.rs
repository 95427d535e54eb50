use dfu::{Session, SessionConfig, UsbDevice};

use crate::CliError;
use crate::list::print_segment;

pub(crate) fn print_status(device: UsbDevice) -> Result<(), CliError> {
    let mut session = Session::open(device, SessionConfig::default())?;

    println!("Device: {}", session.device());
    let interface = session.interface();
    println!(
        "Interface: {} (cfg={}, intf={}, alt={}) {}",
        interface.mode(),
        interface.configuration_value,
        interface.interface_number,
        interface.alternate_setting,
        interface.name.as_deref().unwrap_or(""),
    );

    match session.dfu_descriptor() {
        Some(desc) => {
            println!(
                "DFU version {:#06x}, transfer size {}, attributes {:#04x}",
                desc.dfu_version(),
                desc.transfer_size(),
                desc.attributes(),
            );
            println!(
                "  download={}, upload={}, manifestation tolerant={}, \
                 will detach={}",
                desc.can_download(),
                desc.can_upload(),
                desc.manifestation_tolerant(),
                desc.will_detach(),
            );
        }
        None => println!("No DFU functional descriptor"),
    }

    if let Some(memory) = session.memory() {
        println!("Memory: {} ({} bytes)", memory.name, memory.size());
        for segment in memory.segments.iter() {
            print_segment("  ", segment);
        }
    }
    if let Some(addr) = session.start_address() {
        println!("Start address: 0x{addr:08x}");
    }

    let st = session.connection()?.get_status()?;
    println!("State: {}", st.state);
    println!("Status: {}", st.status);
    println!("Poll timeout: {:?}", st.poll_timeout);

    session.close();
    Ok(())
}
