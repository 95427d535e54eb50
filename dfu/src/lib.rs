//! USB Device Firmware Upgrade (DFU) download engine based on [`nusb`]
//!
//! Writes firmware images to devices speaking DFU 1.1 or its STMicro
//! extension (aka "DfuSe"). The engine parses the device descriptors to
//! learn the transfer size and manifestation behaviour, reads the DfuSe
//! memory map from the interface name, erases and programs flash block by
//! block and finally lets the device manifest the new firmware.
//!
//! All USB traffic goes through the [Transport] trait. [UsbDevice] implements
//! it on top of `nusb`; tests drive the engine with scripted devices.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! The following example flashes an image to the first DFU device found:
//! ```no_run
//! use dfu_engine::{Session, SessionConfig, find_dfu_devices};
//!
//! let image = std::fs::read("firmware.bin")?;
//! if let Some(device) = find_dfu_devices(None, None)?.into_iter().next() {
//!     let mut session = Session::open(device, SessionConfig::default())?;
//!     session.download_firmware(&image, |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

use std::time::Duration;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub const DEFAULT_TRANSFER_SIZE: u16 = 1024;
pub(crate) const DEFAULT_ERASE_SIZE: u32 = 4096;

/// Internal flash of STM32 devices
pub const INTERNAL_FLASH_BASE: u32 = 0x0800_0000;
/// Memory mapped QSPI flash
pub const EXTERNAL_FLASH_BASE: u32 = 0x9000_0000;
/// Start of external flash kept for the bootloader
pub const EXTERNAL_FLASH_RESERVED: u32 = 0x4_0000;

pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1u64);

mod config;
mod connection;
mod descriptor;
mod device;
mod download;
mod error;
mod interface;
mod memory;
mod session;
mod state;
mod transport;

// Re-exports
pub use config::SessionConfig;
pub use connection::{DfuConnection, DfuseCommand};
pub use descriptor::{
    ConfigurationDescriptor, DFUSE_VERSION_NUMBER, Descriptor, DfuDescriptor,
    InterfaceDescriptor,
};
pub use device::{UsbDevice, find_dfu_devices};
pub use download::{Manifestation, Stage};
pub use error::DfuError;
pub use interface::{
    DFU_PROTOCOL_DFU, DFU_PROTOCOL_RUNTIME, InterfaceSetting,
    find_configuration_descriptor, find_dfu_interfaces,
    read_configuration_descriptor, select_interface,
};
pub use memory::{DfuMemSegment, DfuMemory};
pub use session::Session;
pub use state::{DeviceState, Status, StatusReport};
pub use transport::{
    DeviceDescriptor, REQUEST_TYPE_CLASS_IN, REQUEST_TYPE_CLASS_OUT,
    REQUEST_TYPE_STANDARD_IN, Transport, TransportError,
};
