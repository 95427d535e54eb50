//! Interface to the USB host-access layer
//!
//! The engine never talks to a USB stack directly. Everything it needs from
//! the bus goes through [Transport]: device identity, alternate setting
//! enumeration, configuration and interface selection, and the two control
//! transfer directions. [UsbDevice](crate::UsbDevice) implements it on top of
//! `nusb`; tests implement it with a simulated device.

use std::{fmt, time::Duration};

use thiserror::Error;

/// `bmRequestType` for class requests to an interface, host to device.
pub const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
/// `bmRequestType` for class requests to an interface, device to host.
pub const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;
/// `bmRequestType` for standard requests to the device, device to host.
pub const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The device is no longer present on the bus.
    #[error("device disconnected")]
    Disconnected,
    #[error("control transfer stalled")]
    Stall,
    #[error("control transfer timed out")]
    TimedOut,
    #[error("{0}")]
    Failed(String),
}

/// USB device identity, read once when the device is found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:04x}:{:04x}] \"{}\" serial=\"{}\"",
            self.vendor_id,
            self.product_id,
            self.product_name.as_deref().unwrap_or(""),
            self.serial_number.as_deref().unwrap_or(""),
        )
    }
}

/// Host side of the USB control pipe of a single device.
///
/// Calls are strictly sequential: the engine never issues a request before the
/// previous one has completed.
pub trait Transport {
    fn device_descriptor(&self) -> &DeviceDescriptor;

    /// Every alternate setting of every configuration. Names are filled in
    /// when the backend could read them, `None` otherwise.
    fn interfaces(
        &mut self,
    ) -> Result<Vec<crate::InterfaceSetting>, TransportError>;

    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    fn select_configuration(&mut self, value: u8)
    -> Result<(), TransportError>;

    /// Claim `interface` and activate `alt_setting` on it. Subsequent
    /// control transfers are routed through this interface.
    fn claim_interface(
        &mut self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError>;

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError>;

    /// Issue a USB port reset.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Release the device and wait for it to leave the bus. Returns `false`
    /// if it is still present after `timeout`.
    fn wait_disconnected(&mut self, timeout: Duration) -> bool;

    /// Suspend between two status polls.
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration)
    }
}
