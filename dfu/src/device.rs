use std::{
    num::NonZeroU8,
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace};
use nusb::{
    self, MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError},
};

use crate::descriptor::{DFU_CLASS, DFU_SUBCLASS};
use crate::transport::{DeviceDescriptor, Transport, TransportError};
use crate::{DEFAULT_TIMEOUT, DfuError, InterfaceSetting};

const RESCAN_INTERVAL: Duration = Duration::from_millis(100);

/// USB device accessed through `nusb`
pub struct UsbDevice {
    info: nusb::DeviceInfo,
    descriptor: DeviceDescriptor,
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
    timeout: Duration,
}

impl UsbDevice {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        let descriptor = DeviceDescriptor {
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            product_name: info.product_string().map(String::from),
            serial_number: info.serial_number().map(String::from),
        };
        UsbDevice {
            info,
            descriptor,
            device: None,
            interface: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.info
    }

    pub fn id(&self) -> nusb::DeviceId {
        self.info.id()
    }

    pub fn bus_id(&self) -> &str {
        self.info.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.info.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.info.product_id()
    }

    /// Timeout applied to every control transfer
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn open_device(&mut self) -> Result<&nusb::Device, TransportError> {
        if self.device.is_none() {
            self.device = Some(self.info.open().wait().map_err(usb_error)?);
        }
        self.device
            .as_ref()
            .ok_or_else(|| TransportError::Failed("device not open".into()))
    }

    fn claimed(&self) -> Result<&nusb::Interface, TransportError> {
        self.interface
            .as_ref()
            .ok_or_else(|| {
                TransportError::Failed("no interface claimed".into())
            })
    }

    fn is_present(&self) -> bool {
        match nusb::list_devices().wait() {
            Ok(mut devices) => devices.any(|dev| dev.id() == self.info.id()),
            Err(_) => false,
        }
    }
}

impl Transport for UsbDevice {
    fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn interfaces(&mut self) -> Result<Vec<InterfaceSetting>, TransportError> {
        let timeout = self.timeout;
        let device = self.open_device()?;
        let mut settings = Vec::new();
        for configuration in device.configurations() {
            let config = configuration.configuration_value();
            for alt_setting in configuration.interface_alt_settings() {
                let name = alt_setting.string_index().and_then(|idx| {
                    get_string_descriptor(device, idx, timeout)
                });
                settings.push(InterfaceSetting {
                    configuration_value: config,
                    interface_number: alt_setting.interface_number(),
                    alternate_setting: alt_setting.alternate_setting(),
                    interface_class: alt_setting.class(),
                    interface_subclass: alt_setting.subclass(),
                    interface_protocol: alt_setting.protocol(),
                    name,
                });
            }
        }
        Ok(settings)
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.open_device().map(|_| ())
    }

    fn close(&mut self) {
        self.interface = None;
        self.device = None;
    }

    fn select_configuration(
        &mut self,
        value: u8,
    ) -> Result<(), TransportError> {
        let device = self.open_device()?;
        let active = device
            .active_configuration()
            .map(|config| config.configuration_value())
            .ok();
        if active != Some(value) {
            debug!("Selecting configuration {value}");
            device.set_configuration(value).wait().map_err(usb_error)?;
        }
        Ok(())
    }

    fn claim_interface(
        &mut self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        self.interface = None;
        let device = self.open_device()?;
        let intf = device.claim_interface(interface).wait().map_err(usb_error)?;
        intf.set_alt_setting(alt_setting).wait().map_err(usb_error)?;
        self.interface = Some(intf);
        Ok(())
    }

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        trace!(
            "control out {request_type:#04x} {request:#04x} {value:#06x} {index}"
        );
        let (control_type, recipient) = split_request_type(request_type);
        Ok(self
            .claimed()?
            .control_out(
                ControlOut {
                    control_type,
                    recipient,
                    request,
                    value,
                    index,
                    data,
                },
                self.timeout,
            )
            .wait()?)
    }

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        trace!(
            "control in {request_type:#04x} {request:#04x} {value:#06x} {index}"
        );
        let (control_type, recipient) = split_request_type(request_type);
        Ok(self
            .claimed()?
            .control_in(
                ControlIn {
                    control_type,
                    recipient,
                    request,
                    value,
                    index,
                    length,
                },
                self.timeout,
            )
            .wait()?)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        let device = self.open_device()?.clone();
        self.device = None;
        device.reset().wait().map_err(usb_error)
    }

    fn wait_disconnected(&mut self, timeout: Duration) -> bool {
        self.close();
        let start = Instant::now();
        while self.is_present() {
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(RESCAN_INTERVAL);
        }
        true
    }
}

impl From<TransferError> for TransportError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Disconnected => TransportError::Disconnected,
            TransferError::Stall => TransportError::Stall,
            TransferError::Cancelled => TransportError::TimedOut,
            err => TransportError::Failed(err.to_string()),
        }
    }
}

fn usb_error(err: nusb::Error) -> TransportError {
    TransportError::Failed(err.to_string())
}

/// Map `bmRequestType` to `nusb` control type and recipient.
fn split_request_type(request_type: u8) -> (ControlType, Recipient) {
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        _ => ControlType::Vendor,
    };
    let recipient = match request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        _ => Recipient::Other,
    };
    (control_type, recipient)
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// List attached devices exposing a DFU interface, optionally filtered by
/// vendor and product ID.
pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<UsbDevice>, DfuError> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(usb_error)?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .map(UsbDevice::new)
        .collect();
    Ok(devices)
}
