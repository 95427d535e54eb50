#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use dfu_engine::{
    DeviceDescriptor, InterfaceSetting, REQUEST_TYPE_CLASS_IN,
    REQUEST_TYPE_CLASS_OUT, REQUEST_TYPE_STANDARD_IN, Transport, TransportError,
};

// State
pub const DFU_IDLE: u8 = 2;
pub const DFU_DNLOAD_SYNC: u8 = 3;
pub const DFU_DN_BUSY: u8 = 4;
pub const DFU_DNLOAD_IDLE: u8 = 5;
pub const DFU_MANIFEST_SYNC: u8 = 6;
pub const DFU_MANIFEST: u8 = 7;
pub const DFU_MANIFEST_WAIT_RESET: u8 = 8;
pub const DFU_UPLOAD_IDLE: u8 = 9;
pub const DFU_ERROR: u8 = 10;

// Status
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERR_WRITE: u8 = 0x03;
pub const STATUS_ERR_ERASE: u8 = 0x04;
pub const STATUS_ERR_STALLED_PKT: u8 = 0x0F;

// Requests
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;
pub const DFU_GETSTATE: u8 = 5;
pub const DFU_ABORT: u8 = 6;
const GET_DESCRIPTOR: u8 = 6;

pub const ATTR_CAN_DNLOAD: u8 = 0x01;
pub const ATTR_CAN_UPLOAD: u8 = 0x02;
pub const ATTR_MANIFESTATION_TOLERANT: u8 = 0x04;
pub const ATTR_WILL_DETACH: u8 = 0x08;
pub const TOLERANT: u8 = ATTR_CAN_DNLOAD | ATTR_MANIFESTATION_TOLERANT;

pub const DFU_VERSION: u16 = 0x0110;
pub const DFUSE_VERSION: u16 = 0x011A;

pub const STM32_FLASH: &str =
    "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";
pub const STM32_OPTION_BYTES: &str = "@Option Bytes  /0x1FFFC000/01*016 e";
pub const QSPI_FLASH: &str = "@External Flash /0x90000000/256*4Kg";

/// One control request as seen by the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

/// Simulated DFU device
///
/// Follows the DFU 1.1 state machine closely enough for a host: DNLOAD moves
/// to `dfuDNLOAD_SYNC`, GETSTATUS reports `dfuDNBUSY` `busy_polls` times and
/// then `dfuDNLOAD_IDLE`, a zero-length DNLOAD starts manifestation.
pub struct MockDevice {
    pub descriptor: DeviceDescriptor,
    pub settings: Vec<InterfaceSetting>,
    pub config_descriptor: Vec<u8>,
    /// Configuration descriptors at index 1 and up.
    pub other_configs: Vec<Vec<u8>>,
    pub strings: HashMap<u8, String>,
    pub transfer_size: u16,
    pub dfuse: bool,
    pub manifestation_tolerant: bool,

    pub state: u8,
    pub status: u8,
    pub poll_timeout_ms: u32,
    pub busy_polls: usize,

    /// Reject this data block with the given status.
    pub fail_block: Option<(u16, u8)>,
    /// Reject the erase of this sector with the given status.
    pub fail_erase: Option<(u32, u8)>,
    /// Vanish when this data block is sent.
    pub disconnect_at_block: Option<u16>,
    /// Answer GETSTATUS with this error once manifestation was requested.
    pub manifest_status_error: Option<TransportError>,
    /// Leave the bus when asked to (non tolerant devices).
    pub leaves_bus: bool,

    pub requests: Vec<Request>,
    pub sleeps: Vec<Duration>,
    pub blocks: Vec<(u16, Vec<u8>)>,
    pub dfuse_commands: Vec<Vec<u8>>,
    pub writes: Vec<(u32, Vec<u8>)>,
    pub address_pointer: u32,
    pub configuration: Option<u8>,
    pub claimed: Option<(u8, u8)>,
    pub resets: usize,
    pub disconnect_waits: Vec<Duration>,
    pub gone: bool,

    busy_left: usize,
    pending_status: u8,
    manifesting: bool,
}

fn dfu_setting(
    intf: u8,
    alt: u8,
    protocol: u8,
    name: Option<&str>,
) -> InterfaceSetting {
    InterfaceSetting {
        configuration_value: 1,
        interface_number: intf,
        alternate_setting: alt,
        interface_class: 0xFE,
        interface_subclass: 0x01,
        interface_protocol: protocol,
        name: name.map(String::from),
    }
}

/// Configuration descriptor holding the given interfaces, each a tuple of
/// (interface, alt setting, class, protocol, iInterface), followed by a DFU
/// functional descriptor.
pub fn config_descriptor(
    interfaces: &[(u8, u8, u8, u8, u8)],
    attributes: u8,
    transfer_size: u16,
    version: u16,
) -> Vec<u8> {
    let mut data = vec![9, 0x02, 0, 0, 1, 1, 0, 0x80, 50];
    for &(intf, alt, class, protocol, name) in interfaces {
        let subclass = if class == 0xFE { 0x01 } else { 0x00 };
        data.extend_from_slice(&[
            9, 0x04, intf, alt, 0, class, subclass, protocol, name,
        ]);
    }
    let [xfer_lo, xfer_hi] = transfer_size.to_le_bytes();
    let [ver_lo, ver_hi] = version.to_le_bytes();
    data.extend_from_slice(&[
        9, 0x21, attributes, 0xFF, 0x00, xfer_lo, xfer_hi, ver_lo, ver_hi,
    ]);
    let total = data.len() as u16;
    data[2..4].copy_from_slice(&total.to_le_bytes());
    data
}

fn string_descriptor(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut data = vec![(2 + units.len() * 2) as u8, 0x03];
    for unit in units {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data
}

impl MockDevice {
    /// Plain DFU 1.1 device with a single alternate setting.
    pub fn dfu(transfer_size: u16, attributes: u8) -> Self {
        Self::new(
            vec![dfu_setting(0, 0, 2, Some("Application"))],
            config_descriptor(
                &[(0, 0, 0xFE, 2, 4)],
                attributes,
                transfer_size,
                DFU_VERSION,
            ),
            transfer_size,
            false,
            attributes & ATTR_MANIFESTATION_TOLERANT != 0,
        )
    }

    /// STM32 style DfuSe bootloader exposing `layouts`, one alt setting each.
    pub fn dfuse(transfer_size: u16, attributes: u8, layouts: &[&str]) -> Self {
        let settings = layouts
            .iter()
            .enumerate()
            .map(|(alt, name)| dfu_setting(0, alt as u8, 2, Some(name)))
            .collect();
        let intfs: Vec<_> = (0..layouts.len())
            .map(|alt| (0, alt as u8, 0xFE, 2, alt as u8 + 4))
            .collect();
        let mut dev = Self::new(
            settings,
            config_descriptor(&intfs, attributes, transfer_size, DFUSE_VERSION),
            transfer_size,
            true,
            attributes & ATTR_MANIFESTATION_TOLERANT != 0,
        );
        for (idx, name) in layouts.iter().enumerate() {
            dev.strings.insert(idx as u8 + 4, name.to_string());
        }
        dev
    }

    fn new(
        settings: Vec<InterfaceSetting>,
        config_descriptor: Vec<u8>,
        transfer_size: u16,
        dfuse: bool,
        manifestation_tolerant: bool,
    ) -> Self {
        MockDevice {
            descriptor: DeviceDescriptor {
                vendor_id: 0x0483,
                product_id: 0xdf11,
                product_name: Some("DFU in FS Mode".into()),
                serial_number: Some("206B3A5B4E43".into()),
            },
            settings,
            config_descriptor,
            other_configs: Vec::new(),
            strings: HashMap::new(),
            transfer_size,
            dfuse,
            manifestation_tolerant,
            state: DFU_IDLE,
            status: STATUS_OK,
            poll_timeout_ms: 0,
            busy_polls: 0,
            fail_block: None,
            fail_erase: None,
            disconnect_at_block: None,
            manifest_status_error: None,
            leaves_bus: true,
            requests: Vec::new(),
            sleeps: Vec::new(),
            blocks: Vec::new(),
            dfuse_commands: Vec::new(),
            writes: Vec::new(),
            address_pointer: 0,
            configuration: None,
            claimed: None,
            resets: 0,
            disconnect_waits: Vec::new(),
            gone: false,
            busy_left: 0,
            pending_status: STATUS_OK,
            manifesting: false,
        }
    }

    /// Drop the interface names, as a backend without string access would.
    pub fn without_names(mut self) -> Self {
        for setting in self.settings.iter_mut() {
            setting.name = None;
        }
        self
    }

    pub fn count(&self, request: u8) -> usize {
        self.requests
            .iter()
            .filter(|r| r.request == request && r.request_type & 0x60 == 0x20)
            .count()
    }

    /// Data blocks concatenated in the order they were sent.
    pub fn image(&self) -> Vec<u8> {
        self.blocks.iter().flat_map(|(_, data)| data.clone()).collect()
    }

    pub fn block_numbers(&self) -> Vec<u16> {
        self.blocks.iter().map(|(block, _)| *block).collect()
    }

    /// Sector addresses erased through DfuSe commands.
    pub fn erased(&self) -> Vec<u32> {
        self.dfuse_commands
            .iter()
            .filter(|cmd| cmd.len() == 5 && cmd[0] == 0x41)
            .map(|cmd| u32::from_le_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]))
            .collect()
    }

    pub fn addresses_set(&self) -> Vec<u32> {
        self.dfuse_commands
            .iter()
            .filter(|cmd| cmd.len() == 5 && cmd[0] == 0x21)
            .map(|cmd| u32::from_le_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]))
            .collect()
    }

    fn status_report(&self) -> Vec<u8> {
        let [pt0, pt1, pt2, _] = self.poll_timeout_ms.to_le_bytes();
        vec![self.status, pt0, pt1, pt2, self.state, 0]
    }

    fn stall(&mut self) -> TransportError {
        self.state = DFU_ERROR;
        self.status = STATUS_ERR_STALLED_PKT;
        TransportError::Stall
    }

    fn dnload(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if self.state != DFU_IDLE && self.state != DFU_DNLOAD_IDLE {
            return Err(self.stall());
        }
        if data.is_empty() {
            self.manifesting = true;
            self.state = DFU_MANIFEST_SYNC;
            return Ok(());
        }

        self.pending_status = STATUS_OK;
        if self.dfuse && block == 0 {
            self.dfuse_commands.push(data.to_vec());
            match data {
                [0x21, a @ ..] if a.len() == 4 => {
                    self.address_pointer =
                        u32::from_le_bytes([a[0], a[1], a[2], a[3]]);
                }
                [0x41, a @ ..] if a.len() == 4 => {
                    let addr = u32::from_le_bytes([a[0], a[1], a[2], a[3]]);
                    if let Some((fail_addr, status)) = self.fail_erase {
                        if fail_addr == addr {
                            self.pending_status = status;
                        }
                    }
                }
                [0x41] => {}
                _ => return Err(self.stall()),
            }
        } else {
            if self.disconnect_at_block == Some(block) {
                self.gone = true;
                return Err(TransportError::Disconnected);
            }
            if self.dfuse {
                let offset = (block as u32 - 2) * self.transfer_size as u32;
                self.writes
                    .push((self.address_pointer + offset, data.to_vec()));
            }
            self.blocks.push((block, data.to_vec()));
            if let Some((fail_block, status)) = self.fail_block {
                if fail_block == block {
                    self.pending_status = status;
                }
            }
        }
        self.busy_left = self.busy_polls;
        self.state = DFU_DNLOAD_SYNC;
        Ok(())
    }

    fn get_status(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.manifesting {
            if let Some(err) = self.manifest_status_error.clone() {
                return Err(err);
            }
        }
        match self.state {
            DFU_DNLOAD_SYNC | DFU_DN_BUSY => {
                if self.busy_left > 0 {
                    self.busy_left -= 1;
                    self.state = DFU_DN_BUSY;
                } else if self.pending_status != STATUS_OK {
                    self.status = self.pending_status;
                    self.state = DFU_ERROR;
                } else {
                    self.state = DFU_DNLOAD_IDLE;
                }
            }
            DFU_MANIFEST_SYNC => self.state = DFU_MANIFEST,
            DFU_MANIFEST => {
                self.state = if self.manifestation_tolerant {
                    self.manifesting = false;
                    DFU_IDLE
                } else {
                    DFU_MANIFEST_WAIT_RESET
                }
            }
            _ => {}
        }
        Ok(self.status_report())
    }

    fn get_descriptor(
        &mut self,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let mut data = match ((value >> 8) as u8, value as u8) {
            (0x02, 0) if !self.config_descriptor.is_empty() => {
                self.config_descriptor.clone()
            }
            (0x02, idx) if idx > 0 => {
                match self.other_configs.get(idx as usize - 1) {
                    Some(desc) => desc.clone(),
                    None => return Err(TransportError::Stall),
                }
            }
            (0x03, 0) => vec![4, 0x03, 0x09, 0x04],
            (0x03, idx) => match self.strings.get(&idx) {
                Some(s) => string_descriptor(s),
                None => return Err(TransportError::Stall),
            },
            _ => return Err(TransportError::Stall),
        };
        data.truncate(length as usize);
        Ok(data)
    }
}

impl Transport for MockDevice {
    fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn interfaces(&mut self) -> Result<Vec<InterfaceSetting>, TransportError> {
        if self.gone {
            return Err(TransportError::Disconnected);
        }
        Ok(self.settings.clone())
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.gone {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.claimed = None;
    }

    fn select_configuration(
        &mut self,
        value: u8,
    ) -> Result<(), TransportError> {
        self.configuration = Some(value);
        Ok(())
    }

    fn claim_interface(
        &mut self,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        self.claimed = Some((interface, alt_setting));
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
        if self.gone {
            return Err(TransportError::Disconnected);
        }
        self.requests.push(Request {
            request_type,
            request,
            value,
            index,
            data: data.to_vec(),
        });
        if request_type != REQUEST_TYPE_CLASS_OUT {
            return Err(TransportError::Stall);
        }
        match request {
            DFU_DNLOAD => self.dnload(value, data),
            DFU_CLRSTATUS => {
                if self.state == DFU_ERROR {
                    self.state = DFU_IDLE;
                    self.status = STATUS_OK;
                }
                Ok(())
            }
            DFU_ABORT => {
                if self.state != DFU_ERROR {
                    self.state = DFU_IDLE;
                }
                Ok(())
            }
            _ => Err(self.stall()),
        }
    }

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        if self.gone {
            return Err(TransportError::Disconnected);
        }
        self.requests.push(Request {
            request_type,
            request,
            value,
            index,
            data: Vec::new(),
        });
        match (request_type, request) {
            (REQUEST_TYPE_STANDARD_IN, GET_DESCRIPTOR) => {
                self.get_descriptor(value, length)
            }
            (REQUEST_TYPE_CLASS_IN, DFU_GETSTATUS) => self.get_status(),
            (REQUEST_TYPE_CLASS_IN, DFU_GETSTATE) => Ok(vec![self.state]),
            _ => Err(self.stall()),
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.resets += 1;
        Ok(())
    }

    fn wait_disconnected(&mut self, timeout: Duration) -> bool {
        self.disconnect_waits.push(timeout);
        if self.leaves_bus {
            self.gone = true;
        }
        self.leaves_bus
    }

    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }
}
