use std::collections::HashMap;

use log::{debug, warn};

use crate::descriptor::{
    CONFIG_DESC_TYPE, ConfigurationDescriptor, DFU_CLASS, DFU_SUBCLASS,
    STRING_DESC_TYPE, decode_string_descriptor, total_length,
};
use crate::memory::DfuMemory;
use crate::transport::{REQUEST_TYPE_STANDARD_IN, Transport, TransportError};
use crate::DfuError;

const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
const LANGUAGE_US_ENGLISH: u16 = 0x0409;
const MAX_STRING_LEN: u16 = 255;

pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
pub const DFU_PROTOCOL_DFU: u8 = 0x02;

/// One alternate setting of a device interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceSetting {
    pub configuration_value: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub name: Option<String>,
}

impl InterfaceSetting {
    pub fn is_dfu(&self) -> bool {
        self.interface_class == DFU_CLASS
            && self.interface_subclass == DFU_SUBCLASS
    }

    pub fn mode(&self) -> &'static str {
        match self.interface_protocol {
            DFU_PROTOCOL_RUNTIME => "Runtime",
            DFU_PROTOCOL_DFU => "DFU",
            _ => "Unknown",
        }
    }

    /// DfuSe memory layout announced in the setting name
    pub fn layout(&self) -> Option<Result<DfuMemory, DfuError>> {
        self.name.as_deref().map(DfuMemory::parse)
    }

    /// Names the memory region at `address`, DfuSe style (`/0x08000000/`).
    pub fn names_address(&self, address: u32) -> bool {
        let needle = format!("0x{address:08x}");
        self.name
            .as_deref()
            .is_some_and(|name| name.to_ascii_lowercase().contains(&needle))
    }
}

/// DFU alternate settings of an open device, all of them named when the
/// device provides names.
pub fn find_dfu_interfaces<T: Transport>(
    transport: &mut T,
) -> Result<Vec<InterfaceSetting>, DfuError> {
    let mut interfaces: Vec<InterfaceSetting> = transport
        .interfaces()?
        .into_iter()
        .filter(InterfaceSetting::is_dfu)
        .collect();

    if interfaces.iter().any(|intf| intf.name.is_none()) {
        if let Err(err) = fix_interface_names(transport, &mut interfaces) {
            warn!("Failed to read interface names: {err}");
        }
    }
    Ok(interfaces)
}

/// Pick the DFU alternate setting to download to.
///
/// A single DFU setting is used as is. Among several, the first one whose
/// name covers `flash_base` wins.
pub fn select_interface<T: Transport>(
    transport: &mut T,
    flash_base: u32,
) -> Result<InterfaceSetting, DfuError> {
    let interfaces = find_dfu_interfaces(transport)?;
    match interfaces.len() {
        0 => Err(DfuError::NoDfuInterface),
        1 => interfaces.into_iter().next().ok_or(DfuError::NoDfuInterface),
        candidates => interfaces
            .into_iter()
            .find(|intf| intf.names_address(flash_base))
            .ok_or(DfuError::AmbiguousInterface { candidates }),
    }
}

/// Fetch the names the transport could not provide straight from the
/// device's string descriptors.
fn fix_interface_names<T: Transport>(
    transport: &mut T,
    interfaces: &mut [InterfaceSetting],
) -> Result<(), DfuError> {
    let Some(first) = interfaces.first() else {
        return Ok(());
    };
    debug!("Reading interface names from string descriptors");
    transport.select_configuration(first.configuration_value)?;
    transport
        .claim_interface(first.interface_number, first.alternate_setting)?;

    let Some(config) =
        find_configuration_descriptor(transport, first.configuration_value)?
    else {
        return Ok(());
    };
    let language = read_languages(transport)?
        .first()
        .copied()
        .unwrap_or(LANGUAGE_US_ENGLISH);

    let mut names: HashMap<(u8, u8), String> = HashMap::new();
    for intf in config.interfaces().filter(|intf| intf.string_index != 0) {
        let name = read_string(transport, intf.string_index, language)?;
        names.insert((intf.interface_number, intf.alternate_setting), name);
    }

    for intf in interfaces.iter_mut().filter(|intf| {
        intf.name.is_none()
            && intf.configuration_value == config.configuration_value
    }) {
        intf.name = names
            .get(&(intf.interface_number, intf.alternate_setting))
            .cloned();
    }
    Ok(())
}

fn get_descriptor<T: Transport>(
    transport: &mut T,
    desc_type: u8,
    desc_index: u8,
    language: u16,
    length: u16,
) -> Result<Vec<u8>, TransportError> {
    transport.control_in(
        REQUEST_TYPE_STANDARD_IN,
        USB_REQ_GET_DESCRIPTOR,
        (desc_type as u16) << 8 | desc_index as u16,
        language,
        length,
    )
}

/// Read and parse configuration descriptor `index` with all its records.
pub fn read_configuration_descriptor<T: Transport>(
    transport: &mut T,
    index: u8,
) -> Result<ConfigurationDescriptor, DfuError> {
    let header = get_descriptor(transport, CONFIG_DESC_TYPE, index, 0, 4)?;
    let length = total_length(&header).ok_or(DfuError::MalformedDescriptor {
        offset: 0,
        reason: "not a configuration descriptor",
    })?;
    let data = get_descriptor(transport, CONFIG_DESC_TYPE, index, 0, length)?;
    ConfigurationDescriptor::parse(&data)
}

/// Configuration descriptor whose `bConfigurationValue` is `value`.
///
/// Descriptor indices are tried from 0; the first index the device refuses
/// ends the walk with `None`.
pub fn find_configuration_descriptor<T: Transport>(
    transport: &mut T,
    value: u8,
) -> Result<Option<ConfigurationDescriptor>, DfuError> {
    for index in 0..=u8::MAX {
        let config = match read_configuration_descriptor(transport, index) {
            Ok(config) => config,
            Err(DfuError::Transport(err)) if index > 0 => {
                debug!("No configuration descriptor {index}: {err}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if config.configuration_value == value {
            return Ok(Some(config));
        }
    }
    Ok(None)
}

fn read_languages<T: Transport>(
    transport: &mut T,
) -> Result<Vec<u16>, DfuError> {
    let raw =
        get_descriptor(transport, STRING_DESC_TYPE, 0, 0, MAX_STRING_LEN)?;
    Ok(raw
        .get(2..)
        .unwrap_or_default()
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn read_string<T: Transport>(
    transport: &mut T,
    index: u8,
    language: u16,
) -> Result<String, DfuError> {
    let raw = get_descriptor(
        transport,
        STRING_DESC_TYPE,
        index,
        language,
        MAX_STRING_LEN,
    )?;
    decode_string_descriptor(&raw).ok_or(DfuError::MalformedDescriptor {
        offset: 0,
        reason: "not a string descriptor",
    })
}
