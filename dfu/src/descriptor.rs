use crate::DfuError;

pub(crate) const CONFIG_DESC_TYPE: u8 = 0x02;
pub(crate) const STRING_DESC_TYPE: u8 = 0x03;
pub(crate) const INTERFACE_DESC_TYPE: u8 = 0x04;
pub(crate) const DFU_DESC_TYPE: u8 = 0x21;

pub(crate) const CONFIG_DESC_LEN: usize = 9;
pub(crate) const INTERFACE_DESC_LEN: usize = 9;
pub(crate) const DFU_DESC_LEN: usize = 9;

pub(crate) const DFU_CLASS: u8 = 0xFE;
pub(crate) const DFU_SUBCLASS: u8 = 0x1;

pub const DFUSE_VERSION_NUMBER: u16 = 0x11A;

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    /// `raw_desc` must hold at least [DFU_DESC_LEN] bytes.
    pub(crate) fn new(raw_desc: &[u8]) -> Self {
        Self {
            attributes: raw_desc[2],
            detach_timeout: u16::from_le_bytes([raw_desc[3], raw_desc[4]]),
            transfer_size: u16::from_le_bytes([raw_desc[5], raw_desc[6]]),
            dfu_version: u16::from_le_bytes([raw_desc[7], raw_desc[8]]),
        }
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Raw `bmAttributes`
    #[doc(alias = "bmAttributes")]
    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Time, in milliseconds, that the device will wait after receipt of the `DFU_DETACH`
    /// request (`wDetachTimeOut`).
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write transaction
    /// (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification release
    /// (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }

    /// `bcdDFUVersion` announces the ST DfuSe extension.
    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}

/// Standard interface descriptor (USB 2.0, table 9-12)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// `iInterface`, 0 when the interface has no name.
    pub string_index: u8,
}

impl InterfaceDescriptor {
    fn new(raw_desc: &[u8]) -> Self {
        Self {
            interface_number: raw_desc[2],
            alternate_setting: raw_desc[3],
            num_endpoints: raw_desc[4],
            class: raw_desc[5],
            subclass: raw_desc[6],
            protocol: raw_desc[7],
            string_index: raw_desc[8],
        }
    }

    pub fn is_dfu(&self) -> bool {
        self.class == DFU_CLASS && self.subclass == DFU_SUBCLASS
    }
}

/// One record found while walking a configuration descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    /// Type 0x21 record following a DFU-class interface
    DfuFunctional(DfuDescriptor),
    /// Endpoints, class-specific records of other classes (HID uses 0x21 too), ...
    Other { descriptor_type: u8, data: Vec<u8> },
}

/// Configuration descriptor together with all records that follow it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub descriptors: Vec<Descriptor>,
}

impl ConfigurationDescriptor {
    /// Walk a `GET_DESCRIPTOR(CONFIGURATION)` answer record by record.
    pub fn parse(data: &[u8]) -> Result<Self, DfuError> {
        let mut records = split_records(data)?.into_iter();

        let (_, header) = records.next().ok_or(DfuError::MalformedDescriptor {
            offset: 0,
            reason: "empty descriptor",
        })?;
        if header[1] != CONFIG_DESC_TYPE || header.len() < CONFIG_DESC_LEN {
            return Err(DfuError::MalformedDescriptor {
                offset: 0,
                reason: "not a configuration descriptor",
            });
        }

        let mut descriptors = Vec::new();
        let mut in_dfu_interface = false;
        for (offset, raw) in records {
            match raw[1] {
                INTERFACE_DESC_TYPE => {
                    if raw.len() < INTERFACE_DESC_LEN {
                        return Err(DfuError::MalformedDescriptor {
                            offset,
                            reason: "short interface descriptor",
                        });
                    }
                    let intf = InterfaceDescriptor::new(raw);
                    in_dfu_interface = intf.is_dfu();
                    descriptors.push(Descriptor::Interface(intf));
                }
                // bcdDFUVersion is the last field, a 9 byte record carries it
                DFU_DESC_TYPE
                    if in_dfu_interface && raw.len() >= DFU_DESC_LEN =>
                {
                    let dfu_desc = DfuDescriptor::new(raw);
                    descriptors.push(Descriptor::DfuFunctional(dfu_desc));
                }
                descriptor_type => descriptors.push(Descriptor::Other {
                    descriptor_type,
                    data: raw.to_vec(),
                }),
            }
        }

        Ok(Self {
            total_length: u16::from_le_bytes([header[2], header[3]]),
            num_interfaces: header[4],
            configuration_value: header[5],
            string_index: header[6],
            attributes: header[7],
            max_power: header[8],
            descriptors,
        })
    }

    /// DFU functional descriptor, provided this configuration is the active one.
    pub fn dfu_descriptor(
        &self,
        active_configuration: u8,
    ) -> Option<DfuDescriptor> {
        if self.configuration_value != active_configuration {
            return None;
        }
        self.descriptors.iter().find_map(|desc| match desc {
            Descriptor::DfuFunctional(dfu_desc) => Some(*dfu_desc),
            _ => None,
        })
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.descriptors.iter().filter_map(|desc| match desc {
            Descriptor::Interface(intf) => Some(intf),
            _ => None,
        })
    }
}

/// `wTotalLength` from the first 4 bytes of a configuration descriptor
pub(crate) fn total_length(header: &[u8]) -> Option<u16> {
    match header {
        [_, CONFIG_DESC_TYPE, lo, hi, ..] => {
            Some(u16::from_le_bytes([*lo, *hi]))
        }
        _ => None,
    }
}

fn split_records(data: &[u8]) -> Result<Vec<(usize, &[u8])>, DfuError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let len = rest[0] as usize;
        if len < 2 {
            return Err(DfuError::MalformedDescriptor {
                offset,
                reason: "descriptor length below 2",
            });
        }
        if len > rest.len() {
            return Err(DfuError::MalformedDescriptor {
                offset,
                reason: "descriptor runs past end of buffer",
            });
        }
        records.push((offset, &rest[..len]));
        offset += len;
    }
    Ok(records)
}

/// Decode a UTF-16LE string descriptor.
pub(crate) fn decode_string_descriptor(raw: &[u8]) -> Option<String> {
    match raw {
        [len, STRING_DESC_TYPE, payload @ ..] => {
            let len = (*len as usize).clamp(2, raw.len()) - 2;
            let units: Vec<u16> = payload[..len]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            Some(String::from_utf16_lossy(&units))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(records: &[&[u8]]) -> Vec<u8> {
        let total: usize = 9 + records.iter().map(|r| r.len()).sum::<usize>();
        let mut data =
            vec![9, 0x02, total as u8, (total >> 8) as u8, 1, 1, 0, 0x80, 50];
        for r in records {
            data.extend_from_slice(r);
        }
        data
    }

    const DFU_INTF: [u8; 9] = [9, 0x04, 0, 0, 0, 0xFE, 0x01, 0x02, 4];
    const DFU_FUNC: [u8; 9] =
        [9, 0x21, 0x0B, 0xFF, 0x00, 0x00, 0x08, 0x1A, 0x01];

    #[test]
    fn test_functional_descriptor() {
        let desc =
            ConfigurationDescriptor::parse(&config(&[&DFU_INTF, &DFU_FUNC]))
                .unwrap();
        assert_eq!(desc.configuration_value, 1);
        assert_eq!(desc.total_length, 27);

        let dfu = desc.dfu_descriptor(1).unwrap();
        assert_eq!(dfu.attributes(), 0x0B);
        assert!(dfu.can_download());
        assert!(dfu.can_upload());
        assert!(!dfu.manifestation_tolerant());
        assert!(dfu.will_detach());
        assert_eq!(dfu.detach_timeout(), 255);
        assert_eq!(dfu.transfer_size(), 2048);
        assert_eq!(dfu.dfu_version(), 0x011A);
        assert!(dfu.is_dfuse());

        assert_eq!(desc.dfu_descriptor(2), None);
    }

    #[test]
    fn test_foreign_class_descriptor_ignored() {
        // HID interface with its own type 0x21 descriptor
        let hid_intf: [u8; 9] = [9, 0x04, 1, 0, 1, 0x03, 0x00, 0x00, 0];
        let hid_desc: [u8; 9] =
            [9, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x3F, 0x00];
        let endpoint: [u8; 7] = [7, 0x05, 0x81, 0x03, 0x40, 0x00, 0x0A];
        let data = config(&[&hid_intf, &hid_desc, &endpoint]);
        let desc = ConfigurationDescriptor::parse(&data).unwrap();
        assert_eq!(desc.dfu_descriptor(1), None);
        assert_eq!(desc.descriptors.len(), 3);
        assert!(matches!(
            desc.descriptors[1],
            Descriptor::Other {
                descriptor_type: 0x21,
                ..
            }
        ));

        let desc = ConfigurationDescriptor::parse(&config(&[
            &hid_intf, &hid_desc, &endpoint, &DFU_INTF, &DFU_FUNC,
        ]))
        .unwrap();
        assert_eq!(desc.dfu_descriptor(1).unwrap().transfer_size(), 2048);
        assert_eq!(desc.interfaces().count(), 2);
    }

    #[test]
    fn test_malformed() {
        let mut data = config(&[&DFU_INTF, &DFU_FUNC]);
        data[18] = 12;
        assert!(matches!(
            ConfigurationDescriptor::parse(&data),
            Err(DfuError::MalformedDescriptor { offset: 18, .. })
        ));

        let mut data = config(&[&DFU_INTF]);
        data[9] = 0;
        assert!(matches!(
            ConfigurationDescriptor::parse(&data),
            Err(DfuError::MalformedDescriptor { offset: 9, .. })
        ));

        assert!(matches!(
            ConfigurationDescriptor::parse(&DFU_INTF),
            Err(DfuError::MalformedDescriptor { offset: 0, .. })
        ));
    }

    #[test]
    fn test_string_descriptor() {
        let raw = [10, 0x03, b'@', 0, b'F', 0, b'/', 0, b'0', 0];
        assert_eq!(decode_string_descriptor(&raw).as_deref(), Some("@F/0"));
        assert_eq!(decode_string_descriptor(&[2, 0x03]).as_deref(), Some(""));
        assert_eq!(decode_string_descriptor(&[2, 0x02]), None);
    }
}
