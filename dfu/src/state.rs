use std::fmt;
use std::time::Duration;

use num_enum::FromPrimitive;

use crate::DfuError;

pub(crate) const DFU_STATUS_LEN: usize = 6;

/// DFU device states (DFU 1.1, section 6.1.2).
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum DeviceState {
    appIDLE = 0,
    appDETACH = 1,
    dfuIDLE = 2,
    dfuDNLOAD_SYNC = 3,
    dfuDNBUSY = 4,
    dfuDNLOAD_IDLE = 5,
    dfuMANIFEST_SYNC = 6,
    dfuMANIFEST = 7,
    dfuMANIFEST_WAIT_RESET = 8,
    dfuUPLOAD_IDLE = 9,
    dfuERROR = 10,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl DeviceState {
    pub fn code(self) -> u8 {
        use DeviceState::*;
        match self {
            appIDLE => 0,
            appDETACH => 1,
            dfuIDLE => 2,
            dfuDNLOAD_SYNC => 3,
            dfuDNBUSY => 4,
            dfuDNLOAD_IDLE => 5,
            dfuMANIFEST_SYNC => 6,
            dfuMANIFEST => 7,
            dfuMANIFEST_WAIT_RESET => 8,
            dfuUPLOAD_IDLE => 9,
            dfuERROR => 10,
            Unknown(code) => code,
        }
    }

    /// Device is still processing the last DNLOAD block.
    pub fn is_busy(self) -> bool {
        matches!(self, DeviceState::dfuDNLOAD_SYNC | DeviceState::dfuDNBUSY)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Unknown(code) => write!(f, "unknown state {code}"),
            state => write!(f, "{state:?}"),
        }
    }
}

/// Status codes a DFU device can return, taken from the USB DFU 1.1 spec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[allow(non_camel_case_types)] // Names from DFU spec
pub enum Status {
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0a,
    errVENDOR = 0x0b,
    errUSBR = 0x0c,
    errPOR = 0x0d,
    errUNKNOWN = 0x0e,
    errSTALLEDPKT = 0x0f,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl Status {
    pub fn code(self) -> u8 {
        use Status::*;
        match self {
            OK => 0x00,
            errTARGET => 0x01,
            errFILE => 0x02,
            errWRITE => 0x03,
            errERASE => 0x04,
            errCHECK_ERASED => 0x05,
            errPROG => 0x06,
            errVERIFY => 0x07,
            errADDRESS => 0x08,
            errNOTDONE => 0x09,
            errFIRMWARE => 0x0a,
            errVENDOR => 0x0b,
            errUSBR => 0x0c,
            errPOR => 0x0d,
            errUNKNOWN => 0x0e,
            errSTALLEDPKT => 0x0f,
            Unknown(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }

    pub fn error_str(self) -> &'static str {
        use Status::*;
        match self {
            OK => "No error condition is present.",
            errTARGET => "File is not targeted for use by this device.",
            errFILE => "File is for this device but fails some vendor-specific verification test.",
            errWRITE => "Device is unable to write memory.",
            errERASE => "Memory erase function failed.",
            errCHECK_ERASED => "Memory erase check failed.",
            errPROG => "Program memory function failed.",
            errVERIFY => "Programmed memory failed verification.",
            errADDRESS => "Cannot program memory due to received address that is out of range.",
            errNOTDONE => {
                "Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet."
            }
            errFIRMWARE => {
                "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations."
            }
            errVENDOR => "iString indicates a vendor-specific error.",
            errUSBR => "Device detected unexpected USB reset signaling.",
            errPOR => "Device detected unexpected power on reset.",
            errUNKNOWN => "Something went wrong, but the device does not know what it was.",
            errSTALLEDPKT => "Device stalled an unexpected request.",
            Unknown(_) => "Status code outside the DFU specification.",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Unknown(code) => write!(f, "unknown status {code}"),
            status => write!(f, "{status:?} ({})", status.error_str()),
        }
    }
}

/// Answer to a `DFU_GETSTATUS` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusReport {
    pub status: Status,
    /// Minimum time the host must wait before the next `DFU_GETSTATUS`.
    pub poll_timeout: Duration,
    pub state: DeviceState,
    pub string_index: u8,
}

impl StatusReport {
    pub(crate) fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN {
            return Err(DfuError::ShortResponse {
                request: crate::connection::DFU_CMD_GETSTATUS,
                expected: DFU_STATUS_LEN,
                got: data.len(),
            });
        }
        let poll_timeout =
            (data[3] as u32) << 16 | (data[2] as u32) << 8 | (data[1] as u32);
        Ok(StatusReport {
            status: Status::from_primitive(data[0]),
            poll_timeout: Duration::from_millis(poll_timeout as u64),
            state: DeviceState::from_primitive(data[4]),
            string_index: data[5],
        })
    }

    /// Device accepted the last request and is not in `dfuERROR`.
    pub fn is_ok(&self) -> bool {
        self.status.is_ok() && self.state != DeviceState::dfuERROR
    }
}
