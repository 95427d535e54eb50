use thiserror::Error;

use crate::state::{DeviceState, Status};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum DfuError {
    #[error("Malformed descriptor at offset {offset}: {reason}")]
    MalformedDescriptor { offset: usize, reason: &'static str },
    #[error("Invalid DfuSe memory layout: {0}")]
    InvalidMemoryLayout(String),
    #[error("Device has no DFU interface")]
    NoDfuInterface,
    #[error(
        "{candidates} DFU interfaces found, none names the internal flash region"
    )]
    AmbiguousInterface { candidates: usize },
    #[error("Erase failed @ 0x{address:08x}: status {status}, state {state}")]
    EraseFailed {
        address: u32,
        status: Status,
        state: DeviceState,
    },
    #[error("Block {block} rejected: status {status}, state {state}")]
    TransferRejected {
        block: u16,
        status: Status,
        state: DeviceState,
    },
    #[error("Device disconnected")]
    DeviceDisconnected,
    #[error("Timeout")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Short response to request {request}: expected {expected} bytes, got {got}")]
    ShortResponse {
        request: u8,
        expected: usize,
        got: usize,
    },
    #[error("Unexpected device state: expected {expected}, got {got}")]
    UnexpectedState {
        expected: DeviceState,
        got: DeviceState,
    },
    #[error("Range 0x{start:08x}..0x{end:08x} is not writable device memory")]
    OutOfMemoryRange { start: u32, end: u32 },
    #[error("Image needs {blocks} blocks, more than a DfuSe transfer can address")]
    ImageTooLarge { blocks: usize },
    #[error("Session is not connected")]
    NotConnected,
}

impl DfuError {
    /// Loss of the USB link, as seen when a device resets itself.
    ///
    /// A stall is an answer from the device and does not count.
    pub fn is_link_loss(&self) -> bool {
        matches!(
            self,
            DfuError::DeviceDisconnected
                | DfuError::Timeout
                | DfuError::Transport(TransportError::Failed(_))
        )
    }
}

impl From<TransportError> for DfuError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => DfuError::DeviceDisconnected,
            TransportError::TimedOut => DfuError::Timeout,
            err => DfuError::Transport(err),
        }
    }
}
