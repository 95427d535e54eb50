use std::time::Duration;

use crate::{
    DEFAULT_DISCONNECT_TIMEOUT, EXTERNAL_FLASH_BASE, EXTERNAL_FLASH_RESERVED,
    INTERNAL_FLASH_BASE, MIN_POLL_INTERVAL,
};

/// Tunables of a DFU session
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Overrides `wTransferSize` from the functional descriptor.
    pub transfer_size: Option<u16>,
    /// Address an alternate setting name must mention to be picked when a
    /// device exposes several DFU interfaces.
    pub internal_flash_base: u32,
    /// Base of the external (QSPI) flash. A download defaulting to this
    /// address starts `external_flash_reserved` bytes further.
    pub external_flash_base: u32,
    pub external_flash_reserved: u32,
    /// Overrides the DfuSe start address taken from the memory layout.
    pub start_address: Option<u32>,
    /// How long a device that is not manifestation tolerant may take to
    /// leave the bus after the last block.
    pub disconnect_timeout: Duration,
    /// Lower bound on the wait between two status polls.
    pub min_poll_interval: Duration,
    /// Erase the whole DfuSe memory instead of the sectors being written.
    pub mass_erase: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            transfer_size: None,
            internal_flash_base: INTERNAL_FLASH_BASE,
            external_flash_base: EXTERNAL_FLASH_BASE,
            external_flash_reserved: EXTERNAL_FLASH_RESERVED,
            start_address: None,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            min_poll_interval: MIN_POLL_INTERVAL,
            mass_erase: false,
        }
    }
}
