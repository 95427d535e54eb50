//! Block-wise firmware download
//!
//! Plain DFU sends the image as DNLOAD blocks numbered from 0. DfuSe first
//! erases the target sectors and loads the address pointer through vendor
//! commands carried in DNLOAD block 0, then numbers data blocks from 2 so
//! that the device writes block `n` at `pointer + (n - 2) * wTransferSize`.
//! Both end with a zero-length DNLOAD that starts manifestation.

use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::connection::{DfuConnection, DfuseCommand};
use crate::memory::DfuMemory;
use crate::state::{DeviceState, StatusReport};
use crate::transport::Transport;
use crate::DfuError;

const DFUSE_FIRST_BLOCK: u16 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Erasing,
    SettingAddress,
    Transferring,
    Polling,
    Manifesting,
    Done,
    Failed,
}

/// How a successful download ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Manifestation {
    /// Device reported `dfuIDLE` after manifestation.
    Idle,
    /// Device reset itself and left the bus.
    Reset,
    /// Device was expected to reset but is still attached.
    Pending,
}

pub(crate) enum Protocol<'a> {
    Dfu,
    Dfuse {
        memory: &'a DfuMemory,
        start_address: u32,
        mass_erase: bool,
    },
}

pub(crate) struct Download<'a, T: Transport> {
    conn: &'a mut DfuConnection<T>,
    protocol: Protocol<'a>,
    manifestation_tolerant: bool,
    disconnect_timeout: Duration,
    stage: Stage,
    failed_in: Option<Stage>,
}

impl<'a, T: Transport> Download<'a, T> {
    pub(crate) fn new(
        conn: &'a mut DfuConnection<T>,
        protocol: Protocol<'a>,
        manifestation_tolerant: bool,
        disconnect_timeout: Duration,
    ) -> Self {
        Download {
            conn,
            protocol,
            manifestation_tolerant,
            disconnect_timeout,
            stage: Stage::Idle,
            failed_in: None,
        }
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    /// Stage that was active when the download failed
    pub(crate) fn failed_in(&self) -> Option<Stage> {
        self.failed_in
    }

    pub(crate) fn run(
        &mut self,
        image: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Manifestation, DfuError> {
        let result = self.transfer(image, progress);
        match &result {
            Ok(_) => self.enter(Stage::Done),
            Err(err) => {
                debug!("Download failed in stage {:?}: {err}", self.stage);
                self.failed_in = Some(self.stage);
                self.enter(Stage::Failed)
            }
        }
        result
    }

    fn transfer(
        &mut self,
        image: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Manifestation, DfuError> {
        let xfer_size = self.conn.transfer_size() as usize;
        let blocks = image.len().div_ceil(xfer_size);

        let first_block = match self.protocol {
            Protocol::Dfu => 0,
            Protocol::Dfuse {
                memory,
                start_address,
                mass_erase,
            } => {
                if blocks > (u16::MAX - DFUSE_FIRST_BLOCK + 1) as usize {
                    return Err(DfuError::ImageTooLarge { blocks });
                }
                let length = u32::try_from(image.len()).map_err(|_| {
                    DfuError::OutOfMemoryRange {
                        start: start_address,
                        end: u32::MAX,
                    }
                })?;
                memory.check_writable(start_address, length)?;

                self.erase(memory, start_address, length, mass_erase)?;
                self.set_address(start_address)?;
                DFUSE_FIRST_BLOCK
            }
        };

        let next_block = self.write_blocks(image, first_block, progress)?;
        self.manifest(next_block)
    }

    fn erase(
        &mut self,
        memory: &DfuMemory,
        start: u32,
        length: u32,
        mass_erase: bool,
    ) -> Result<(), DfuError> {
        self.enter(Stage::Erasing);
        if mass_erase {
            info!("Mass erasing \"{}\"", memory.name);
            let st = self.conn.dfuse_command(DfuseCommand::MassErase)?;
            return erase_result(st, start);
        }

        let sectors = memory.erase_sectors(start, length)?;
        info!("Erasing {} sectors of \"{}\"", sectors.len(), memory.name);
        for (n, addr) in sectors.iter().enumerate() {
            debug!(
                "Erasing sector {:2} of {:2} @ 0x{addr:08x}",
                n + 1,
                sectors.len()
            );
            let st = self.conn.dfuse_command(DfuseCommand::Erase(*addr))?;
            erase_result(st, *addr)?;
        }
        Ok(())
    }

    fn set_address(&mut self, addr: u32) -> Result<(), DfuError> {
        self.enter(Stage::SettingAddress);
        debug!("Set address pointer to 0x{addr:08x}");
        let st = self.conn.dfuse_command(DfuseCommand::SetAddress(addr))?;
        block_result(st, 0, DeviceState::dfuDNLOAD_IDLE)
    }

    /// Returns the number the next block would carry.
    fn write_blocks(
        &mut self,
        image: &[u8],
        first_block: u16,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<u16, DfuError> {
        let total = image.len();
        let mut sent = 0;
        let mut block = first_block;

        info!("Copying {total} bytes to the device");
        progress(sent, total);
        for chunk in image.chunks(self.conn.transfer_size() as usize) {
            self.enter(Stage::Transferring);
            self.conn.dnload(block, chunk)?;

            self.enter(Stage::Polling);
            let st = self.conn.poll_until(|state| !state.is_busy())?;
            block_result(st, block, DeviceState::dfuDNLOAD_IDLE)?;

            sent += chunk.len();
            progress(sent, total);
            block = block.wrapping_add(1);
        }
        info!("Wrote {sent} bytes");
        Ok(block)
    }

    fn manifest(&mut self, next_block: u16) -> Result<Manifestation, DfuError> {
        self.enter(Stage::Manifesting);
        info!("Manifesting new firmware");

        let final_block = match self.protocol {
            Protocol::Dfu => next_block,
            Protocol::Dfuse { start_address, .. } => {
                let st = self
                    .conn
                    .dfuse_command(DfuseCommand::SetAddress(start_address))?;
                block_result(st, 0, DeviceState::dfuDNLOAD_IDLE)?;
                0
            }
        };

        // From here on the device may reset at any moment
        if let Err(err) = self.conn.dnload(final_block, &[]) {
            return device_reset(err);
        }

        let tolerant = self.manifestation_tolerant;
        let st = match self.conn.poll_until(|state| {
            matches!(
                state,
                DeviceState::dfuMANIFEST_SYNC
                    | DeviceState::dfuMANIFEST
                    | DeviceState::dfuMANIFEST_WAIT_RESET
            ) || (tolerant && state == DeviceState::dfuIDLE)
        }) {
            Ok(st) => st,
            Err(err) => return device_reset(err),
        };
        manifest_result(st, final_block)?;

        if !tolerant {
            return Ok(self.wait_reset());
        }

        let st = if st.state == DeviceState::dfuIDLE {
            st
        } else {
            match self.conn.poll_after(&st, |state| {
                matches!(
                    state,
                    DeviceState::dfuIDLE | DeviceState::dfuMANIFEST_WAIT_RESET
                )
            }) {
                Ok(st) => st,
                Err(err) => return device_reset(err),
            }
        };
        manifest_result(st, final_block)?;

        if st.state == DeviceState::dfuMANIFEST_WAIT_RESET {
            debug!(
                "Device entered dfuMANIFEST_WAIT_RESET although manifestation tolerant"
            );
            return Ok(self.wait_reset());
        }
        Ok(Manifestation::Idle)
    }

    fn wait_reset(&mut self) -> Manifestation {
        let timeout = self.disconnect_timeout;
        let transport = self.conn.transport_mut();
        if transport.wait_disconnected(timeout) {
            info!("Device disconnected to boot the new firmware");
            return Manifestation::Reset;
        }

        warn!("Device still attached {timeout:?} after manifestation");
        if let Err(err) = transport.reset() {
            debug!("Ignored reset error: {err}");
        }
        Manifestation::Pending
    }

    fn enter(&mut self, stage: Stage) {
        if self.stage != stage {
            trace!("Download stage {:?} -> {stage:?}", self.stage);
            self.stage = stage;
        }
    }
}

fn block_result(
    st: StatusReport,
    block: u16,
    expected: DeviceState,
) -> Result<(), DfuError> {
    if st.status.is_ok() && st.state == expected {
        Ok(())
    } else {
        Err(DfuError::TransferRejected {
            block,
            status: st.status,
            state: st.state,
        })
    }
}

fn erase_result(st: StatusReport, address: u32) -> Result<(), DfuError> {
    if st.is_ok() {
        Ok(())
    } else {
        Err(DfuError::EraseFailed {
            address,
            status: st.status,
            state: st.state,
        })
    }
}

fn manifest_result(st: StatusReport, block: u16) -> Result<(), DfuError> {
    if st.is_ok() {
        Ok(())
    } else {
        Err(DfuError::TransferRejected {
            block,
            status: st.status,
            state: st.state,
        })
    }
}

/// The device stopped answering once manifestation had been requested: it is
/// rebooting into the new firmware. Errors reported by the device still count.
fn device_reset(err: DfuError) -> Result<Manifestation, DfuError> {
    if err.is_link_loss() {
        info!("Device reset during manifestation ({err})");
        Ok(Manifestation::Reset)
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Status;

    fn report(status: Status, state: DeviceState) -> StatusReport {
        StatusReport {
            status,
            poll_timeout: Duration::ZERO,
            state,
            string_index: 0,
        }
    }

    #[test]
    fn test_block_result() {
        assert!(
            block_result(
                report(Status::OK, DeviceState::dfuDNLOAD_IDLE),
                3,
                DeviceState::dfuDNLOAD_IDLE
            )
            .is_ok()
        );
        assert!(matches!(
            block_result(
                report(Status::errWRITE, DeviceState::dfuERROR),
                3,
                DeviceState::dfuDNLOAD_IDLE
            ),
            Err(DfuError::TransferRejected {
                block: 3,
                status: Status::errWRITE,
                state: DeviceState::dfuERROR,
            })
        ));
        assert!(
            block_result(
                report(Status::OK, DeviceState::dfuIDLE),
                3,
                DeviceState::dfuDNLOAD_IDLE
            )
            .is_err()
        );
    }

    #[test]
    fn test_device_reset_classification() {
        use crate::transport::TransportError;

        assert_eq!(
            device_reset(DfuError::DeviceDisconnected).unwrap(),
            Manifestation::Reset
        );
        assert_eq!(
            device_reset(
                TransportError::Failed("status query failed".into()).into()
            )
            .unwrap(),
            Manifestation::Reset
        );
        assert!(device_reset(TransportError::Stall.into()).is_err());
        assert!(
            device_reset(DfuError::TransferRejected {
                block: 0,
                status: Status::errNOTDONE,
                state: DeviceState::dfuERROR,
            })
            .is_err()
        );
    }
}
