use std::time::Duration;

use log::{debug, trace, warn};
use num_enum::FromPrimitive;

use crate::error::DfuError;
use crate::state::{DFU_STATUS_LEN, DeviceState, StatusReport};
use crate::transport::{
    REQUEST_TYPE_CLASS_IN, REQUEST_TYPE_CLASS_OUT, Transport,
};

// const DFU_CMD_DETACH: u8 = 0;
pub(crate) const DFU_CMD_DOWNLOAD: u8 = 1;
// const DFU_CMD_UPLOAD: u8 = 2;
pub(crate) const DFU_CMD_GETSTATUS: u8 = 3;
pub(crate) const DFU_CMD_CLRSTATUS: u8 = 4;
pub(crate) const DFU_CMD_GETSTATE: u8 = 5;
pub(crate) const DFU_CMD_ABORT: u8 = 6;

const DFUSE_CMD_ADDR: u8 = 0x21;
const DFUSE_CMD_ERASE: u8 = 0x41;

/// DfuSe vendor command, sent as the payload of DNLOAD block 0
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuseCommand {
    SetAddress(u32),
    Erase(u32),
    MassErase,
}

impl DfuseCommand {
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            DfuseCommand::SetAddress(addr) => command(DFUSE_CMD_ADDR, addr),
            DfuseCommand::Erase(addr) => command(DFUSE_CMD_ERASE, addr),
            DfuseCommand::MassErase => vec![DFUSE_CMD_ERASE],
        }
    }
}

fn command(cmd: u8, addr: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(5);
    data.push(cmd);
    data.extend_from_slice(&addr.to_le_bytes());
    data
}

/// Claimed DFU interface of an open device
pub struct DfuConnection<T: Transport> {
    transport: T,
    interface: u8,
    xfer_size: u16,
    min_poll: Duration,
    last_state: Option<DeviceState>,
}

impl<T: Transport> DfuConnection<T> {
    pub(crate) fn new(
        transport: T,
        interface: u8,
        xfer_size: u16,
        min_poll: Duration,
    ) -> Self {
        DfuConnection {
            transport,
            interface,
            xfer_size: if xfer_size > 0 {
                xfer_size
            } else {
                crate::DEFAULT_TRANSFER_SIZE
            },
            min_poll,
            last_state: None,
        }
    }

    pub fn transfer_size(&self) -> u16 {
        self.xfer_size
    }

    /// State reported by the most recent GETSTATE/GETSTATUS answer
    pub fn last_state(&self) -> Option<DeviceState> {
        self.last_state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub(crate) fn into_transport(self) -> T {
        self.transport
    }

    pub fn get_state(&mut self) -> Result<DeviceState, DfuError> {
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATE, 0, 1)?;
        let state = match data.first() {
            Some(code) => DeviceState::from_primitive(*code),
            None => {
                return Err(DfuError::ShortResponse {
                    request: DFU_CMD_GETSTATE,
                    expected: 1,
                    got: 0,
                });
            }
        };
        self.last_state = Some(state);
        Ok(state)
    }

    pub fn get_status(&mut self) -> Result<StatusReport, DfuError> {
        let data =
            self.dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN as u16)?;
        let st = StatusReport::from_raw(&data)?;
        trace!(
            "status: state={} status={} poll={:?}",
            st.state, st.status, st.poll_timeout
        );
        self.last_state = Some(st.state);
        Ok(st)
    }

    /// Leave `dfuERROR`.
    pub fn clear_status(&mut self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[])
    }

    pub fn abort(&mut self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_ABORT, 0, &[])
    }

    /// Send `DFU_ABORT` and make sure the device ends up in `dfuIDLE`.
    pub fn abort_to_idle(&mut self) -> Result<(), DfuError> {
        self.abort()?;
        let mut state = self.get_state()?;
        if state == DeviceState::dfuERROR {
            self.clear_status()?;
            state = self.get_state()?;
        }
        if state != DeviceState::dfuIDLE {
            return Err(DfuError::UnexpectedState {
                expected: DeviceState::dfuIDLE,
                got: state,
            });
        }
        Ok(())
    }

    /// Bring a device left over by an interrupted session back to `dfuIDLE`.
    ///
    /// Failures are only logged: the first DNLOAD reports a stuck device.
    pub fn normalize_state(&mut self) {
        match self.get_state() {
            Ok(DeviceState::dfuERROR) => {
                debug!("Device in dfuERROR, clearing status");
                if let Err(err) = self.clear_status() {
                    warn!("Failed to clear error status: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => debug!("Failed to read initial state: {err}"),
        }

        match self.get_status() {
            Ok(st) if st.state == DeviceState::dfuIDLE => {}
            Ok(st) => {
                debug!("Device in {}, aborting to dfuIDLE", st.state);
                if let Err(err) = self.abort_to_idle() {
                    warn!("Failed to return to dfuIDLE: {err}");
                }
            }
            Err(err) => warn!("Failed to check device state: {err}"),
        }
    }

    /// Send a DNLOAD request without waiting for the device.
    pub fn dnload(&mut self, block: u16, data: &[u8]) -> Result<(), DfuError> {
        trace!("DNLOAD block {block}, {} bytes", data.len());
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, block, data)
    }

    /// Run a DfuSe command to completion.
    ///
    /// Returns the final status, which the caller must check.
    pub fn dfuse_command(
        &mut self,
        cmd: DfuseCommand,
    ) -> Result<StatusReport, DfuError> {
        debug!("DfuSe command {cmd:x?}");
        self.dnload(0, &cmd.to_bytes())?;
        self.poll_until(|state| !state.is_busy())
    }

    /// Poll status until `done` accepts the state or the device enters
    /// `dfuERROR`.
    ///
    /// Waits at least the device-requested poll timeout between two polls.
    pub fn poll_until(
        &mut self,
        done: impl Fn(DeviceState) -> bool,
    ) -> Result<StatusReport, DfuError> {
        let st = self.get_status()?;
        self.poll_from(st, done)
    }

    /// Like [`poll_until`](Self::poll_until), continuing from an earlier
    /// report: its poll timeout elapses before the first request.
    pub fn poll_after(
        &mut self,
        previous: &StatusReport,
        done: impl Fn(DeviceState) -> bool,
    ) -> Result<StatusReport, DfuError> {
        self.wait_poll_timeout(previous);
        let st = self.get_status()?;
        self.poll_from(st, done)
    }

    fn poll_from(
        &mut self,
        mut st: StatusReport,
        done: impl Fn(DeviceState) -> bool,
    ) -> Result<StatusReport, DfuError> {
        while !done(st.state) && st.state != DeviceState::dfuERROR {
            self.wait_poll_timeout(&st);
            st = self.get_status()?;
        }
        Ok(st)
    }

    fn wait_poll_timeout(&mut self, st: &StatusReport) {
        self.transport.sleep(st.poll_timeout.max(self.min_poll));
    }

    fn dfu_cmd_out(
        &mut self,
        req: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let index = self.interface as u16;
        Ok(self.transport.control_out(
            REQUEST_TYPE_CLASS_OUT,
            req,
            value,
            index,
            data,
        )?)
    }

    fn dfu_cmd_in(
        &mut self,
        req: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let index = self.interface as u16;
        Ok(self.transport.control_in(
            REQUEST_TYPE_CLASS_IN,
            req,
            value,
            index,
            length,
        )?)
    }
}
