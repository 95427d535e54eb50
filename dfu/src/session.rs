use log::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::connection::DfuConnection;
use crate::descriptor::DfuDescriptor;
use crate::download::{Download, Manifestation, Protocol, Stage};
use crate::interface::{
    DFU_PROTOCOL_DFU, InterfaceSetting, find_configuration_descriptor,
    select_interface,
};
use crate::memory::DfuMemory;
use crate::transport::{DeviceDescriptor, Transport};
use crate::{DEFAULT_TRANSFER_SIZE, DfuError};

/// Connection to one DFU device, from interface claim to disconnect
///
/// The session owns the transport, so a device can only be driven by one
/// session at a time.
pub struct Session<T: Transport> {
    connection: DfuConnection<T>,
    device: DeviceDescriptor,
    setting: InterfaceSetting,
    dfu_descriptor: Option<DfuDescriptor>,
    manifestation_tolerant: bool,
    memory: Option<DfuMemory>,
    start_address: Option<u32>,
    config: SessionConfig,
    connected: bool,
    last_stage: Stage,
}

impl<T: Transport> Session<T> {
    /// Open the device, pick its DFU interface and connect to it.
    pub fn open(
        mut transport: T,
        config: SessionConfig,
    ) -> Result<Self, DfuError> {
        transport.open()?;
        let setting =
            select_interface(&mut transport, config.internal_flash_base)?;
        Self::connect(transport, setting, config)
    }

    /// Connect to the given DFU alternate setting.
    pub fn connect(
        mut transport: T,
        setting: InterfaceSetting,
        config: SessionConfig,
    ) -> Result<Self, DfuError> {
        if !setting.is_dfu() {
            return Err(DfuError::NoDfuInterface);
        }
        let device = transport.device_descriptor().clone();

        transport.open()?;
        transport.select_configuration(setting.configuration_value)?;
        transport.claim_interface(
            setting.interface_number,
            setting.alternate_setting,
        )?;

        let value = setting.configuration_value;
        let dfu_descriptor =
            match find_configuration_descriptor(&mut transport, value) {
                Ok(Some(config_desc)) => config_desc.dfu_descriptor(value),
                Ok(None) => {
                    warn!("No descriptor for configuration {value}");
                    None
                }
                Err(err @ DfuError::MalformedDescriptor { .. }) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!("Failed to read configuration descriptor: {err}");
                    None
                }
            };

        let mut transfer_size = DEFAULT_TRANSFER_SIZE;
        let mut manifestation_tolerant = true;
        let mut memory = None;
        match &dfu_descriptor {
            Some(desc) => {
                transfer_size = desc.transfer_size();
                if desc.can_download() {
                    manifestation_tolerant = desc.manifestation_tolerant();
                }
                if desc.is_dfuse()
                    && setting.interface_protocol == DFU_PROTOCOL_DFU
                {
                    memory = match setting.layout() {
                        Some(Ok(layout)) => Some(layout),
                        Some(Err(err)) => {
                            warn!("{err}, using plain DFU");
                            None
                        }
                        None => {
                            warn!(
                                "DfuSe interface has no name, using plain DFU"
                            );
                            None
                        }
                    };
                }
            }
            None => debug!("No DFU functional descriptor, using defaults"),
        }
        if let Some(size) = config.transfer_size {
            transfer_size = size;
        }

        let start_address = memory.as_ref().and_then(|memory| {
            config.start_address.or_else(|| {
                memory.default_start_address(
                    config.external_flash_base,
                    config.external_flash_reserved,
                )
            })
        });

        let connection = DfuConnection::new(
            transport,
            setting.interface_number,
            transfer_size,
            config.min_poll_interval,
        );

        let session = Session {
            connection,
            device,
            setting,
            dfu_descriptor,
            manifestation_tolerant,
            memory,
            start_address,
            config,
            connected: true,
            last_stage: Stage::Idle,
        };
        session.log_summary();
        Ok(session)
    }

    fn log_summary(&self) {
        info!(
            "{}: [{}] cfg={}, intf={}, alt={}, transfer size {}",
            self.setting.mode(),
            self.device,
            self.setting.configuration_value,
            self.setting.interface_number,
            self.setting.alternate_setting,
            self.transfer_size(),
        );
        let Some(memory) = &self.memory else {
            return;
        };
        info!(
            "Selected memory region: {} ({} bytes)",
            memory.name,
            memory.size()
        );
        for segment in memory.segments.iter() {
            let mut properties = Vec::new();
            if segment.readable() {
                properties.push("readable");
            }
            if segment.erasable() {
                properties.push("erasable");
            }
            if segment.writable() {
                properties.push("writable");
            }
            info!(
                "  0x{:08x}-0x{:08x} ({})",
                segment.start_addr(),
                segment.end_addr().wrapping_sub(1),
                if properties.is_empty() {
                    "inaccessible".into()
                } else {
                    properties.join(", ")
                }
            );
        }
        if let Some(addr) = self.start_address {
            info!("Start address 0x{addr:08x}");
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn interface(&self) -> &InterfaceSetting {
        &self.setting
    }

    pub fn dfu_descriptor(&self) -> Option<&DfuDescriptor> {
        self.dfu_descriptor.as_ref()
    }

    pub fn transfer_size(&self) -> u16 {
        self.connection.transfer_size()
    }

    pub fn manifestation_tolerant(&self) -> bool {
        self.manifestation_tolerant
    }

    /// DfuSe memory map, `None` for plain DFU
    pub fn memory(&self) -> Option<&DfuMemory> {
        self.memory.as_ref()
    }

    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    /// Stage the most recent download ended in
    pub fn last_stage(&self) -> Stage {
        self.last_stage
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connection(&mut self) -> Result<&mut DfuConnection<T>, DfuError> {
        if !self.connected {
            return Err(DfuError::NotConnected);
        }
        Ok(&mut self.connection)
    }

    /// Write `image` to the device and let it manifest.
    ///
    /// `progress` receives `(bytes acknowledged, image length)` after every
    /// block.
    pub fn download_firmware(
        &mut self,
        image: &[u8],
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Manifestation, DfuError> {
        if !self.connected {
            return Err(DfuError::NotConnected);
        }
        self.connection.normalize_state();

        let protocol = match &self.memory {
            Some(memory) => {
                let start_address = match self.start_address {
                    Some(addr) => addr,
                    None => {
                        let addr = memory.segments.first().start_addr();
                        warn!("Using inferred start address 0x{addr:08x}");
                        addr
                    }
                };
                Protocol::Dfuse {
                    memory,
                    start_address,
                    mass_erase: self.config.mass_erase,
                }
            }
            None => Protocol::Dfu,
        };

        let mut download = Download::new(
            &mut self.connection,
            protocol,
            self.manifestation_tolerant,
            self.config.disconnect_timeout,
        );
        let result = download.run(image, &mut progress);
        self.last_stage = download.stage();
        let stage = download.failed_in().unwrap_or(self.last_stage);

        match result {
            Ok(Manifestation::Idle) => {
                info!("Done, firmware programming complete");
            }
            Ok(outcome) => {
                info!("Done, device will reset and boot the new firmware");
                if outcome == Manifestation::Reset {
                    self.connected = false;
                }
            }
            Err(DfuError::DeviceDisconnected) => {
                error!("{}: disconnected during {stage:?}", self.device);
                self.connected = false;
            }
            Err(ref err) => {
                error!(
                    "{}: download failed during {stage:?}, last state {}: {err}",
                    self.device,
                    self.connection
                        .last_state()
                        .map_or("unknown".into(), |state| state.to_string()),
                );
            }
        }
        result
    }

    /// Release the device.
    pub fn close(self) -> T {
        let mut transport = self.connection.into_transport();
        transport.close();
        transport
    }
}
