use std::{fmt::Display, io};

use dfu::DfuError;

pub enum CliError {
    IO(io::Error),
    Dfu(DfuError),
    NoDFUDevice,
    ManyDFUDevices,
    ReconnectTimeout,
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DfuError> for CliError {
    fn from(value: DfuError) -> Self {
        CliError::Dfu(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Dfu(err) => write!(f, "DFU error: {err}"),
            CliError::NoDFUDevice => write!(f, "No DFU device"),
            CliError::ManyDFUDevices => write!(f, "More than one DFU devices"),
            CliError::ReconnectTimeout => {
                write!(f, "Device did not come back after bootloader update")
            }
        }
    }
}
