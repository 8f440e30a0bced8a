use i2cdev::core::I2CDevice;
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to open {path} for address {address:#04x}: {source}")]
    Open {
        path: String,
        address: u16,
        #[source]
        source: LinuxI2CError,
    },
    #[error("bus transfer failed: {0}")]
    Transfer(String),
}

/// A bus already bound to one target address.
///
/// Only one owner per bus handle; the flight loop is the sole user.
pub trait I2cBus {
    /// START - ADDR(W) - DATA - STOP
    fn write(&mut self, data: &[u8]) -> Result<(), BusError>;

    /// Writes `write` (usually a register index), then reads into `read`.
    fn write_read(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), BusError>;
}

/// `/dev/i2c-N` character device with the slave address selected.
pub struct LinuxI2cBus {
    dev: LinuxI2CDevice,
}

impl LinuxI2cBus {
    pub fn open(path: &str, address: u16) -> Result<Self, BusError> {
        let dev = LinuxI2CDevice::new(path, address).map_err(|source| BusError::Open {
            path: path.to_owned(),
            address,
            source,
        })?;
        Ok(Self { dev })
    }
}

impl I2cBus for LinuxI2cBus {
    fn write(&mut self, data: &[u8]) -> Result<(), BusError> {
        self.dev
            .write(data)
            .map_err(|e| BusError::Transfer(e.to_string()))
    }

    fn write_read(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), BusError> {
        self.dev
            .write(write)
            .map_err(|e| BusError::Transfer(e.to_string()))?;
        self.dev
            .read(read)
            .map_err(|e| BusError::Transfer(e.to_string()))
    }
}
