use crate::board::BoardError;
use crate::config::ConfigError;
use crate::drivers::i2c::BusError;
use crate::drivers::imu::ImuError;
use crate::drivers::pca9685::ActuatorError;
use crate::drivers::serial::SerialError;

/// Anything that stops the process.
#[derive(Debug, thiserror::Error)]
pub enum FlightError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("board: {0}")]
    Board(#[from] BoardError),
    #[error("radio link: {0}")]
    Serial(#[from] SerialError),
    #[error("i2c: {0}")]
    Bus(#[from] BusError),
    #[error("actuator: {0}")]
    Actuator(#[from] ActuatorError),
    #[error("imu: {0}")]
    Imu(#[from] ImuError),
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}
