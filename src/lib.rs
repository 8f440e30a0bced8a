//! Flight-control core for a Linux-hosted quadcopter.
//!
//! Radio frames and IMU samples in, four ESC pulses out, at a fixed rate on a
//! real-time thread. `main.rs` wires the pieces to hardware; everything here
//! is usable against the mocks in `drivers::mock`.

pub mod board;
pub mod config;
pub mod drivers;
pub mod error;
pub mod state;
pub mod tasks;

pub use config::{ControlTuning, FlightConfig};
pub use error::FlightError;
