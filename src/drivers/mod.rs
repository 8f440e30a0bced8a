pub mod filter;
pub mod i2c;
pub mod imu;
pub mod mixer;
pub mod pca9685;
pub mod pid;
pub mod sbus;
pub mod serial;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
