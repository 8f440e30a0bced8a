//! Runtime configuration.
//!
//! Everything has a compiled-in default; a handful of deployment-specific
//! values (device paths, baud rates, loop rate) can be overridden from the
//! environment. Nothing is persisted.

use std::str::FromStr;
use std::time::Duration;

use crate::drivers::pca9685::{DEFAULT_FREQUENCY_HZ, PCA9685_ADDR};
use crate::drivers::pid::PidGains;
use crate::drivers::serial::RetryPolicy;

pub const ENV_RC_PORT: &str = "FC_RC_PORT";
pub const ENV_RC_BAUD: &str = "FC_RC_BAUD";
pub const ENV_IMU_PORT: &str = "FC_IMU_PORT";
pub const ENV_IMU_BAUD: &str = "FC_IMU_BAUD";
pub const ENV_I2C_BUS: &str = "FC_I2C_BUS";
pub const ENV_LOOP_HZ: &str = "FC_LOOP_HZ";
/// `0` waits forever, any other value bounds the number of open attempts.
pub const ENV_RC_OPEN_ATTEMPTS: &str = "FC_RC_OPEN_ATTEMPTS";

/// PCA9685 prescaler limits (prescale 3..=255 at 25 MHz).
const PWM_FREQUENCY_RANGE: std::ops::RangeInclusive<u16> = 24..=1526;
const RT_PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 1..=99;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("control loop rate must be non-zero")]
    ZeroLoopRate,
    #[error("pwm frequency {0} Hz outside 24..=1526")]
    PwmFrequency(u16),
    #[error("real-time priority {0} outside 1..=99")]
    PriorityRange(i32),
    #[error("control priority {control} below sensor priority {sensor}")]
    PriorityOrder { control: i32, sensor: i32 },
    #[error("calibration needs at least one sample")]
    NoCalibrationSamples,
}

/// Per-axis gains and the attitude deadband.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlTuning {
    pub roll: PidGains,
    pub pitch: PidGains,
    pub yaw: PidGains,
    /// Degrees of attitude error ignored by the roll/pitch loops.
    pub roll_tolerance: f32,
    pub pitch_tolerance: f32,
    /// Close the yaw loop on the corrected z-rate instead of passing the
    /// rudder stick straight to the mixer.
    pub yaw_rate_loop: bool,
    /// Yaw rate (deg/s) commanded at full rudder when `yaw_rate_loop` is on.
    pub max_yaw_rate: f32,
}

impl Default for ControlTuning {
    fn default() -> Self {
        Self {
            roll: PidGains::new(1.5, 0.0, 1.0),
            pitch: PidGains::new(2.0, 0.5, 0.2),
            yaw: PidGains::new(1.2, 0.5, 0.5),
            roll_tolerance: 1.0,
            pitch_tolerance: 1.0,
            yaw_rate_loop: false,
            max_yaw_rate: 90.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlightConfig {
    pub rc_port: String,
    pub rc_baud: u32,
    pub rc_open: RetryPolicy,

    pub imu_port: String,
    pub imu_baud: u32,
    pub imu_calibration_samples: usize,

    pub i2c_bus: String,
    pub pca9685_address: u16,
    pub pwm_frequency_hz: u16,

    pub loop_hz: u64,
    /// SCHED_FIFO priorities.
    pub control_priority: i32,
    pub sensor_priority: i32,

    pub control: ControlTuning,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            rc_port: "/dev/ttyAMA0".to_owned(),
            rc_baud: 115_200,
            rc_open: RetryPolicy::default(),
            imu_port: "/dev/ttyUSB0".to_owned(),
            imu_baud: 115_200,
            imu_calibration_samples: 100,
            i2c_bus: "/dev/i2c-1".to_owned(),
            pca9685_address: PCA9685_ADDR,
            pwm_frequency_hz: DEFAULT_FREQUENCY_HZ,
            loop_hz: 500,
            control_priority: 80,
            sensor_priority: 70,
            control: ControlTuning::default(),
        }
    }
}

impl FlightConfig {
    /// Defaults plus `FC_*` overrides from the process environment, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup(ENV_RC_PORT) {
            cfg.rc_port = v;
        }
        if let Some(v) = lookup(ENV_RC_BAUD) {
            cfg.rc_baud = parse(ENV_RC_BAUD, &v)?;
        }
        if let Some(v) = lookup(ENV_IMU_PORT) {
            cfg.imu_port = v;
        }
        if let Some(v) = lookup(ENV_IMU_BAUD) {
            cfg.imu_baud = parse(ENV_IMU_BAUD, &v)?;
        }
        if let Some(v) = lookup(ENV_I2C_BUS) {
            cfg.i2c_bus = v;
        }
        if let Some(v) = lookup(ENV_LOOP_HZ) {
            cfg.loop_hz = parse(ENV_LOOP_HZ, &v)?;
        }
        if let Some(v) = lookup(ENV_RC_OPEN_ATTEMPTS) {
            let count: u32 = parse(ENV_RC_OPEN_ATTEMPTS, &v)?;
            cfg.rc_open = if count == 0 {
                RetryPolicy::Forever {
                    backoff: RetryPolicy::DEFAULT_BACKOFF,
                }
            } else {
                RetryPolicy::Attempts {
                    count,
                    backoff: RetryPolicy::DEFAULT_BACKOFF,
                }
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loop_hz == 0 {
            return Err(ConfigError::ZeroLoopRate);
        }
        if !PWM_FREQUENCY_RANGE.contains(&self.pwm_frequency_hz) {
            return Err(ConfigError::PwmFrequency(self.pwm_frequency_hz));
        }
        for priority in [self.control_priority, self.sensor_priority] {
            if !RT_PRIORITY_RANGE.contains(&priority) {
                return Err(ConfigError::PriorityRange(priority));
            }
        }
        if self.control_priority < self.sensor_priority {
            return Err(ConfigError::PriorityOrder {
                control: self.control_priority,
                sensor: self.sensor_priority,
            });
        }
        if self.imu_calibration_samples == 0 {
            return Err(ConfigError::NoCalibrationSamples);
        }
        Ok(())
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.loop_hz.max(1))
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_owned(),
    })
}
