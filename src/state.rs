//! Shared state types passed between the drivers, the IMU producer and the
//! flight loop.
//!
//! The data types are `Copy` so they can be handed across the mailbox by value.

use bitflags::bitflags;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Instant;

use crate::drivers::pca9685::PWM_MIN;

// ── Radio ─────────────────────────────────────────────────────────────────────

pub const RC_CHANNEL_COUNT: usize = 16;

bitflags! {
    /// Status bits carried in the flags byte of every radio frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RcFlags: u8 {
        const CH17 = 0x80;
        const CH18 = 0x40;
        const FRAME_LOST = 0x20;
        const FAILSAFE = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcData {
    pub channels: [u16; RC_CHANNEL_COUNT],
    pub flags: RcFlags,
}

impl Default for RcData {
    fn default() -> Self {
        Self {
            channels: [0u16; RC_CHANNEL_COUNT],
            flags: RcFlags::empty(),
        }
    }
}

impl RcData {
    /// Value of a 1-based channel number, `None` outside `1..=16`.
    pub fn channel(&self, number: usize) -> Option<u16> {
        if (1..=RC_CHANNEL_COUNT).contains(&number) {
            Some(self.channels[number - 1])
        } else {
            None
        }
    }
}

// ── Inertial ──────────────────────────────────────────────────────────────────

/// One calibrated IMU reading. Angles in degrees, rates in deg/s, accel in g.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialSample {
    pub timestamp: Instant,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub gyro: [f32; 3],
    pub accel: [f32; 3],
}

impl Default for InertialSample {
    fn default() -> Self {
        Self {
            timestamp: Instant::from_ticks(0),
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            gyro: [0.0; 3],
            accel: [0.0; 3],
        }
    }
}

impl InertialSample {
    /// Bias-corrected yaw rate (gyro z).
    pub fn yaw_rate(&self) -> f32 {
        self.gyro[2]
    }
}

/// Single-slot mailbox between the IMU producer thread and the flight loop.
///
/// `publish` overwrites whatever is pending: the consumer only ever wants the
/// newest sample, older ones are dropped.
pub struct SampleMailbox {
    latest: Signal<CriticalSectionRawMutex, InertialSample>,
}

impl SampleMailbox {
    pub const fn new() -> Self {
        Self {
            latest: Signal::new(),
        }
    }

    pub fn publish(&self, sample: InertialSample) {
        self.latest.signal(sample);
    }

    /// Non-blocking take of the pending sample, if one arrived since the last take.
    pub fn take_latest(&self) -> Option<InertialSample> {
        self.latest.try_take()
    }

    pub fn has_pending(&self) -> bool {
        self.latest.signaled()
    }

    /// Waits for the next published sample.
    pub async fn next(&self) -> InertialSample {
        self.latest.wait().await
    }
}

impl Default for SampleMailbox {
    fn default() -> Self {
        Self::new()
    }
}

// ── Motors ────────────────────────────────────────────────────────────────────

pub const MOTOR_COUNT: usize = 4;

/// Pulse widths for the four motors, in PCA9685 ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCommand {
    pub pulses: [u16; MOTOR_COUNT],
}

impl MotorCommand {
    pub const fn uniform(pulse: u16) -> Self {
        Self {
            pulses: [pulse; MOTOR_COUNT],
        }
    }

    pub const fn idle() -> Self {
        Self::uniform(PWM_MIN)
    }

    pub fn is_idle(&self) -> bool {
        self.pulses.iter().all(|&p| p == PWM_MIN)
    }
}
