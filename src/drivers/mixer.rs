use crate::drivers::pca9685::{PWM_MAX, PWM_MIN};
use crate::state::{MotorCommand, MOTOR_COUNT};

/// Receiver calibration range.
pub const RC_MIN: u16 = 172;
pub const RC_MAX: u16 = 1811;
pub const RC_MID: u16 = 991;

/// Largest per-axis pulse offset a full stick deflection produces.
pub const MAX_ADJUSTMENT: i32 = 10;

/// Throttle stick to `0.0..=1.0`.
pub fn throttle_to_unit(value: u16) -> f32 {
    if value <= RC_MIN {
        return 0.0;
    }
    if value >= RC_MAX {
        return 1.0;
    }
    (value - RC_MIN) as f32 / (RC_MAX - RC_MIN) as f32
}

/// Control stick to `-1.0..=1.0` about `RC_MID`. Anything outside the
/// calibrated range reads as neutral.
pub fn stick_to_unit(value: u16) -> f32 {
    if !(RC_MIN..=RC_MAX).contains(&value) {
        return 0.0;
    }
    let v = value as f32 - RC_MID as f32;
    if value < RC_MID {
        v / (RC_MID - RC_MIN) as f32
    } else if value > RC_MID {
        v / (RC_MAX - RC_MID) as f32
    } else {
        0.0
    }
}

/// Base pulse for a normalised throttle, truncated toward `PWM_MIN`.
pub fn throttle_to_pulse(unit_throttle: f32) -> u16 {
    let t = unit_throttle.clamp(0.0, 1.0);
    (PWM_MIN as f32 + t * (PWM_MAX - PWM_MIN) as f32) as u16
}

pub fn stick_adjustment(unit_stick: f32) -> i32 {
    (unit_stick * MAX_ADJUSTMENT as f32) as i32
}

/// Per-axis pulse offsets fed to the mixer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisAdjustments {
    pub roll: i32,
    pub pitch: i32,
    pub yaw: i32,
}

/// X-frame signs per motor, as (roll, pitch, yaw).
///
/// Diagonal motors share the yaw sign; each axis pairs opposite signs.
const X_QUAD: [(i32, i32, i32); MOTOR_COUNT] = [
    (-1, 1, 1),
    (1, -1, -1),
    (1, 1, 1),
    (-1, -1, -1),
];

/// Distributes axis offsets over the four motors around `base`, each clamped
/// independently into the pulse range.
pub fn mix_x_quad(base: u16, adj: AxisAdjustments) -> MotorCommand {
    let mut pulses = [PWM_MIN; MOTOR_COUNT];
    for (pulse, &(r, p, y)) in pulses.iter_mut().zip(X_QUAD.iter()) {
        let offset = r * adj.roll + p * adj.pitch + y * adj.yaw;
        let value = (base as i32 + offset).clamp(PWM_MIN as i32, PWM_MAX as i32);
        *pulse = value as u16;
    }
    MotorCommand { pulses }
}
