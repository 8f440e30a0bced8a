use embassy_time::{block_for, Duration};
use log::{error, info, warn};

use crate::drivers::i2c::{BusError, I2cBus};
use crate::state::{MotorCommand, MOTOR_COUNT};

pub const PCA9685_ADDR: u16 = 0x40;

const MODE1: u8 = 0x00;
const PRESCALE: u8 = 0xFE;
const LED0_ON_L: u8 = 0x06;
const LED0_OFF_L: u8 = 0x08;
const REGS_PER_CHANNEL: u8 = 4;

const MODE1_SLEEP: u8 = 0x10;
/// RESTART | AI (auto-increment) | ALLCALL
const MODE1_RUN: u8 = 0xA1;
const OSC_HZ: f32 = 25_000_000.0;

/// ESC pulse range in 4096-tick counts at 50 Hz (~1.03 ms .. ~1.98 ms).
pub const PWM_MIN: u16 = 210;
pub const PWM_MAX: u16 = 405;
pub const SAFE_PULSE: u16 = PWM_MIN;
pub const DEFAULT_FREQUENCY_HZ: u16 = 50;

pub const WRITE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(1);
const OSC_STARTUP: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("register {register:#04x}: bus unusable after {attempts} attempts: {source}")]
    RetriesExhausted {
        register: u8,
        attempts: u32,
        #[source]
        source: BusError,
    },
    #[error("motor channel {0} does not exist")]
    InvalidChannel(usize),
}

pub fn prescale_for(frequency_hz: u16) -> u8 {
    let f = frequency_hz.max(24) as f32;
    (OSC_HZ / (4096.0 * f) - 1.0) as u8
}

/// Four-channel ESC output on a PCA9685.
///
/// Every channel holds `SAFE_PULSE` when `new` returns and again after drop.
pub struct Pca9685<B: I2cBus> {
    bus: B,
    pulses: [u16; MOTOR_COUNT],
}

impl<B: I2cBus> Pca9685<B> {
    pub fn new(bus: B, frequency_hz: u16) -> Result<Self, ActuatorError> {
        let mut pca = Self {
            bus,
            pulses: [SAFE_PULSE; MOTOR_COUNT],
        };
        pca.write_register(MODE1, 0x00)?;
        pca.set_pwm_frequency(frequency_hz)?;
        for channel in 0..MOTOR_COUNT {
            pca.set_motor_speed(channel, SAFE_PULSE)?;
        }
        info!("pca9685 ready at {frequency_hz} Hz, motors at safe pulse");
        Ok(pca)
    }

    /// Writes one channel. Out-of-range pulses are logged and dropped.
    pub fn set_motor_speed(&mut self, channel: usize, pulse: u16) -> Result<(), ActuatorError> {
        if channel >= MOTOR_COUNT {
            return Err(ActuatorError::InvalidChannel(channel));
        }
        if !(PWM_MIN..=PWM_MAX).contains(&pulse) {
            warn!("pulse {pulse} out of range ({PWM_MIN}-{PWM_MAX}), channel {channel} unchanged");
            return Ok(());
        }
        self.set_pwm(channel, 0, pulse)?;
        self.pulses[channel] = pulse;
        Ok(())
    }

    /// Writes all four channels in one auto-increment transaction, clamping
    /// each pulse into range.
    pub fn set_all_motor_speeds(&mut self, pulses: [u16; MOTOR_COUNT]) -> Result<(), ActuatorError> {
        let mut buf = [0u8; 1 + MOTOR_COUNT * REGS_PER_CHANNEL as usize];
        buf[0] = LED0_ON_L;

        let mut clamped = [SAFE_PULSE; MOTOR_COUNT];
        for (i, &pulse) in pulses.iter().enumerate() {
            let pwm = pulse.clamp(PWM_MIN, PWM_MAX);
            let [lo, hi] = pwm.to_le_bytes();
            let base = 1 + i * REGS_PER_CHANNEL as usize;
            buf[base] = 0;
            buf[base + 1] = 0;
            buf[base + 2] = lo;
            buf[base + 3] = hi;
            clamped[i] = pwm;
        }

        self.write_with_retry(LED0_ON_L, &buf)?;
        self.pulses = clamped;
        Ok(())
    }

    pub fn apply(&mut self, command: &MotorCommand) -> Result<(), ActuatorError> {
        self.set_all_motor_speeds(command.pulses)
    }

    /// Last pulse successfully written to each channel.
    pub fn pulses(&self) -> [u16; MOTOR_COUNT] {
        self.pulses
    }

    fn set_pwm(&mut self, channel: usize, on: u16, off: u16) -> Result<(), ActuatorError> {
        let offset = REGS_PER_CHANNEL * channel as u8;
        let [on_lo, on_hi] = on.to_le_bytes();
        let [off_lo, off_hi] = off.to_le_bytes();
        self.write_register(LED0_ON_L + offset, on_lo)?;
        self.write_register(LED0_ON_L + offset + 1, on_hi)?;
        self.write_register(LED0_OFF_L + offset, off_lo)?;
        self.write_register(LED0_OFF_L + offset + 1, off_hi)?;
        Ok(())
    }

    fn set_pwm_frequency(&mut self, frequency_hz: u16) -> Result<(), ActuatorError> {
        let prescale = prescale_for(frequency_hz);
        let old_mode = self.read_register(MODE1)?;
        let sleep_mode = (old_mode & 0x7F) | MODE1_SLEEP;
        self.write_register(MODE1, sleep_mode)?;
        self.write_register(PRESCALE, prescale)?;
        self.write_register(MODE1, old_mode)?;
        block_for(OSC_STARTUP);
        self.write_register(MODE1, old_mode | MODE1_RUN)?;
        Ok(())
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), ActuatorError> {
        self.write_with_retry(register, &[register, value])
    }

    fn write_with_retry(&mut self, register: u8, data: &[u8]) -> Result<(), ActuatorError> {
        let mut attempt = 1;
        loop {
            match self.bus.write(data) {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= WRITE_ATTEMPTS => {
                    error!("i2c write to {register:#04x} failed after {attempt} attempts");
                    return Err(ActuatorError::RetriesExhausted {
                        register,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!("i2c write to {register:#04x} failed ({e}), retrying");
                    attempt += 1;
                    block_for(RETRY_DELAY);
                }
            }
        }
    }

    fn read_register(&mut self, register: u8) -> Result<u8, ActuatorError> {
        let mut value = [0u8; 1];
        let mut attempt = 1;
        loop {
            match self.bus.write_read(&[register], &mut value) {
                Ok(()) => return Ok(value[0]),
                Err(source) if attempt >= WRITE_ATTEMPTS => {
                    error!("i2c read of {register:#04x} failed after {attempt} attempts");
                    return Err(ActuatorError::RetriesExhausted {
                        register,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!("i2c read of {register:#04x} failed ({e}), retrying");
                    attempt += 1;
                    block_for(RETRY_DELAY);
                }
            }
        }
    }
}

impl<B: I2cBus> Drop for Pca9685<B> {
    fn drop(&mut self) {
        let mut stopped = true;
        for channel in 0..MOTOR_COUNT {
            match self.set_pwm(channel, 0, SAFE_PULSE) {
                Ok(()) => self.pulses[channel] = SAFE_PULSE,
                Err(e) => {
                    stopped = false;
                    error!("failed to stop motor {channel}: {e}");
                }
            }
        }
        if stopped {
            info!("all motors stopped safely");
        }
    }
}
