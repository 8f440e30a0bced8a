use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embassy_executor::task;
use embassy_time::{Duration, Instant, Ticker};
use log::{error, info};

use crate::board;
use crate::config::ControlTuning;
use crate::drivers::i2c::{I2cBus, LinuxI2cBus};
use crate::drivers::mixer::{
    mix_x_quad, stick_adjustment, stick_to_unit, throttle_to_pulse, throttle_to_unit,
    AxisAdjustments,
};
use crate::drivers::pca9685::{ActuatorError, Pca9685, PWM_MIN};
use crate::drivers::pid::PidController;
use crate::drivers::sbus::RcReceiver;
use crate::drivers::serial::{ByteSource, SerialPort};
use crate::state::{InertialSample, MotorCommand, RcData, RcFlags, SampleMailbox};

// ── Channel assignment (1-based, AETR) ────────────────────────────────────────

pub const AILERON_CHANNEL: usize = 1;
pub const ELEVATOR_CHANNEL: usize = 2;
pub const THROTTLE_CHANNEL: usize = 3;
pub const RUDDER_CHANNEL: usize = 4;

/// Level flight.
const ATTITUDE_SETPOINT: f32 = 0.0;

/// One control cycle's worth of state: radio in, attitude in, motors out.
pub struct FlightLoop<S: ByteSource, B: I2cBus> {
    receiver: RcReceiver<S>,
    actuator: Pca9685<B>,
    mailbox: Arc<SampleMailbox>,
    attitude: InertialSample,
    roll_pid: PidController,
    pitch_pid: PidController,
    yaw_pid: PidController,
    tuning: ControlTuning,
}

pub type HardwareFlightLoop = FlightLoop<SerialPort, LinuxI2cBus>;

impl<S: ByteSource, B: I2cBus> FlightLoop<S, B> {
    pub fn new(
        receiver: RcReceiver<S>,
        actuator: Pca9685<B>,
        mailbox: Arc<SampleMailbox>,
        tuning: ControlTuning,
    ) -> Self {
        Self {
            receiver,
            actuator,
            mailbox,
            attitude: InertialSample::default(),
            roll_pid: PidController::new(tuning.roll),
            pitch_pid: PidController::new(tuning.pitch),
            yaw_pid: PidController::new(tuning.yaw),
            tuning,
        }
    }

    /// Runs one cycle and returns what was sent to the motors.
    ///
    /// Only actuator errors escape; they mean the bus is gone and the caller
    /// must stop.
    pub fn step(&mut self, dt: f32) -> Result<MotorCommand, ActuatorError> {
        if let Some(sample) = self.mailbox.take_latest() {
            self.attitude = sample;
        }
        let rc = *self.receiver.update();
        let command = self.compute(&rc, dt);
        self.actuator.apply(&command)?;
        Ok(command)
    }

    fn compute(&mut self, rc: &RcData, dt: f32) -> MotorCommand {
        let channel = |n| rc.channel(n).unwrap_or(0);
        let throttle = throttle_to_unit(channel(THROTTLE_CHANNEL));
        let aileron = stick_to_unit(channel(AILERON_CHANNEL));
        let elevator = stick_to_unit(channel(ELEVATOR_CHANNEL));
        let rudder = stick_to_unit(channel(RUDDER_CHANNEL));

        let roll_adj = deadband_pid(
            &mut self.roll_pid,
            self.attitude.roll,
            self.tuning.roll_tolerance,
            dt,
        );
        let pitch_adj = deadband_pid(
            &mut self.pitch_pid,
            self.attitude.pitch,
            self.tuning.pitch_tolerance,
            dt,
        );
        let yaw_adj = if self.tuning.yaw_rate_loop {
            let target = rudder * self.tuning.max_yaw_rate;
            self.yaw_pid.calculate(target, self.attitude.yaw_rate(), dt) as i32
        } else {
            stick_adjustment(rudder)
        };

        let base = throttle_to_pulse(throttle);
        if base <= PWM_MIN || rc.flags.contains(RcFlags::FAILSAFE) {
            return MotorCommand::idle();
        }

        mix_x_quad(
            base,
            AxisAdjustments {
                roll: stick_adjustment(aileron) + roll_adj,
                pitch: stick_adjustment(elevator) + pitch_adj,
                yaw: yaw_adj,
            },
        )
    }

    /// Attitude used by the last cycle.
    pub fn attitude(&self) -> &InertialSample {
        &self.attitude
    }

    pub fn receiver_mut(&mut self) -> &mut RcReceiver<S> {
        &mut self.receiver
    }

    pub fn actuator(&self) -> &Pca9685<B> {
        &self.actuator
    }

    pub fn roll_pid(&self) -> &PidController {
        &self.roll_pid
    }

    pub fn pitch_pid(&self) -> &PidController {
        &self.pitch_pid
    }
}

/// PID toward level, skipped while the error sits inside `tolerance`.
fn deadband_pid(pid: &mut PidController, angle: f32, tolerance: f32, dt: f32) -> i32 {
    if (ATTITUDE_SETPOINT - angle).abs() > tolerance {
        pid.calculate(ATTITUDE_SETPOINT, angle, dt) as i32
    } else {
        0
    }
}

// ── Task ─────────────────────────────────────────────────────────────────────

static RUNNING: AtomicBool = AtomicBool::new(false);

/// Whether the control task has taken over the motors.
pub fn loop_running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

/// Fixed-rate control task. Never returns: a bus fault, a latched fault or a
/// shutdown request drops the loop (motors to safe pulse) and ends the
/// process, with status 1 for faults.
#[task]
pub async fn flight_loop_task(mut flight: HardwareFlightLoop, loop_hz: u64) {
    let period = 1.0 / loop_hz as f32;
    let (min_dt, max_dt) = (period * 0.25, period * 4.0);

    let mut ticker = Ticker::every(Duration::from_hz(loop_hz));
    let mut last = Instant::now();
    RUNNING.store(true, Ordering::SeqCst);
    info!("flight loop running at {loop_hz} Hz");

    let status = loop {
        ticker.next().await;

        if let Some(status) = board::stop_status() {
            if status == 0 {
                info!("shutdown requested");
            } else {
                error!("fault latched, stopping");
            }
            break status;
        }

        let now = Instant::now();
        let dt = ((now - last).as_micros() as f32 / 1_000_000.0).clamp(min_dt, max_dt);
        last = now;

        if let Err(e) = flight.step(dt) {
            error!("actuator fault, stopping: {e}");
            break 1;
        }
    };

    drop(flight);
    std::process::exit(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mixer::{RC_MAX, RC_MID, RC_MIN};
    use crate::drivers::mock::{MockByteSource, MockI2cBus};
    use crate::drivers::pca9685::WRITE_ATTEMPTS;
    use crate::drivers::sbus::build_frame;
    use crate::state::RC_CHANNEL_COUNT;

    const DT: f32 = 0.002;

    type TestLoop = FlightLoop<MockByteSource, MockI2cBus>;

    fn rig_with(tuning: ControlTuning) -> (TestLoop, MockI2cBus, Arc<SampleMailbox>) {
        let bus = MockI2cBus::new();
        let actuator = Pca9685::new(bus.clone(), 50).unwrap();
        let mailbox = Arc::new(SampleMailbox::new());
        let flight = FlightLoop::new(
            RcReceiver::new(MockByteSource::new()),
            actuator,
            Arc::clone(&mailbox),
            tuning,
        );
        (flight, bus, mailbox)
    }

    fn rig() -> (TestLoop, MockI2cBus, Arc<SampleMailbox>) {
        rig_with(ControlTuning::default())
    }

    struct Sticks {
        throttle: u16,
        aileron: u16,
        elevator: u16,
        rudder: u16,
        flags: RcFlags,
    }

    impl Default for Sticks {
        fn default() -> Self {
            Self {
                throttle: RC_MID,
                aileron: RC_MID,
                elevator: RC_MID,
                rudder: RC_MID,
                flags: RcFlags::empty(),
            }
        }
    }

    fn send(flight: &mut TestLoop, sticks: Sticks) {
        let mut channels = [RC_MID; RC_CHANNEL_COUNT];
        channels[AILERON_CHANNEL - 1] = sticks.aileron;
        channels[ELEVATOR_CHANNEL - 1] = sticks.elevator;
        channels[THROTTLE_CHANNEL - 1] = sticks.throttle;
        channels[RUDDER_CHANNEL - 1] = sticks.rudder;
        flight
            .receiver_mut()
            .source_mut()
            .feed(&build_frame(&channels, sticks.flags));
    }

    fn attitude(roll: f32, pitch: f32) -> InertialSample {
        InertialSample {
            roll,
            pitch,
            ..InertialSample::default()
        }
    }

    fn mid_base() -> u16 {
        throttle_to_pulse(throttle_to_unit(RC_MID))
    }

    #[test]
    fn no_radio_yet_means_idle() {
        let (mut flight, _bus, _mb) = rig();
        assert_eq!(flight.step(DT).unwrap(), MotorCommand::idle());
    }

    #[test]
    fn minimum_throttle_idles_regardless_of_attitude() {
        let (mut flight, bus, mailbox) = rig();
        mailbox.publish(attitude(30.0, -25.0));
        send(
            &mut flight,
            Sticks {
                throttle: RC_MIN,
                aileron: RC_MAX,
                ..Sticks::default()
            },
        );
        bus.clear_transactions();

        let cmd = flight.step(DT).unwrap();
        assert!(cmd.is_idle());
        assert_eq!(flight.actuator().pulses(), [PWM_MIN; 4]);
        // Still dispatched, as one batched write.
        assert_eq!(bus.transactions().len(), 1);
    }

    #[test]
    fn level_and_centred_gives_equal_base_pulses() {
        let (mut flight, _bus, mailbox) = rig();
        mailbox.publish(attitude(0.5, -0.5));
        send(&mut flight, Sticks::default());

        let base = mid_base();
        assert!(base > PWM_MIN);
        assert_eq!(flight.step(DT).unwrap(), MotorCommand::uniform(base));
        assert_eq!(flight.actuator().pulses(), [base; 4]);
    }

    #[test]
    fn failsafe_flag_forces_idle() {
        let (mut flight, _bus, _mb) = rig();
        send(
            &mut flight,
            Sticks {
                throttle: RC_MAX,
                flags: RcFlags::FAILSAFE,
                ..Sticks::default()
            },
        );
        assert!(flight.step(DT).unwrap().is_idle());
    }

    #[test]
    fn sticks_mix_with_x_frame_signs() {
        let (mut flight, _bus, _mb) = rig();
        let b = mid_base();

        send(
            &mut flight,
            Sticks {
                aileron: RC_MAX,
                ..Sticks::default()
            },
        );
        assert_eq!(flight.step(DT).unwrap().pulses, [b - 10, b + 10, b + 10, b - 10]);

        send(
            &mut flight,
            Sticks {
                elevator: RC_MAX,
                ..Sticks::default()
            },
        );
        assert_eq!(flight.step(DT).unwrap().pulses, [b + 10, b - 10, b + 10, b - 10]);

        send(
            &mut flight,
            Sticks {
                rudder: RC_MIN,
                ..Sticks::default()
            },
        );
        assert_eq!(flight.step(DT).unwrap().pulses, [b - 10, b + 10, b - 10, b + 10]);
    }

    #[test]
    fn roll_error_outside_deadband_is_corrected() {
        let (mut flight, _bus, mailbox) = rig();
        send(&mut flight, Sticks::default());
        // Right wing down 5 degrees: large negative output, clamped to -10.
        mailbox.publish(attitude(5.0, 0.0));

        let b = mid_base();
        let cmd = flight.step(DT).unwrap();
        assert_eq!(cmd.pulses, [b + 10, b - 10, b - 10, b + 10]);
        assert_eq!(flight.roll_pid().previous_error(), -5.0);
    }

    #[test]
    fn small_error_leaves_pid_untouched() {
        let (mut flight, _bus, mailbox) = rig();
        send(&mut flight, Sticks::default());
        mailbox.publish(attitude(0.9, -1.0));

        assert_eq!(flight.step(DT).unwrap(), MotorCommand::uniform(mid_base()));
        assert_eq!(flight.roll_pid().integral(), 0.0);
        assert_eq!(flight.pitch_pid().previous_error(), 0.0);
    }

    #[test]
    fn last_sample_is_reused_until_a_new_one_arrives() {
        let (mut flight, _bus, mailbox) = rig();
        send(&mut flight, Sticks::default());
        mailbox.publish(attitude(0.0, 5.0));
        let first = flight.step(DT).unwrap();

        let second = flight.step(DT).unwrap();
        assert_eq!(flight.attitude().pitch, 5.0);
        assert!(!second.is_idle());
        assert_ne!(second, MotorCommand::uniform(mid_base()));
        assert_eq!(first.pulses[0] > mid_base(), second.pulses[0] > mid_base());

        mailbox.publish(attitude(0.0, 0.0));
        assert_eq!(flight.step(DT).unwrap(), MotorCommand::uniform(mid_base()));
    }

    #[test]
    fn radio_state_persists_between_frames() {
        let (mut flight, _bus, _mb) = rig();
        send(
            &mut flight,
            Sticks {
                aileron: RC_MAX,
                ..Sticks::default()
            },
        );
        let first = flight.step(DT).unwrap();
        let second = flight.step(DT).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn yaw_rate_loop_uses_corrected_rate() {
        let tuning = ControlTuning {
            yaw_rate_loop: true,
            ..ControlTuning::default()
        };
        let (mut flight, _bus, mailbox) = rig_with(tuning);
        send(&mut flight, Sticks::default());
        mailbox.publish(InertialSample {
            gyro: [0.0, 0.0, 50.0],
            ..InertialSample::default()
        });

        // Yawing at 50 deg/s with the stick centred: full opposing yaw.
        let b = mid_base();
        assert_eq!(flight.step(DT).unwrap().pulses, [b - 10, b + 10, b - 10, b + 10]);
    }

    #[test]
    fn dead_bus_surfaces_as_actuator_error() {
        let (mut flight, bus, _mb) = rig();
        send(&mut flight, Sticks::default());
        bus.fail_next(WRITE_ATTEMPTS);

        assert!(matches!(
            flight.step(DT),
            Err(ActuatorError::RetriesExhausted { .. })
        ));
    }
}
