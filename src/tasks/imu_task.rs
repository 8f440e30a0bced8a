use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::drivers::imu::{ImuCalibration, ImuError, InertialSensor};
use crate::state::{InertialSample, SampleMailbox};

/// Pause after a failed read so a dead link does not spin the thread.
const IO_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Inertial producer: reads the sensor as fast as it delivers, removes the
/// gyro bias, and overwrites the mailbox slot with every sample.
pub struct ImuProducer<S: InertialSensor> {
    sensor: S,
    calibration: ImuCalibration,
    mailbox: Arc<SampleMailbox>,
    published: u64,
}

impl<S: InertialSensor> ImuProducer<S> {
    pub fn new(sensor: S, calibration: ImuCalibration, mailbox: Arc<SampleMailbox>) -> Self {
        Self {
            sensor,
            calibration,
            mailbox,
            published: 0,
        }
    }

    /// One read-correct-publish cycle.
    pub fn step(&mut self) -> Result<InertialSample, ImuError> {
        let sample = self.calibration.apply(self.sensor.read_sample()?);
        self.mailbox.publish(sample);
        self.published += 1;
        Ok(sample)
    }

    /// Runs until `keep_running` returns false. Read errors never end the loop.
    pub fn run_while(&mut self, mut keep_running: impl FnMut() -> bool) {
        info!("imu producer running");
        while keep_running() {
            match self.step() {
                Ok(_) => {}
                Err(ImuError::Malformed(line)) => debug!("dropping imu line: {line}"),
                Err(e) => {
                    warn!("imu read error: {e}");
                    thread::sleep(IO_ERROR_BACKOFF);
                }
            }
        }
        info!("imu producer stopped after {} samples", self.published);
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::MockInertialSensor;

    fn sample(roll: f32, gz: f32) -> InertialSample {
        InertialSample {
            roll,
            gyro: [0.0, 0.0, gz],
            ..InertialSample::default()
        }
    }

    #[test]
    fn step_publishes_bias_corrected_sample() {
        let mut sensor = MockInertialSensor::new();
        sensor.push_sample(sample(4.0, 1.5));
        let mailbox = Arc::new(SampleMailbox::new());
        let cal = ImuCalibration {
            gyro_bias: [0.0, 0.0, 0.5],
        };
        let mut producer = ImuProducer::new(sensor, cal, Arc::clone(&mailbox));

        let out = producer.step().unwrap();
        assert_eq!(out.yaw_rate(), 1.0);

        let got = mailbox.take_latest().unwrap();
        assert_eq!(got.roll, 4.0);
        assert_eq!(got.yaw_rate(), 1.0);
        assert_eq!(producer.published(), 1);
    }

    #[test]
    fn failed_read_publishes_nothing() {
        let mailbox = Arc::new(SampleMailbox::new());
        let mut producer = ImuProducer::new(
            MockInertialSensor::new(),
            ImuCalibration::default(),
            Arc::clone(&mailbox),
        );
        assert!(producer.step().is_err());
        assert!(!mailbox.has_pending());
    }

    #[test]
    fn run_skips_bad_reads_and_leaves_newest_sample() {
        let mut sensor = MockInertialSensor::new();
        sensor.push_sample(sample(1.0, 0.0));
        sensor.push_error(ImuError::Malformed("junk".to_owned()));
        sensor.push_sample(sample(2.0, 0.0));
        sensor.push_error(ImuError::Io(std::io::ErrorKind::TimedOut.into()));
        sensor.push_sample(sample(3.0, 0.0));

        let mailbox = Arc::new(SampleMailbox::new());
        let mut producer = ImuProducer::new(sensor, ImuCalibration::default(), Arc::clone(&mailbox));

        let mut cycles = 0;
        producer.run_while(|| {
            cycles += 1;
            cycles <= 5
        });

        assert_eq!(producer.published(), 3);
        assert_eq!(mailbox.take_latest().map(|s| s.roll), Some(3.0));
    }
}
