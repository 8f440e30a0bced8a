//! Inertial sensor boundary.
//!
//! The attitude solution is computed on the sensor module itself; this side
//! only reads finished samples off a serial line and removes the gyro bias
//! measured at start-up.

use std::io::{self, BufRead, BufReader, Read};

use embassy_time::Instant;
use log::{debug, info};

use crate::drivers::serial::{ReadMode, SerialError, SerialPort};
use crate::state::InertialSample;

/// Longest line accepted before the reader gives up on it.
const MAX_LINE_LEN: usize = 160;
const LINE_MARKER: char = '*';

#[derive(Debug, thiserror::Error)]
pub enum ImuError {
    #[error("imu read failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed imu line: {0}")]
    Malformed(String),
    #[error("no valid samples during calibration")]
    CalibrationFailed,
    #[error(transparent)]
    Serial(#[from] SerialError),
}

/// A source of finished attitude samples. `read_sample` blocks until one
/// arrives.
pub trait InertialSensor {
    fn read_sample(&mut self) -> Result<InertialSample, ImuError>;
}

/// IMU module streaming `*roll,pitch,yaw,gx,gy,gz[,ax,ay,az]` lines.
pub struct SerialImu<R: Read = SerialPort> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl SerialImu<SerialPort> {
    pub fn open(port: &str, baud: u32) -> Result<Self, ImuError> {
        let serial = SerialPort::open(port, baud, ReadMode::Blocking)?;
        info!("imu connected on {port} at {baud} baud");
        Ok(Self::new(serial))
    }
}

impl<R: Read> SerialImu<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: Vec::with_capacity(MAX_LINE_LEN + 1),
        }
    }
}

impl<R: Read> SerialImu<R> {
    /// Drops input up to and including the next newline, or to end of stream.
    fn skip_rest_of_line(&mut self) -> io::Result<usize> {
        let mut skipped = 0;
        loop {
            let (used, done) = {
                let buf = self.reader.fill_buf()?;
                match buf.iter().position(|&b| b == b'\n') {
                    Some(i) => (i + 1, true),
                    None => (buf.len(), buf.is_empty()),
                }
            };
            self.reader.consume(used);
            skipped += used;
            if done {
                return Ok(skipped);
            }
        }
    }
}

impl<R: Read> InertialSensor for SerialImu<R> {
    fn read_sample(&mut self) -> Result<InertialSample, ImuError> {
        self.line.clear();
        // One byte over the limit is enough to tell an overlong line apart.
        let n = (&mut self.reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Err(ImuError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        if self.line.len() > MAX_LINE_LEN {
            let skipped = if self.line.ends_with(b"\n") {
                0
            } else {
                self.skip_rest_of_line()?
            };
            return Err(ImuError::Malformed(format!(
                "line over {MAX_LINE_LEN} bytes ({} dropped)",
                self.line.len() + skipped
            )));
        }
        let text = std::str::from_utf8(&self.line)
            .map_err(|_| ImuError::Malformed("non-ascii bytes".to_owned()))?;
        parse_line(text, Instant::now())
    }
}

/// Parses one protocol line. Angles in degrees, rates in deg/s, accel in g;
/// accel is zero when the short form is sent.
pub fn parse_line(line: &str, timestamp: Instant) -> Result<InertialSample, ImuError> {
    let body = line
        .trim()
        .strip_prefix(LINE_MARKER)
        .ok_or_else(|| ImuError::Malformed(line.trim().to_owned()))?;

    let mut values = [0.0f32; 9];
    let mut count = 0;
    for field in body.split(',') {
        if count == values.len() {
            return Err(ImuError::Malformed(format!("too many fields: {body}")));
        }
        values[count] = field
            .trim()
            .parse()
            .map_err(|_| ImuError::Malformed(format!("bad field {field:?}")))?;
        count += 1;
    }
    if count != 6 && count != 9 {
        return Err(ImuError::Malformed(format!("{count} fields")));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ImuError::Malformed(format!("non-finite value: {body}")));
    }

    Ok(InertialSample {
        timestamp,
        roll: values[0],
        pitch: values[1],
        yaw: values[2],
        gyro: [values[3], values[4], values[5]],
        accel: [values[6], values[7], values[8]],
    })
}

/// Gyro offsets measured while the frame is at rest.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuCalibration {
    pub gyro_bias: [f32; 3],
}

impl ImuCalibration {
    pub fn apply(&self, mut sample: InertialSample) -> InertialSample {
        for (rate, bias) in sample.gyro.iter_mut().zip(self.gyro_bias) {
            *rate -= bias;
        }
        sample
    }
}

/// Averages the gyro over `samples` reads. Malformed lines are skipped and do
/// not count toward the average; I/O errors abort.
pub fn calibrate<S: InertialSensor + ?Sized>(
    sensor: &mut S,
    samples: usize,
) -> Result<ImuCalibration, ImuError> {
    let mut sum = [0.0f32; 3];
    let mut valid = 0usize;
    for _ in 0..samples {
        match sensor.read_sample() {
            Ok(s) => {
                for (acc, rate) in sum.iter_mut().zip(s.gyro) {
                    *acc += rate;
                }
                valid += 1;
            }
            Err(ImuError::Malformed(line)) => debug!("calibration: skipping {line}"),
            Err(e) => return Err(e),
        }
    }
    if valid == 0 {
        return Err(ImuError::CalibrationFailed);
    }

    let gyro_bias = sum.map(|s| s / valid as f32);
    info!(
        "gyro bias from {valid} samples: [{:.3}, {:.3}, {:.3}]",
        gyro_bias[0], gyro_bias[1], gyro_bias[2]
    );
    Ok(ImuCalibration { gyro_bias })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock::MockInertialSensor;
    use std::io::Cursor;

    fn t0() -> Instant {
        Instant::from_ticks(0)
    }

    #[test]
    fn parses_short_form() {
        let s = parse_line("*1.5,-2.0,180.0,0.1,0.2,0.3\r\n", t0()).unwrap();
        assert_eq!((s.roll, s.pitch, s.yaw), (1.5, -2.0, 180.0));
        assert_eq!(s.gyro, [0.1, 0.2, 0.3]);
        assert_eq!(s.accel, [0.0; 3]);
    }

    #[test]
    fn parses_long_form() {
        let s = parse_line("*0,0,0,0,0,0,0.01,-0.02,1.0", t0()).unwrap();
        assert_eq!(s.accel, [0.01, -0.02, 1.0]);
    }

    #[test]
    fn rejects_bad_lines() {
        for line in [
            "",
            "1,2,3,4,5,6",
            "*1,2,3",
            "*1,2,3,4,5,6,7",
            "*1,2,3,4,5,6,7,8,9,10",
            "*1,2,x,4,5,6",
            "*1,2,NaN,4,5,6",
            "*1,2,3,4,5,",
        ] {
            assert!(
                matches!(parse_line(line, t0()), Err(ImuError::Malformed(_))),
                "{line:?} accepted"
            );
        }
    }

    #[test]
    fn serial_imu_reads_consecutive_lines() {
        let stream = b"*1,2,3,4,5,6\r\ngarbage\r\n*7,8,9,0,0,0\r\n".to_vec();
        let mut imu = SerialImu::new(Cursor::new(stream));

        assert_eq!(imu.read_sample().unwrap().roll, 1.0);
        assert!(matches!(imu.read_sample(), Err(ImuError::Malformed(_))));
        assert_eq!(imu.read_sample().unwrap().roll, 7.0);
        assert!(matches!(imu.read_sample(), Err(ImuError::Io(_))));
    }

    #[test]
    fn overlong_line_is_malformed() {
        let mut stream = vec![b'*'];
        stream.extend(std::iter::repeat(b'1').take(MAX_LINE_LEN + 10));
        stream.extend_from_slice(b"\n*0,0,0,0,0,0\n");
        let mut imu = SerialImu::new(Cursor::new(stream));

        assert!(matches!(imu.read_sample(), Err(ImuError::Malformed(_))));
        assert!(imu.read_sample().is_ok());
    }

    #[test]
    fn unterminated_flood_is_dropped_without_buffering_it() {
        let mut stream = vec![b'7'; 4 << 20];
        stream.extend_from_slice(b"\n*2,0,0,0,0,0\n");
        let mut imu = SerialImu::new(Cursor::new(stream));

        assert!(matches!(imu.read_sample(), Err(ImuError::Malformed(_))));
        assert!(imu.line.capacity() <= 2 * MAX_LINE_LEN);
        assert_eq!(imu.read_sample().unwrap().roll, 2.0);
    }

    #[test]
    fn calibration_averages_valid_samples() {
        let mut sensor = MockInertialSensor::new();
        for gz in [1.0, 3.0] {
            sensor.push_sample(InertialSample {
                gyro: [0.5, -1.0, gz],
                ..InertialSample::default()
            });
        }
        sensor.push_error(ImuError::Malformed("noise".to_owned()));

        let cal = calibrate(&mut sensor, 3).unwrap();
        assert_eq!(cal.gyro_bias, [0.5, -1.0, 2.0]);
        assert_eq!(sensor.reads(), 3);

        let corrected = cal.apply(InertialSample {
            gyro: [0.5, 0.0, 2.5],
            ..InertialSample::default()
        });
        assert_eq!(corrected.gyro, [0.0, 1.0, 0.5]);
    }

    #[test]
    fn calibration_without_valid_samples_fails() {
        let mut sensor = MockInertialSensor::new();
        sensor.push_error(ImuError::Malformed("a".to_owned()));
        sensor.push_error(ImuError::Malformed("b".to_owned()));
        assert!(matches!(
            calibrate(&mut sensor, 2),
            Err(ImuError::CalibrationFailed)
        ));
    }

    #[test]
    fn calibration_aborts_on_io_error() {
        let mut sensor = MockInertialSensor::new();
        assert!(matches!(calibrate(&mut sensor, 5), Err(ImuError::Io(_))));
        assert_eq!(sensor.reads(), 1);
    }
}
