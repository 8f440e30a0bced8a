//! Test doubles for the serial, bus and IMU seams.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::drivers::i2c::{BusError, I2cBus};
use crate::drivers::imu::{ImuError, InertialSensor};
use crate::drivers::serial::{ByteSource, SerialError};
use crate::state::InertialSample;

/// Byte source fed by the test; reads hand out at most `chunk` bytes at a time.
#[derive(Debug, Default)]
pub struct MockByteSource {
    pending: VecDeque<u8>,
    chunk: Option<usize>,
    fail_next: bool,
}

impl MockByteSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(chunk: usize) -> Self {
        Self {
            chunk: Some(chunk.max(1)),
            ..Self::default()
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    pub fn fail_next_read(&mut self) {
        self.fail_next = true;
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl ByteSource for MockByteSource {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        if self.fail_next {
            self.fail_next = false;
            return Err(SerialError::Read(io::Error::new(io::ErrorKind::Other, "mock read failure")));
        }
        let limit = self.chunk.unwrap_or(buf.len()).min(buf.len());
        let mut n = 0;
        while n < limit {
            match self.pending.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I2cTransaction {
    Write(Vec<u8>),
    WriteRead { write: Vec<u8>, read_len: usize },
}

#[derive(Debug)]
struct MockI2cState {
    transactions: Vec<I2cTransaction>,
    registers: [u8; 256],
    failures_remaining: u32,
    failed_attempts: u32,
}

impl Default for MockI2cState {
    fn default() -> Self {
        Self {
            transactions: Vec::new(),
            registers: [0u8; 256],
            failures_remaining: 0,
            failed_attempts: 0,
        }
    }
}

/// Register-file I2C bus. Clones share the same log, so a test can keep a
/// handle after moving the bus into a driver.
#[derive(Debug, Clone, Default)]
pub struct MockI2cBus {
    state: Rc<RefCell<MockI2cState>>,
}

impl MockI2cBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` transfers fail before the bus recovers.
    pub fn fail_next(&self, count: u32) {
        self.state.borrow_mut().failures_remaining = count;
    }

    pub fn transactions(&self) -> Vec<I2cTransaction> {
        self.state.borrow().transactions.clone()
    }

    pub fn clear_transactions(&self) {
        self.state.borrow_mut().transactions.clear();
    }

    pub fn failed_attempts(&self) -> u32 {
        self.state.borrow().failed_attempts
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.state.borrow().registers[reg as usize]
    }

    fn take_failure(state: &mut MockI2cState) -> bool {
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            state.failed_attempts += 1;
            true
        } else {
            false
        }
    }
}

impl I2cBus for MockI2cBus {
    fn write(&mut self, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.state.borrow_mut();
        if Self::take_failure(&mut state) {
            return Err(BusError::Transfer("mock nack".to_owned()));
        }
        state.transactions.push(I2cTransaction::Write(data.to_vec()));
        // Auto-increment from the first byte, like the PCA9685 with AI set.
        if let Some((&reg, values)) = data.split_first() {
            for (i, &v) in values.iter().enumerate() {
                let idx = (reg as usize + i) % 256;
                state.registers[idx] = v;
            }
        }
        Ok(())
    }

    fn write_read(&mut self, write: &[u8], read: &mut [u8]) -> Result<(), BusError> {
        let mut state = self.state.borrow_mut();
        if Self::take_failure(&mut state) {
            return Err(BusError::Transfer("mock nack".to_owned()));
        }
        state.transactions.push(I2cTransaction::WriteRead {
            write: write.to_vec(),
            read_len: read.len(),
        });
        let start = write.first().copied().unwrap_or(0) as usize;
        for (i, slot) in read.iter_mut().enumerate() {
            *slot = state.registers[(start + i) % 256];
        }
        Ok(())
    }
}

/// Scripted IMU: hands out queued results, then reports an I/O error.
#[derive(Debug, Default)]
pub struct MockInertialSensor {
    script: VecDeque<Result<InertialSample, ImuError>>,
    reads: usize,
}

impl MockInertialSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_sample(&mut self, sample: InertialSample) {
        self.script.push_back(Ok(sample));
    }

    pub fn push_error(&mut self, error: ImuError) {
        self.script.push_back(Err(error));
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl InertialSensor for MockInertialSensor {
    fn read_sample(&mut self) -> Result<InertialSample, ImuError> {
        self.reads += 1;
        self.script.pop_front().unwrap_or_else(|| {
            Err(ImuError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted")))
        })
    }
}
