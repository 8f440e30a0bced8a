use heapless::Deque;
use log::{debug, info, warn};

use crate::drivers::serial::{open_with_retry, ByteSource, ReadMode, RetryPolicy, SerialError, SerialPort};
use crate::state::{RcData, RcFlags, RC_CHANNEL_COUNT};

pub const SBUS_START_BYTE: u8 = 0x0F;
pub const SBUS_FRAME_SIZE: usize = 35;
const FLAGS_INDEX: usize = 33;
const CHECKSUM_INDEX: usize = SBUS_FRAME_SIZE - 1;
/// Ten frames of backlog; anything older is stale by the time we read it.
pub const SBUS_BUFFER_SIZE: usize = SBUS_FRAME_SIZE * 10;

pub struct SbusParser {
    buffer: Deque<u8, SBUS_BUFFER_SIZE>,
    frames_decoded: u32,
    bytes_discarded: u32,
}

impl SbusParser {
    pub fn new() -> Self {
        Self {
            buffer: Deque::new(),
            frames_decoded: 0,
            bytes_discarded: 0,
        }
    }

    /// Appends raw bytes, dropping the oldest buffered bytes once full.
    pub fn push_bytes(&mut self, data: &[u8]) {
        for &b in data {
            if self.buffer.is_full() {
                let _ = self.buffer.pop_front();
                self.bytes_discarded = self.bytes_discarded.wrapping_add(1);
            }
            let _ = self.buffer.push_back(b);
        }
    }

    /// Scans for the oldest complete frame and decodes it.
    ///
    /// Misaligned or corrupt windows cost one byte each, so a valid frame that
    /// starts mid-window is never lost. At most one frame is consumed per call.
    pub fn next_frame(&mut self) -> Option<RcData> {
        let mut frame = [0u8; SBUS_FRAME_SIZE];

        while self.buffer.len() >= SBUS_FRAME_SIZE {
            for (dst, src) in frame.iter_mut().zip(self.buffer.iter()) {
                *dst = *src;
            }

            if frame[0] != SBUS_START_BYTE {
                self.discard_one();
                continue;
            }

            if checksum(&frame[1..CHECKSUM_INDEX]) != frame[CHECKSUM_INDEX] {
                debug!("sbus: checksum mismatch, resyncing");
                self.discard_one();
                continue;
            }

            for _ in 0..SBUS_FRAME_SIZE {
                let _ = self.buffer.pop_front();
            }
            self.frames_decoded = self.frames_decoded.wrapping_add(1);
            return Some(parse_frame(&frame));
        }

        None
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_decoded(&self) -> u32 {
        self.frames_decoded
    }

    pub fn bytes_discarded(&self) -> u32 {
        self.bytes_discarded
    }

    fn discard_one(&mut self) {
        let _ = self.buffer.pop_front();
        self.bytes_discarded = self.bytes_discarded.wrapping_add(1);
    }
}

impl Default for SbusParser {
    fn default() -> Self {
        Self::new()
    }
}

/// XOR over the payload (everything between the start byte and the checksum).
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn parse_frame(frame: &[u8; SBUS_FRAME_SIZE]) -> RcData {
    let mut channels = [0u16; RC_CHANNEL_COUNT];
    for (i, ch) in channels.iter_mut().enumerate() {
        *ch = u16::from_be_bytes([frame[1 + i * 2], frame[2 + i * 2]]);
    }
    RcData {
        channels,
        flags: RcFlags::from_bits_truncate(frame[FLAGS_INDEX]),
    }
}

/// Builds a complete frame, checksum included.
pub fn build_frame(channels: &[u16; RC_CHANNEL_COUNT], flags: RcFlags) -> [u8; SBUS_FRAME_SIZE] {
    let mut frame = [0u8; SBUS_FRAME_SIZE];
    frame[0] = SBUS_START_BYTE;
    for (i, ch) in channels.iter().enumerate() {
        frame[1 + i * 2..3 + i * 2].copy_from_slice(&ch.to_be_bytes());
    }
    frame[FLAGS_INDEX] = flags.bits();
    frame[CHECKSUM_INDEX] = checksum(&frame[1..CHECKSUM_INDEX]);
    frame
}

/// Radio receiver: owns the serial source, the byte buffer and the latest
/// decoded channel state.
pub struct RcReceiver<S> {
    source: S,
    parser: SbusParser,
    data: RcData,
}

impl RcReceiver<SerialPort> {
    /// Opens the receiver line, waiting for it according to `policy`.
    pub fn initialize(port: &str, baud: u32, policy: RetryPolicy) -> Result<Self, SerialError> {
        let serial = open_with_retry("rc receiver", policy, || {
            SerialPort::open(port, baud, ReadMode::NonBlocking)
        })?;
        info!("rc receiver on {} @ {} baud", serial.path(), baud);
        Ok(Self::new(serial))
    }
}

impl<S: ByteSource> RcReceiver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            parser: SbusParser::new(),
            data: RcData::default(),
        }
    }

    /// Pulls everything the source has, then decodes at most one frame.
    pub fn update(&mut self) -> &RcData {
        let mut buf = [0u8; 64];
        loop {
            match self.source.read_available(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.parser.push_bytes(&buf[..n]),
                Err(e) => {
                    warn!("rc receiver read failed: {e}");
                    break;
                }
            }
        }

        if let Some(frame) = self.parser.next_frame() {
            self.data = frame;
        }
        &self.data
    }

    /// Latest value of 1-based channel `number`, `None` outside `1..=16`.
    pub fn read_channel(&mut self, number: usize) -> Option<u16> {
        if !(1..=RC_CHANNEL_COUNT).contains(&number) {
            warn!("invalid rc channel number: {number}");
            return None;
        }
        self.update().channel(number)
    }

    pub fn data(&self) -> &RcData {
        &self.data
    }

    pub fn parser(&self) -> &SbusParser {
        &self.parser
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
