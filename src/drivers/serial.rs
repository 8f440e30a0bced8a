//! Raw serial line on top of a Linux tty.
//!
//! Both the radio receiver and the IMU talk over plain UARTs: 8 data bits, no
//! parity, one stop bit, no flow control and no line discipline.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

use log::warn;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to configure {path}: {source}")]
    Configure {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),
    #[error("serial read failed: {0}")]
    Read(#[from] io::Error),
}

/// Anything bytes can be drained from without blocking.
pub trait ByteSource {
    /// Copies pending bytes into `buf`. `Ok(0)` means nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SerialError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Reads return immediately with whatever is pending.
    NonBlocking,
    /// Reads wait for at least one byte.
    Blocking,
}

/// How long to keep retrying when a device is not there yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Forever { backoff: Duration },
    Attempts { count: u32, backoff: Duration },
}

impl RetryPolicy {
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

    fn backoff(&self) -> Duration {
        match *self {
            Self::Forever { backoff } | Self::Attempts { backoff, .. } => backoff,
        }
    }

    fn exhausted(&self, attempts: u32) -> bool {
        match *self {
            Self::Forever { .. } => false,
            Self::Attempts { count, .. } => attempts >= count.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Forever {
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

/// Runs `open` until it succeeds or `policy` gives up, sleeping between tries.
pub fn open_with_retry<T, E, F>(what: &str, policy: RetryPolicy, mut open: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;
    loop {
        match open() {
            Ok(device) => return Ok(device),
            Err(e) => {
                attempts += 1;
                if policy.exhausted(attempts) {
                    return Err(e);
                }
                warn!("{what}: {e}, retrying (attempt {attempts})");
                thread::sleep(policy.backoff());
            }
        }
    }
}

pub struct SerialPort {
    file: File,
    path: String,
}

impl SerialPort {
    pub fn open(path: &str, baud: u32, mode: ReadMode) -> Result<Self, SerialError> {
        let speed = baud_constant(baud).ok_or(SerialError::UnsupportedBaud(baud))?;

        let mut flags = libc::O_NOCTTY;
        if mode == ReadMode::NonBlocking {
            flags |= libc::O_NONBLOCK;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)
            .map_err(|source| SerialError::Open {
                path: path.to_owned(),
                source,
            })?;

        configure_raw(&file, speed, mode).map_err(|source| SerialError::Configure {
            path: path.to_owned(),
            source,
        })?;

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

}

/// Plain reads for line-oriented devices opened with `ReadMode::Blocking`.
impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ByteSource for SerialPort {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, SerialError> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(SerialError::Read(e)),
        }
    }
}

fn configure_raw(file: &File, speed: libc::speed_t, mode: ReadMode) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: termios is plain old data; tcgetattr fills it before use.
    let mut tty: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tty) } != 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        libc::cfsetispeed(&mut tty, speed);
        libc::cfsetospeed(&mut tty, speed);
    }

    tty.c_cflag |= libc::CLOCAL | libc::CREAD;
    tty.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE | libc::CRTSCTS);
    tty.c_cflag |= libc::CS8;
    tty.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
    tty.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::ICRNL
        | libc::INLCR
        | libc::PARMRK
        | libc::INPCK
        | libc::ISTRIP);
    tty.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);
    tty.c_oflag &= !libc::OPOST;

    match mode {
        ReadMode::NonBlocking => {
            tty.c_cc[libc::VMIN] = 0;
            tty.c_cc[libc::VTIME] = 0;
        }
        ReadMode::Blocking => {
            tty.c_cc[libc::VMIN] = 1;
            tty.c_cc[libc::VTIME] = 0;
        }
    }

    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tty) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::tcflush(fd, libc::TCIFLUSH) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        500_000 => libc::B500000,
        921_600 => libc::B921600,
        1_000_000 => libc::B1000000,
        _ => return None,
    };
    Some(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_retry_gives_up_with_last_error() {
        let mut calls = 0;
        let policy = RetryPolicy::Attempts {
            count: 3,
            backoff: Duration::ZERO,
        };
        let res: Result<(), String> = open_with_retry("test", policy, || {
            calls += 1;
            Err(format!("failure {calls}"))
        });
        assert_eq!(res, Err("failure 3".to_owned()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_returns_first_success() {
        let mut calls = 0;
        let res: Result<u32, String> = open_with_retry("test", RetryPolicy::Forever { backoff: Duration::ZERO }, || {
            calls += 1;
            if calls < 4 {
                Err("not yet".to_owned())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res, Ok(4));
    }

    #[test]
    fn unsupported_baud_is_rejected_before_open() {
        let res = SerialPort::open("/dev/does-not-exist", 123, ReadMode::NonBlocking);
        assert!(matches!(res, Err(SerialError::UnsupportedBaud(123))));
    }

    #[test]
    fn missing_device_reports_open_error() {
        let res = SerialPort::open("/dev/does-not-exist-fc", 115_200, ReadMode::NonBlocking);
        assert!(matches!(res, Err(SerialError::Open { .. })));
    }
}
