//! Host bring-up: memory locking, real-time scheduling, the stop latch and
//! worker supervision.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;

use log::{info, warn};

use crate::error::FlightError;

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("failed to lock process memory: {0}")]
    MemoryLock(#[source] io::Error),
    #[error("failed to install handler for signal {signal}: {source}")]
    Signal {
        signal: libc::c_int,
        #[source]
        source: io::Error,
    },
}

/// Why the process should stop: an operator request or a fault.
///
/// A fault wins over a shutdown, so the exit status stays non-zero when both
/// are set.
pub struct StopLatch {
    shutdown: AtomicBool,
    fault: AtomicBool,
}

impl StopLatch {
    pub const fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            fault: AtomicBool::new(false),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn request_fault(&self) {
        self.fault.store(true, Ordering::SeqCst);
    }

    /// Exit status to stop with, `None` while nothing is latched.
    pub fn exit_status(&self) -> Option<i32> {
        if self.fault.load(Ordering::SeqCst) {
            Some(1)
        } else if self.shutdown.load(Ordering::SeqCst) {
            Some(0)
        } else {
            None
        }
    }
}

impl Default for StopLatch {
    fn default() -> Self {
        Self::new()
    }
}

static STOP: StopLatch = StopLatch::new();

pub struct Board {
    _private: (),
}

impl Board {
    /// Locks every current and future page so the control path never
    /// page-faults.
    pub fn init() -> Result<Self, BoardError> {
        // SAFETY: mlockall has no memory-safety preconditions.
        if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
            return Err(BoardError::MemoryLock(io::Error::last_os_error()));
        }
        info!("board ready: memory locked");
        Ok(Self { _private: () })
    }
}

/// Puts the calling thread on SCHED_FIFO at `priority`. Failure only costs
/// timing determinism, so it is reported and otherwise ignored.
pub fn set_realtime_priority(thread_name: &str, priority: i32) -> bool {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pthread_self is always valid for the calling thread.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!(
            "{thread_name}: SCHED_FIFO priority {priority} refused: {}",
            io::Error::from_raw_os_error(rc)
        );
        return false;
    }
    info!("{thread_name}: SCHED_FIFO priority {priority}");
    true
}

extern "C" fn on_shutdown_signal(_signal: libc::c_int) {
    STOP.request_shutdown();
}

/// Turns SIGINT/SIGTERM into a latch instead of immediate termination. Only
/// install once something polls `stop_status`.
pub fn install_shutdown_handler() -> Result<(), BoardError> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        let handler = on_shutdown_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
            return Err(BoardError::Signal {
                signal,
                source: io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

/// Process-wide stop status: `Some(1)` after a fault, `Some(0)` after a
/// shutdown request.
pub fn stop_status() -> Option<i32> {
    STOP.exit_status()
}

/// Stops the flight loop with a failure status.
pub fn request_fault() {
    STOP.request_fault();
}

// ── Worker supervision ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    Imu,
    FlightControl,
}

/// Final word from a worker thread.
#[derive(Debug)]
pub struct WorkerExit {
    pub worker: Worker,
    pub result: Result<(), FlightError>,
}

/// Blocks until a worker reports an error the main thread has to act on.
///
/// Flight-control errors are always returned at once: they only happen before
/// the loop starts, and nothing else needs to wind down. An IMU error while
/// the loop runs is left to the loop, which sees the fault latch and stops
/// the motors itself. Returns `Ok` once every worker has gone quietly.
pub fn wait_for_fatal_exit(
    exits: &Receiver<WorkerExit>,
    loop_running: impl Fn() -> bool,
) -> Result<(), FlightError> {
    while let Ok(exit) = exits.recv() {
        match exit {
            WorkerExit { result: Ok(()), .. } => {}
            WorkerExit {
                worker: Worker::Imu,
                result: Err(e),
            } if loop_running() => warn!("imu producer failed under a running loop: {e}"),
            WorkerExit { result: Err(e), .. } => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::drivers::imu::ImuError;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn signal_sets_the_shutdown_latch() {
        install_shutdown_handler().unwrap();
        // SAFETY: raise delivers to this process; the handler only stores an atomic.
        assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);
        assert!(stop_status().is_some());
    }

    #[test]
    fn fault_exits_non_zero_even_after_shutdown() {
        let latch = StopLatch::new();
        assert_eq!(latch.exit_status(), None);

        latch.request_shutdown();
        assert_eq!(latch.exit_status(), Some(0));

        latch.request_fault();
        assert_eq!(latch.exit_status(), Some(1));
    }

    #[test]
    fn fault_alone_exits_non_zero() {
        let latch = StopLatch::new();
        latch.request_fault();
        assert_eq!(latch.exit_status(), Some(1));
    }

    #[test]
    fn flight_control_error_returns_while_imu_is_still_busy() {
        let (tx, rx) = mpsc::channel();
        // Stands in for an IMU thread stuck opening its port: never sends.
        let _imu_tx = tx.clone();
        tx.send(WorkerExit {
            worker: Worker::FlightControl,
            result: Err(ConfigError::ZeroLoopRate.into()),
        })
        .unwrap();

        let err = wait_for_fatal_exit(&rx, || false).unwrap_err();
        assert!(matches!(err, FlightError::Config(ConfigError::ZeroLoopRate)));
    }

    #[test]
    fn imu_error_before_the_loop_starts_is_fatal() {
        let (tx, rx) = mpsc::channel();
        tx.send(WorkerExit {
            worker: Worker::Imu,
            result: Err(ImuError::CalibrationFailed.into()),
        })
        .unwrap();

        let err = wait_for_fatal_exit(&rx, || false).unwrap_err();
        assert!(matches!(err, FlightError::Imu(ImuError::CalibrationFailed)));
    }

    #[test]
    fn imu_error_under_a_running_loop_is_left_to_the_loop() {
        let (tx, rx) = mpsc::channel();
        let imu_tx = tx.clone();
        let imu = thread::spawn(move || {
            imu_tx
                .send(WorkerExit {
                    worker: Worker::Imu,
                    result: Err(ImuError::CalibrationFailed.into()),
                })
                .unwrap();
        });
        imu.join().unwrap();
        drop(tx);

        assert!(wait_for_fatal_exit(&rx, || true).is_ok());
    }
}
