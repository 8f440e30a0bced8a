use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use embassy_executor::Executor;
use log::{error, info};
use static_cell::StaticCell;

use quad_flight_core::board::{self, Board, Worker, WorkerExit};
use quad_flight_core::drivers::i2c::LinuxI2cBus;
use quad_flight_core::drivers::imu::{calibrate, SerialImu};
use quad_flight_core::drivers::pca9685::Pca9685;
use quad_flight_core::drivers::sbus::RcReceiver;
use quad_flight_core::drivers::serial::{open_with_retry, RetryPolicy};
use quad_flight_core::state::SampleMailbox;
use quad_flight_core::tasks::flight_loop::{flight_loop_task, loop_running, FlightLoop};
use quad_flight_core::tasks::imu_task::ImuProducer;
use quad_flight_core::{FlightConfig, FlightError};

// The control thread's executor lives for the rest of the process.
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), FlightError> {
    // 1. Configuration
    let config = FlightConfig::from_env()?;
    info!(
        "loop {} Hz ({:?}), rc {} @ {}, imu {} @ {}, i2c {}",
        config.loop_hz,
        config.loop_period(),
        config.rc_port,
        config.rc_baud,
        config.imu_port,
        config.imu_baud,
        config.i2c_bus
    );

    // 2. Memory lock
    let _board = Board::init()?;

    // 3. IMU producer -> mailbox -> flight loop
    let mailbox = Arc::new(SampleMailbox::new());
    let (exit_tx, exit_rx) = mpsc::channel();

    {
        let config = config.clone();
        let mailbox = Arc::clone(&mailbox);
        let exit_tx = exit_tx.clone();
        thread::Builder::new()
            .name("imu-producer".to_owned())
            .spawn(move || {
                let result = catch_panic("imu-producer", || imu_producer(&config, mailbox));
                if let Err(e) = &result {
                    error!("imu producer failed: {e}");
                    board::request_fault();
                }
                report(&exit_tx, Worker::Imu, result);
            })
            .map_err(|source| FlightError::Thread {
                name: "imu-producer",
                source,
            })?;
    }

    // 4. Control thread. Only returns on a start-up failure; every other way
    //    out ends the process from inside the loop task.
    thread::Builder::new()
        .name("flight-ctl".to_owned())
        .spawn(move || {
            let result = catch_panic("flight-ctl", || flight_control(config, mailbox));
            report(&exit_tx, Worker::FlightControl, result);
        })
        .map_err(|source| FlightError::Thread {
            name: "flight-ctl",
            source,
        })?;

    // The IMU thread may be parked in a blocking open or read; it is not
    // joined, returning ends the process.
    board::wait_for_fatal_exit(&exit_rx, loop_running)
}

fn catch_panic(
    name: &'static str,
    work: impl FnOnce() -> Result<(), FlightError>,
) -> Result<(), FlightError> {
    panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or(Err(FlightError::Panicked(name)))
}

fn report(exits: &Sender<WorkerExit>, worker: Worker, result: Result<(), FlightError>) {
    // The receiver only goes away with the main thread.
    let _ = exits.send(WorkerExit { worker, result });
}

fn imu_producer(config: &FlightConfig, mailbox: Arc<SampleMailbox>) -> Result<(), FlightError> {
    board::set_realtime_priority("imu-producer", config.sensor_priority);

    let mut imu = open_with_retry("imu", RetryPolicy::default(), || {
        SerialImu::open(&config.imu_port, config.imu_baud)
    })?;

    info!("calibrating gyro, keep the frame still");
    let calibration = calibrate(&mut imu, config.imu_calibration_samples)?;

    let mut producer = ImuProducer::new(imu, calibration, mailbox);
    producer.run_while(|| board::stop_status().is_none());
    Ok(())
}

fn flight_control(config: FlightConfig, mailbox: Arc<SampleMailbox>) -> Result<(), FlightError> {
    board::set_realtime_priority("flight-ctl", config.control_priority);

    let bus = LinuxI2cBus::open(&config.i2c_bus, config.pca9685_address)?;
    let actuator = Pca9685::new(bus, config.pwm_frequency_hz)?;
    let receiver = RcReceiver::initialize(&config.rc_port, config.rc_baud, config.rc_open)?;

    let flight = FlightLoop::new(receiver, actuator, mailbox, config.control);
    let loop_hz = config.loop_hz;

    // From here on Ctrl-C goes through the loop so the motors are stopped.
    board::install_shutdown_handler()?;

    let executor = EXECUTOR.init(Executor::new());
    executor.run(move |spawner| spawner.must_spawn(flight_loop_task(flight, loop_hz)))
}
