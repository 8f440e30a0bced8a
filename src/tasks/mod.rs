pub mod flight_loop;
pub mod imu_task;
