//! File I/O: map persistence and recorded sensor streams.

pub mod map_yaml;
pub mod odometry_csv;

pub use map_yaml::{load_map_file, load_map_str, save_map_file, save_map_str, MapDescription};
pub use odometry_csv::{load_readings, Reading};
