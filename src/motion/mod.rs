//! Motion integration: delta algebra, buffers and the motion processor.
//!
//! Raw proprioceptive readings (wheel odometry, IMU samples) are converted
//! into deltas by a [`MotionModel`], composed into a [`MotionBuffer`] and
//! frozen into constraints whenever a key frame cuts the buffer.

pub mod buffer;
pub mod imu;
pub mod model;
pub mod odom_2d;
pub mod odom_3d;
pub mod processor;

pub use buffer::{MotionBuffer, MotionSample, TIME_TOLERANCE};
pub use imu::{ImuBias, ImuModel, ImuNoise, GRAVITY};
pub use model::{propagate_covariance, MotionModel};
pub use odom_2d::{Odom2dModel, Odom2dNoise};
pub use odom_3d::{Odom3dModel, Odom3dNoise};
pub use processor::{MotionParams, MotionProcessor, MotionState};
