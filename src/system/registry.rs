//! Type-keyed factories for landmarks, sensors and processors.
//!
//! The registry is an ordinary value built at startup and passed to whatever
//! constructs typed entities from configuration or map files. There is no
//! global table.

use std::collections::HashMap;

use nalgebra::{DVector, Vector3};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{EstimationError, Result};
use crate::graph::{LandmarkId, SensorId, SensorKind};
use crate::io::map_yaml;
use crate::motion::{
    ImuModel, ImuNoise, MotionParams, MotionProcessor, Odom2dModel, Odom2dNoise, Odom3dModel,
    Odom3dNoise,
};
use crate::tracking::{HammingMatcher, PointListDetector, TrackerParams, TrackerProcessor};

use super::config::{ProcessorConfig, SensorConfig};
use super::fix::{FixParams, FixProcessor};
use super::problem::Problem;
use super::processor::Processor;

pub type LandmarkCreator = fn(&mut Problem, &serde_yaml::Value) -> Result<LandmarkId>;
pub type SensorCreator = fn(&mut Problem, &SensorConfig) -> Result<SensorId>;
pub type ProcessorCreator = fn(&ProcessorConfig, SensorId) -> Result<Box<dyn Processor>>;

#[derive(Default)]
pub struct Registry {
    landmarks: HashMap<String, LandmarkCreator>,
    sensors: HashMap<String, SensorCreator>,
    processors: HashMap<String, ProcessorCreator>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing every landmark, sensor and processor type of this crate.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register_landmark("POINT 2D", map_yaml::point_2d_from_yaml);
        r.register_landmark("POINT 3D", map_yaml::point_3d_from_yaml);
        r.register_landmark("AHP", map_yaml::ahp_from_yaml);

        r.register_sensor("ODOM 2D", install_odom_2d);
        r.register_sensor("ODOM 3D", install_odom_3d);
        r.register_sensor("IMU", install_imu);
        r.register_sensor("GPS FIX", install_gps_fix);
        r.register_sensor("CAMERA", install_camera);

        r.register_processor("ODOM 2D", odom_2d_processor);
        r.register_processor("ODOM 3D", odom_3d_processor);
        r.register_processor("IMU", imu_processor);
        r.register_processor("GPS FIX", fix_processor);
        r.register_processor("TRACKER IMAGE", image_tracker);
        r
    }

    /// Register a creator; a later registration under the same tag replaces the earlier one.
    pub fn register_landmark(&mut self, tag: impl Into<String>, creator: LandmarkCreator) {
        self.landmarks.insert(tag.into(), creator);
    }

    pub fn register_sensor(&mut self, tag: impl Into<String>, creator: SensorCreator) {
        self.sensors.insert(tag.into(), creator);
    }

    pub fn register_processor(&mut self, tag: impl Into<String>, creator: ProcessorCreator) {
        self.processors.insert(tag.into(), creator);
    }

    pub fn create_landmark(&self, problem: &mut Problem, tag: &str, value: &serde_yaml::Value) -> Result<LandmarkId> {
        let creator = self.landmarks.get(tag).ok_or_else(|| unknown("landmark", tag))?;
        creator(problem, value)
    }

    pub fn create_sensor(&self, problem: &mut Problem, config: &SensorConfig) -> Result<SensorId> {
        let creator = self
            .sensors
            .get(&config.kind)
            .ok_or_else(|| unknown("sensor", &config.kind))?;
        creator(problem, config)
    }

    pub fn create_processor(&self, config: &ProcessorConfig, sensor: SensorId) -> Result<Box<dyn Processor>> {
        let creator = self
            .processors
            .get(&config.kind)
            .ok_or_else(|| unknown("processor", &config.kind))?;
        creator(config, sensor)
    }
}

fn unknown(family: &'static str, tag: &str) -> EstimationError {
    EstimationError::UnknownType {
        family,
        tag: tag.to_string(),
    }
}

/// Deserialize processor parameters; a missing section means defaults.
fn params<T: DeserializeOwned + Default>(value: &serde_yaml::Value) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_value(value.clone())?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sensors
// ─────────────────────────────────────────────────────────────────────────────

fn install(problem: &mut Problem, config: &SensorConfig, kind: SensorKind) -> Result<SensorId> {
    let extrinsics = DVector::from_column_slice(&config.extrinsics);
    let intrinsics = config.intrinsics.as_deref().map(DVector::from_column_slice);
    problem.install_sensor(&config.name, kind, &extrinsics, intrinsics)
}

fn install_odom_2d(problem: &mut Problem, config: &SensorConfig) -> Result<SensorId> {
    install(problem, config, SensorKind::Odom2D)
}

fn install_odom_3d(problem: &mut Problem, config: &SensorConfig) -> Result<SensorId> {
    install(problem, config, SensorKind::Odom3D)
}

fn install_imu(problem: &mut Problem, config: &SensorConfig) -> Result<SensorId> {
    if let Some(biases) = &config.intrinsics {
        if biases.len() != 6 {
            return Err(EstimationError::dimension("IMU biases", 6, biases.len()));
        }
    }
    install(problem, config, SensorKind::Imu)
}

fn install_gps_fix(problem: &mut Problem, config: &SensorConfig) -> Result<SensorId> {
    install(problem, config, SensorKind::GpsFix)
}

fn install_camera(problem: &mut Problem, config: &SensorConfig) -> Result<SensorId> {
    let found = config.intrinsics.as_ref().map_or(0, Vec::len);
    if found != 4 {
        return Err(EstimationError::dimension("camera intrinsics [u0, v0, αu, αv]", 4, found));
    }
    install(problem, config, SensorKind::Camera)
}

// ─────────────────────────────────────────────────────────────────────────────
// Processors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Odom2dSection {
    motion: MotionParams,
    noise: Odom2dNoise,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Odom3dSection {
    motion: MotionParams,
    noise: Odom3dNoise,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImuSection {
    motion: MotionParams,
    noise: ImuNoise,
    gravity: Option<[f64; 3]>,
}

fn odom_2d_processor(config: &ProcessorConfig, sensor: SensorId) -> Result<Box<dyn Processor>> {
    let p: Odom2dSection = params(&config.params)?;
    Ok(Box::new(MotionProcessor::new(
        config.name.as_str(),
        sensor,
        Odom2dModel::new(p.noise),
        p.motion,
    )))
}

fn odom_3d_processor(config: &ProcessorConfig, sensor: SensorId) -> Result<Box<dyn Processor>> {
    let p: Odom3dSection = params(&config.params)?;
    Ok(Box::new(MotionProcessor::new(
        config.name.as_str(),
        sensor,
        Odom3dModel::new(p.noise),
        p.motion,
    )))
}

fn imu_processor(config: &ProcessorConfig, sensor: SensorId) -> Result<Box<dyn Processor>> {
    let p: ImuSection = params(&config.params)?;
    let mut model = ImuModel::new(p.noise);
    if let Some(g) = p.gravity {
        model = model.with_gravity(Vector3::from(g));
    }
    Ok(Box::new(MotionProcessor::new(config.name.as_str(), sensor, model, p.motion)))
}

fn fix_processor(config: &ProcessorConfig, sensor: SensorId) -> Result<Box<dyn Processor>> {
    let p: FixParams = params(&config.params)?;
    Ok(Box::new(FixProcessor::new(config.name.as_str(), sensor, p)))
}

fn image_tracker(config: &ProcessorConfig, sensor: SensorId) -> Result<Box<dyn Processor>> {
    let p: TrackerParams = params(&config.params)?;
    Ok(Box::new(TrackerProcessor::new(
        config.name.as_str(),
        sensor,
        PointListDetector,
        HammingMatcher,
        p,
    )))
}
