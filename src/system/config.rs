//! Estimator configuration: sensors and processors declared by type tag.
//!
//! ```yaml
//! sensors:
//!   - type: ODOM 2D
//!     name: wheels
//!     extrinsics: [0, 0, 0]
//! processors:
//!   - type: ODOM 2D
//!     name: odometry
//!     sensor: wheels
//!     params:
//!       motion: { max_time_span: 0.5 }
//! solver:
//!   max_iterations: 50
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use crate::optimizer::SolverOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub extrinsics: Vec<f64>,
    #[serde(default)]
    pub intrinsics: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    /// Name of the sensor whose captures the processor consumes.
    pub sensor: String,
    /// Processor-specific parameters; missing means defaults.
    #[serde(default)]
    pub params: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub sensors: Vec<SensorConfig>,
    pub processors: Vec<ProcessorConfig>,
    pub solver: SolverOptions,
}

impl EstimatorConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
sensors:
  - type: ODOM 2D
    name: wheels
    extrinsics: [0.0, 0.0, 0.0]
  - type: CAMERA
    name: front
    extrinsics: [0, 0, 0, 0, 0, 0, 1]
    intrinsics: [320, 240, 400, 400]
processors:
  - type: ODOM 2D
    name: odometry
    sensor: wheels
    params:
      motion:
        max_time_span: 0.5
solver:
  max_iterations: 20
"#;

    #[test]
    fn test_parse_config() {
        let cfg = EstimatorConfig::from_yaml_str(CONFIG).unwrap();

        assert_eq!(cfg.sensors.len(), 2);
        assert_eq!(cfg.sensors[0].kind, "ODOM 2D");
        assert_eq!(cfg.sensors[1].intrinsics.as_deref(), Some(&[320.0, 240.0, 400.0, 400.0][..]));
        assert_eq!(cfg.processors[0].sensor, "wheels");
        assert!(!cfg.processors[0].params.is_null());
        assert_eq!(cfg.solver.max_iterations, 20);
        assert_eq!(cfg.solver.ftol, SolverOptions::default().ftol);
    }

    #[test]
    fn test_missing_sections_default() {
        let cfg = EstimatorConfig::from_yaml_str("sensors: []").unwrap();
        assert!(cfg.processors.is_empty());
        assert_eq!(cfg.solver.max_iterations, 100);
    }
}
