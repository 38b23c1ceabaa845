use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use tracing_subscriber::EnvFilter;

use rust_fgraph::graph::{CaptureData, SensorId, SensorKind};
use rust_fgraph::io::{load_readings, Reading};
use rust_fgraph::motion::{MotionParams, MotionProcessor, Odom2dModel};
use rust_fgraph::system::{Estimator, EstimatorConfig, FixParams, FixProcessor, Registry};

/// Usage: `rust-fgraph <odometry.csv> [fixes.csv] [config.yaml]`
///
/// Odometry rows are `timestamp_ns, distance, dθ`; fix rows are
/// `timestamp_ns, x, y`. With a config, sensors named `wheels` and `gps`
/// are looked up in it instead of being installed with defaults.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rust_fgraph=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let odom_path = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "data/odom_2d.csv".to_string());
    let fix_path = args.get(2);
    let config_path = args.get(3);

    let mut estimator = match config_path {
        Some(path) => {
            let config = EstimatorConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config {}", path))?;
            let (estimator, skipped) = Estimator::from_config(&config, &Registry::with_defaults())?;
            for e in &skipped {
                println!("Skipped config entry: {}", e);
            }
            estimator
        }
        None => default_estimator()?,
    };

    let wheels = sensor(&estimator, "wheels")?;
    let odometry = load_readings(&odom_path, 2)?;
    println!("Loaded {} odometry readings from {}", odometry.len(), odom_path);

    let mut events: Vec<(SensorId, &Reading)> = odometry.iter().map(|r| (wheels, r)).collect();
    let fixes = match fix_path {
        Some(path) => load_readings(path, 2)?,
        None => Vec::new(),
    };
    if !fixes.is_empty() {
        let gps = sensor(&estimator, "gps")?;
        println!("Loaded {} position fixes", fixes.len());
        events.extend(fixes.iter().map(|r| (gps, r)));
    }
    // stable: odometry before a fix at the same timestamp
    events.sort_by_key(|(_, r)| r.timestamp_ns);

    for (sensor, reading) in events {
        let values = DVector::from_column_slice(&reading.values);
        let data = if sensor == wheels {
            CaptureData::Motion {
                data: values,
                covariance: DMatrix::zeros(0, 0),
            }
        } else {
            CaptureData::Fix {
                position: values,
                covariance: DMatrix::zeros(0, 0),
            }
        };
        estimator
            .process(sensor, reading.timestamp_s(), data)
            .with_context(|| format!("Failed to process reading at {} ns", reading.timestamp_ns))?;
    }

    let summary = estimator.solve()?;
    println!(
        "Solve: converged={} cost {:.6e} -> {:.6e} ({} evaluations, {:.1}ms)",
        summary.converged,
        summary.initial_cost,
        summary.final_cost,
        summary.iterations,
        summary.wall_time.as_secs_f64() * 1000.0
    );

    let problem = estimator.problem();
    for kf in problem.key_frames() {
        let ts = problem.frame(kf)?.timestamp;
        let x = problem.frame_state(kf)?;
        println!("{:>12.6}  [{:.4}, {:.4}, {:.4}]", ts, x[0], x[1], x[2]);
    }
    println!("Done! {} key frames, {} constraints", problem.key_frames().len(), problem.constraints().count());
    Ok(())
}

fn default_estimator() -> Result<Estimator> {
    let mut estimator = Estimator::default();
    let problem = estimator.problem_mut();
    let wheels = problem.install_sensor("wheels", SensorKind::Odom2D, &DVector::zeros(3), None)?;
    let gps = problem.install_sensor("gps", SensorKind::GpsFix, &DVector::zeros(3), None)?;
    estimator.add_processor(Box::new(MotionProcessor::new(
        "odometry",
        wheels,
        Odom2dModel::default(),
        MotionParams::default(),
    )));
    estimator.add_processor(Box::new(FixProcessor::new("gps", gps, FixParams::default())));
    Ok(estimator)
}

fn sensor(estimator: &Estimator, name: &str) -> Result<SensorId> {
    estimator
        .problem()
        .sensor_by_name(name)
        .with_context(|| format!("No sensor named '{}'", name))
}
