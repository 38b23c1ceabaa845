//! CSV readers for recorded sensor streams.
//!
//! One reading per row: `timestamp_ns, v0, v1, ...`. Lines starting with `#`
//! are comments. Odometry rows carry `distance, dθ`; fix rows carry `x, y`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use csv::ReaderBuilder;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp_ns: u64,
    pub values: Vec<f64>,
}

impl Reading {
    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_ns as f64 * 1e-9
    }
}

/// Load every reading with exactly `width` values, sorted by timestamp.
///
/// Rows with a different number of values are skipped with a warning.
pub fn load_readings(csv_path: impl AsRef<Path>, width: usize) -> Result<Vec<Reading>> {
    let csv_path = csv_path.as_ref();
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for (line, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("Malformed row {} in {}", line + 1, csv_path.display()))?;
        if rec.len() != width + 1 {
            warn!(
                "[Io] {}: row {} has {} values, expected {}; skipped",
                csv_path.display(),
                line + 1,
                rec.len().saturating_sub(1),
                width
            );
            continue;
        }
        let timestamp_ns: u64 = rec[0]
            .parse()
            .with_context(|| format!("Bad timestamp '{}' in {}", &rec[0], csv_path.display()))?;
        let values = rec
            .iter()
            .skip(1)
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Bad value in row {} of {}", line + 1, csv_path.display()))?;
        entries.push(Reading { timestamp_ns, values });
    }
    if entries.is_empty() {
        bail!("No readings with {} values in {}", width, csv_path.display());
    }
    entries.sort_by_key(|r| r.timestamp_ns);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn temp_csv(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("rust_fgraph_{}_{}.csv", name, std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_sorted_readings() {
        let path = temp_csv(
            "odom",
            "# timestamp, distance, dtheta\n2000000000, 1.0, 0.0\n1000000000, 0.5, 0.1\n1500000000, 0.2\n",
        );
        let readings = load_readings(&path, 2).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].timestamp_ns, 1_000_000_000);
        assert_eq!(readings[0].values, vec![0.5, 0.1]);
        assert_relative_eq!(readings[1].timestamp_s(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_readings("/nonexistent/odom.csv", 2).unwrap_err();
        assert!(format!("{}", err).contains("Failed to open"));
    }

    #[test]
    fn test_bad_value_is_an_error() {
        let path = temp_csv("bad", "1000, 1.0, abc\n");
        let result = load_readings(&path, 2);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
