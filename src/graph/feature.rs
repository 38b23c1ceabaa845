//! Features: measurements extracted from a Capture.

use nalgebra::{Cholesky, DMatrix, DVector, Vector2};

use crate::error::{EstimationError, Result};

use super::types::{FeatureId, LandmarkId};

/// Binary descriptor compared by Hamming distance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Descriptor(pub Vec<u8>);

impl Descriptor {
    /// Descriptor length in bits.
    pub fn size_bits(&self) -> usize {
        self.0.len() * 8
    }

    /// Number of differing bits; bytes past the shorter descriptor count as fully different.
    pub fn hamming(&self, other: &Descriptor) -> usize {
        let common: usize = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones() as usize)
            .sum();
        let extra = self.0.len().abs_diff(other.0.len()) * 8;
        common + extra
    }
}

/// A detected image point with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    pub pixel: Vector2<f64>,
    pub descriptor: Descriptor,
}

/// What a feature measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// Absolute position fix.
    Fix,
    /// Integrated motion delta between two key frames.
    Motion,
    /// Pixel observation of a point.
    PointImage,
}

/// Data association of a feature to a landmark.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkMatch {
    pub landmark: LandmarkId,
    pub normalized_score: f64,
}

/// A measurement with its uncertainty.
#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    pub kind: FeatureKind,
    measurement: DVector<f64>,
    covariance: DMatrix<f64>,
    sqrt_information: DMatrix<f64>,
    /// Identity of the physical point this feature follows across captures.
    pub track_id: u64,
    pub descriptor: Option<Descriptor>,
    pub landmark_match: Option<LandmarkMatch>,
}

impl Feature {
    /// Build a feature, validating the covariance eagerly.
    pub fn new(kind: FeatureKind, measurement: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        let sqrt_information = sqrt_information(&covariance)?;
        let id = FeatureId::next();
        Ok(Self {
            id,
            kind,
            measurement,
            covariance,
            sqrt_information,
            track_id: id.0 .0,
            descriptor: None,
            landmark_match: None,
        })
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn with_track_id(mut self, track_id: u64) -> Self {
        self.track_id = track_id;
        self
    }

    pub fn measurement(&self) -> &DVector<f64> {
        &self.measurement
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Lower-triangular S with SᵀS = Σ⁻¹.
    pub fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_information
    }

    /// Pixel of a point-image feature.
    pub fn pixel(&self) -> Option<Vector2<f64>> {
        (self.kind == FeatureKind::PointImage && self.measurement.len() == 2)
            .then(|| Vector2::new(self.measurement[0], self.measurement[1]))
    }
}

/// Square root of the information matrix of `cov`.
///
/// With Σ = L Lᵀ (Cholesky), S = L⁻¹ satisfies SᵀS = Σ⁻¹. The covariance must
/// be square, symmetric and positive-definite. Its size is checked against the
/// residual size when a constraint is built on the feature.
pub fn sqrt_information(cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let dim = cov.nrows();
    if cov.ncols() != dim {
        return Err(EstimationError::dimension("measurement covariance columns", dim, cov.ncols()));
    }
    let scale = cov.amax().max(1.0);
    if (cov - cov.transpose()).amax() > 1e-9 * scale {
        return Err(EstimationError::InvalidCovariance("matrix is not symmetric".into()));
    }
    let chol = Cholesky::new(cov.clone())
        .ok_or_else(|| EstimationError::InvalidCovariance("matrix is not positive-definite".into()))?;
    chol.l()
        .solve_lower_triangular(&DMatrix::identity(dim, dim))
        .ok_or_else(|| EstimationError::InvalidCovariance("singular Cholesky factor".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sqrt_information_whitens() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 2.0]);
        let s = sqrt_information(&cov).unwrap();

        let info = s.transpose() * &s;
        assert_relative_eq!(info, cov.try_inverse().unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn test_non_symmetric_covariance_is_rejected() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(matches!(
            sqrt_information(&cov),
            Err(EstimationError::InvalidCovariance(_))
        ));
    }

    #[test]
    fn test_indefinite_covariance_is_rejected() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(Feature::new(FeatureKind::Fix, DVector::zeros(2), cov).is_err());
    }

    #[test]
    fn test_non_square_covariance() {
        let err = Feature::new(FeatureKind::Fix, DVector::zeros(2), DMatrix::identity(2, 3)).unwrap_err();
        assert!(matches!(err, EstimationError::DimensionMismatch { expected: 2, found: 3, .. }));
    }

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor(vec![0b1111_0000, 0xFF]);
        let b = Descriptor(vec![0b1111_0001, 0x0F]);

        assert_eq!(a.hamming(&b), 5);
        assert_eq!(a.size_bits(), 16);
    }
}
