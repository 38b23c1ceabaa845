//! Time-ordered buffer of integrated motion.
//!
//! Each sample stores the step delta of one reading together with the delta
//! integrated since the buffer's origin. The first sample is always the zero
//! delta at the origin timestamp.

use nalgebra::{DMatrix, DVector};

use super::model::{propagate_covariance, MotionModel};

/// Timestamps closer than this are treated as equal.
pub const TIME_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct MotionSample {
    pub ts: f64,
    /// Delta of this step alone.
    pub delta: DVector<f64>,
    pub delta_cov: DMatrix<f64>,
    /// Delta accumulated since the buffer origin.
    pub delta_integr: DVector<f64>,
    pub delta_integr_cov: DMatrix<f64>,
}

#[derive(Debug, Clone)]
pub struct MotionBuffer {
    samples: Vec<MotionSample>,
}

impl MotionBuffer {
    /// Buffer holding only the origin sample at `ts`.
    pub fn new(ts: f64, model: &dyn MotionModel) -> Self {
        let zero = model.delta_zero();
        let n = model.delta_cov_size();
        Self {
            samples: vec![MotionSample {
                ts,
                delta: zero.clone(),
                delta_cov: DMatrix::zeros(n, n),
                delta_integr: zero,
                delta_integr_cov: DMatrix::zeros(n, n),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[MotionSample] {
        &self.samples
    }

    pub fn first(&self) -> &MotionSample {
        &self.samples[0]
    }

    pub fn last(&self) -> &MotionSample {
        &self.samples[self.samples.len() - 1]
    }

    /// Time covered by the buffer.
    pub fn time_span(&self) -> f64 {
        self.last().ts - self.first().ts
    }

    /// Integrate one step delta at `ts`. The caller guarantees `ts` is not
    /// earlier than the last sample.
    pub fn integrate(&mut self, model: &dyn MotionModel, ts: f64, delta: DVector<f64>, delta_cov: DMatrix<f64>) {
        let last = self.last();
        let integr = model.delta_plus_delta(&last.delta_integr, &delta);
        let (j1, j2) = model.delta_plus_delta_jacobians(&last.delta_integr, &delta);
        let integr_cov = propagate_covariance(&j1, &last.delta_integr_cov, &j2, &delta_cov);
        self.samples.push(MotionSample {
            ts,
            delta,
            delta_cov,
            delta_integr: integr,
            delta_integr_cov: integr_cov,
        });
    }

    /// Index of the nearest sample at or before `ts`, clamped to the first sample.
    pub fn index_before(&self, ts: f64) -> usize {
        self.samples
            .iter()
            .rposition(|s| s.ts <= ts + TIME_TOLERANCE)
            .unwrap_or(0)
    }

    /// Nearest sample at or before `ts`.
    pub fn sample_before(&self, ts: f64) -> &MotionSample {
        &self.samples[self.index_before(ts)]
    }

    /// Integrated delta and covariance at `ts`, interpolated between samples.
    /// Queries outside the buffer clamp to its ends.
    pub fn delta_at(&self, model: &dyn MotionModel, ts: f64) -> (DVector<f64>, DMatrix<f64>) {
        let i = self.index_before(ts);
        let s = &self.samples[i];
        if (s.ts - ts).abs() <= TIME_TOLERANCE || i + 1 == self.samples.len() || ts < s.ts {
            return (s.delta_integr.clone(), s.delta_integr_cov.clone());
        }
        let next = &self.samples[i + 1];
        let alpha = (ts - s.ts) / (next.ts - s.ts);
        let delta = model.interpolate(&s.delta_integr, &next.delta_integr, alpha);
        let cov = &s.delta_integr_cov + (&next.delta_integr_cov - &s.delta_integr_cov) * alpha;
        (delta, cov)
    }

    /// Cut the buffer at `ts`.
    ///
    /// Returns the closed part, ending exactly at `ts`. `self` keeps the
    /// remainder, re-integrated from a zero delta at `ts`.
    pub fn split(&mut self, model: &dyn MotionModel, ts: f64) -> MotionBuffer {
        let i = self.index_before(ts);
        let exact = (self.samples[i].ts - ts).abs() <= TIME_TOLERANCE || i + 1 == self.samples.len();

        let mut closed: Vec<MotionSample> = self.samples[..=i].to_vec();
        let mut pending: Vec<(f64, DVector<f64>, DMatrix<f64>)> = Vec::new();

        if exact {
            for s in &self.samples[i + 1..] {
                pending.push((s.ts, s.delta.clone(), s.delta_cov.clone()));
            }
        } else {
            let (prev, next) = (&self.samples[i], &self.samples[i + 1]);
            let alpha = (ts - prev.ts) / (next.ts - prev.ts);
            let (cut, cut_cov) = self.delta_at(model, ts);

            closed.push(MotionSample {
                ts,
                delta: model.delta_minus_delta(&prev.delta_integr, &cut),
                delta_cov: &next.delta_cov * alpha,
                delta_integr: cut.clone(),
                delta_integr_cov: cut_cov,
            });

            // The straddling step is split in two; the rest is carried over as is.
            pending.push((
                next.ts,
                model.delta_minus_delta(&cut, &next.delta_integr),
                &next.delta_cov * (1.0 - alpha),
            ));
            for s in &self.samples[i + 2..] {
                pending.push((s.ts, s.delta.clone(), s.delta_cov.clone()));
            }
        }

        let mut remainder = MotionBuffer::new(ts, model);
        for (t, d, c) in pending {
            remainder.integrate(model, t, d, c);
        }
        *self = remainder;

        if let Some(last) = closed.last_mut() {
            last.ts = ts;
        }
        MotionBuffer { samples: closed }
    }
}
