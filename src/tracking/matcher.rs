//! Descriptor matching with normalized scores.

use crate::graph::{Descriptor, Keypoint};

/// Picks the best candidate for a descriptor.
pub trait Matcher {
    /// Index and score in `[0, 1]` of the best candidate, `None` if there is none.
    ///
    /// Ties are broken by candidate order: the first best wins.
    fn best_match(&self, descriptor: &Descriptor, candidates: &[Keypoint]) -> Option<(usize, f64)>;
}

/// Binary descriptor matcher, score `1 − hamming / bits`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HammingMatcher;

impl HammingMatcher {
    pub fn score(a: &Descriptor, b: &Descriptor) -> f64 {
        let bits = a.size_bits().max(b.size_bits());
        if bits == 0 {
            return 0.0;
        }
        1.0 - a.hamming(b) as f64 / bits as f64
    }
}

impl Matcher for HammingMatcher {
    fn best_match(&self, descriptor: &Descriptor, candidates: &[Keypoint]) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            let score = Self::score(descriptor, &c.descriptor);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((i, score));
            }
        }
        best
    }
}
