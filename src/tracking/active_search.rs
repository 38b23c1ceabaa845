//! Active search: a coarse grid over the image bounding where new features are sought.
//!
//! Cells already holding a tracked feature are `Hit`; cells where detection
//! came back empty are `Blocked`. The detector only ever runs on `Empty`
//! cells, picked at random so a bounded number of detector calls still
//! samples the whole image.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use serde::Deserialize;

use super::detector::Roi;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActiveSearchParams {
    pub image_width: f64,
    pub image_height: f64,
    pub cells_h: usize,
    pub cells_v: usize,
    /// Border in pixels excluded from every search region.
    pub margin: f64,
    /// Seed of the cell picker.
    pub seed: u64,
}

impl Default for ActiveSearchParams {
    fn default() -> Self {
        Self {
            image_width: 640.0,
            image_height: 480.0,
            cells_h: 8,
            cells_v: 6,
            margin: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Empty,
    Hit,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct ActiveSearchGrid {
    params: ActiveSearchParams,
    cell_width: f64,
    cell_height: f64,
    cells: Vec<CellState>,
    rng: StdRng,
}

impl ActiveSearchGrid {
    pub fn new(params: ActiveSearchParams) -> Self {
        let cells_h = params.cells_h.max(1);
        let cells_v = params.cells_v.max(1);
        Self {
            cell_width: params.image_width / cells_h as f64,
            cell_height: params.image_height / cells_v as f64,
            cells: vec![CellState::Empty; cells_h * cells_v],
            rng: StdRng::seed_from_u64(params.seed),
            params: ActiveSearchParams {
                cells_h,
                cells_v,
                ..params
            },
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    fn cell_of(&self, pixel: &Vector2<f64>) -> Option<usize> {
        if pixel.x < 0.0 || pixel.y < 0.0 || pixel.x >= self.params.image_width || pixel.y >= self.params.image_height {
            return None;
        }
        let i = ((pixel.x / self.cell_width) as usize).min(self.params.cells_h - 1);
        let j = ((pixel.y / self.cell_height) as usize).min(self.params.cells_v - 1);
        Some(j * self.params.cells_h + i)
    }

    fn cell_roi(&self, index: usize) -> Roi {
        let i = index % self.params.cells_h;
        let j = index / self.params.cells_h;
        let m = self.params.margin;
        Roi::new(
            i as f64 * self.cell_width + m,
            j as f64 * self.cell_height + m,
            (self.cell_width - 2.0 * m).max(0.0),
            (self.cell_height - 2.0 * m).max(0.0),
        )
    }

    pub fn state_at(&self, pixel: &Vector2<f64>) -> Option<CellState> {
        self.cell_of(pixel).map(|c| self.cells[c])
    }

    /// Mark the cell containing `pixel` as holding a feature.
    pub fn hit_cell(&mut self, pixel: &Vector2<f64>) {
        if let Some(c) = self.cell_of(pixel) {
            if self.cells[c] == CellState::Empty {
                self.cells[c] = CellState::Hit;
            }
        }
    }

    /// Exclude the cell of `roi` from further searches.
    pub fn block_cell(&mut self, roi: &Roi) {
        if let Some(c) = self.cell_of(&roi.center()) {
            self.cells[c] = CellState::Blocked;
        }
    }

    /// A random empty cell, or `None` once every cell is used.
    pub fn pick_roi(&mut self) -> Option<Roi> {
        let picked = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == CellState::Empty)
            .map(|(i, _)| i)
            .choose(&mut self.rng)?;
        Some(self.cell_roi(picked))
    }

    /// Forget hits and blocks for a fresh detection round.
    pub fn renew(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = CellState::Empty);
    }
}
