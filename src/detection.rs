//! Point source detection in raw camera frames.
//!
//! A pixel is a star candidate when it lies above the interpolated noise threshold,
//! leads to a compact, unsaturated local maximum, and that maximum has enough
//! contiguous neighbors above a very local threshold.

use std::ops::ControlFlow;

use log::{debug, info};
use ndarray::Array2;

use crate::Float;
use crate::error::SolveError;
use crate::grid::PixelGrid;
use crate::threshold::{Region, ThresholdSurface, region_median, region_threshold};

/// A detected peak.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Candidate {
    /// Column of the peak.
    pub x: usize,
    /// Row of the peak.
    pub y: usize,
    /// Intensity of the peak.
    pub peak: u16,
}

/// Parameters of the source detector.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectorConfig {
    /// Width of the ignored frame around the image, in pixels.
    pub border: usize,
    /// Approximate number of boxes used to estimate the noise threshold surface.
    pub noise_boxes: usize,
    /// Side of the square used for the local threshold around a peak.
    pub local_box: usize,
    /// Minimum Chebyshev distance between two accepted peaks.
    pub min_separation: usize,
    /// Minimum number of contiguous neighbors above the local threshold. `0` disables the test.
    pub min_connected: usize,
    /// Number of standard deviations above the median a signal needs.
    pub noise_sigma: f64,
    /// Pixels above this value are considered burned out.
    pub saturation: u16,
    /// Half width of the window a peak is centroided over.
    pub centroid_radius: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            border: 32,
            noise_boxes: 100,
            local_box: 10,
            min_separation: 5,
            min_connected: 4,
            noise_sigma: 4.,
            saturation: 60000,
            centroid_radius: 3,
        }
    }
}

impl DetectorConfig {
    /// Set the ignored border width.
    pub fn with_border(mut self, border: usize) -> Self {
        self.border = border;
        self
    }

    /// Set the number of noise boxes.
    pub fn with_noise_boxes(mut self, noise_boxes: usize) -> Self {
        self.noise_boxes = noise_boxes;
        self
    }

    /// Set the side of the local threshold box.
    pub fn with_local_box(mut self, local_box: usize) -> Self {
        self.local_box = local_box;
        self
    }

    /// Set the minimum separation of two peaks.
    pub fn with_min_separation(mut self, min_separation: usize) -> Self {
        self.min_separation = min_separation;
        self
    }

    /// Set the minimum number of contiguous bright neighbors.
    pub fn with_min_connected(mut self, min_connected: usize) -> Self {
        self.min_connected = min_connected;
        self
    }

    /// Set the detection threshold in standard deviations.
    pub fn with_noise_sigma(mut self, noise_sigma: f64) -> Self {
        self.noise_sigma = noise_sigma;
        self
    }

    /// Set the saturation ceiling.
    pub fn with_saturation(mut self, saturation: u16) -> Self {
        self.saturation = saturation;
        self
    }

    /// Set the half width of the centroid window.
    pub fn with_centroid_radius(mut self, centroid_radius: usize) -> Self {
        self.centroid_radius = centroid_radius;
        self
    }

    /// Border actually used: large enough for every neighborhood read around a peak.
    fn effective_border(&self) -> usize {
        self.border.max(self.local_box + 1).max(FAN_RADIUS)
    }
}

/// Half width of the neighborhood searched by the bright walk.
const FAN_RADIUS: usize = 2;

/// The 8 neighbors in circular order, starting west and going clockwise through north.
const RING: [(isize, isize); 8] = [
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
];

/// Finds star candidates in a [`PixelGrid`].
#[derive(Clone, Debug, Default)]
pub struct Detector {
    config: DetectorConfig,
}

impl Detector {
    /// Create a detector with the given parameters.
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Parameters in use.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect all candidates, sorted by ascending row.
    ///
    /// An empty list is a valid result.
    pub fn detect<G: PixelGrid>(&self, grid: &G) -> Vec<Candidate> {
        self.detect_with_progress(grid, |_| ControlFlow::Continue(()))
            .unwrap_or_default()
    }

    /// Detect all candidates, reporting the fraction of scanned rows to `progress` once per row.
    ///
    /// Returning [`ControlFlow::Break`] from `progress` stops the scan with
    /// [`SolveError::Cancelled`].
    pub fn detect_with_progress<G, P>(
        &self,
        grid: &G,
        mut progress: P,
    ) -> Result<Vec<Candidate>, SolveError>
    where
        G: PixelGrid,
        P: FnMut(f64) -> ControlFlow<()>,
    {
        let cfg = &self.config;
        let border = cfg.effective_border();
        let (w, h) = (grid.width(), grid.height());
        if w <= 2 * border || h <= 2 * border {
            debug!("Frame of {w}x{h} pixels is smaller than its border of {border}.");
            return Ok(Vec::new());
        }
        let active = Region::new(border, border, w - 2 * border, h - 2 * border);

        info!("Estimating noise thresholds.");
        let surface = ThresholdSurface::new(grid, active, cfg.noise_boxes, cfg.noise_sigma);
        debug!("Noise surface of {:?} boxes.", surface.shape());

        info!("Scanning for peaks.");
        let mut found: Vec<Candidate> = Vec::new();
        for y in active.y..active.y + active.height {
            for x in active.x..active.x + active.width {
                let thresh = surface.at(x, y);
                let value = grid.value(x, y) as f64;
                if value <= thresh
                    || grid.value(x, y) > cfg.saturation
                    || grid.value(x - 1, y) as f64 > thresh
                {
                    continue;
                }

                let Some(peak) = self.bright_walk(grid, active, x, y) else {
                    continue;
                };
                if self.near_accepted(&found, &peak) {
                    continue;
                }
                if !self.is_compact(grid, &peak) {
                    continue;
                }

                let at = found.partition_point(|c| c.y <= peak.y);
                found.insert(at, peak);
            }

            let done = (y + 1 - active.y) as f64 / active.height as f64;
            if progress(done).is_break() {
                info!("Detection cancelled at row {y}.");
                return Err(SolveError::Cancelled);
            }
        }

        info!("Found {} candidates.", found.len());
        Ok(found)
    }

    /// Climb to the brightest pixel reachable through the 5x5 neighborhood.
    ///
    /// Returns `None` if the climb hits a saturated pixel or leaves the active region.
    fn bright_walk<G: PixelGrid>(
        &self,
        grid: &G,
        active: Region,
        mut x: usize,
        mut y: usize,
    ) -> Option<Candidate> {
        let mut peak = grid.value(x, y);
        loop {
            let (mut bx, mut by, mut best) = (x, y, peak);
            for ny in y - FAN_RADIUS..=y + FAN_RADIUS {
                for nx in x - FAN_RADIUS..=x + FAN_RADIUS {
                    let v = grid.value(nx, ny);
                    if v > best {
                        (bx, by, best) = (nx, ny, v);
                    }
                }
            }

            if (bx, by) == (x, y) {
                return Some(Candidate { x, y, peak });
            }
            if best > self.config.saturation || !active.contains(bx, by) {
                return None;
            }
            (x, y, peak) = (bx, by, best);
        }
    }

    /// Whether `peak` is within the minimum separation of an accepted candidate.
    ///
    /// `found` is sorted by row, so only its tail needs checking.
    fn near_accepted(&self, found: &[Candidate], peak: &Candidate) -> bool {
        let sep = self.config.min_separation;
        found
            .iter()
            .rev()
            .take_while(|c| c.y + sep >= peak.y)
            .any(|c| c.x.abs_diff(peak.x) <= sep && c.y.abs_diff(peak.y) <= sep)
    }

    /// Local shape tests: not a vertical trail and enough bright neighbors.
    fn is_compact<G: PixelGrid>(&self, grid: &G, peak: &Candidate) -> bool {
        let size = self.config.local_box;
        let local = Region::new(peak.x - size / 2, peak.y - size / 2, size, size);
        let thresh = region_threshold(grid, local, self.config.noise_sigma);
        let above = |x: usize, y: usize| grid.value(x, y) > thresh;

        // bleed trails and columns
        let too_tall = size > 1
            && (1..size).all(|i| above(peak.x, peak.y - i) || above(peak.x, peak.y + i));
        if too_tall {
            return false;
        }

        let min_connected = self.config.min_connected;
        if min_connected == 0 {
            return true;
        }
        let mut run = 0;
        for i in 0..RING.len() + min_connected {
            let (dx, dy) = RING[i % RING.len()];
            let x = peak.x.wrapping_add_signed(dx);
            let y = peak.y.wrapping_add_signed(dy);
            if above(x, y) {
                run += 1;
                if run >= min_connected {
                    return true;
                }
            } else {
                run = 0;
            }
        }
        false
    }

    /// Sub-pixel positions of `candidates`, as an image point set of shape `(n, 2)`.
    ///
    /// Each peak moves to the centroid of the pixels within `centroid_radius`, weighted by
    /// the square of their excess over the median of a window twice as wide. Both windows
    /// are clipped to the frame. A peak without any excess keeps its pixel position.
    pub fn centroids<F, G>(&self, grid: &G, candidates: &[Candidate]) -> Array2<F>
    where
        F: Float,
        G: PixelGrid,
    {
        let mut points = Array2::zeros((candidates.len(), 2));
        for (i, c) in candidates.iter().enumerate() {
            let (x, y) = self.centroid(grid, c);
            points[[i, 0]] = F::from_f64(x).unwrap();
            points[[i, 1]] = F::from_f64(y).unwrap();
        }
        debug!("Centroided {} candidates.", candidates.len());
        points
    }

    fn centroid<G: PixelGrid>(&self, grid: &G, c: &Candidate) -> (f64, f64) {
        let r = self.config.centroid_radius;
        let background = region_median(grid, window(grid, c, 2 * r)) as f64;
        let win = window(grid, c, r);

        let (mut sum_w, mut sum_wx, mut sum_wy) = (0., 0., 0.);
        for y in win.y..win.y + win.height {
            for x in win.x..win.x + win.width {
                let w = (grid.value(x, y) as f64 - background).max(0.).powi(2);
                sum_w += w;
                sum_wx += w * x as f64;
                sum_wy += w * y as f64;
            }
        }
        if sum_w > 0. {
            (sum_wx / sum_w, sum_wy / sum_w)
        } else {
            (c.x as f64, c.y as f64)
        }
    }
}

/// Square window of half width `r` around a candidate, clipped to the grid.
fn window<G: PixelGrid>(grid: &G, c: &Candidate, r: usize) -> Region {
    let (x0, y0) = (c.x.saturating_sub(r), c.y.saturating_sub(r));
    let x1 = (c.x + r + 1).min(grid.width());
    let y1 = (c.y + r + 1).min(grid.height());
    Region::new(x0, y0, x1 - x0, y1 - y0)
}

/// The `n` brightest candidates, brightest first. Equal peaks keep their order.
pub fn brightest(mut candidates: Vec<Candidate>, n: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.peak.cmp(&a.peak));
    candidates.truncate(n);
    candidates
}

/// Convert candidates into an image point set of shape `(n, 2)` holding `(x, y)`.
pub fn candidates_to_points<F: Float>(candidates: &[Candidate]) -> Array2<F> {
    Array2::from_shape_fn((candidates.len(), 2), |(i, j)| {
        let c = &candidates[i];
        let v = if j == 0 { c.x } else { c.y };
        F::from_usize(v).unwrap()
    })
}
