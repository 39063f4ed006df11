//! Local signal thresholds estimated from noise boxes.

use ndarray::Array2;

use crate::grid::PixelGrid;

/// Largest value a camera pixel can take.
pub const MAX_PIXEL: u16 = u16::MAX;

/// A rectangular region of a grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    /// Left column.
    pub x: usize,
    /// Top row.
    pub y: usize,
    /// Number of columns.
    pub width: usize,
    /// Number of rows.
    pub height: usize,
}

impl Region {
    /// Create a new region.
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether pixel `(x, y)` lies inside the region.
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    fn pixels<'g, G: PixelGrid>(&self, grid: &'g G) -> impl Iterator<Item = u16> + 'g {
        let Region {
            x,
            y,
            width,
            height,
        } = *self;
        (y..y + height).flat_map(move |row| (x..x + width).map(move |col| grid.value(col, row)))
    }
}

/// Median of the pixels in `region`, found by binary search over the pixel range.
///
/// Returns the smallest value `v` such that at most half of the pixels are above `v`.
/// Much faster than a histogram for small boxes.
pub fn region_median<G: PixelGrid>(grid: &G, region: Region) -> u16 {
    let half = region.width * region.height / 2;
    let mut low = 0u32;
    let mut high = MAX_PIXEL as u32;

    while low < high {
        let mid = (low + high) / 2;
        let mut above = 0;
        let mut too_many = false;
        for v in region.pixels(grid) {
            if v as u32 > mid {
                above += 1;
                if above > half {
                    too_many = true;
                    break;
                }
            }
        }
        if too_many {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    low as u16
}

/// Signal threshold of `region`: median plus `sigma` standard deviations of the noise.
///
/// Only the non-zero pixels at or below the median contribute to the deviation,
/// so bright sources in the box do not inflate it.
pub fn region_threshold<G: PixelGrid>(grid: &G, region: Region, sigma: f64) -> u16 {
    let median = region_median(grid, region);

    let (mut sum, mut sum2, mut n) = (0., 0., 0usize);
    for v in region.pixels(grid) {
        if v != 0 && v <= median {
            let d = (median - v) as f64;
            sum += d;
            sum2 += d * d;
            n += 1;
        }
    }
    let var = if n > 1 {
        (sum2 - sum * sum / n as f64) / (n - 1) as f64
    } else {
        0.
    };
    let sd = if var > 0. { var.sqrt() } else { 0. };

    let thresh = median as f64 + sigma * sd;
    thresh.min(MAX_PIXEL as f64) as u16
}

/// Thresholds of a coarse grid of noise boxes, bilinearly interpolated between box centers.
#[derive(Clone, Debug)]
pub struct ThresholdSurface {
    /// Box thresholds, shape `(ny, nx)`.
    boxes: Array2<f64>,
    /// Center of the top left box.
    x0: f64,
    y0: f64,
    box_width: f64,
    box_height: f64,
}

impl ThresholdSurface {
    /// Spread about `n_boxes` noise boxes evenly over `active` and measure each.
    pub fn new<G: PixelGrid>(grid: &G, active: Region, n_boxes: usize, sigma: f64) -> Self {
        let aw = active.width.max(1) as f64;
        let ah = active.height.max(1) as f64;
        let nx = ((n_boxes.max(1) as f64 * aw / ah).sqrt().ceil() as usize)
            .clamp(1, active.width.max(1));
        let ny = (n_boxes.max(1) / nx).clamp(1, active.height.max(1));
        let box_width = active.width / nx;
        let box_height = active.height / ny;

        let boxes = Array2::from_shape_fn((ny, nx), |(j, i)| {
            let region = Region::new(
                active.x + i * box_width,
                active.y + j * box_height,
                box_width,
                box_height,
            );
            region_threshold(grid, region, sigma) as f64
        });

        Self {
            boxes,
            x0: active.x as f64 + box_width as f64 / 2.,
            y0: active.y as f64 + box_height as f64 / 2.,
            box_width: box_width.max(1) as f64,
            box_height: box_height.max(1) as f64,
        }
    }

    /// Number of boxes in x and y.
    pub fn shape(&self) -> (usize, usize) {
        (self.boxes.ncols(), self.boxes.nrows())
    }

    /// Interpolated threshold at pixel `(x, y)`.
    pub fn at(&self, x: usize, y: usize) -> f64 {
        let (i, fx) = Self::cell(x as f64, self.x0, self.box_width, self.boxes.ncols());
        let (j, fy) = Self::cell(y as f64, self.y0, self.box_height, self.boxes.nrows());
        let i1 = (i + 1).min(self.boxes.ncols() - 1);
        let j1 = (j + 1).min(self.boxes.nrows() - 1);

        let top = self.boxes[[j, i]] * (1. - fx) + self.boxes[[j, i1]] * fx;
        let bottom = self.boxes[[j1, i]] * (1. - fx) + self.boxes[[j1, i1]] * fx;
        top * (1. - fy) + bottom * fy
    }

    /// Lower box index and fractional offset towards the next one, clamped to the outer centers.
    fn cell(v: f64, origin: f64, step: f64, n: usize) -> (usize, f64) {
        let t = ((v - origin) / step).clamp(0., (n - 1) as f64);
        let i = (t.floor() as usize).min(n - 1);
        (i, t - i as f64)
    }
}
