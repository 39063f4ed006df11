//! Read-only access to the pixels of a camera frame.

use ndarray::{Array2, ArrayView2};

/// A 2D buffer of intensities, typically 16-bit camera counts.
///
/// `x` indexes columns and `y` indexes rows. Callers guarantee `x < width()` and `y < height()`.
pub trait PixelGrid {
    /// Number of columns.
    fn width(&self) -> usize;

    /// Number of rows.
    fn height(&self) -> usize;

    /// Intensity at column `x`, row `y`.
    fn value(&self, x: usize, y: usize) -> u16;
}

impl PixelGrid for ArrayView2<'_, u16> {
    fn width(&self) -> usize {
        self.ncols()
    }

    fn height(&self) -> usize {
        self.nrows()
    }

    fn value(&self, x: usize, y: usize) -> u16 {
        self[[y, x]]
    }
}

impl PixelGrid for Array2<u16> {
    fn width(&self) -> usize {
        self.ncols()
    }

    fn height(&self) -> usize {
        self.nrows()
    }

    fn value(&self, x: usize, y: usize) -> u16 {
        self[[y, x]]
    }
}

impl<G: PixelGrid + ?Sized> PixelGrid for &G {
    fn width(&self) -> usize {
        (**self).width()
    }

    fn height(&self) -> usize {
        (**self).height()
    }

    fn value(&self, x: usize, y: usize) -> u16 {
        (**self).value(x, y)
    }
}
