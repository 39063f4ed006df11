#![warn(missing_docs)]

//! Blind astrometric plate solving for raw camera frames. \
//! Point sources are detected in the pixel data, their geometric pattern is matched against
//! reference stars by voting with similar triangles, and the tangent-plane
//! [World Coordinate System](wcs::Wcs) is refined by a derivative-free least squares fit
//! with iterative outlier rejection.
//!
//! The triangle technique follows
//! [Valdes et al. 1995](<https://ui.adsabs.harvard.edu/abs/1995PASP..107.1119V>),
//! "FOCAS Automatic Catalog Matching Algorithms".
//!
//! ## Interface
//! The central struct of this library is [`PlateSolver`]. It takes the detected image points and
//! the reference stars, and refines a nominal pointing guess into a [`Registration`].
//! Additional parameters are set via `PlateSolver::with_*()` functions.
//!
//! Example:
//! ```rust
//! # use ndarray::array;
//! # use platesolve::{PlateSolver, WcsParams};
//! let pixels = array![[70., 90.], [410., 60.], [250., 200.], [120., 330.]];
//! let radecs = array![[1.2, 0.5], [1.21, 0.5], [1.2, 0.51], [1.21, 0.51]];
//! let solver = PlateSolver::new(pixels, radecs)
//!     .with_image_size(512, 512)
//!     .with_max_residual(0.5);
//! let nominal = WcsParams::new(1.2, 0.5, 0., -1e-5, 1e-5);
//! let _result = solver.solve(&nominal);
//! ```
//!
//! Around the solver:
//! - [`Detector`] finds star candidates in anything implementing [`PixelGrid`].
//! - [`hunt()`] walks a spiral of trial centers, pulling reference stars from a [`Catalog`].
//! - [`WcsHeader`] reads and writes the solved fields on a caller-owned image header.
//! - [`solve_frame()`] chains them: header pointing, detection, centroids, hunt, header update.
//!
//! ## Parameters
//! - `max_residual`: Maximum accepted median distance, in pixels, between image points and their
//!     projected catalog partners. Also the floor of the outlier rejection threshold.
//! - `tolerance`: Maximum L1 distance between two triangles in triangle space for them to vote.
//! - `min_votes`: Minimum number of votes an image/catalog pairing needs to be used in the fit.
//! - `min_pairs`: Minimum number of pairs for a fit; fewer is reported as an error.
//!
//! Only with the `parallel` feature:
//! - [`PlateSolver::solve_par()`] casts the triangle votes in parallel.

pub(crate) mod geometry;
pub(crate) mod ndarray_utils;

pub mod detection;
pub mod error;
pub mod fit;
pub mod grid;
pub mod header;
pub mod hunt;
pub mod matching;
pub mod minimize;
pub mod threshold;
pub mod triangles;
pub mod wcs;

pub use detection::{Candidate, Detector, DetectorConfig};
pub use error::{CatalogError, SolveError};
pub use fit::{FitConfig, FitContext, Registration};
pub use grid::PixelGrid;
pub use header::{WcsHeader, has_wcs, nominal_from_header};
pub use hunt::{Catalog, CatalogStar, HuntConfig, hunt, solve_frame};
pub use matching::{PlateSolver, SolverConfig};
pub use minimize::{Minimizer, Minimum, NelderMead};
pub use triangles::{CandidatePair, TriangleMatcher};
pub use wcs::{Wcs, WcsParams};

/// A generic float trait such that the plate solving algorithm is generic over `f32`/`f64`.
///
/// This trait is automatically implemented for all types implementing the supertraits.
/// Particularly, this includes `f32` and `f64`.
/// [`num_traits::Float`] is not a supertrait as the need to specify the provider of the
/// redundant definitions of the basic math functions would clutter the code.
pub trait Float:
    Copy + Default + nalgebra::RealField + num_traits::FromPrimitive + num_traits::ToPrimitive
{
}

impl<F> Float for F where
    F: Copy + Default + nalgebra::RealField + num_traits::FromPrimitive + num_traits::ToPrimitive
{
}
