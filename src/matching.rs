//! Cross matching and the main interface.

use log::{debug, info, warn};
use nalgebra::Vector2;
use ndarray::{Array2, ArrayView2, Axis, s};

use crate::Float;
use crate::error::SolveError;
use crate::fit::{FitConfig, FitContext, Registration, refine};
use crate::geometry::bounding_box_center;
use crate::minimize::{Minimizer, NelderMead};
use crate::ndarray_utils::{IntoNdarray2, min_axis, norm_axis};
use crate::triangles::{CandidatePair, TriangleMatcher};
use crate::wcs::{Wcs, WcsParams};

/// Count the points of `coords2` that have a point of `coords1` within `tolerance`.
///
/// # Arguments:
/// - `(coords1, coord2)`: Two sets of points. The number of points can differ.
/// - `tolerance`: Tolerance of the match, in the units of the points.
///
/// # Example:
/// ```
/// # use ndarray::array;
/// # use platesolve::matching::count_cross_match;
/// let coords1 = array![[1.,2.], [3.,4.], [5.,6.]];
/// let coords2 = array![[1.,2.], [3.,4.], [6.,7.], [8., 9.]];
/// assert_eq!(count_cross_match(coords1.view(), coords2.view(), 0.), 2)
/// ```
pub fn count_cross_match<F: Float>(
    coords1: ArrayView2<F>,
    coords2: ArrayView2<F>,
    tolerance: F,
) -> usize {
    let coords1 = coords1.insert_axis(Axis(1));
    let coords2 = coords2.insert_axis(Axis(0));
    let diff = &coords1 - &coords2;
    let norm = norm_axis(diff.view(), Axis(2));
    let min = min_axis(norm.view(), Axis(0));
    min.fold(
        0,
        |acc, elem| if *elem <= tolerance { acc + 1 } else { acc },
    )
}

/// Project every star of `radecs` through `wcs`.
///
/// Returns the pixel positions of the stars that could be projected
/// along with their row in `radecs`.
fn project<F: Float>(wcs: &Wcs<F>, radecs: ArrayView2<F>) -> (Array2<F>, Vec<usize>) {
    let mut pixels = Vec::with_capacity(radecs.nrows() * 2);
    let mut rows = Vec::with_capacity(radecs.nrows());
    for (i, radec) in radecs.rows().into_iter().enumerate() {
        if let Some(p) = wcs.world_to_pixel(Vector2::new(radec[0], radec[1])) {
            pixels.extend([p.x, p.y]);
            rows.push(i);
        }
    }
    let projected = Array2::from_shape_vec((rows.len(), 2), pixels).unwrap();
    (projected, rows)
}

/// Parameters of a solve.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SolverConfig {
    /// Only the leading image points are used. They are expected brightest first.
    pub max_image_points: usize,
    /// Only the leading catalog stars are used. They are expected brightest first.
    pub max_catalog_points: usize,
    /// Distance in pixels under which a projected catalog star counts as matched.
    pub match_tolerance: f64,
    /// Explicit 1-based reference pixel.
    pub crpix: Option<[f64; 2]>,
    /// Image `(width, height)`, putting the reference pixel at the image center.
    pub image_size: Option<(usize, usize)>,
    /// Triangle matching.
    pub matcher: TriangleMatcher,
    /// Least squares refinement.
    pub fit: FitConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_image_points: 25,
            max_catalog_points: 100,
            match_tolerance: 3.,
            crpix: None,
            image_size: None,
            matcher: TriangleMatcher::default(),
            fit: FitConfig::default(),
        }
    }
}

/// The central struct of this library.
///
/// Use this in order to build options for plate solving.
/// For more details, check the crate-level documentation.
#[derive(Clone, Debug)]
pub struct PlateSolver<F: Float, M = NelderMead> {
    /// Image points in pixels, brightest first. Shape `(n_points, 2)`.
    pixels: Array2<F>,
    /// Catalog stars `(ra, dec)` in radians, brightest first. Shape `(n_radecs, 2)`.
    radecs: Array2<F>,
    config: SolverConfig,
    minimizer: M,
}

impl<F: Float> PlateSolver<F, NelderMead> {
    /// Create a new instance using default options.
    /// Use `with_` functions to set parameters.
    ///
    /// # Arguments
    /// -`pixels`: List of image points, brightest first. Shape `(n_points, 2)`.\
    /// -`radecs`: List of catalog stars `(ra, dec)` in radians, brightest first.
    ///   Shape `(n_radecs, 2)`.
    pub fn new<A>(pixels: A, radecs: A) -> Self
    where
        A: IntoNdarray2<Out = Array2<F>>,
    {
        Self {
            pixels: pixels.into_ndarray2(),
            radecs: radecs.into_ndarray2(),
            config: SolverConfig::default(),
            minimizer: NelderMead::default(),
        }
    }
}

impl<F, M> PlateSolver<F, M>
where
    F: Float,
    M: Minimizer<F>,
{
    /// Replace the minimizer of the refinement.
    pub fn with_minimizer<N: Minimizer<F>>(self, minimizer: N) -> PlateSolver<F, N> {
        PlateSolver {
            pixels: self.pixels,
            radecs: self.radecs,
            config: self.config,
            minimizer,
        }
    }

    /// Replace all parameters.
    pub fn with_config(mut self, config: SolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the refinement parameters.
    pub fn with_fit_config(mut self, fit: FitConfig) -> Self {
        self.config.fit = fit;
        self
    }

    /// Replace the triangle matching parameters.
    pub fn with_matcher(mut self, matcher: TriangleMatcher) -> Self {
        self.config.matcher = matcher;
        self
    }

    /// Set the image size. The reference pixel is put at its center.
    pub fn with_image_size(mut self, width: usize, height: usize) -> Self {
        self.config.image_size = Some((width, height));
        self
    }

    /// Set an explicit 1-based reference pixel.
    pub fn with_crpix(mut self, x: f64, y: f64) -> Self {
        self.config.crpix = Some([x, y]);
        self
    }

    /// Set the maximum accepted median residual, in pixels.
    pub fn with_max_residual(mut self, max_residual: f64) -> Self {
        self.config.fit.max_residual = max_residual;
        self
    }

    /// Set the triangle space matching tolerance.
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.config.matcher.tolerance = tolerance;
        self
    }

    /// Set the minimum number of votes of a pair.
    pub fn with_min_votes(mut self, min_votes: u32) -> Self {
        self.config.matcher.min_votes = min_votes;
        self
    }

    /// Set the minimum number of pairs of a fit.
    pub fn with_min_pairs(mut self, min_pairs: usize) -> Self {
        self.config.fit.min_pairs = min_pairs;
        self
    }

    /// Set the maximum number of pairs promoted from the votes.
    pub fn with_max_pairs(mut self, max_pairs: usize) -> Self {
        self.config.matcher.max_pairs = max_pairs;
        self
    }

    /// Set the distance in pixels under which a catalog star counts as matched.
    pub fn with_match_tolerance(mut self, match_tolerance: f64) -> Self {
        self.config.match_tolerance = match_tolerance;
        self
    }

    /// Set the number of leading image points used for matching.
    pub fn with_max_image_points(mut self, n: usize) -> Self {
        self.config.max_image_points = n;
        self
    }

    /// Set the number of leading catalog stars used for matching.
    pub fn with_max_catalog_points(mut self, n: usize) -> Self {
        self.config.max_catalog_points = n;
        self
    }

    /// Current parameters.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Reference pixel: explicit, else the image center, else the center of the image points.
    fn crpix(&self) -> Option<Vector2<F>> {
        if let Some([x, y]) = self.config.crpix {
            return Some(Vector2::new(F::from_f64(x).unwrap(), F::from_f64(y).unwrap()));
        }
        if let Some((w, h)) = self.config.image_size {
            let two = F::from_f64(2.).unwrap();
            return Some(Vector2::new(
                F::from_usize(w).unwrap() / two,
                F::from_usize(h).unwrap() / two,
            ));
        }
        bounding_box_center(self.pixels.view()).map(|c| c.add_scalar(F::from_f64(1.).unwrap()))
    }

    /// Solve the plate given a nominal guess of the pointing, rotation and scales.
    ///
    /// # Returns
    /// The refined solution, or why none was accepted. The `matched` count of the result is the
    /// number of catalog stars within the match tolerance of an image point under the solution.
    pub fn solve(&self, nominal: &WcsParams<F>) -> Result<Registration<F>, SolveError> {
        self.solve_with(nominal, |matcher, image, catalog| {
            matcher.candidate_pairs(image, catalog)
        })
    }

    fn solve_with<V>(&self, nominal: &WcsParams<F>, vote: V) -> Result<Registration<F>, SolveError>
    where
        V: FnOnce(&TriangleMatcher, ArrayView2<F>, ArrayView2<F>) -> Vec<CandidatePair<F>>,
    {
        let config = &self.config;
        let required = config.fit.min_pairs.max(3);
        for found in [self.pixels.nrows(), self.radecs.nrows()] {
            if found < required {
                return Err(SolveError::InsufficientData { found, required });
            }
        }

        let n_image = self.pixels.nrows().min(config.max_image_points);
        let n_catalog = self.radecs.nrows().min(config.max_catalog_points);
        let image = self.pixels.slice(s![..n_image, ..]);
        let catalog = self.radecs.slice(s![..n_catalog, ..]);

        let Some(crpix) = self.crpix() else {
            return Err(SolveError::InsufficientData {
                found: 0,
                required,
            });
        };
        let nominal_wcs = Wcs::new(*nominal, crpix);

        info!("Projecting {n_catalog} catalog stars.");
        let (projected, rows) = project(&nominal_wcs, catalog);
        if projected.nrows() < n_catalog {
            debug!(
                "{} catalog stars are behind the tangent plane.",
                n_catalog - projected.nrows()
            );
        }

        let mut pairs = vote(&config.matcher, image, projected.view());
        if pairs.len() < config.fit.min_pairs {
            warn!("Only {} pairs found in the votes.", pairs.len());
            return Err(SolveError::InsufficientData {
                found: pairs.len(),
                required: config.fit.min_pairs,
            });
        }
        for pair in &mut pairs {
            pair.catalog = rows[pair.catalog];
        }

        let context = FitContext::new(image, catalog, crpix, nominal);
        let mut registration = refine(&context, pairs, *nominal, &config.fit, &self.minimizer)?;

        let (solved, _) = project(&registration.wcs, self.radecs.view());
        let tolerance = F::from_f64(config.match_tolerance).unwrap();
        registration.matched = count_cross_match(self.pixels.view(), solved.view(), tolerance);
        info!(
            "Solved with {} pairs, median residual {:?} px, {} catalog stars matched.",
            registration.pairs.len(),
            registration.median_residual,
            registration.matched
        );
        Ok(registration)
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;

    impl<F, M> PlateSolver<F, M>
    where
        F: Float,
        M: Minimizer<F>,
    {
        /// Solve the plate, casting the triangle votes in parallel.
        ///
        /// Also see [`solve`](PlateSolver::solve()). The result is identical.
        pub fn solve_par(&self, nominal: &WcsParams<F>) -> Result<Registration<F>, SolveError> {
            self.solve_with(nominal, |matcher, image, catalog| {
                matcher.candidate_pairs_par(image, catalog)
            })
        }
    }
}
