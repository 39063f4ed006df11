//! Least squares refinement of a plate solution with iterative outlier rejection.

use log::{debug, info, warn};
use nalgebra::{SVector, Vector2};
use ndarray::ArrayView2;

use crate::Float;
use crate::error::SolveError;
use crate::geometry::{bearing, wrap_angle};
use crate::minimize::Minimizer;
use crate::ndarray_utils::upper_median;
use crate::triangles::CandidatePair;
use crate::wcs::{Wcs, WcsParams};

/// Parameters of the refinement.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FitConfig {
    /// Minimum number of pairs for a fit.
    pub min_pairs: usize,
    /// Maximum number of fits, each followed by outlier rejection. At least one fit runs.
    pub max_rounds: usize,
    /// Fractional tolerance on the objective at which the minimizer stops.
    pub ftol: f64,
    /// Maximum accepted median residual, in pixels. Also the floor of the rejection threshold.
    pub max_residual: f64,
    /// Pairs with a residual of at least this multiple of the median are rejected.
    pub reject_factor: f64,
    /// Fitted scales must stay within this factor of the nominal scales.
    pub scale_bound: f64,
    /// Initial simplex step of the center, radians.
    pub center_step: f64,
    /// Initial simplex step of the rotation, radians.
    pub rotation_step: f64,
    /// Initial simplex step of the scales, as a factor.
    pub scale_step: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_pairs: 4,
            max_rounds: 4,
            ftol: 2e-4,
            max_residual: 2.,
            reject_factor: 1.5,
            scale_bound: 2.,
            center_step: 0.25f64.to_radians(),
            rotation_step: 30f64.to_radians(),
            scale_step: 1.1,
        }
    }
}

/// An accepted plate solution.
#[derive(Clone, Debug, PartialEq)]
pub struct Registration<F: Float> {
    /// The fitted projection.
    pub wcs: Wcs<F>,
    /// Median pair residual, pixels.
    pub median_residual: F,
    /// Mean pair residual, pixels.
    pub mean_residual: F,
    /// Pairs that survived outlier rejection, with their final residuals.
    pub pairs: Vec<CandidatePair<F>>,
    /// Objective evaluations spent over all fits.
    pub evaluations: usize,
    /// Number of catalog stars within the match tolerance of an image point under the solution.
    pub matched: usize,
}

/// Everything the objective needs besides the trial parameters.
#[derive(Clone, Debug)]
pub struct FitContext<'a, F: Float> {
    /// Image points, `(x, y)` pixels.
    image: ArrayView2<'a, F>,
    /// Catalog stars, `(ra, dec)` radians.
    catalog: ArrayView2<'a, F>,
    /// Reference pixel of every trial projection.
    crpix: Vector2<F>,
    /// Signs of the nominal scales, which a fit may not flip.
    positive_scales: (bool, bool),
}

impl<'a, F: Float> FitContext<'a, F> {
    /// Create a new context. The scale signs of `nominal` are fixed for every fit.
    pub fn new(
        image: ArrayView2<'a, F>,
        catalog: ArrayView2<'a, F>,
        crpix: Vector2<F>,
        nominal: &WcsParams<F>,
    ) -> Self {
        let zero = F::from_f64(0.).unwrap();
        Self {
            image,
            catalog,
            crpix,
            positive_scales: (nominal.x_scale > zero, nominal.y_scale > zero),
        }
    }

    /// Weighted residual of every pair, in pixels.
    ///
    /// The squared distance of each pair after the first is multiplied by
    /// `1 + |Δ|`, where `Δ` is the difference between the bearings towards the previous pair
    /// in the image and under the projection.
    /// Returns `None` if a scale changed sign or a star could not be projected.
    pub fn residuals(&self, params: &WcsParams<F>, pairs: &[CandidatePair<F>]) -> Option<Vec<F>> {
        let zero = F::from_f64(0.).unwrap();
        let one = F::from_f64(1.).unwrap();
        if (params.x_scale > zero, params.y_scale > zero) != self.positive_scales {
            return None;
        }

        let wcs = Wcs::new(*params, self.crpix);
        let mut residuals = Vec::with_capacity(pairs.len());
        let mut previous: Option<(Vector2<F>, Vector2<F>)> = None;
        for pair in pairs {
            let image = Vector2::new(self.image[[pair.image, 0]], self.image[[pair.image, 1]]);
            let radec = Vector2::new(
                self.catalog[[pair.catalog, 0]],
                self.catalog[[pair.catalog, 1]],
            );
            let projected = wcs.world_to_pixel(radec)?;

            let mut r2 = (projected - image).norm_squared();
            if let Some((prev_image, prev_projected)) = previous {
                let a1 = bearing(&image, &prev_image);
                let a2 = bearing(&projected, &prev_projected);
                r2 *= one + wrap_angle(a1 - a2).abs();
            }
            residuals.push(r2.sqrt());
            previous = Some((image, projected));
        }
        Some(residuals)
    }

    /// Sum of the squared weighted residuals, `+∞` where [`residuals`](Self::residuals) fails.
    pub fn objective(&self, params: &WcsParams<F>, pairs: &[CandidatePair<F>]) -> F {
        match self.residuals(params, pairs) {
            Some(r) => r.into_iter().fold(F::from_f64(0.).unwrap(), |acc, r| acc + r * r),
            None => F::from_f64(f64::INFINITY).unwrap(),
        }
    }
}

/// Second simplex seed: `start` moved by the configured steps.
fn perturbed<F: Float>(start: &WcsParams<F>, config: &FitConfig) -> SVector<F, 5> {
    let center = F::from_f64(config.center_step).unwrap();
    let rotation = F::from_f64(config.rotation_step).unwrap();
    let scale = F::from_f64(config.scale_step).unwrap();
    WcsParams::new(
        start.ra + center,
        start.dec + center,
        start.rotation + rotation,
        start.x_scale * scale,
        start.y_scale * scale,
    )
    .to_vector()
}

/// Fit the parameters to `pairs`, starting at `start`, rejecting outliers after every fit.
///
/// The scales are bounded relative to `start`. `matched` of the result is left at the number of
/// surviving pairs.
pub fn refine<F, M>(
    context: &FitContext<'_, F>,
    mut pairs: Vec<CandidatePair<F>>,
    start: WcsParams<F>,
    config: &FitConfig,
    minimizer: &M,
) -> Result<Registration<F>, SolveError>
where
    F: Float,
    M: Minimizer<F>,
{
    let required = config.min_pairs.max(1);
    if pairs.len() < required {
        return Err(SolveError::InsufficientData {
            found: pairs.len(),
            required,
        });
    }
    let ftol = F::from_f64(config.ftol).unwrap();
    let max_residual = F::from_f64(config.max_residual).unwrap();
    let reject_factor = F::from_f64(config.reject_factor).unwrap();

    let mut params = start;
    let mut evaluations = 0;
    for round in 0..config.max_rounds.max(1) {
        info!("Fitting {} pairs, round {}.", pairs.len(), round + 1);
        let min = minimizer.minimize(
            |v| context.objective(&WcsParams::from_vector(v), &pairs),
            params.to_vector(),
            perturbed(&params, config),
            ftol,
        );
        let min = match min {
            Ok(min) => min,
            Err(SolveError::NoConvergence { evaluations: spent }) => {
                return Err(SolveError::NoConvergence {
                    evaluations: evaluations + spent,
                });
            }
            Err(e) => return Err(e),
        };
        evaluations += min.evaluations;
        params = WcsParams::from_vector(&min.point);

        let residuals = context
            .residuals(&params, &pairs)
            .ok_or(SolveError::NoConvergence { evaluations })?;
        for (pair, r) in pairs.iter_mut().zip(residuals) {
            pair.residual = r;
        }

        let median = upper_median(pairs.iter().map(|p| p.residual)).unwrap();
        let threshold = max_residual.max(reject_factor * median);
        let before = pairs.len();
        pairs.retain(|p| p.residual < threshold);
        debug!(
            "Median residual {:?} px, rejected {} pairs.",
            median,
            before - pairs.len()
        );

        if pairs.len() == before {
            break;
        }
        if pairs.len() < required {
            return Err(SolveError::TooFewSurvivingPairs {
                remaining: pairs.len(),
                required,
            });
        }
    }

    let median = upper_median(pairs.iter().map(|p| p.residual)).unwrap();
    let mean = pairs.iter().fold(F::from_f64(0.).unwrap(), |acc, p| acc + p.residual)
        / F::from_usize(pairs.len()).unwrap();

    if median > max_residual {
        warn!("Rejecting solution with median residual {:?} px.", median);
        return Err(SolveError::ResidualTooLarge {
            median: median.to_f64().unwrap(),
            max: config.max_residual,
        });
    }

    let bound = F::from_f64(config.scale_bound).unwrap();
    let in_bounds = |fitted: F, nominal: F| {
        fitted.abs() > nominal.abs() / bound && fitted.abs() < nominal.abs() * bound
    };
    if !in_bounds(params.x_scale, start.x_scale) || !in_bounds(params.y_scale, start.y_scale) {
        warn!("Rejecting solution with degenerate scales.");
        return Err(SolveError::DegenerateSolution {
            x_scale: params.x_scale.to_f64().unwrap(),
            y_scale: params.y_scale.to_f64().unwrap(),
        });
    }

    let matched = pairs.len();
    Ok(Registration {
        wcs: Wcs::new(params, context.crpix),
        median_residual: median,
        mean_residual: mean,
        pairs,
        evaluations,
        matched,
    })
}
