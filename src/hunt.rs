//! Searching for a solution around an uncertain nominal pointing.
//!
//! Trial centers are visited in hollow squares of growing size around the nominal center.
//! At each one the reference stars are pulled from a [`Catalog`] and a solve is attempted.
//! The first success is solved once more at its own center.
//!
//! [`solve_frame`] runs the whole chain on a raw frame: nominal pointing from its header,
//! detection, centroiding, the hunt, and the solution written back to the header.

use std::ops::ControlFlow;

use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2};

use crate::Float;
use crate::detection::{Detector, brightest};
use crate::error::{CatalogError, SolveError};
use crate::fit::Registration;
use crate::geometry::wrap_two_pi;
use crate::grid::PixelGrid;
use crate::header::{WcsHeader, nominal_from_header};
use crate::matching::{PlateSolver, SolverConfig};
use crate::minimize::NelderMead;
use crate::wcs::WcsParams;

/// A reference star.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CatalogStar<F: Float> {
    /// Right ascension, radians.
    pub ra: F,
    /// Declination, radians.
    pub dec: F,
    /// Visual magnitude.
    pub magnitude: F,
}

/// Source of reference stars.
pub trait Catalog<F: Float> {
    /// All stars within `radius` radians of `(ra, dec)` that are brighter than `faint_limit`.
    fn stars(
        &mut self,
        ra: F,
        dec: F,
        radius: F,
        faint_limit: F,
    ) -> Result<Vec<CatalogStar<F>>, CatalogError>;
}

/// Parameters of a hunt.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HuntConfig {
    /// Largest distance of a trial center from the nominal center, radians.
    pub radius: f64,
    /// Step between trial centers as a fraction of the image height and width.
    pub step_fraction: f64,
    /// Stars brighter than this magnitude are ignored.
    pub bright_limit: f64,
    /// Faintest magnitude requested from the catalog.
    pub faint_limit: f64,
    /// Solve at each trial center. Its image size is overridden by the hunted image.
    pub solver: SolverConfig,
    /// Minimizer of every solve.
    pub minimizer: NelderMead,
}

impl Default for HuntConfig {
    fn default() -> Self {
        Self {
            radius: 1f64.to_radians(),
            step_fraction: 0.33,
            bright_limit: 6.,
            faint_limit: 18.,
            solver: SolverConfig::default(),
            minimizer: NelderMead::default(),
        }
    }
}

impl HuntConfig {
    /// Set the search radius, radians.
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    /// Set the step fraction.
    pub fn with_step_fraction(mut self, step_fraction: f64) -> Self {
        self.step_fraction = step_fraction;
        self
    }

    /// Set the magnitude limits of the used stars.
    pub fn with_magnitudes(mut self, bright_limit: f64, faint_limit: f64) -> Self {
        self.bright_limit = bright_limit;
        self.faint_limit = faint_limit;
        self
    }

    /// Set the solver parameters.
    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Trial centers in hollow squares of growing size around `(ra0, dec0)`.
///
/// Steps are `dra` and `ddec` radians, out to `rings` squares. Centers beyond a pole
/// continue on the other side of it. `ra` is in `[0, 2π)`.
fn spiral<F: Float>(
    ra0: F,
    dec0: F,
    dra: F,
    ddec: F,
    rings: i64,
) -> impl Iterator<Item = (F, F)> {
    (0..=rings).flat_map(move |r| {
        (-r..=r).flat_map(move |i| {
            (-r..=r)
                .filter(move |j| i.abs() == r || j.abs() == r)
                .map(move |j| {
                    let half_pi = F::frac_pi_2();
                    let mut dec = dec0 + F::from_i64(j).unwrap() * ddec;
                    let mut ra = ra0 + F::from_i64(i).unwrap() * dra;
                    if dec > half_pi {
                        ra += F::pi();
                        dec = F::pi() - dec;
                    } else if dec < -half_pi {
                        ra += F::pi();
                        dec = -F::pi() - dec;
                    }
                    (wrap_two_pi(ra), dec)
                })
        })
    })
}

/// Usable reference stars around `(ra, dec)`, brightest first, as `(ra, dec)` rows.
fn fetch<F, C>(
    catalog: &mut C,
    ra: F,
    dec: F,
    radius: F,
    config: &HuntConfig,
) -> Result<Array2<F>, CatalogError>
where
    F: Float,
    C: Catalog<F>,
{
    let faint = F::from_f64(config.faint_limit).unwrap();
    let bright = F::from_f64(config.bright_limit).unwrap();
    let mut stars = catalog.stars(ra, dec, radius, faint)?;
    let total = stars.len();
    stars.retain(|s| s.magnitude >= bright);
    stars.sort_by(|a, b| {
        a.magnitude
            .partial_cmp(&b.magnitude)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    debug!("{} catalog stars, {} fainter than the bright limit.", total, stars.len());
    Ok(Array2::from_shape_fn((stars.len(), 2), |(i, j)| {
        if j == 0 { stars[i].ra } else { stars[i].dec }
    }))
}

/// Radius around the center covering a `width` by `height` image.
fn field_radius<F: Float>(params: &WcsParams<F>, width: usize, height: usize) -> F {
    let w = F::from_usize(width).unwrap() * params.x_scale;
    let h = F::from_usize(height).unwrap() * params.y_scale;
    w.hypot(h) / F::from_f64(2.).unwrap()
}

/// Hunt for a solution of `image` around the `nominal` pointing.
///
/// # Arguments
/// - `image`: Image points in pixels, brightest first. Shape `(n_points, 2)`.
/// - `(width, height)`: Image size. The reference pixel is its center.
/// - `nominal`: Guess of the image center, rotation and scales.
/// - `progress`: Called with the number of trial centers tried before each new one.
///   Returning [`ControlFlow::Break`] stops the hunt with [`SolveError::Cancelled`].
///
/// # Returns
/// The first solution found, refined at its own center if possible.
/// A trial center whose catalog query fails is skipped. If every query failed, the last
/// failure is returned as [`SolveError::Catalog`], otherwise [`SolveError::NoSolution`].
///
/// The image points are capped at `config.solver.max_image_points` for every solve.
pub fn hunt<F, C, P>(
    image: ArrayView2<F>,
    (width, height): (usize, usize),
    nominal: &WcsParams<F>,
    catalog: &mut C,
    config: &HuntConfig,
    mut progress: P,
) -> Result<Registration<F>, SolveError>
where
    F: Float,
    C: Catalog<F>,
    P: FnMut(usize) -> ControlFlow<()>,
{
    let fraction = F::from_f64(config.step_fraction).unwrap();
    let ddec = F::from_usize(height).unwrap() * nominal.y_scale.abs() * fraction;
    let dra =
        F::from_usize(width).unwrap() * nominal.x_scale.abs() * fraction / nominal.dec.cos();
    let rings = (F::from_f64(config.radius).unwrap() / ddec)
        .floor()
        .to_i64()
        .unwrap_or(0)
        .max(0);
    let radius = field_radius(nominal, width, height);

    let mut solver_config = config.solver.clone();
    solver_config.image_size = Some((width, height));
    solver_config.crpix = None;
    let min_pairs = solver_config.fit.min_pairs;

    info!("Hunting in {} rings around the nominal center.", rings + 1);
    let mut tried = 0;
    let mut failures = 0;
    let mut last_failure = None;
    for (ra, dec) in spiral(nominal.ra, nominal.dec, dra, ddec, rings) {
        if progress(tried).is_break() {
            info!("Hunt cancelled after {tried} trial centers.");
            return Err(SolveError::Cancelled);
        }
        tried += 1;

        let radecs = match fetch(catalog, ra, dec, radius, config) {
            Ok(radecs) => radecs,
            Err(e) => {
                warn!("Skipping trial center {tried}: {e}");
                failures += 1;
                last_failure = Some(e);
                continue;
            }
        };
        if radecs.nrows() < min_pairs {
            debug!("Skipping trial center with {} stars.", radecs.nrows());
            continue;
        }

        let trial = WcsParams { ra, dec, ..*nominal };
        let solver = PlateSolver::new(image.to_owned(), radecs)
            .with_config(solver_config.clone())
            .with_minimizer(config.minimizer.clone());
        let first = match solver.solve(&trial) {
            Ok(reg) => reg,
            Err(e) => {
                debug!("Trial center {tried}: {e}");
                continue;
            }
        };
        info!("Found a solution at trial center {tried}.");
        return Ok(nail(image, (width, height), first, catalog, config, &solver_config));
    }

    match last_failure {
        Some(e) if failures == tried => {
            warn!("Catalog failed at all {tried} trial centers.");
            Err(SolveError::Catalog(e))
        }
        _ => {
            info!("No solution at {tried} trial centers.");
            Err(SolveError::NoSolution { tried })
        }
    }
}

/// Solve once more around the center of `first`, which usually pulls in more reference stars.
///
/// Falls back to `first` if that fails.
fn nail<F, C>(
    image: ArrayView2<F>,
    (width, height): (usize, usize),
    first: Registration<F>,
    catalog: &mut C,
    config: &HuntConfig,
    solver_config: &SolverConfig,
) -> Registration<F>
where
    F: Float,
    C: Catalog<F>,
{
    let params = first.wcs.params;
    let radius = field_radius(&params, width, height);
    let radecs = match fetch(catalog, params.ra, params.dec, radius, config) {
        Ok(radecs) => radecs,
        Err(e) => {
            debug!("Keeping the first solution: {e}");
            return first;
        }
    };

    let solver = PlateSolver::new(image.to_owned(), radecs)
        .with_config(solver_config.clone())
        .with_minimizer(config.minimizer.clone());
    match solver.solve(&params) {
        Ok(nailed) => nailed,
        Err(e) => {
            debug!("Keeping the first solution: {e}");
            first
        }
    }
}

/// Plate solve a raw frame whose header holds an approximate solution.
///
/// The nominal pointing, rotation and scales are read from `header`. The brightest detected
/// candidates are centroided and hunted for around it. On success the solution is written
/// back to `header`; on failure `header` is left untouched.
///
/// # Errors
/// [`SolveError::MissingHeaderField`] without a nominal pointing,
/// [`SolveError::InsufficientData`] if fewer candidates than the minimum pairs are found, and
/// every error of [`hunt`].
pub fn solve_frame<F, G, H, C, P>(
    grid: &G,
    header: &mut H,
    catalog: &mut C,
    detector: &Detector,
    config: &HuntConfig,
    progress: P,
) -> Result<Registration<F>, SolveError>
where
    F: Float,
    G: PixelGrid,
    H: WcsHeader + ?Sized,
    C: Catalog<F>,
    P: FnMut(usize) -> ControlFlow<()>,
{
    let nominal = nominal_from_header::<F, H>(header)?;

    let candidates = detector.detect(grid);
    let required = config.solver.fit.min_pairs.max(1);
    if candidates.len() < required {
        return Err(SolveError::InsufficientData {
            found: candidates.len(),
            required,
        });
    }
    let candidates = brightest(candidates, config.solver.max_image_points);
    let points = detector.centroids::<F, G>(grid, &candidates);

    let size = (grid.width(), grid.height());
    let reg = hunt(points.view(), size, &nominal, catalog, config, progress)?;
    info!("Writing the solution to the header.");
    reg.wcs.write_header(header);
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use approx::assert_abs_diff_eq;
    use nalgebra::Vector2;
    use rand::prelude::*;
    use simplelog::{Config, LevelFilter, TestLogger};

    use super::*;
    use crate::detection::tests::{add_star_at, noisy_frame};
    use crate::header::has_wcs;
    use crate::wcs::Wcs;

    /// Every star of a fixed list within the requested radius.
    struct MockCatalog {
        stars: Vec<CatalogStar<f64>>,
        queries: usize,
    }

    impl MockCatalog {
        fn new(stars: Vec<CatalogStar<f64>>) -> Self {
            Self { stars, queries: 0 }
        }
    }

    fn separation(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
        let c = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * (ra1 - ra2).cos();
        c.clamp(-1., 1.).acos()
    }

    impl Catalog<f64> for MockCatalog {
        fn stars(
            &mut self,
            ra: f64,
            dec: f64,
            radius: f64,
            faint_limit: f64,
        ) -> Result<Vec<CatalogStar<f64>>, CatalogError> {
            self.queries += 1;
            Ok(self
                .stars
                .iter()
                .filter(|s| s.magnitude <= faint_limit)
                .filter(|s| separation(ra, dec, s.ra, s.dec) <= radius)
                .copied()
                .collect())
        }
    }

    /// Fails the first `failures` queries, then answers from `inner`.
    struct FlakyCatalog {
        inner: MockCatalog,
        failures: usize,
        queries: usize,
    }

    impl FlakyCatalog {
        fn new(inner: MockCatalog, failures: usize) -> Self {
            Self {
                inner,
                failures,
                queries: 0,
            }
        }
    }

    impl Catalog<f64> for FlakyCatalog {
        fn stars(
            &mut self,
            ra: f64,
            dec: f64,
            radius: f64,
            faint_limit: f64,
        ) -> Result<Vec<CatalogStar<f64>>, CatalogError> {
            self.queries += 1;
            if self.queries <= self.failures {
                return Err(CatalogError("offline".to_string()));
            }
            self.inner.stars(ra, dec, radius, faint_limit)
        }
    }

    const POINTS: [[f64; 2]; 12] = [
        [70., 90.],
        [410., 60.],
        [250., 200.],
        [120., 330.],
        [380., 300.],
        [300., 450.],
        [60., 460.],
        [200., 110.],
        [460., 200.],
        [160., 220.],
        [330., 380.],
        [440., 470.],
    ];

    fn image() -> Array2<f64> {
        Array2::from_shape_fn((POINTS.len(), 2), |(i, j)| POINTS[i][j])
    }

    fn scale() -> f64 {
        2f64.to_radians() / 3600.
    }

    fn nominal() -> WcsParams<f64> {
        WcsParams::new(1.2, 0.5, 0., -scale(), scale())
    }

    /// The sky half a degree north of the nominal center, rotated by a degree.
    fn truth() -> Wcs<f64> {
        let s = scale();
        Wcs::centered(
            WcsParams::new(1.2, 0.5 + 0.5f64.to_radians(), 1f64.to_radians(), -s, s),
            512,
            512,
        )
    }

    fn sky() -> Vec<CatalogStar<f64>> {
        sky_of(&image())
    }

    /// Catalog stars under every image point, fainter down the rows, and one bright star.
    fn sky_of(image: &Array2<f64>) -> Vec<CatalogStar<f64>> {
        let truth = truth();
        let mut stars = image
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let (x, y) = (row[0], row[1]);
                let radec = truth.pixel_to_world(Vector2::new(x, y)).unwrap();
                CatalogStar {
                    ra: radec.x,
                    dec: radec.y,
                    magnitude: 8. + i as f64 * 0.2,
                }
            })
            .collect::<Vec<_>>();
        // too bright to be in the image
        let center = truth.image_center(512, 512).unwrap();
        stars.push(CatalogStar {
            ra: center.x,
            dec: center.y,
            magnitude: 3.,
        });
        stars
    }

    fn init_logger() {
        let _ = TestLogger::init(LevelFilter::Debug, Config::default());
    }

    #[test]
    fn spiral_order() {
        let centers = spiral(1., 0.2, 0.1, 0.05, 2).collect::<Vec<_>>();
        assert_eq!(centers.len(), 25);
        assert_eq!(centers[0], (1., 0.2));
        // first ring starts at its south west corner
        assert_abs_diff_eq!(centers[1].0, 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(centers[1].1, 0.15, epsilon = 1e-12);
        assert!(centers.iter().all(|(ra, _)| (0.0..std::f64::consts::TAU).contains(ra)));
    }

    #[test]
    fn spiral_over_the_pole() {
        let centers = spiral(0.1, 1.5, 0.2, 0.1, 1).collect::<Vec<_>>();
        let (ra, dec) = centers[3];
        // i = -1, j = 1 crosses the pole
        assert_abs_diff_eq!(dec, std::f64::consts::PI - 1.6, epsilon = 1e-12);
        assert_abs_diff_eq!(ra, 0.1 - 0.2 + std::f64::consts::PI, epsilon = 1e-12);

        let centers = spiral(0.05, 0., 0.1, 0.1, 1).collect::<Vec<_>>();
        assert_abs_diff_eq!(centers[1].0, std::f64::consts::TAU - 0.05, epsilon = 1e-12);
    }

    #[test]
    fn finds_offset_field() {
        init_logger();
        let mut catalog = MockCatalog::new(sky());
        let config = HuntConfig::default();
        let mut calls = 0;

        let reg = hunt(image().view(), (512, 512), &nominal(), &mut catalog, &config, |_| {
            calls += 1;
            ControlFlow::Continue(())
        })
        .unwrap();

        assert!(calls > 1);
        assert_eq!(catalog.queries, calls + 1);
        assert!(reg.median_residual < 0.5);
        assert_eq!(reg.matched, POINTS.len());
        let expected = truth().image_center(512, 512).unwrap();
        let found = reg.wcs.image_center(512, 512).unwrap();
        assert!(separation(expected.x, expected.y, found.x, found.y) < scale());
        assert_abs_diff_eq!(reg.wcs.params.rotation.to_degrees(), 1., epsilon = 0.05);
    }

    #[test]
    fn cancelled() {
        let mut catalog = MockCatalog::new(sky());
        let result = hunt(
            image().view(),
            (512, 512),
            &nominal(),
            &mut catalog,
            &HuntConfig::default(),
            |tried| {
                if tried == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        assert_eq!(result, Err(SolveError::Cancelled));
        assert_eq!(catalog.queries, 2);
    }

    #[test]
    fn empty_sky() {
        let mut catalog = MockCatalog::new(Vec::new());
        let config = HuntConfig::default().with_radius(0.3f64.to_radians());
        let result = hunt(image().view(), (512, 512), &nominal(), &mut catalog, &config, |_| {
            ControlFlow::Continue(())
        });
        // steps of 0.0939 degrees, three rings around the center
        assert_eq!(result, Err(SolveError::NoSolution { tried: 49 }));
    }

    #[test]
    fn catalog_down_everywhere() {
        let mut catalog = FlakyCatalog::new(MockCatalog::new(sky()), usize::MAX);
        let config = HuntConfig::default().with_radius(0.3f64.to_radians());
        let result = hunt(image().view(), (512, 512), &nominal(), &mut catalog, &config, |_| {
            ControlFlow::Continue(())
        });
        assert_eq!(result, Err(SolveError::Catalog(CatalogError("offline".to_string()))));
        assert_eq!(catalog.queries, 49);
    }

    #[test]
    fn skips_failed_queries() {
        init_logger();
        let mut catalog = FlakyCatalog::new(MockCatalog::new(sky()), 3);
        let reg = hunt(
            image().view(),
            (512, 512),
            &nominal(),
            &mut catalog,
            &HuntConfig::default(),
            |_| ControlFlow::Continue(()),
        )
        .unwrap();

        assert!(catalog.queries > 4);
        let expected = truth().image_center(512, 512).unwrap();
        let found = reg.wcs.image_center(512, 512).unwrap();
        assert!(separation(expected.x, expected.y, found.x, found.y) < scale());
    }

    #[test]
    fn image_points_stay_capped() {
        let mut rng = StdRng::seed_from_u64(5);
        let image = Array2::from_shape_simple_fn((40, 2), || rng.random_range(40.0..472.));
        let mut catalog = MockCatalog::new(sky_of(&image));
        let config = HuntConfig::default();
        assert_eq!(config.solver.max_image_points, 25);

        let reg = hunt(image.view(), (512, 512), &nominal(), &mut catalog, &config, |_| {
            ControlFlow::Continue(())
        })
        .unwrap();

        assert!(reg.pairs.len() >= config.solver.fit.min_pairs);
        assert!(reg.pairs.iter().all(|p| p.image < 25));
        let expected = truth().image_center(512, 512).unwrap();
        let found = reg.wcs.image_center(512, 512).unwrap();
        assert!(separation(expected.x, expected.y, found.x, found.y) < scale());
    }

    /// A 512 pixel frame with a star under every image point, brightest first.
    fn frame() -> Array2<u16> {
        let mut frame = noisy_frame(512, 512, 31);
        for (i, [x, y]) in POINTS.iter().enumerate() {
            add_star_at(&mut frame, x + 0.3, y - 0.2, 8000. - 400. * i as f64, 1.5);
        }
        frame
    }

    fn nominal_header() -> HashMap<String, f64> {
        let n = nominal();
        HashMap::from([
            ("CRVAL1".to_string(), n.ra.to_degrees()),
            ("CRVAL2".to_string(), n.dec.to_degrees()),
            ("CDELT1".to_string(), n.x_scale.to_degrees()),
            ("CDELT2".to_string(), n.y_scale.to_degrees()),
        ])
    }

    #[test]
    fn solves_raw_frame() {
        init_logger();
        let shifted = Array2::from_shape_fn((POINTS.len(), 2), |(i, j)| {
            POINTS[i][j] + if j == 0 { 0.3 } else { -0.2 }
        });
        let mut catalog = MockCatalog::new(sky_of(&shifted));
        let mut header = nominal_header();
        assert!(!has_wcs(&header));

        let reg = solve_frame(
            &frame(),
            &mut header,
            &mut catalog,
            &Detector::default(),
            &HuntConfig::default(),
            |_| ControlFlow::Continue(()),
        )
        .unwrap();

        assert!(has_wcs(&header));
        assert!(reg.median_residual < 0.5);
        assert_eq!(reg.wcs.crpix, Vector2::new(256., 256.));
        let t = truth().params;
        assert_abs_diff_eq!(header["CRVAL1"], t.ra.to_degrees(), epsilon = 1e-3);
        assert_abs_diff_eq!(header["CRVAL2"], t.dec.to_degrees(), epsilon = 1e-3);
        assert_abs_diff_eq!(header["CROTA2"], 1., epsilon = 0.05);
        assert_abs_diff_eq!(header["CRPIX1"], 256.);
    }

    #[test]
    fn raw_frame_without_stars() {
        let mut catalog = MockCatalog::new(sky());
        let mut header = nominal_header();
        let result = solve_frame::<f64, _, _, _, _>(
            &noisy_frame(512, 512, 37),
            &mut header,
            &mut catalog,
            &Detector::default(),
            &HuntConfig::default(),
            |_| ControlFlow::Continue(()),
        );
        assert_eq!(
            result,
            Err(SolveError::InsufficientData {
                found: 0,
                required: 4
            })
        );
        assert!(!has_wcs(&header));
        assert_eq!(catalog.queries, 0);

        header.remove("CRVAL1");
        let result = solve_frame::<f64, _, _, _, _>(
            &frame(),
            &mut header,
            &mut catalog,
            &Detector::default(),
            &HuntConfig::default(),
            |_| ControlFlow::Continue(()),
        );
        assert_eq!(result, Err(SolveError::MissingHeaderField("CRVAL1")));
    }
}
