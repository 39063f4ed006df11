//! Tangent plane (gnomonic) projection of the World Coordinate System standard,
//! following the AIPS conventions of `CROTA2` and per-axis `CDELT`.

use nalgebra::Vector2;

use crate::Float;
use crate::geometry::wrap_two_pi;

/// The free parameters of a plate solution. All angles in radians.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WcsParams<F: Float> {
    /// Right ascension of the reference pixel.
    pub ra: F,
    /// Declination of the reference pixel.
    pub dec: F,
    /// Rotation of the image, north through east.
    pub rotation: F,
    /// Size of a pixel along x, radians per pixel. Usually negative (east to the left).
    pub x_scale: F,
    /// Size of a pixel along y, radians per pixel.
    pub y_scale: F,
}

impl<F: Float> WcsParams<F> {
    /// Create a new instance.
    pub fn new(ra: F, dec: F, rotation: F, x_scale: F, y_scale: F) -> Self {
        Self {
            ra,
            dec,
            rotation,
            x_scale,
            y_scale,
        }
    }

    /// Parameters as a vector `(ra, dec, rotation, x_scale, y_scale)`.
    pub(crate) fn to_vector(self) -> nalgebra::SVector<F, 5> {
        nalgebra::SVector::<F, 5>::new(self.ra, self.dec, self.rotation, self.x_scale, self.y_scale)
    }

    pub(crate) fn from_vector(v: &nalgebra::SVector<F, 5>) -> Self {
        Self::new(v[0], v[1], v[2], v[3], v[4])
    }
}

/// A complete tangent plane projection: [`WcsParams`] at a reference pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Wcs<F: Float> {
    /// Sky position, rotation and scale.
    pub params: WcsParams<F>,
    /// Reference pixel, 1-based as in FITS headers.
    pub crpix: Vector2<F>,
}

impl<F: Float> Wcs<F> {
    /// Create a new instance.
    pub fn new(params: WcsParams<F>, crpix: Vector2<F>) -> Self {
        Self { params, crpix }
    }

    /// Projection with the reference pixel at the center of a `width` by `height` image.
    pub fn centered(params: WcsParams<F>, width: usize, height: usize) -> Self {
        let two = F::from_f64(2.).unwrap();
        let crpix = Vector2::new(
            F::from_usize(width).unwrap() / two,
            F::from_usize(height).unwrap() / two,
        );
        Self { params, crpix }
    }

    /// Transforms from sky coordinates `(ra, dec)` to 0-based pixel space.
    ///
    /// Returns `None` for directions on or behind the tangent plane, and for a zero scale.
    pub fn world_to_pixel(&self, radec: Vector2<F>) -> Option<Vector2<F>> {
        let zero = F::from_f64(0.).unwrap();
        let one = F::from_f64(1.).unwrap();
        let p = &self.params;
        if p.x_scale == zero || p.y_scale == zero {
            return None;
        }

        let (sin_d0, cos_d0) = p.dec.sin_cos();
        let (sin_d, cos_d) = radec.y.sin_cos();
        let (sin_da, cos_da) = (radec.x - p.ra).sin_cos();

        let s = sin_d * sin_d0 + cos_d * cos_d0 * cos_da;
        if s <= zero {
            return None;
        }
        let l = sin_da * cos_d / s;
        let m = (sin_d * cos_d0 - cos_d * sin_d0 * cos_da) / s;

        let (sin_r, cos_r) = p.rotation.sin_cos();
        let dx = l * cos_r + m * sin_r;
        let dy = m * cos_r - l * sin_r;

        let pixel = Vector2::new(
            dx / p.x_scale + self.crpix.x - one,
            dy / p.y_scale + self.crpix.y - one,
        );
        (pixel.x.is_finite() && pixel.y.is_finite()).then_some(pixel)
    }

    /// Transforms from 0-based pixel space to sky coordinates `(ra, dec)`, `ra` in `[0, 2π)`.
    ///
    /// Returns `None` if the result is not finite.
    pub fn pixel_to_world(&self, pixel: Vector2<F>) -> Option<Vector2<F>> {
        let one = F::from_f64(1.).unwrap();
        let p = &self.params;

        let dx = (pixel.x + one - self.crpix.x) * p.x_scale;
        let dy = (pixel.y + one - self.crpix.y) * p.y_scale;
        let (sin_r, cos_r) = p.rotation.sin_cos();
        let l = dx * cos_r - dy * sin_r;
        let m = dy * cos_r + dx * sin_r;

        let (sin_d0, cos_d0) = p.dec.sin_cos();
        let dect = cos_d0 - m * sin_d0;
        let ra = wrap_two_pi(p.ra + l.atan2(dect));
        let dec = (m * cos_d0 + sin_d0).atan2(l.hypot(dect));

        let radec = Vector2::new(ra, dec);
        (ra.is_finite() && dec.is_finite()).then_some(radec)
    }

    /// Sky position of the center of a `width` by `height` image.
    pub fn image_center(&self, width: usize, height: usize) -> Option<Vector2<F>> {
        let two = F::from_f64(2.).unwrap();
        let one = F::from_f64(1.).unwrap();
        self.pixel_to_world(Vector2::new(
            F::from_usize(width).unwrap() / two - one,
            F::from_usize(height).unwrap() / two - one,
        ))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;

    use super::*;

    fn random_wcs(rng: &mut StdRng) -> Wcs<f64> {
        let scale = rng.random_range(1e-6..1e-4);
        let flip = if rng.random_bool(0.5) { -1. } else { 1. };
        let params = WcsParams::new(
            rng.random_range(0.5..5.5),
            rng.random_range(-1.3..1.3),
            rng.random_range(-std::f64::consts::PI..std::f64::consts::PI),
            flip * scale * rng.random_range(0.9..1.1),
            scale,
        );
        Wcs::new(
            params,
            Vector2::new(rng.random_range(0.0..2048.), rng.random_range(0.0..2048.)),
        )
    }

    #[test]
    fn pixel_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let wcs = random_wcs(&mut rng);
            let pixel = Vector2::new(rng.random_range(0.0..2048.), rng.random_range(0.0..2048.));

            let radec = wcs.pixel_to_world(pixel).unwrap();
            let back = wcs.world_to_pixel(radec).unwrap();

            assert_abs_diff_eq!(back.x, pixel.x, epsilon = 1e-6);
            assert_abs_diff_eq!(back.y, pixel.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn world_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let wcs = random_wcs(&mut rng);
            let p = wcs.params;
            let radec = Vector2::new(
                p.ra + rng.random_range(-0.05..0.05) / p.dec.cos(),
                p.dec + rng.random_range(-0.05..0.05),
            );

            let pixel = wcs.world_to_pixel(radec).unwrap();
            let back = wcs.pixel_to_world(pixel).unwrap();

            assert_abs_diff_eq!(back.x, radec.x, epsilon = 1e-9);
            assert_abs_diff_eq!(back.y, radec.y, epsilon = 1e-9);
        }
    }

    #[test]
    fn reference_pixel() {
        let params = WcsParams::new(1.2, 0.5, 0.3, -1e-5, 1e-5);
        let wcs = Wcs::centered(params, 512, 400);
        assert_eq!(wcs.crpix, Vector2::new(256., 200.));

        let pixel = wcs.world_to_pixel(Vector2::new(1.2, 0.5)).unwrap();
        assert_abs_diff_eq!(pixel.x, 255., epsilon = 1e-9);
        assert_abs_diff_eq!(pixel.y, 199., epsilon = 1e-9);

        let center = wcs.image_center(512, 400).unwrap();
        assert_abs_diff_eq!(center.x, 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(center.y, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn orientation() {
        // north up, east left
        let params = WcsParams::new(1., 0., 0., -1e-4, 1e-4);
        let wcs = Wcs::new(params, Vector2::new(1., 1.));

        let north = wcs.world_to_pixel(Vector2::new(1., 1e-3)).unwrap();
        assert_abs_diff_eq!(north.x, 0., epsilon = 1e-6);
        assert!(north.y > 9.9);

        let east = wcs.world_to_pixel(Vector2::new(1. + 1e-3, 0.)).unwrap();
        assert!(east.x < -9.9);
        assert_abs_diff_eq!(east.y, 0., epsilon = 1e-6);

        // a quarter turn moves north onto the x axis
        let rotated = Wcs::new(
            WcsParams::new(1., 0., std::f64::consts::FRAC_PI_2, -1e-4, 1e-4),
            Vector2::new(1., 1.),
        );
        let north = rotated.world_to_pixel(Vector2::new(1., 1e-3)).unwrap();
        assert!(north.x < -9.9);
        assert_abs_diff_eq!(north.y, 0., epsilon = 1e-6);
    }

    #[test]
    fn behind_tangent_plane() {
        let wcs = Wcs::new(WcsParams::new(0., 0., 0., -1e-5, 1e-5), Vector2::new(1., 1.));
        assert!(wcs.world_to_pixel(Vector2::new(std::f64::consts::PI, 0.)).is_none());
        assert!(wcs.world_to_pixel(Vector2::new(2., 0.)).is_none());
        assert!(wcs.world_to_pixel(Vector2::new(0., -2.)).is_none());
        assert!(wcs.world_to_pixel(Vector2::new(0.1, 0.)).is_some());
    }

    #[test]
    fn zero_scale() {
        let wcs = Wcs::new(WcsParams::new(0., 0., 0., 0., 1e-5), Vector2::new(1., 1.));
        assert!(wcs.world_to_pixel(Vector2::new(0., 0.)).is_none());
    }

    #[test]
    fn ra_stays_in_range() {
        let wcs = Wcs::new(WcsParams::new(0.001f64, 0., 0., -1e-4, 1e-4), Vector2::new(1., 1.));
        let radec = wcs.pixel_to_world(Vector2::new(100., 0.)).unwrap();
        assert!(radec.x > 6. && radec.x < std::f64::consts::TAU);

        let f32_wcs = Wcs::new(WcsParams::new(1f32, 0.2, 0.1, -1e-4, 1e-4), Vector2::new(1., 1.));
        let radec = f32_wcs.pixel_to_world(Vector2::new(10., 10.)).unwrap();
        let pixel = f32_wcs.world_to_pixel(radec).unwrap();
        assert_abs_diff_eq!(pixel.x, 10., epsilon = 1e-2);
    }

    #[test]
    fn ra_outside_one_turn() {
        use std::f64::consts::TAU;

        for ra in [7., -7., 20., -0.5] {
            let wcs = Wcs::new(WcsParams::new(ra, 0.2, 0., -1e-5, 1e-5), Vector2::new(1., 1.));
            let radec = wcs.pixel_to_world(Vector2::new(0., 0.)).unwrap();
            assert!((0. ..TAU).contains(&radec.x), "{ra} -> {}", radec.x);
            assert_abs_diff_eq!(radec.x, ra.rem_euclid(TAU), epsilon = 1e-12);
            assert_abs_diff_eq!(radec.y, 0.2, epsilon = 1e-12);
        }
    }
}
