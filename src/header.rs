//! Reading and writing solutions through the named real values of an image header.
//!
//! Angles are stored in degrees as usual in FITS headers.

use std::collections::HashMap;

use nalgebra::Vector2;

use crate::Float;
use crate::error::SolveError;
use crate::wcs::{Wcs, WcsParams};

/// Access to the real valued fields of an image header, e.g. a FITS header.
pub trait WcsHeader {
    /// Value of the field `key`, if present.
    fn get_real(&self, key: &str) -> Option<f64>;

    /// Set the field `key`, optionally with a comment.
    fn set_real(&mut self, key: &str, value: f64, comment: Option<&str>);
}

impl WcsHeader for HashMap<String, f64> {
    fn get_real(&self, key: &str) -> Option<f64> {
        self.get(key).copied()
    }

    fn set_real(&mut self, key: &str, value: f64, _comment: Option<&str>) {
        self.insert(key.to_string(), value);
    }
}

/// All fields of a complete solution.
const WCS_FIELDS: [&str; 8] = [
    "CRVAL1", "CRVAL2", "CDELT1", "CDELT2", "CRPIX1", "CRPIX2", "CROTA1", "CROTA2",
];

/// Whether `header` carries every field of a solution.
pub fn has_wcs<H: WcsHeader + ?Sized>(header: &H) -> bool {
    WCS_FIELDS.iter().all(|k| header.get_real(k).is_some())
}

fn field<H: WcsHeader + ?Sized>(header: &H, key: &'static str) -> Result<f64, SolveError> {
    header
        .get_real(key)
        .ok_or(SolveError::MissingHeaderField(key))
}

fn from_degrees<F: Float, H: WcsHeader + ?Sized>(
    header: &H,
    key: &'static str,
) -> Result<F, SolveError> {
    Ok(F::from_f64(field(header, key)?.to_radians()).unwrap())
}

/// Read the pointing, rotation and scale of a header as the nominal guess for a solve.
///
/// Only `CRVAL1/2`, `CDELT1/2` and `CROTA2` are needed. A missing `CROTA2` counts as no rotation.
pub fn nominal_from_header<F: Float, H: WcsHeader + ?Sized>(
    header: &H,
) -> Result<WcsParams<F>, SolveError> {
    let rotation = header.get_real("CROTA2").unwrap_or(0.).to_radians();
    Ok(WcsParams::new(
        from_degrees(header, "CRVAL1")?,
        from_degrees(header, "CRVAL2")?,
        F::from_f64(rotation).unwrap(),
        from_degrees(header, "CDELT1")?,
        from_degrees(header, "CDELT2")?,
    ))
}

impl<F: Float> Wcs<F> {
    /// Write the solution to `header`.
    pub fn write_header<H: WcsHeader + ?Sized>(&self, header: &mut H) {
        let deg = |v: F| v.to_f64().unwrap().to_degrees();
        let p = &self.params;

        header.set_real("CRVAL1", deg(p.ra), Some("RA at CRPIX1, degrees"));
        header.set_real("CDELT1", deg(p.x_scale), Some("RA step right, degrees/pixel"));
        header.set_real(
            "CRPIX1",
            self.crpix.x.to_f64().unwrap(),
            Some("RA reference pixel index, 1-based"),
        );
        header.set_real("CROTA1", 0., None);

        header.set_real("CRVAL2", deg(p.dec), Some("Dec at CRPIX2, degrees"));
        header.set_real("CDELT2", deg(p.y_scale), Some("Dec step down, degrees/pixel"));
        header.set_real(
            "CRPIX2",
            self.crpix.y.to_f64().unwrap(),
            Some("Dec reference pixel index, 1-based"),
        );
        header.set_real("CROTA2", deg(p.rotation), Some("Rotation N through E, degrees"));
    }

    /// Read a complete solution from `header`.
    pub fn from_header<H: WcsHeader + ?Sized>(header: &H) -> Result<Self, SolveError> {
        let params = WcsParams::new(
            from_degrees(header, "CRVAL1")?,
            from_degrees(header, "CRVAL2")?,
            from_degrees(header, "CROTA2")?,
            from_degrees(header, "CDELT1")?,
            from_degrees(header, "CDELT2")?,
        );
        let crpix = Vector2::new(
            F::from_f64(field(header, "CRPIX1")?).unwrap(),
            F::from_f64(field(header, "CRPIX2")?).unwrap(),
        );
        Ok(Wcs::new(params, crpix))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn round_trip() {
        let wcs = Wcs::new(
            WcsParams::new(1.2, -0.4, 0.05, -9.7e-6, 9.8e-6),
            Vector2::new(512., 384.5),
        );
        let mut header: HashMap<String, f64> = HashMap::new();
        assert!(!has_wcs(&header));

        wcs.write_header(&mut header);
        assert!(has_wcs(&header));
        assert_abs_diff_eq!(header["CRVAL1"], 1.2f64.to_degrees());
        assert_eq!(header["CROTA1"], 0.);

        let read = Wcs::<f64>::from_header(&header).unwrap();
        assert_abs_diff_eq!(read.params.ra, wcs.params.ra, epsilon = 1e-15);
        assert_abs_diff_eq!(read.params.dec, wcs.params.dec, epsilon = 1e-15);
        assert_abs_diff_eq!(read.params.rotation, wcs.params.rotation, epsilon = 1e-15);
        assert_abs_diff_eq!(read.params.x_scale, wcs.params.x_scale, epsilon = 1e-18);
        assert_abs_diff_eq!(read.params.y_scale, wcs.params.y_scale, epsilon = 1e-18);
        assert_eq!(read.crpix, wcs.crpix);
    }

    #[test]
    fn missing_field() {
        let mut header: HashMap<String, f64> = HashMap::new();
        header.insert("CRVAL1".to_string(), 10.);
        header.insert("CRVAL2".to_string(), 20.);
        header.insert("CDELT1".to_string(), -3e-4);

        assert_eq!(
            nominal_from_header::<f64, _>(&header),
            Err(SolveError::MissingHeaderField("CDELT2"))
        );

        header.insert("CDELT2".to_string(), 3e-4);
        let nominal = nominal_from_header::<f64, _>(&header).unwrap();
        assert_abs_diff_eq!(nominal.ra, 10f64.to_radians());
        assert_eq!(nominal.rotation, 0.);

        assert_eq!(
            Wcs::<f64>::from_header(&header),
            Err(SolveError::MissingHeaderField("CROTA2"))
        );
    }
}
