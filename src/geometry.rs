use nalgebra::Vector2;
use ndarray::ArrayView2;

use crate::Float;

/// Direction of the segment from `from` to `to`, counter-clockwise from the x axis.
pub(crate) fn bearing<F: Float>(from: &Vector2<F>, to: &Vector2<F>) -> F {
    (to.y - from.y).atan2(to.x - from.x)
}

/// Wrap `angle` into `[-π, π]`.
pub(crate) fn wrap_angle<F: Float>(angle: F) -> F {
    let pi = F::pi();
    let two_pi = F::two_pi();
    let mut a = angle % two_pi;
    if a > pi {
        a -= two_pi;
    } else if a < -pi {
        a += two_pi;
    }
    a
}

/// Wrap `angle` into `[0, 2π)`.
pub(crate) fn wrap_two_pi<F: Float>(angle: F) -> F {
    let two_pi = F::two_pi();
    let mut a = angle % two_pi;
    if a < F::from_f64(0.).unwrap() {
        a += two_pi;
    }
    // a tiny negative remainder rounds up to 2π
    if a >= two_pi {
        a -= two_pi;
    }
    a
}

/// Center of the bounding box of `points`. Shape `(n_points, 2)`.
pub(crate) fn bounding_box_center<F: Float>(points: ArrayView2<F>) -> Option<Vector2<F>> {
    let xs = points.column(0);
    let ys = points.column(1);
    let xmin = xs.iter().copied().reduce(|f1, f2| f1.min(f2))?;
    let xmax = xs.iter().copied().reduce(|f1, f2| f1.max(f2))?;
    let ymin = ys.iter().copied().reduce(|f1, f2| f1.min(f2))?;
    let ymax = ys.iter().copied().reduce(|f1, f2| f1.max(f2))?;
    Some(Vector2::new(
        (xmin + xmax) / F::from_f64(2.).unwrap(),
        (ymin + ymax) / F::from_f64(2.).unwrap(),
    ))
}
