//! A collection of various utilities needed in this library.
//! The two main groups are `nalgebra` to `ndarray` conversions,
//! inspired by [`nshare`](https://github.com/rust-cv/nshare);
//! and common operations on arrays.

use nalgebra::allocator::Allocator;
use nalgebra::{DefaultAllocator, Dim, Matrix, Scalar, Storage};
use ndarray::{Array, Array2, ArrayView, Axis, Dimension, RemoveAxis, ShapeBuilder};

use crate::Float;

/// Conversion of point sets into an `ndarray` matrix of shape `(n_points, 2)`.
pub trait IntoNdarray2 {
    /// Resulting array type.
    type Out;

    /// Perform the conversion.
    fn into_ndarray2(self) -> Self::Out;
}

impl<N: Scalar> IntoNdarray2 for Array2<N> {
    type Out = Array2<N>;

    fn into_ndarray2(self) -> Self::Out {
        self
    }
}

impl<N: Scalar, C: Dim, R: Dim, S: Storage<N, R, C>> IntoNdarray2 for Matrix<N, R, C, S>
where
    DefaultAllocator: Allocator<R, C, Buffer<N> = S>,
{
    type Out = Array2<N>;

    fn into_ndarray2(self) -> Self::Out {
        Array2::from_shape_vec(
            self.shape().strides(self.strides()),
            self.into_iter().cloned().collect(),
        )
        .unwrap()
    }
}

pub(crate) fn norm_axis<F, D, Di>(arr: ArrayView<F, Di>, axis: Axis) -> Array<F, D>
where
    F: Float,
    D: Dimension,
    Di: RemoveAxis<Smaller = D>,
{
    let norm_sq = arr.map(|x| *x * *x).sum_axis(axis);
    norm_sq.map(|x| x.sqrt())
}

pub(crate) fn min_axis<F, D, Di>(arr: ArrayView<'_, F, Di>, axis: Axis) -> Array<F, D>
where
    F: Float,
    D: Dimension,
    Di: RemoveAxis<Smaller = D>,
{
    arr.map_axis(axis, |a| {
        a.iter()
            .copied()
            .reduce(|f1, f2| f1.min(f2))
            .unwrap_or_else(|| F::from_f64(f64::INFINITY).unwrap())
    })
}

/// The upper median: element `n / 2` of the sorted values. `None` for no values.
pub(crate) fn upper_median<F: Float>(values: impl IntoIterator<Item = F>) -> Option<F> {
    let mut sorted = values.into_iter().collect::<Vec<_>>();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted.get(sorted.len() / 2).copied()
}
