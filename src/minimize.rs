//! Derivative-free minimization.

use log::debug;
use nalgebra::SVector;

use crate::Float;
use crate::error::SolveError;

/// Result of a successful minimization.
#[derive(Clone, Debug, PartialEq)]
pub struct Minimum<F: Float, const D: usize> {
    /// Location of the minimum.
    pub point: SVector<F, D>,
    /// Objective value at `point`.
    pub value: F,
    /// Number of objective evaluations spent.
    pub evaluations: usize,
}

/// A minimizer of functions of `D` parameters.
///
/// The objective may return `+∞` to mark forbidden points.
pub trait Minimizer<F: Float> {
    /// Minimize `objective` starting from `p0`.
    ///
    /// `p1` sets the initial step per parameter: its `i`-th component replaces the `i`-th
    /// component of `p0` to span the search. `ftol` is the fractional tolerance on the
    /// objective value at which the search stops.
    fn minimize<const D: usize, O>(
        &self,
        objective: O,
        p0: SVector<F, D>,
        p1: SVector<F, D>,
        ftol: F,
    ) -> Result<Minimum<F, D>, SolveError>
    where
        O: FnMut(&SVector<F, D>) -> F;
}

/// The downhill simplex method of Nelder and Mead.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NelderMead {
    /// Budget of objective evaluations.
    pub max_evaluations: usize,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_evaluations: 5000,
        }
    }
}

impl NelderMead {
    /// Create a new instance with an evaluation budget.
    pub fn new(max_evaluations: usize) -> Self {
        Self { max_evaluations }
    }
}

/// Simplex of `D + 1` vertices and their objective values.
struct Simplex<F: Float, const D: usize> {
    vertices: Vec<SVector<F, D>>,
    values: Vec<F>,
}

impl<F: Float, const D: usize> Simplex<F, D> {
    /// Indices of the lowest, highest and second highest vertex.
    fn ranks(&self) -> (usize, usize, usize) {
        let y = &self.values;
        let mut lo = 0;
        let (mut hi, mut next_hi) = if y[0] > y[1] { (0, 1) } else { (1, 0) };
        for (i, &v) in y.iter().enumerate() {
            if v <= y[lo] {
                lo = i;
            }
            if v > y[hi] {
                next_hi = hi;
                hi = i;
            } else if v > y[next_hi] && i != hi {
                next_hi = i;
            }
        }
        (lo, hi, next_hi)
    }

    /// Extrapolate through the face opposite `hi` by `factor`, replacing `hi` if that is better.
    fn try_move<O>(&mut self, objective: &mut O, hi: usize, factor: F) -> F
    where
        O: FnMut(&SVector<F, D>) -> F,
    {
        let one = F::from_f64(1.).unwrap();
        let centroid_weight = (one - factor) / F::from_usize(D).unwrap();
        let sum: SVector<F, D> = self.vertices.iter().sum();
        let trial = sum * centroid_weight - self.vertices[hi] * (centroid_weight - factor);

        let value = objective(&trial);
        if value < self.values[hi] {
            self.values[hi] = value;
            self.vertices[hi] = trial;
        }
        value
    }
}

impl<F: Float> Minimizer<F> for NelderMead {
    fn minimize<const D: usize, O>(
        &self,
        mut objective: O,
        p0: SVector<F, D>,
        p1: SVector<F, D>,
        ftol: F,
    ) -> Result<Minimum<F, D>, SolveError>
    where
        O: FnMut(&SVector<F, D>) -> F,
    {
        assert!(D > 0, "at least one parameter required");
        let two = F::from_f64(2.).unwrap();
        let half = F::from_f64(0.5).unwrap();
        let tiny = F::from_f64(1e-10).unwrap();

        let vertices = std::iter::once(p0)
            .chain((0..D).map(|i| {
                let mut v = p0;
                v[i] = p1[i];
                v
            }))
            .collect::<Vec<_>>();
        let values = vertices.iter().map(&mut objective).collect();
        let mut simplex = Simplex { vertices, values };
        let mut evaluations = D + 1;

        loop {
            let (lo, hi, next_hi) = simplex.ranks();
            let (y_lo, y_hi) = (simplex.values[lo], simplex.values[hi]);
            let rtol = two * (y_hi - y_lo).abs() / (y_hi.abs() + y_lo.abs() + tiny);
            if rtol < ftol {
                debug!("Simplex converged after {evaluations} evaluations.");
                return Ok(Minimum {
                    point: simplex.vertices[lo],
                    value: y_lo,
                    evaluations,
                });
            }
            if evaluations >= self.max_evaluations {
                debug!("Simplex exhausted {evaluations} evaluations.");
                return Err(SolveError::NoConvergence { evaluations });
            }

            // reflect
            let y_try = simplex.try_move(&mut objective, hi, -F::from_f64(1.).unwrap());
            evaluations += 1;
            if y_try <= simplex.values[lo] {
                // expand
                simplex.try_move(&mut objective, hi, two);
                evaluations += 1;
            } else if y_try >= simplex.values[next_hi] {
                // contract
                let y_save = simplex.values[hi];
                let y_try = simplex.try_move(&mut objective, hi, half);
                evaluations += 1;
                if y_try >= y_save {
                    // shrink towards the best vertex
                    let best = simplex.vertices[lo];
                    for i in (0..=D).filter(|i| *i != lo) {
                        let v = (simplex.vertices[i] + best) * half;
                        simplex.values[i] = objective(&v);
                        simplex.vertices[i] = v;
                    }
                    evaluations += D;
                }
            }
        }
    }
}
