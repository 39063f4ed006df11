//! Failure reasons of a registration attempt.
//!
//! All of them are ordinary values meant for the caller to retry with a different
//! nominal center, a different field or looser parameters.

use thiserror::Error;

/// Why a plate solve did not produce an accepted solution.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SolveError {
    /// Too few detected or catalog points (or promoted pairs) to attempt matching.
    #[error("insufficient data: found {found} usable points, need at least {required}")]
    InsufficientData {
        /// Number of points or pairs available.
        found: usize,
        /// Number required.
        required: usize,
    },

    /// The minimizer did not reach its tolerance within its evaluation budget.
    #[error("minimizer did not converge within {evaluations} evaluations")]
    NoConvergence {
        /// Objective evaluations spent.
        evaluations: usize,
    },

    /// Outlier rejection pruned the pair list below the minimum.
    #[error("outlier rejection left {remaining} pairs, need at least {required}")]
    TooFewSurvivingPairs {
        /// Pairs left after the last rejection round.
        remaining: usize,
        /// Number required.
        required: usize,
    },

    /// A fitted pixel scale left the sanity bound around the nominal scale.
    #[error("degenerate solution: scales ({x_scale:e}, {y_scale:e}) rad/pixel out of bounds")]
    DegenerateSolution {
        /// Fitted x scale, radians per pixel.
        x_scale: f64,
        /// Fitted y scale, radians per pixel.
        y_scale: f64,
    },

    /// The fit converged but its median residual exceeds the requested maximum.
    #[error("median residual {median:.3} px exceeds the maximum of {max:.3} px")]
    ResidualTooLarge {
        /// Achieved median residual, pixels.
        median: f64,
        /// Requested maximum, pixels.
        max: f64,
    },

    /// The caller asked to stop through a progress hook.
    #[error("cancelled by caller")]
    Cancelled,

    /// The reference catalog could not be queried.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Every trial center of a hunt failed.
    #[error("no solution at any of {tried} trial centers")]
    NoSolution {
        /// Number of trial centers tried.
        tried: usize,
    },

    /// A header lacks a field needed to read a WCS.
    #[error("header field {0} is missing")]
    MissingHeaderField(&'static str),
}

/// Error reported by a [`Catalog`](crate::Catalog) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("catalog lookup failed: {0}")]
pub struct CatalogError(pub String);
