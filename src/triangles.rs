//! Similar triangle matching between image points and projected catalog stars.
//!
//! Every triangle is described by two ratios of its sorted edge lengths, which are
//! invariant to translation, rotation and scale. Each pair of matching image and catalog
//! triangles casts one vote for each of the three vertex correspondences.

use std::cmp::Ordering;

use itertools::Itertools;
use kiddo::float::{distance::SquaredEuclidean, kdtree::KdTree};
use log::{debug, info};
use ndarray::{Array2, ArrayView2};

use crate::Float;

/// A triangle of three points, canonicalized such that the edge opposite vertex 0
/// is the longest and the edge opposite vertex 2 the shortest.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triangle {
    /// Indices of the vertices in their point set.
    pub vertices: [usize; 3],
    /// Position in triangle space: `(b/a, c/a)` for the edges `a >= b >= c`.
    pub shape: [f32; 2],
}

impl Triangle {
    /// Build the canonical triangle of three points.
    ///
    /// Returns `None` if an edge is shorter than `min_edge` or not finite, or the longest
    /// edge exceeds `max_fatness` times the sum of the other two.
    pub fn new<F: Float>(
        points: ArrayView2<F>,
        [i, j, k]: [usize; 3],
        min_edge: F,
        max_fatness: F,
    ) -> Option<Self> {
        let dist = |p: usize, q: usize| {
            let dx = points[[p, 0]] - points[[q, 0]];
            let dy = points[[p, 1]] - points[[q, 1]];
            dx.hypot(dy)
        };

        // each vertex with the length of its opposite edge
        let mut opposite = [(i, dist(j, k)), (j, dist(i, k)), (k, dist(i, j))];
        if opposite.iter().any(|(_, e)| *e < min_edge) {
            return None;
        }
        opposite.sort_by(|(_, e1), (_, e2)| e2.partial_cmp(e1).unwrap_or(Ordering::Equal));

        let [(vi, a), (vj, b), (vk, c)] = opposite;
        if !a.is_finite() || a <= F::from_f64(0.).unwrap() || a > max_fatness * (b + c) {
            return None;
        }

        Some(Self {
            vertices: [vi, vj, vk],
            shape: [(b / a).to_f32().unwrap(), (c / a).to_f32().unwrap()],
        })
    }

    /// L1 distance in triangle space.
    pub fn distance(&self, other: &Triangle) -> f32 {
        (self.shape[0] - other.shape[0]).abs() + (self.shape[1] - other.shape[1]).abs()
    }
}

/// A promoted image/catalog correspondence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CandidatePair<F: Float> {
    /// Index of the image point.
    pub image: usize,
    /// Index of the catalog star.
    pub catalog: usize,
    /// Number of triangle votes for this pairing.
    pub votes: u32,
    /// Weighted distance in pixels under the latest fit, zero before fitting.
    pub residual: F,
}

/// Parameters of the triangle matching.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriangleMatcher {
    /// Minimum length of every triangle edge, in pixels.
    pub min_edge: f64,
    /// Maximum ratio of the longest edge to the sum of the two others.
    pub max_fatness: f64,
    /// Maximum L1 distance between two matching triangles in triangle space.
    pub tolerance: f32,
    /// Minimum number of votes for a pair to be promoted.
    pub min_votes: u32,
    /// Maximum number of promoted pairs.
    pub max_pairs: usize,
}

impl Default for TriangleMatcher {
    fn default() -> Self {
        Self {
            min_edge: 25.,
            max_fatness: 0.9,
            tolerance: 0.005,
            min_votes: 4,
            max_pairs: 25,
        }
    }
}

impl TriangleMatcher {
    /// All acceptable triangles formed by `points`. Shape `(n_points, 2)`.
    pub fn triangles<F: Float>(&self, points: ArrayView2<F>) -> Vec<Triangle> {
        let min_edge = F::from_f64(self.min_edge).unwrap();
        let max_fatness = F::from_f64(self.max_fatness).unwrap();
        (0..points.nrows())
            .combinations(3)
            .filter_map(|idx| {
                Triangle::new(points, [idx[0], idx[1], idx[2]], min_edge, max_fatness)
            })
            .collect()
    }

    /// Vote table of shape `(n_image, n_catalog)` from the triangles of both point sets.
    pub fn vote<F: Float>(&self, image: ArrayView2<F>, catalog: ArrayView2<F>) -> Array2<u32> {
        info!("Computing triangles.");
        let image_triangles = self.triangles(image);
        let catalog_triangles = self.triangles(catalog);
        debug!(
            "{} image and {} catalog triangles.",
            image_triangles.len(),
            catalog_triangles.len()
        );

        info!("Casting votes.");
        let index = ShapeIndex::new(&catalog_triangles);
        let mut votes = Array2::zeros((image.nrows(), catalog.nrows()));
        for triangle in &image_triangles {
            self.cast(&mut votes, triangle, &index, &catalog_triangles);
        }
        votes
    }

    /// Vote for every catalog triangle close to `triangle`.
    fn cast(
        &self,
        votes: &mut Array2<u32>,
        triangle: &Triangle,
        index: &ShapeIndex,
        catalog_triangles: &[Triangle],
    ) {
        let matches = index
            .tree
            .within_unsorted::<SquaredEuclidean>(&triangle.shape, self.tolerance.powi(2));
        for m in matches {
            for &t in &index.groups[m.item] {
                let other = &catalog_triangles[t];
                if triangle.distance(other) > self.tolerance {
                    continue;
                }
                for (s, g) in triangle.vertices.into_iter().zip(other.vertices) {
                    votes[[s, g]] += 1;
                }
            }
        }
    }

    /// Promote the best voted pairs.
    ///
    /// Pairs need at least `min_votes`, are ordered by descending votes (ties in row major order)
    /// and capped at the smallest of the two set sizes and `max_pairs`.
    pub fn top_pairs<F: Float>(&self, votes: &Array2<u32>) -> Vec<CandidatePair<F>> {
        let cap = votes.nrows().min(votes.ncols()).min(self.max_pairs);
        let pairs = votes
            .indexed_iter()
            .filter(|(_, v)| **v >= self.min_votes)
            .map(|((image, catalog), v)| CandidatePair {
                image,
                catalog,
                votes: *v,
                residual: F::from_f64(0.).unwrap(),
            })
            .sorted_by(|p1, p2| p2.votes.cmp(&p1.votes))
            .take(cap)
            .collect_vec();
        debug!("Promoted {} pairs.", pairs.len());
        pairs
    }

    /// Vote and promote in one go.
    pub fn candidate_pairs<F: Float>(
        &self,
        image: ArrayView2<F>,
        catalog: ArrayView2<F>,
    ) -> Vec<CandidatePair<F>> {
        self.top_pairs(&self.vote(image, catalog))
    }
}

/// Catalog triangles in a k-d tree over triangle space.
///
/// Triangles of identical shape share one tree entry. Regular fields produce many of them,
/// more than a tree leaf can hold at a single point.
struct ShapeIndex {
    tree: KdTree<f32, usize, 2, 32, u32>,
    /// Triangles of each tree entry.
    groups: Vec<Vec<usize>>,
}

impl ShapeIndex {
    fn new(triangles: &[Triangle]) -> Self {
        let mut order = (0..triangles.len()).collect_vec();
        order.sort_by_key(|&i| triangles[i].shape.map(f32::to_bits));

        let mut shapes = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (shape, members) in &order
            .into_iter()
            .chunk_by(|&i| triangles[i].shape.map(f32::to_bits))
        {
            shapes.push(shape.map(f32::from_bits));
            groups.push(members.collect());
        }

        let tree = shapes.into_iter().enumerate().map(|(i, s)| (s, i)).collect();
        Self { tree, groups }
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use super::*;
    use rayon::prelude::*;

    impl TriangleMatcher {
        /// Vote table computed in parallel over the image triangles.
        ///
        /// Also see [`vote`](TriangleMatcher::vote()). The result is identical.
        pub fn vote_par<F: Float>(
            &self,
            image: ArrayView2<F>,
            catalog: ArrayView2<F>,
        ) -> Array2<u32> {
            info!("Computing triangles.");
            let image_triangles = self.triangles(image);
            let catalog_triangles = self.triangles(catalog);

            info!("Casting votes in parallel.");
            let index = ShapeIndex::new(&catalog_triangles);
            let shape = (image.nrows(), catalog.nrows());
            image_triangles
                .par_iter()
                .fold(
                    || Array2::zeros(shape),
                    |mut votes, triangle| {
                        self.cast(&mut votes, triangle, &index, &catalog_triangles);
                        votes
                    },
                )
                .reduce(|| Array2::zeros(shape), |a, b| a + b)
        }

        /// Vote in parallel and promote.
        pub fn candidate_pairs_par<F: Float>(
            &self,
            image: ArrayView2<F>,
            catalog: ArrayView2<F>,
        ) -> Vec<CandidatePair<F>> {
            self.top_pairs(&self.vote_par(image, catalog))
        }
    }
}
