use std::num::NonZeroUsize;

use kiddo::{immutable::float::kdtree::ImmutableKdTree, SquaredEuclidean};
use lidarnet_tensor::{Tensor3, TensorError};

use crate::{error::NnError, ops::check_coords};

#[inline]
fn squared_distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)
}

// kiddo sums distances in its own order, so searches run on a slightly larger radius
// and the exact squared distance decides membership
#[inline]
fn widen(distance: f32) -> f32 {
    distance + distance.abs() * 1e-5 + f32::EPSILON
}

fn check_batches(points: &Tensor3<f32>, queries: &Tensor3<f32>) -> Result<(), NnError> {
    check_coords(points)?;
    check_coords(queries)?;
    if points.shape[0] != queries.shape[0] {
        return Err(NnError::ShapeMismatch(
            vec![points.shape[0], queries.shape[1], 3],
            queries.shape.to_vec(),
        ));
    }
    Ok(())
}

fn coords_at(tensor: &Tensor3<f32>, b: usize, i: usize) -> Result<[f32; 3], NnError> {
    let row = tensor.row(&[b, i])?;
    Ok([row[0], row[1], row[2]])
}

/// The points of one batch entry indexed by a kd-tree.
struct Cloud {
    coords: Vec<[f32; 3]>,
    kdtree: ImmutableKdTree<f32, u32, 3, 32>,
}

impl Cloud {
    fn new(points: &Tensor3<f32>, b: usize) -> Result<Self, NnError> {
        let coords = (0..points.shape[1])
            .map(|p| coords_at(points, b, p))
            .collect::<Result<Vec<_>, _>>()?;
        let kdtree = ImmutableKdTree::new_from_slice(&coords);
        Ok(Self { coords, kdtree })
    }

    /// `(squared distance, index)` of every point with squared distance at most `radius2`.
    fn within(&self, query: &[f32; 3], radius2: f32) -> Vec<(f32, usize)> {
        self.kdtree
            .within_unsorted::<SquaredEuclidean>(query, widen(radius2))
            .into_iter()
            .map(|neighbour| {
                let index = neighbour.item as usize;
                (squared_distance(&self.coords[index], query), index)
            })
            .filter(|&(distance, _)| distance <= radius2)
            .collect()
    }

    /// Indices of the `k` nearest points, by distance and then by index.
    fn nearest(&self, query: &[f32; 3], k: NonZeroUsize) -> Vec<usize> {
        let farthest = self
            .kdtree
            .nearest_n::<SquaredEuclidean>(query, k)
            .iter()
            .map(|neighbour| squared_distance(&self.coords[neighbour.item as usize], query))
            .fold(0.0, f32::max);

        // points tied with the k-th neighbor compete on their index
        let mut candidates = self.within(query, farthest);
        candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        candidates.truncate(k.get());
        candidates.into_iter().map(|(_, index)| index).collect()
    }
}

/// The `k` nearest neighbors of each query, sorted by increasing distance.
///
/// Distances are Euclidean; equally distant points are ordered by index. Each batch entry
/// is indexed once by a kd-tree shared by all of its queries.
///
/// # Arguments
///
/// * `points` - Point set of shape `[B, P, 3]`.
/// * `queries` - Query points of shape `[B, Q, 3]`.
/// * `k` - Number of neighbors per query.
///
/// # Returns
///
/// Indices into `points` of shape `[B, Q, k]`.
///
/// # Errors
///
/// Returns [`NnError::NotEnoughPoints`] if a batch entry holds fewer than `k` points.
///
/// # Example
///
/// ```
/// use lidarnet_nn::neighbors::knn;
/// use lidarnet_tensor::Tensor3;
///
/// let points = Tensor3::<f32>::from_shape_vec(
///     [1, 3, 3],
///     vec![0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 1.0, 0.0, 0.0],
/// )
/// .unwrap();
/// let queries = Tensor3::<f32>::from_shape_vec([1, 1, 3], vec![0.0, 0.0, 0.0]).unwrap();
/// let indices = knn(&points, &queries, 2).unwrap();
/// assert_eq!(indices.as_slice(), &[0, 2]);
/// ```
pub fn knn(
    points: &Tensor3<f32>,
    queries: &Tensor3<f32>,
    k: usize,
) -> Result<Tensor3<usize>, NnError> {
    check_batches(points, queries)?;
    let [batch_size, num_points, _] = points.shape;
    let num_queries = queries.shape[1];
    if k > num_points {
        return Err(NnError::NotEnoughPoints {
            required: k,
            available: num_points,
        });
    }
    let Some(k_nonzero) = NonZeroUsize::new(k) else {
        return Ok(Tensor3::from_shape_vec([batch_size, num_queries, 0], Vec::new())?);
    };

    let mut out = Vec::with_capacity(batch_size * num_queries * k);
    for b in 0..batch_size {
        let cloud = Cloud::new(points, b)?;
        for q in 0..num_queries {
            let query = coords_at(queries, b, q)?;
            out.extend(cloud.nearest(&query, k_nonzero));
        }
    }

    Ok(Tensor3::from_shape_vec([batch_size, num_queries, k], out)?)
}

/// Ball query: up to `k` points within `radius` of each query.
///
/// Points are taken in index order. A ball holding fewer than `k` points is padded by
/// repeating its first point; an empty ball falls back to the nearest point overall so
/// that every query still gets a full neighborhood.
///
/// # Arguments
///
/// * `points` - Point set of shape `[B, P, 3]`.
/// * `queries` - Query points of shape `[B, Q, 3]`.
/// * `radius` - Radius of the ball.
/// * `k` - Number of neighbors per query.
///
/// # Returns
///
/// Indices into `points` of shape `[B, Q, k]`.
pub fn ball_query(
    points: &Tensor3<f32>,
    queries: &Tensor3<f32>,
    radius: f32,
    k: usize,
) -> Result<Tensor3<usize>, NnError> {
    check_batches(points, queries)?;
    let [batch_size, num_points, _] = points.shape;
    let num_queries = queries.shape[1];
    if num_points == 0 && k > 0 {
        return Err(NnError::NotEnoughPoints {
            required: 1,
            available: 0,
        });
    }
    if k == 0 {
        return Ok(Tensor3::from_shape_vec([batch_size, num_queries, 0], Vec::new())?);
    }

    let radius2 = radius * radius;
    let mut out = Vec::with_capacity(batch_size * num_queries * k);
    for b in 0..batch_size {
        let cloud = Cloud::new(points, b)?;
        for q in 0..num_queries {
            let query = coords_at(queries, b, q)?;
            let mut found: Vec<usize> = cloud
                .within(&query, radius2)
                .into_iter()
                .map(|(_, index)| index)
                .collect();
            found.sort_unstable();
            found.truncate(k);

            if found.len() < k {
                let pad = match found.first() {
                    Some(&first) => first,
                    None => {
                        let nearest = cloud
                            .nearest(&query, NonZeroUsize::MIN)
                            .first()
                            .copied()
                            .ok_or(TensorError::index_out_of_bounds(0, num_points))?;
                        log::trace!(
                            "empty ball around query {q} of batch {b}, using point {nearest}"
                        );
                        nearest
                    }
                };
                found.resize(k, pad);
            }
            out.extend_from_slice(&found);
        }
    }

    Ok(Tensor3::from_shape_vec([batch_size, num_queries, k], out)?)
}
