use lidarnet_tensor::{Tensor3, Tensor4, TensorError};

use crate::error::NnError;

/// Check that `coords` holds a batch of 3-D coordinates, `[B, N, 3]`.
pub fn check_coords(coords: &Tensor3<f32>) -> Result<(), NnError> {
    if coords.shape[2] != 3 {
        return Err(NnError::ShapeMismatch(
            vec![coords.shape[0], coords.shape[1], 3],
            coords.shape.to_vec(),
        ));
    }
    Ok(())
}

/// Batched gather of rows.
///
/// For every batch entry `b`, query `q` and neighbor slot `k`, copies the row
/// `src[b, indices[b, q, k], :]`.
///
/// # Arguments
///
/// * `src` - Source rows of shape `[B, P, C]`.
/// * `indices` - Row indices of shape `[B, Q, K]`, each in `0..P`.
///
/// # Returns
///
/// The gathered rows, shape `[B, Q, K, C]`.
///
/// # Example
///
/// ```
/// use lidarnet_nn::ops::gather;
/// use lidarnet_tensor::Tensor3;
///
/// let src = Tensor3::<f32>::from_shape_vec([1, 3, 1], vec![10.0, 20.0, 30.0]).unwrap();
/// let indices = Tensor3::<usize>::from_shape_vec([1, 1, 2], vec![2, 0]).unwrap();
/// let out = gather(&src, &indices).unwrap();
/// assert_eq!(out.shape, [1, 1, 2, 1]);
/// assert_eq!(out.as_slice(), &[30.0, 10.0]);
/// ```
pub fn gather(src: &Tensor3<f32>, indices: &Tensor3<usize>) -> Result<Tensor4<f32>, NnError> {
    let [batch_size, num_points, channels] = src.shape;
    let [index_batch, num_queries, k] = indices.shape;
    if index_batch != batch_size {
        return Err(NnError::ShapeMismatch(
            vec![batch_size, num_queries, k],
            indices.shape.to_vec(),
        ));
    }

    let src_data = src.as_slice();
    let mut out = Vec::with_capacity(batch_size * num_queries * k * channels);
    for (b, batch_indices) in indices
        .as_slice()
        .chunks_exact((num_queries * k).max(1))
        .take(batch_size)
        .enumerate()
    {
        let batch_offset = b * num_points * channels;
        for &i in batch_indices.iter().take(num_queries * k) {
            if i >= num_points {
                return Err(TensorError::index_out_of_bounds(i, num_points).into());
            }
            let start = batch_offset + i * channels;
            out.extend_from_slice(&src_data[start..start + channels]);
        }
    }

    Ok(Tensor4::from_shape_vec([batch_size, num_queries, k, channels], out)?)
}

/// Subtract the query coordinates from every gathered neighbor, in place.
///
/// # Arguments
///
/// * `neighbors` - Gathered coordinates of shape `[B, Q, K, 3]`.
/// * `queries` - Query coordinates of shape `[B, Q, 3]`.
pub fn relative_offsets(
    neighbors: &mut Tensor4<f32>,
    queries: &Tensor3<f32>,
) -> Result<(), NnError> {
    let [batch_size, num_queries, k, channels] = neighbors.shape;
    if queries.shape != [batch_size, num_queries, channels] {
        return Err(NnError::ShapeMismatch(
            vec![batch_size, num_queries, channels],
            queries.shape.to_vec(),
        ));
    }
    if k == 0 || channels == 0 {
        return Ok(());
    }

    neighbors
        .as_slice_mut()
        .chunks_exact_mut(k * channels)
        .zip(queries.as_slice().chunks_exact(channels))
        .for_each(|(neighborhood, query)| {
            neighborhood.chunks_exact_mut(channels).for_each(|p| {
                p.iter_mut().zip(query).for_each(|(v, q)| *v -= q);
            });
        });

    Ok(())
}

/// Concatenate two tensors along the last (channel) axis.
pub fn concat_channels(lhs: &Tensor4<f32>, rhs: &Tensor4<f32>) -> Result<Tensor4<f32>, NnError> {
    let [b, q, k, c_lhs] = lhs.shape;
    let c_rhs = rhs.shape[3];
    if rhs.shape[..3] != lhs.shape[..3] {
        return Err(NnError::ShapeMismatch(vec![b, q, k, c_rhs], rhs.shape.to_vec()));
    }

    let rows = b * q * k;
    let mut out = Vec::with_capacity(rows * (c_lhs + c_rhs));
    for r in 0..rows {
        out.extend_from_slice(&lhs.as_slice()[r * c_lhs..(r + 1) * c_lhs]);
        out.extend_from_slice(&rhs.as_slice()[r * c_rhs..(r + 1) * c_rhs]);
    }

    Ok(Tensor4::from_shape_vec([b, q, k, c_lhs + c_rhs], out)?)
}

/// Max pooling over the neighbor axis, `[B, Q, K, C] -> [B, Q, C]`.
///
/// # Errors
///
/// Returns [`NnError::NotEnoughPoints`] if the neighborhoods are empty.
pub fn max_pool_neighbors(x: &Tensor4<f32>) -> Result<Tensor3<f32>, NnError> {
    let [b, q, k, c] = x.shape;
    if k == 0 {
        return Err(NnError::NotEnoughPoints {
            required: 1,
            available: 0,
        });
    }

    let mut out = vec![f32::NEG_INFINITY; b * q * c];
    if c > 0 {
        out.chunks_exact_mut(c)
            .zip(x.as_slice().chunks_exact(k * c))
            .for_each(|(pooled, neighborhood)| {
                neighborhood.chunks_exact(c).for_each(|row| {
                    pooled
                        .iter_mut()
                        .zip(row)
                        .for_each(|(m, &v)| *m = m.max(v));
                });
            });
    }

    Ok(Tensor3::from_shape_vec([b, q, c], out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_batches() -> Result<(), NnError> {
        let src =
            Tensor3::<f32>::from_shape_fn([2, 3, 2], |[b, p, c]| (b * 100 + p * 10 + c) as f32);
        let indices = Tensor3::<usize>::from_shape_vec([2, 1, 2], vec![1, 2, 0, 0])?;
        let out = gather(&src, &indices)?;
        assert_eq!(out.shape, [2, 1, 2, 2]);
        assert_eq!(
            out.as_slice(),
            &[10.0, 11.0, 20.0, 21.0, 100.0, 101.0, 100.0, 101.0]
        );
        Ok(())
    }

    #[test]
    fn test_gather_out_of_bounds() -> Result<(), NnError> {
        let src = Tensor3::<f32>::zeros([1, 2, 3]);
        let indices = Tensor3::<usize>::from_shape_vec([1, 1, 1], vec![2])?;
        assert!(matches!(
            gather(&src, &indices),
            Err(NnError::TensorError(TensorError::IndexOutOfBounds { index: 2, .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_relative_offsets() -> Result<(), NnError> {
        let mut neighbors =
            Tensor4::<f32>::from_shape_vec([1, 1, 2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0])?;
        let queries = Tensor3::<f32>::from_shape_vec([1, 1, 3], vec![1.0, 1.0, 1.0])?;
        relative_offsets(&mut neighbors, &queries)?;
        assert_eq!(neighbors.as_slice(), &[0.0, 1.0, 2.0, -1.0, -1.0, -1.0]);
        Ok(())
    }

    #[test]
    fn test_concat_channels() -> Result<(), NnError> {
        let lhs = Tensor4::<f32>::from_shape_vec([1, 1, 2, 1], vec![1.0, 2.0])?;
        let rhs = Tensor4::<f32>::from_shape_vec([1, 1, 2, 2], vec![3.0, 4.0, 5.0, 6.0])?;
        let out = concat_channels(&lhs, &rhs)?;
        assert_eq!(out.shape, [1, 1, 2, 3]);
        assert_eq!(out.as_slice(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_max_pool_neighbors() -> Result<(), NnError> {
        let x = Tensor4::<f32>::from_shape_vec(
            [1, 2, 2, 2],
            vec![1.0, -5.0, 0.0, -3.0, 7.0, 2.0, -1.0, 9.0],
        )?;
        let pooled = max_pool_neighbors(&x)?;
        assert_eq!(pooled.shape, [1, 2, 2]);
        assert_eq!(pooled.as_slice(), &[1.0, -3.0, 7.0, 9.0]);
        Ok(())
    }
}
