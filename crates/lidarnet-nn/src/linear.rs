/// Linear layer over a batch of rows, implemented using `matrixmultiply::sgemm`.
///
/// Computes `dst = src * weight^T + bias`. This is the kernel behind every convolution in
/// the crate: a convolution whose receptive field covers `kernel` neighbors of `in`
/// channels is a linear layer over rows of `kernel * in` values.
///
/// # Arguments
///
/// * `src` - Input of shape `[M, D]`
/// * `weight` - Weight of shape `[N, D]`
/// * `bias` - Optional bias of shape `[N]`
/// * `dst` - Output of shape `[M, N]`
/// * `rows` - Number of rows `M`
/// * `input_dim` - Input dimension `D`
/// * `output_dim` - Output dimension `N`
///
/// # Example
///
/// ```
/// use lidarnet_nn::linear::linear_layer_gemm;
///
/// let src = [[1.0, 2.0, 3.0]];
/// let weight = [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]];
/// let bias = [0.1, 0.2];
///
/// let mut dst = [[0.0, 0.0]];
///
/// linear_layer_gemm(
///     src.as_flattened(),
///     weight.as_flattened(),
///     Some(&bias),
///     dst.as_flattened_mut(),
///     1,
///     3,
///     2,
/// );
///
/// assert!((dst[0][0] - 1.5).abs() < 1e-6);
/// assert!((dst[0][1] - 3.4).abs() < 1e-6);
/// ```
pub fn linear_layer_gemm(
    src: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    rows: usize,
    input_dim: usize,
    output_dim: usize,
) {
    assert_eq!(src.len(), rows * input_dim, "Input size mismatch");
    assert_eq!(dst.len(), rows * output_dim, "Output size mismatch");
    assert_eq!(weight.len(), output_dim * input_dim, "Weight size mismatch");

    if rows == 0 || output_dim == 0 {
        return;
    }

    // initialize the output with the bias so that GEMM accumulates on top of it
    let beta = match bias {
        Some(bias) => {
            assert_eq!(bias.len(), output_dim, "Bias size mismatch");
            for output_row in dst.chunks_exact_mut(output_dim) {
                output_row.copy_from_slice(bias);
            }
            1.0
        }
        None => {
            dst.fill(0.0);
            0.0
        }
    };

    let m = rows;
    let k = input_dim;
    let n = output_dim;

    // SAFETY: the slice lengths are checked above against m, k and n.
    unsafe {
        matrixmultiply::sgemm(
            /* m */ m,
            /* k */ k,
            /* n */ n,
            /* alpha */ 1.0,
            /* a */ src.as_ptr(),
            /* rsa */ k as isize,
            /* csa */ 1,
            /* b */ weight.as_ptr(),
            /* rsb */ 1,
            /* csb */ k as isize,
            /* beta */ beta,
            /* c */ dst.as_mut_ptr(),
            /* rsc */ n as isize,
            /* csc */ 1,
        );
    }
}

/// Batched matrix product `dst[g] = lhs[g] * rhs[g]` for `groups` independent products.
///
/// # Arguments
///
/// * `lhs` - Left operands of shape `[G, M, K]`
/// * `rhs` - Right operands of shape `[G, K, N]`
/// * `dst` - Output of shape `[G, M, N]`
#[allow(clippy::too_many_arguments)]
pub fn batched_matmul(
    lhs: &[f32],
    rhs: &[f32],
    dst: &mut [f32],
    groups: usize,
    m: usize,
    k: usize,
    n: usize,
) {
    assert_eq!(lhs.len(), groups * m * k, "Lhs size mismatch");
    assert_eq!(rhs.len(), groups * k * n, "Rhs size mismatch");
    assert_eq!(dst.len(), groups * m * n, "Output size mismatch");

    if groups == 0 || m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        dst.fill(0.0);
        return;
    }

    lhs.chunks_exact(m * k)
        .zip(rhs.chunks_exact(k * n))
        .zip(dst.chunks_exact_mut(m * n))
        .for_each(|((a, b), c)| {
            // SAFETY: each chunk holds exactly one [M, K], [K, N] and [M, N] matrix.
            unsafe {
                matrixmultiply::sgemm(
                    m,
                    k,
                    n,
                    1.0,
                    a.as_ptr(),
                    k as isize,
                    1,
                    b.as_ptr(),
                    n as isize,
                    1,
                    0.0,
                    c.as_mut_ptr(),
                    n as isize,
                    1,
                );
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_layer_gemm() {
        let src = [[1.0, 2.0, 3.0]];
        let weight = [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]];
        let bias = [0.1, 0.2];

        let mut dst = [[0.0, 0.0]];

        linear_layer_gemm(
            src.as_flattened(),
            weight.as_flattened(),
            Some(&bias),
            dst.as_flattened_mut(),
            1,
            3,
            2,
        );

        // from pytorch
        let expected = [1.5, 3.4];
        for (a, e) in dst[0].iter().zip(expected.iter()) {
            assert_relative_eq!(a, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_linear_layer_gemm_no_bias_two_rows() {
        let src = [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let weight = [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]];

        // stale values must be overwritten
        let mut dst = [[9.0, 9.0], [9.0, 9.0]];
        linear_layer_gemm(
            src.as_flattened(),
            weight.as_flattened(),
            None,
            dst.as_flattened_mut(),
            2,
            3,
            2,
        );

        let expected = [[1.4, 3.2], [3.2, 7.7]];
        for (actual, expected) in dst.iter().zip(expected.iter()) {
            for (a, e) in actual.iter().zip(expected.iter()) {
                assert_relative_eq!(a, e, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_batched_matmul() {
        // two groups: identity and a row swap
        let lhs = [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0];
        let rhs: Vec<f32> = (1..=12).map(|v| v as f32).collect();
        let mut dst = [0.0; 12];

        batched_matmul(&lhs, &rhs, &mut dst, 2, 2, 2, 3);

        assert_eq!(dst[..6], rhs[..6]);
        assert_eq!(dst[6..9], rhs[9..]);
        assert_eq!(dst[9..], rhs[6..9]);
    }
}
