use lidarnet_nn::{
    neighbors::{ball_query, knn},
    NnError, SetAbstraction, SetAbstractionConfig, XConv, XConvConfig,
};
use lidarnet_tensor::Tensor3;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn random_cloud(rng: &mut StdRng, batch_size: usize, n: usize) -> Result<Tensor3<f32>, NnError> {
    let data = (0..batch_size * n * 3)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    Ok(Tensor3::from_shape_vec([batch_size, n, 3], data)?)
}

/// The first `n` points of every batch entry.
fn subsample(points: &Tensor3<f32>, n: usize) -> Result<Tensor3<f32>, NnError> {
    let [batch_size, num_points, _] = points.shape;
    let mut data = Vec::with_capacity(batch_size * n * 3);
    for b in 0..batch_size {
        let start = b * num_points * 3;
        data.extend_from_slice(&points.as_slice()[start..start + n * 3]);
    }
    Ok(Tensor3::from_shape_vec([batch_size, n, 3], data)?)
}

#[test]
fn xconv_output_shape() -> Result<(), NnError> {
    let mut rng = StdRng::seed_from_u64(42);
    let points = random_cloud(&mut rng, 2, 32)?;
    let features = Tensor3::from_shape_fn([2, 32, 6], |[b, p, c]| ((b + p + c) % 5) as f32);
    let queries = subsample(&points, 8)?;

    let layer = XConv::with_rng(XConvConfig::new(6, 32, 8), &mut rng)?;
    let (q, x) = layer.forward(&points, &queries, Some(&features))?;
    assert_eq!(q.shape, [2, 8, 3]);
    assert_eq!(x.shape, [2, 8, 32]);
    assert!(x.as_slice().iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn xconv_dilation_selects_every_dth_neighbor() -> Result<(), NnError> {
    // points on a line: the 2 * 3 nearest neighbors of the origin are x = 0..6,
    // dilation 2 keeps x = 0, 2, 4
    let xs = (0..10).flat_map(|p| [p as f32, 0.0, 0.0]).collect();
    let points = Tensor3::from_shape_vec([1, 10, 3], xs)?;
    let queries = Tensor3::from_shape_vec([1, 1, 3], vec![0.0; 3])?;
    let nearest = knn(&points, &queries, 6)?;
    let dilated: Vec<usize> = nearest.as_slice().iter().step_by(2).copied().collect();
    assert_eq!(dilated, vec![0, 2, 4]);

    let mut rng = StdRng::seed_from_u64(0);
    let layer = XConv::with_rng(XConvConfig::new(0, 8, 3).with_dilation(2), &mut rng)?;
    let (_, x) = layer.forward(&points, &queries, None)?;
    assert_eq!(x.shape, [1, 1, 8]);

    // the points beyond the dilated neighborhood do not change the output
    let mut moved = points.clone();
    for p in 6..10 {
        if let Some(v) = moved.get_mut([0, p, 0]) {
            *v = 100.0 + p as f32;
        }
    }
    let (_, y) = layer.forward(&moved, &queries, None)?;
    assert_eq!(x, y);
    Ok(())
}

#[test]
fn set_abstraction_global_pools_once() -> Result<(), NnError> {
    let mut rng = StdRng::seed_from_u64(7);
    let points = random_cloud(&mut rng, 2, 16)?;
    let features = Tensor3::from_shape_fn([2, 16, 2], |[b, p, c]| (b * 16 + p + c) as f32 * 0.01);
    let queries = subsample(&points, 4)?;

    let layer = SetAbstraction::with_rng(SetAbstractionConfig::global(vec![5, 16, 32]), &mut rng)?;
    let (_, x) = layer.forward(&points, &queries, Some(&features))?;
    assert_eq!(x.shape, [2, 4, 32]);

    for b in 0..2 {
        let first = x.row(&[b, 0])?.to_vec();
        for q in 1..4 {
            assert_eq!(x.row(&[b, q])?, first.as_slice());
        }
    }
    Ok(())
}

#[test]
fn set_abstraction_local_stays_within_radius() -> Result<(), NnError> {
    let mut rng = StdRng::seed_from_u64(9);
    let points = random_cloud(&mut rng, 1, 64)?;
    let queries = subsample(&points, 8)?;
    let radius = 0.4;

    let indices = ball_query(&points, &queries, radius, 8)?;
    for q in 0..8 {
        let query = queries.row(&[0, q])?;
        for &i in indices.row(&[0, q])? {
            let p = points.row(&[0, i])?;
            let d2: f32 = p.iter().zip(query).map(|(a, b)| (a - b).powi(2)).sum();
            assert!(d2 <= radius * radius);
        }
    }

    let config = SetAbstractionConfig::local(vec![3, 8, 16], radius, 8);
    let layer = SetAbstraction::with_rng(config, &mut rng)?;
    let (_, x) = layer.forward(&points, &queries, None)?;
    assert_eq!(x.shape, [1, 8, 16]);
    Ok(())
}

#[test]
fn layers_chain() -> Result<(), NnError> {
    let mut rng = StdRng::seed_from_u64(3);
    let points = random_cloud(&mut rng, 1, 24)?;
    let queries = subsample(&points, 12)?;

    let xconv = XConv::with_rng(XConvConfig::new(0, 16, 4), &mut rng)?;
    let (queries, features) = xconv.forward(&points, &queries, None)?;

    let sa = SetAbstraction::with_rng(SetAbstractionConfig::global(vec![19, 32]), &mut rng)?;
    let (_, pooled) = sa.forward(&queries, &queries, Some(&features))?;
    assert_eq!(pooled.shape, [1, 12, 32]);
    Ok(())
}
