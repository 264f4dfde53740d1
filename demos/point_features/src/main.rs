use argh::FromArgs;
use std::path::PathBuf;

use lidarnet::{
    kitti::{KittiDetection, Split},
    nn::{SetAbstraction, SetAbstractionConfig, XConv, XConvConfig},
    tensor::Tensor3,
};
use rand::{rngs::StdRng, seq::index::sample, SeedableRng};

#[derive(FromArgs)]
/// Run the point cloud layers on a KITTI frame and print the feature shapes
struct Args {
    /// path to the KITTI root, the directory holding training/ and testing/
    #[argh(option)]
    root: PathBuf,

    /// subset to read: train, val or test
    #[argh(option, default = "Split::Train")]
    split: Split,

    /// index of the frame to process
    #[argh(option, default = "0")]
    index: usize,

    /// number of points kept from the scan
    #[argh(option, default = "2048")]
    num_points: usize,

    /// number of query points
    #[argh(option, default = "256")]
    num_queries: usize,

    /// path to a JSON file with trained XConv parameters
    #[argh(option)]
    xconv: Option<PathBuf>,

    /// seed of the point sampling and of the random weights
    #[argh(option, default = "0")]
    seed: u64,
}

/// Pick `n` rows of `points` at random, or all of them in order if there are fewer.
fn subsample(
    points: &Tensor3<f32>,
    n: usize,
    rng: &mut StdRng,
) -> Result<Tensor3<f32>, Box<dyn std::error::Error>> {
    let num_points = points.shape[1];
    let indices = if n >= num_points {
        (0..num_points).collect::<Vec<_>>()
    } else {
        sample(rng, num_points, n).into_vec()
    };

    let mut data = Vec::with_capacity(indices.len() * 3);
    for i in &indices {
        data.extend_from_slice(points.row(&[0, *i])?);
    }
    Ok(Tensor3::from_shape_vec([1, indices.len(), 3], data)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let dataset = KittiDetection::new(&args.root, args.split, true)?;
    let (inputs, _) = dataset.get(args.index)?;
    println!("Frame {}: #{} points", args.index, inputs.lidar.len());

    let points = subsample(&inputs.lidar.to_coords_tensor()?, args.num_points, &mut rng)?;
    let queries = subsample(&points, args.num_queries, &mut rng)?;
    log::info!("points {:?}, queries {:?}", points.shape, queries.shape);

    let xconv = match &args.xconv {
        Some(path) => XConv::from_json(&std::fs::read_to_string(path)?)?,
        None => XConv::with_rng(XConvConfig::new(0, 64, 8).with_dilation(2), &mut rng)?,
    };
    let (queries, features) = xconv.forward(&points, &queries, None)?;
    println!("XConv features: {:?}", features.shape);

    let out_channels = xconv.config().out_channels;
    let local = SetAbstraction::with_rng(
        SetAbstractionConfig::local(vec![3 + out_channels, 128, 128], 4.0, 16),
        &mut rng,
    )?;
    let (queries, local_features) = local.forward(&queries, &queries, Some(&features))?;
    println!("Local set abstraction features: {:?}", local_features.shape);

    let global = SetAbstraction::with_rng(
        SetAbstractionConfig::global(vec![3 + 128, 256, 512]),
        &mut rng,
    )?;
    let (_, global_features) = global.forward(&queries, &queries, Some(&local_features))?;
    println!(
        "Global set abstraction features: {:?}",
        global_features.shape
    );

    Ok(())
}
