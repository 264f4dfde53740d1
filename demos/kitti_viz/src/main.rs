use argh::FromArgs;
use std::path::PathBuf;

use lidarnet::kitti::{Annotation, KittiDetection, LidarScan, Split};

#[derive(FromArgs)]
/// Visualize a KITTI detection frame: the velodyne scan and the labeled 3d boxes
struct Args {
    /// path to the KITTI root, the directory holding training/ and testing/
    #[argh(option)]
    root: PathBuf,

    /// subset to read: train, val or test
    #[argh(option, default = "Split::Train")]
    split: Split,

    /// index of the frame to show
    #[argh(option, default = "0")]
    index: usize,

    /// keep the scan in the velodyne frame instead of the rectified camera frame
    #[argh(switch)]
    raw: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let dataset = KittiDetection::new(&args.root, args.split, !args.raw)?;
    println!("Dataset: #{} frames", dataset.len());

    let (inputs, target) = dataset.get(args.index)?;
    println!("Frame {}: #{} points", args.index, inputs.lidar.len());

    // create a Rerun recording stream
    let rec = rerun::RecordingStreamBuilder::new("KITTI Visualizer").spawn()?;

    log_scan(&rec, "lidar", &inputs.lidar)?;

    match inputs.image.decode_rgb8() {
        Ok(image) => rec.log(
            "image",
            &rerun::Image::from_elements(
                image.data.as_slice(),
                (image.width as u32, image.height as u32).into(),
                rerun::ColorModel::RGB,
            ),
        )?,
        Err(e) => log::warn!("cannot show {}: {e}", inputs.image.path().display()),
    }

    // the boxes live in the camera frame
    if let Some(target) = target.filter(|_| !args.raw) {
        let objects = target.objects().collect::<Vec<_>>();
        for object in &objects {
            println!("{} at {:?}", object.class, object.center);
        }
        log_boxes(&rec, "boxes", &objects)?;
    }

    Ok(())
}

fn log_scan(
    rec: &rerun::RecordingStream,
    name: &str,
    scan: &LidarScan,
) -> Result<(), Box<dyn std::error::Error>> {
    let points = scan
        .xyz()
        .map(|p| rerun::Position3D::new(p[0], p[1], p[2]))
        .collect::<Vec<_>>();

    let colors = scan
        .intensities()
        .map(|i| {
            let v = (i.clamp(0.0, 1.0) * 200.0) as u8 + 55;
            rerun::Color::from_rgb(v, v, v)
        })
        .collect::<Vec<_>>();

    rec.log(name, &rerun::Points3D::new(points).with_colors(colors))?;

    Ok(())
}

fn log_boxes(
    rec: &rerun::RecordingStream,
    name: &str,
    objects: &[Annotation],
) -> Result<(), Box<dyn std::error::Error>> {
    // bottom face, top face and the four vertical edges
    const EDGES: [&[usize]; 6] = [
        &[0, 1, 2, 3, 0],
        &[4, 5, 6, 7, 4],
        &[0, 4],
        &[1, 5],
        &[2, 6],
        &[3, 7],
    ];

    let mut strips = Vec::new();
    for object in objects {
        let corners = object.corners();
        for edge in EDGES {
            let strip: Vec<[f32; 3]> = edge.iter().map(|&i| corners[i]).collect();
            strips.push(strip);
        }
    }

    let color = rerun::Color::from_rgb(255, 215, 0); // gold
    rec.log(
        name,
        &rerun::LineStrips3D::new(strips).with_colors(vec![color; objects.len() * EDGES.len()]),
    )?;

    Ok(())
}
