/// opencv
/// https://docs.rs/opencv/latest/opencv/all.html
///
/// nalgebra
/// https://docs.rs/nalgebra/latest/nalgebra/
///
/// ndarray
/// https://docs.rs/ndarray/latest/ndarray/all.html
///
// usage: vslam-map <dataset dir> <camera yaml> [params json] [exchange dir] [output dir]
extern crate opencv;

mod bundle_channel;
mod camera;
mod config;
mod dataset;
mod geometry;
mod global_cast;
mod global_types;
mod map;
mod save;
mod utility;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::bundle_channel::FileBundleChannel;
use crate::camera::PinholeCamera;
use crate::config::MapParameters;
use crate::dataset::DatasetTrait;
use crate::map::Map;

/// 处理完所有帧后等待最后一次 BA 结果的时间
const FINAL_BUNDLE_WAIT: Duration = Duration::from_secs(30);

/// 取回 BA 结果并应用，需要时发送第二遍请求
fn poll_bundle(map: &mut Map<PinholeCamera>, channel: &FileBundleChannel) -> Result<bool> {
    let Some(seq) = map.pending_seq() else {
        return Ok(false);
    };
    let Some(response) = channel.poll(seq)? else {
        return Ok(false);
    };
    match map.update_bundle(&response) {
        Ok(report) => {
            log::info!(
                "bundle {} applied: {} keyframes, {} points updated, {} removed, {} observations dropped",
                seq,
                report.keyframes_updated,
                report.points_updated,
                report.points_removed,
                report.observations_dropped
            );
            if let Some(request) = report.chained {
                channel.send(&request)?;
            }
        }
        Err(e) => log::warn!("bundle response {} discarded: {}", seq, e),
    }
    Ok(true)
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_nanos()
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        anyhow::bail!(
            "usage: {} <dataset dir> <camera yaml> [params json] [exchange dir] [output dir]",
            args[0]
        );
    }
    let dataset_path = &args[1];
    let camera_file = &args[2];
    let params = match args.get(3) {
        Some(path) => MapParameters::from_json_file(path)?,
        None => MapParameters::default(),
    };
    let exchange_dir = args.get(4).map(String::as_str).unwrap_or("bundle_exchange");
    let output_dir = args.get(5).map(String::as_str).unwrap_or("output");
    log::info!("path: {:?}", dataset_path);

    let dataset = dataset::DefaultDataset::new(dataset_path)?;
    let camera = Arc::new(PinholeCamera::new(camera_file)?);
    let channel = FileBundleChannel::new(exchange_dir)?;
    let mut map = Map::new(params, camera.clone());

    for index in 0..dataset.len() {
        poll_bundle(&mut map, &channel)?;

        let frame = dataset
            .read_frame(index)
            .with_context(|| format!("failed to load frame {}", index))?;
        let manual_pose = dataset.manual_pose(frame.timestamp);
        let report = map.process_frame(&frame, manual_pose.as_ref())?;
        match &report.pnp {
            Ok(estimate) => log::debug!(
                "frame {}: {} ({} inliers / {} matches)",
                index,
                estimate.pose,
                estimate.n_inliers,
                estimate.n_matches
            ),
            Err(e) => log::debug!("frame {}: {}", index, e),
        }
        if let Some(request) = report.bundle {
            channel.send(&request)?;
        }
    }

    let start = Instant::now();
    while map.pending_seq().is_some() && start.elapsed() < FINAL_BUNDLE_WAIT {
        if !poll_bundle(&mut map, &channel)? {
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    if let Some(seq) = map.pending_seq() {
        log::warn!("bundle {} still pending, exporting without it", seq);
    }

    save::save_map(&map, output_dir)?;
    let camera_out = std::path::Path::new(output_dir).join("camera.yaml");
    camera
        .parameters
        .write_to_yaml(&camera_out.to_string_lossy())?;
    log::info!("{}", serde_json::to_string(&map.benchmark_info())?);
    Ok(())
}
