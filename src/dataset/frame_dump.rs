use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use super::DatasetTrait;
use crate::global_types::{Frame, Pose3D, Timestamp};

#[derive(Debug, Deserialize)]
struct FrameRecord {
    timestamp: i64,
    file: String,
}

#[derive(Debug, Deserialize)]
struct ManualPoseRecord {
    timestamp: i64,
    x: f64,
    y: f64,
    z: f64,
    roll: f64,
    pitch: f64,
    yaw: f64,
}

#[derive(Debug, Default)]
pub struct FrameDumpDataset {
    pub frames: Vec<(Timestamp, String)>,
    pub manual_poses: BTreeMap<Timestamp, Pose3D>,
}

impl FrameDumpDataset {
    const FRAMES_CSV: &'static str = "frames.csv";
    const MANUAL_POSES_CSV: &'static str = "manual_poses.csv";

    pub fn read_frames(path: &Path) -> Result<Vec<(Timestamp, String)>> {
        let csv_path = path.join(Self::FRAMES_CSV);
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&csv_path)
            .with_context(|| format!("failed to open {}", csv_path.display()))?;
        let mut frames = Vec::new();
        for record in reader.deserialize() {
            let record: FrameRecord =
                record.with_context(|| format!("bad record in {}", csv_path.display()))?;
            let file: PathBuf = path.join(record.file);
            frames.push((Timestamp(record.timestamp), file.to_string_lossy().into_owned()));
        }
        frames.sort_by_key(|(t, _)| *t);
        Ok(frames)
    }

    /// 文件不存在时返回空表
    pub fn read_manual_poses(path: &Path) -> Result<BTreeMap<Timestamp, Pose3D>> {
        let csv_path = path.join(Self::MANUAL_POSES_CSV);
        if !csv_path.exists() {
            return Ok(BTreeMap::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&csv_path)
            .with_context(|| format!("failed to open {}", csv_path.display()))?;
        let mut poses = BTreeMap::new();
        for record in reader.deserialize() {
            let r: ManualPoseRecord =
                record.with_context(|| format!("bad record in {}", csv_path.display()))?;
            poses.insert(
                Timestamp(r.timestamp),
                Pose3D::new(r.x, r.y, r.z, r.roll, r.pitch, r.yaw),
            );
        }
        Ok(poses)
    }

    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let frames = Self::read_frames(path)?;
        let manual_poses = Self::read_manual_poses(path)?;
        log::info!(
            "dataset {}: {} frames, {} manual poses",
            path.display(),
            frames.len(),
            manual_poses.len()
        );
        Ok(Self {
            frames,
            manual_poses,
        })
    }
}

impl DatasetTrait for FrameDumpDataset {
    fn frame_list(&self) -> &Vec<(Timestamp, String)> {
        &self.frames
    }

    fn read_frame(&self, index: usize) -> Result<Frame> {
        let (timestamp, file) = self
            .frames
            .get(index)
            .with_context(|| format!("frame index {} out of range", index))?;
        let text =
            std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file))?;
        let mut frame: Frame =
            serde_json::from_str(&text).with_context(|| format!("failed to parse {}", file))?;
        // 以索引中的时间戳为准
        frame.timestamp = *timestamp;
        Ok(frame)
    }

    fn manual_pose(&self, timestamp: Timestamp) -> Option<Pose3D> {
        self.manual_poses.get(&timestamp).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;
    use ndarray::Array2;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vslam_map_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_read_dataset() {
        let dir = temp_dir("dataset");
        let frame = Frame {
            timestamp: Timestamp(0),
            pose: Pose3D::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.2),
            keypoints: vec![Point2::new(10.0, 20.0), Point2::new(30.5, 40.0)],
            descriptors: Array2::from_shape_vec((2, 3), vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6])
                .unwrap(),
            image_width: 640,
            image_height: 480,
        };
        std::fs::write(dir.join("f1.json"), serde_json::to_string(&frame).unwrap()).unwrap();
        std::fs::write(dir.join("f0.json"), serde_json::to_string(&frame).unwrap()).unwrap();
        std::fs::write(
            dir.join("frames.csv"),
            "timestamp,file\n2000000000,f1.json\n1000000000,f0.json\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("manual_poses.csv"),
            "timestamp,x,y,z,roll,pitch,yaw\n1000000000,1.0,2.0,1.5,0.0,0.0,0.5\n",
        )
        .unwrap();

        let dataset = FrameDumpDataset::new(&dir).unwrap();
        assert_eq!(dataset.len(), 2);
        // 按时间戳排序
        assert_eq!(dataset.frame_list()[0].0, Timestamp(1_000_000_000));
        let first = dataset.read_frame(0).unwrap();
        assert_eq!(first.timestamp, Timestamp(1_000_000_000));
        assert_eq!(first.keypoints, frame.keypoints);
        assert_eq!(first.descriptors, frame.descriptors);
        assert_eq!(
            dataset.manual_pose(Timestamp(1_000_000_000)),
            Some(Pose3D::new(1.0, 2.0, 1.5, 0.0, 0.0, 0.5))
        );
        assert_eq!(dataset.manual_pose(Timestamp(2_000_000_000)), None);
        assert!(dataset.read_frame(2).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_index() {
        let dir = temp_dir("dataset_missing");
        assert!(FrameDumpDataset::new(&dir).is_err());
        std::fs::write(dir.join("frames.csv"), "timestamp,file\n").unwrap();
        let dataset = FrameDumpDataset::new(&dir).unwrap();
        assert!(dataset.is_empty());
        assert!(dataset.manual_poses.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
