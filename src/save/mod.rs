//! 地图导出
//!
//! 关键帧轨迹写入 `keyframes.csv`，路标点云写入 `landmarks.csv`。
mod records;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::camera::CameraTrait;
use crate::map::Map;

pub use records::{KeyframeRecord, LandmarkRecord};

fn write_csv<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    writer.flush()?;
    Ok(())
}

/// 导出关键帧和路标，返回写入的两个文件
pub fn save_map<C: CameraTrait>(map: &Map<C>, dir: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let keyframes_path = dir.join("keyframes.csv");
    write_csv(&keyframes_path, map.keyframes().map(KeyframeRecord::from))?;
    let landmarks_path = dir.join("landmarks.csv");
    write_csv(&landmarks_path, map.landmarks().map(LandmarkRecord::from))?;

    log::info!(
        "saved {} keyframes and {} landmarks to {}",
        map.n_keyframes(),
        map.n_landmarks(),
        dir.display()
    );
    Ok((keyframes_path, landmarks_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::tests::two_view_map;

    #[test]
    fn test_save_map() {
        let map = two_view_map(12);
        let dir = std::env::temp_dir().join(format!("vslam_map_save_{}", std::process::id()));
        let (kf_path, lm_path) = save_map(&map, &dir).unwrap();

        let mut reader = csv::Reader::from_path(&kf_path).unwrap();
        let keyframes: Vec<KeyframeRecord> =
            reader.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(keyframes.len(), 2);
        assert_eq!(keyframes[0].id, 0);
        assert_eq!(keyframes[1].n_mapped, 12);
        assert_eq!(keyframes[1].x, map.keyframes().nth(1).unwrap().pose.x);

        let mut reader = csv::Reader::from_path(&lm_path).unwrap();
        let landmarks: Vec<LandmarkRecord> =
            reader.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(landmarks.len(), 12);
        assert!(landmarks.iter().all(|lm| lm.n_observers == 2));
        std::fs::remove_dir_all(&dir).ok();
    }
}
