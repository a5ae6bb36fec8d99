//! 数据集处理
//!
//! 特征提取模块把每一帧（先验位姿、特征点、描述子）导出为 JSON 文件，
//! 并在 `frames.csv` 中列出时间戳和文件名。
mod frame_dump;

use crate::global_types::{Frame, Pose3D, Timestamp};

pub use frame_dump::FrameDumpDataset;

pub type DefaultDataset = frame_dump::FrameDumpDataset;
pub trait DatasetTrait {
    /// 读取帧列表
    /// 返回时间戳和帧文件路径
    fn frame_list(&self) -> &Vec<(Timestamp, String)>;

    /// 读取第 `index` 帧
    fn read_frame(&self, index: usize) -> anyhow::Result<Frame>;

    /// 该时刻手动指定的位姿
    fn manual_pose(&self, timestamp: Timestamp) -> Option<Pose3D>;

    fn len(&self) -> usize {
        self.frame_list().len()
    }

    fn is_empty(&self) -> bool {
        self.frame_list().is_empty()
    }
}
