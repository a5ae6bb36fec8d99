use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::global_types::{LandmarkId, WorldPoint};

/// 路标的扁平表，用于批量匹配
///
/// `points[i]`、`descriptors` 第 i 行与 `ids[i]` 一一对应。路标ID单调递增且只在末尾追加，
/// 所以 `ids` 始终有序，可以二分查找。删除时整体前移，保持相对顺序。
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    ids: Vec<LandmarkId>,
    points: Vec<WorldPoint>,
    descriptors: Array2<f32>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn push(&mut self, id: LandmarkId, point: WorldPoint, descriptor: ArrayView1<f32>) -> Result<()> {
        if let Some(last) = self.ids.last() {
            ensure!(*last < id, "landmark {} inserted after {}", id, last);
        }
        if self.ids.is_empty() {
            self.descriptors = Array2::zeros((0, descriptor.len()));
        }
        ensure!(
            self.descriptors.ncols() == descriptor.len(),
            "descriptor of landmark {} has {} columns, table has {}",
            id,
            descriptor.len(),
            self.descriptors.ncols()
        );
        self.descriptors.push_row(descriptor)?;
        self.ids.push(id);
        self.points.push(point);
        Ok(())
    }

    pub fn index_of(&self, id: LandmarkId) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    pub fn update(&mut self, id: LandmarkId, point: WorldPoint) -> bool {
        match self.index_of(id) {
            Some(idx) => {
                self.points[idx] = point;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: LandmarkId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        self.ids.remove(idx);
        self.points.remove(idx);
        let keep: Vec<usize> = (0..self.descriptors.nrows()).filter(|&i| i != idx).collect();
        self.descriptors = self.descriptors.select(Axis(0), &keep);
        true
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn ids(&self) -> &[LandmarkId] {
        &self.ids
    }

    pub fn points(&self) -> &[WorldPoint] {
        &self.points
    }

    pub fn descriptors(&self) -> ArrayView2<f32> {
        self.descriptors.view()
    }

    pub fn get(&self, idx: usize) -> Option<(LandmarkId, &WorldPoint, ArrayView1<f32>)> {
        if idx >= self.len() {
            return None;
        }
        Some((self.ids[idx], &self.points[idx], self.descriptors.row(idx)))
    }

    /// 与路标表逐行比较，测试中检查一致性
    #[cfg(test)]
    pub fn matches_row(&self, idx: usize, point: &WorldPoint, descriptor: &ndarray::Array1<f32>) -> bool {
        self.points[idx] == *point && self.descriptors.row(idx) == descriptor.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_push_remove_keeps_order() {
        let mut cloud = PointCloud::default();
        for i in 0..5u32 {
            let d = array![i as f32, 0.0];
            cloud.push(LandmarkId(i * 2), WorldPoint::new(i as f64, 0.0, 0.0), d.view()).unwrap();
        }
        assert!(cloud.remove(LandmarkId(4)));
        assert!(!cloud.remove(LandmarkId(4)));
        assert!(!cloud.remove(LandmarkId(3)));
        assert_eq!(cloud.ids(), &[LandmarkId(0), LandmarkId(2), LandmarkId(6), LandmarkId(8)]);
        assert_eq!(cloud.descriptors().column(0).to_vec(), vec![0.0, 1.0, 3.0, 4.0]);
        assert_eq!(cloud.points()[2].x, 3.0);

        assert!(cloud.update(LandmarkId(6), WorldPoint::new(7.0, 7.0, 7.0)));
        assert!(!cloud.update(LandmarkId(5), WorldPoint::origin()));
        assert_eq!(cloud.get(2).map(|(id, p, _)| (id, *p)), Some((LandmarkId(6), WorldPoint::new(7.0, 7.0, 7.0))));
    }

    #[test]
    fn test_push_rejects_bad_rows() {
        let mut cloud = PointCloud::default();
        cloud.push(LandmarkId(3), WorldPoint::origin(), array![1.0f32, 2.0].view()).unwrap();
        assert!(cloud.push(LandmarkId(1), WorldPoint::origin(), array![1.0f32, 2.0].view()).is_err());
        assert!(cloud.push(LandmarkId(4), WorldPoint::origin(), array![1.0f32].view()).is_err());
        assert_eq!(cloud.len(), 1);

        cloud.clear();
        assert!(cloud.is_empty());
        assert_eq!(cloud.descriptors().nrows(), 0);
    }
}
