use ndarray::{ArrayView1, ArrayView2};

use crate::global_types::PointSlot;

/// 匹配结果：`indices_a[k]` 与 `indices_b[k]` 为一对匹配
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorMatches {
    pub indices_a: Vec<usize>,
    pub indices_b: Vec<usize>,
}

impl DescriptorMatches {
    pub fn len(&self) -> usize {
        self.indices_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices_a.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.indices_a
            .iter()
            .copied()
            .zip(self.indices_b.iter().copied())
    }
}

#[inline]
fn l2_distance(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// matchDescriptors
///
/// A 的每一行在 B 中寻找最近邻，候选按距离升序（稳定排序）贪心接受：
/// - 距离不超过 `threshold`
/// - 只考虑前 `max_matches` 个候选（限制的是搜索宽度，不是接受数量）
/// - B 的每一行最多被接受一次，先到先得
/// - 给定 `slots` 时，在完整匹配之后只保留两边都是 [PointSlot::Unmapped] 的对，用于发现新路标。
///   最近邻总是在 B 的所有行中搜索，被过滤掉的对仍然占用 B 的那一行
pub fn match_descriptors(
    desc_a: ArrayView2<f32>,
    desc_b: ArrayView2<f32>,
    slots: Option<(&[PointSlot], &[PointSlot])>,
    threshold: f32,
    max_matches: Option<usize>,
) -> DescriptorMatches {
    let mut matches = DescriptorMatches::default();
    if desc_a.nrows() == 0 || desc_b.nrows() == 0 {
        return matches;
    }
    if desc_a.ncols() != desc_b.ncols() {
        log::warn!(
            "descriptor width mismatch: {} vs {}",
            desc_a.ncols(),
            desc_b.ncols()
        );
        return matches;
    }

    let unmapped = |slots: &[PointSlot], i: usize| slots.get(i).map_or(false, PointSlot::is_unmapped);

    // (a, b, distance)
    let mut candidates: Vec<(usize, usize, f32)> = Vec::with_capacity(desc_a.nrows());
    for (i, row_a) in desc_a.rows().into_iter().enumerate() {
        let mut best: Option<(usize, f32)> = None;
        for (j, row_b) in desc_b.rows().into_iter().enumerate() {
            let d = l2_distance(row_a, row_b);
            match best {
                Some((_, best_d)) if best_d <= d => {}
                _ => best = Some((j, d)),
            }
        }
        if let Some((j, d)) = best {
            candidates.push((i, j, d));
        }
    }

    // sort_by 是稳定排序，距离相同时保持原始顺序
    candidates.sort_by(|x, y| x.2.total_cmp(&y.2));
    let breadth = max_matches.map_or(candidates.len(), |m| m.min(candidates.len()));

    let mut claimed = vec![false; desc_b.nrows()];
    for &(i, j, d) in &candidates[..breadth] {
        if d > threshold {
            break;
        }
        if claimed[j] {
            continue;
        }
        claimed[j] = true;
        if let Some((slots_a, slots_b)) = slots {
            if !(unmapped(slots_a, i) && unmapped(slots_b, j)) {
                continue;
            }
        }
        matches.indices_a.push(i);
        matches.indices_b.push(j);
    }
    matches
}
