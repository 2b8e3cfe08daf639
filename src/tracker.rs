// 该文件是 Shouwang （守望） 项目的一部分。
// src/tracker.rs - 跨帧身份跟踪
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # 身份跟踪
//!
//! 基于中心点距离的贪心关联：
//!
//! 1. 计算所有（存活轨迹, 检测框）对的中心点距离，只保留不超过阈值的对；
//! 2. 按（距离, 轨迹 ID, 检测序号）升序排序，依次接受两端都未被占用的对。
//!    距离相同时 ID 更小（更老）的轨迹优先；
//! 3. 未匹配的检测框新建轨迹，ID 单调分配、永不复用；
//! 4. 未匹配的轨迹丢失计数加一，超过 `max_missed` 后移除。
//!
//! 人数即存活轨迹数，而不是单帧检测数：静止的人只计一次，
//! 短暂离开（不超过宽限帧数）后回来的人保留原 ID。

use tracing::debug;

use crate::geometry::BBox;

pub type TrackId = u64;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
  /// 中心点距离阈值（像素）
  pub max_distance: f32,
  /// 连续未匹配多少帧后移除轨迹
  pub max_missed: u32,
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      max_distance: 35.0,
      max_missed: 15,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Track {
  pub id: TrackId,
  pub bbox: BBox,
  /// 自上次匹配以来经过的已处理帧数
  pub missed: u32,
}

#[derive(Debug)]
pub struct IdentityTracker {
  config: TrackerConfig,
  tracks: Vec<Track>,
  next_id: TrackId,
}

impl Default for IdentityTracker {
  fn default() -> Self {
    Self::new(TrackerConfig::default())
  }
}

impl IdentityTracker {
  pub fn new(config: TrackerConfig) -> Self {
    Self {
      config,
      tracks: Vec::new(),
      next_id: 0,
    }
  }

  /// 输入本帧的检测框，返回与输入顺序一一对应的轨迹 ID
  pub fn update(&mut self, detections: &[BBox]) -> Vec<TrackId> {
    let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
    for (t, track) in self.tracks.iter().enumerate() {
      for (d, bbox) in detections.iter().enumerate() {
        let distance = track.bbox.center_distance(bbox);
        if distance.is_finite() && distance <= self.config.max_distance {
          pairs.push((distance, t, d));
        }
      }
    }
    // tracks 按 ID 升序存放，因此轨迹下标的顺序就是 ID 的顺序
    pairs.sort_by(|a, b| {
      a.0
        .total_cmp(&b.0)
        .then(a.1.cmp(&b.1))
        .then(a.2.cmp(&b.2))
    });

    let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];
    let mut track_matched = vec![false; self.tracks.len()];
    for (_, t, d) in pairs {
      if track_matched[t] || assigned[d].is_some() {
        continue;
      }
      track_matched[t] = true;
      let track = &mut self.tracks[t];
      track.bbox = detections[d];
      track.missed = 0;
      assigned[d] = Some(track.id);
    }

    for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
      if !matched {
        track.missed += 1;
      }
    }
    let max_missed = self.config.max_missed;
    let before = self.tracks.len();
    self.tracks.retain(|track| track.missed <= max_missed);
    if self.tracks.len() < before {
      debug!("移除 {} 条过期轨迹", before - self.tracks.len());
    }

    assigned
      .into_iter()
      .zip(detections)
      .map(|(id, bbox)| match id {
        Some(id) => id,
        None => {
          let id = self.next_id;
          self.next_id += 1;
          self.tracks.push(Track {
            id,
            bbox: *bbox,
            missed: 0,
          });
          id
        }
      })
      .collect()
  }

  /// 存活轨迹数，即人数
  pub fn count(&self) -> usize {
    self.tracks.len()
  }

  pub fn tracks(&self) -> &[Track] {
    &self.tracks
  }

  /// 清空所有轨迹；ID 计数器不回退
  pub fn clear(&mut self) {
    self.tracks.clear();
  }
}
