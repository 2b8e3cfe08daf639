// 该文件是 Shouwang （守望） 项目的一部分。
// src/crowd.rs - 人数统计与武器告警
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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::{
  geometry::BBox,
  model::{DetectItem, DetectResult, ObjectKind},
  state::{CrowdSnapshot, DetectionState},
  tracker::{IdentityTracker, TrackId, TrackerConfig},
};

#[derive(Debug, Clone)]
pub struct CrowdConfig {
  /// 低于该置信度的人不参与跟踪
  pub person_confidence: f32,
  /// 武器告警的置信度下限
  pub weapon_confidence: f32,
  pub tracker: TrackerConfig,
}

impl Default for CrowdConfig {
  fn default() -> Self {
    Self {
      person_confidence: 0.25,
      weapon_confidence: 0.5,
      tracker: TrackerConfig::default(),
    }
  }
}

/// 一帧聚合后的结果，用于发布与画面标注
#[derive(Debug, Clone, Default)]
pub struct CrowdReport {
  pub frame_index: u64,
  pub count: usize,
  pub weapon_detected: bool,
  pub persons: Vec<(TrackId, DetectItem<ObjectKind>)>,
  pub weapons: Vec<DetectItem<ObjectKind>>,
}

/// 人群聚合器，独占身份跟踪器
///
/// 多个 `/video` 消费者共享同一个聚合器。帧索引不大于上次处理的帧时
/// 直接复用上次的结果，同一帧不会让跟踪器前进两次。
#[derive(Debug)]
pub struct CrowdAggregator {
  config: CrowdConfig,
  tracker: IdentityTracker,
  state: Arc<DetectionState>,
  last: Option<CrowdReport>,
}

pub type SharedAggregator = Arc<Mutex<CrowdAggregator>>;

impl CrowdAggregator {
  pub fn new(config: CrowdConfig, state: Arc<DetectionState>) -> Self {
    let tracker = IdentityTracker::new(config.tracker.clone());
    Self {
      config,
      tracker,
      state,
      last: None,
    }
  }

  pub fn shared(self) -> SharedAggregator {
    Arc::new(Mutex::new(self))
  }

  pub fn lock(shared: &SharedAggregator) -> MutexGuard<'_, CrowdAggregator> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 该帧已被处理过时返回缓存的结果
  pub fn cached(&self, frame_index: u64) -> Option<CrowdReport> {
    self
      .last
      .as_ref()
      .filter(|last| frame_index <= last.frame_index)
      .cloned()
  }

  pub fn process(&mut self, frame_index: u64, result: &DetectResult<ObjectKind>) -> CrowdReport {
    if let Some(report) = self.cached(frame_index) {
      debug!("第 {} 帧已处理，复用结果", frame_index);
      return report;
    }

    let mut persons = Vec::new();
    let mut weapons = Vec::new();
    for item in result.items.iter() {
      match item.kind {
        ObjectKind::Person if item.score >= self.config.person_confidence => {
          persons.push(item.clone())
        }
        ObjectKind::Weapon if item.score >= self.config.weapon_confidence => {
          weapons.push(item.clone())
        }
        _ => {}
      }
    }

    let boxes: Vec<BBox> = persons.iter().map(|item| item.bbox).collect();
    let ids = self.tracker.update(&boxes);
    let count = self.tracker.count();
    let weapon_detected = !weapons.is_empty();

    self.state.publish_crowd(CrowdSnapshot {
      count,
      weapon_detected,
      frame_index: Some(frame_index),
    });
    if weapon_detected {
      warn!("第 {} 帧检测到武器 ({} 个)", frame_index, weapons.len());
    }
    debug!(
      "第 {} 帧: 检测到 {} 人, 当前人数 {}",
      frame_index,
      persons.len(),
      count
    );

    let report = CrowdReport {
      frame_index,
      count,
      weapon_detected,
      persons: ids.into_iter().zip(persons).collect(),
      weapons,
    };
    self.last = Some(report.clone());
    report
  }

  /// 清空轨迹并发布人数 0；武器标志保持不变
  pub fn reset(&mut self) {
    self.tracker.clear();
    let weapon_detected = self.state.update_crowd(|snapshot| {
      snapshot.count = 0;
      snapshot.frame_index = None;
      snapshot.weapon_detected
    });
    if let Some(last) = self.last.as_mut() {
      last.count = 0;
      last.persons.clear();
      last.weapon_detected = weapon_detected;
    }
    info!("人数统计已重置");
  }

  pub fn live_tracks(&self) -> usize {
    self.tracker.count()
  }
}
