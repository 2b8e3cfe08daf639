// 该文件是 Shouwang （守望） 项目的一部分。
// src/face.rs - 人脸比对
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

//! # 人脸比对
//!
//! 每张人脸的特征向量与人脸库中每个条目计算欧氏距离，取最近的条目，
//! 距离在阈值内即为命中，否则标为 "Unknown"。
//!
//! 每个会话只抓拍一次：会话内第一次命中时在帧的私有副本上标注并编码，
//! 连同名字与置信度写入共享状态；之后的命中只标注直播画面。

use std::{
  fmt,
  str::FromStr,
  sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  geometry::BBox,
  model::FaceDetection,
  state::{Capture, DetectionState},
};

pub const UNKNOWN_LABEL: &str = "Unknown";

/// 比对方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
  /// 容差比对：`distance <= tolerance`
  Basic,
  /// 距离比对：`distance < threshold`
  #[default]
  Advanced,
}

impl fmt::Display for MatchMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MatchMethod::Basic => write!(f, "basic"),
      MatchMethod::Advanced => write!(f, "advanced"),
    }
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Method must be 'basic' or 'advanced', got '{0}'")]
pub struct UnknownMethod(pub String);

impl FromStr for MatchMethod {
  type Err = UnknownMethod;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "basic" => Ok(MatchMethod::Basic),
      "advanced" => Ok(MatchMethod::Advanced),
      other => Err(UnknownMethod(other.to_string())),
    }
  }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
  pub tolerance: f32,
  pub threshold: f32,
}

impl Default for MatcherConfig {
  fn default() -> Self {
    Self {
      tolerance: 0.6,
      threshold: 0.5,
    }
  }
}

impl MatcherConfig {
  /// 当前方法下的距离上限
  pub fn limit(&self, method: MatchMethod) -> f32 {
    match method {
      MatchMethod::Basic => self.tolerance,
      MatchMethod::Advanced => self.threshold,
    }
  }

  pub fn accepts(&self, method: MatchMethod, distance: f32) -> bool {
    match method {
      MatchMethod::Basic => distance <= self.tolerance,
      MatchMethod::Advanced => distance < self.threshold,
    }
  }

  /// 距离 0 对应 100，距离等于上限对应 0
  pub fn confidence(&self, method: MatchMethod, distance: f32) -> f32 {
    let limit = self.limit(method);
    if limit <= 0.0 {
      return 0.0;
    }
    ((1.0 - distance / limit) * 100.0).clamp(0.0, 100.0)
  }
}

#[derive(Debug, Clone)]
pub struct GalleryEntry {
  pub name: String,
  pub embedding: Vec<f32>,
}

/// 已登记的人脸集合，只整体替换，不原地修改
#[derive(Debug, Clone, Default)]
pub struct Gallery {
  entries: Vec<GalleryEntry>,
}

impl Gallery {
  pub fn new(entries: Vec<GalleryEntry>) -> Self {
    Self { entries }
  }

  pub fn entries(&self) -> &[GalleryEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.entries.iter().map(|entry| entry.name.as_str())
  }
}

/// 欧氏距离；维度不同或为空时返回 None
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
  if a.len() != b.len() || a.is_empty() {
    return None;
  }
  let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
  Some(sum.sqrt())
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
  pub name: String,
  pub distance: f32,
  pub confidence: f32,
}

/// 一张人脸的标注信息
#[derive(Debug, Clone)]
pub struct FaceAnnotation {
  pub bbox: BBox,
  pub matched: Option<FaceMatch>,
}

impl FaceAnnotation {
  pub fn label(&self) -> String {
    match &self.matched {
      Some(m) => format!("{} ({:.0}%)", m.name, m.confidence),
      None => UNKNOWN_LABEL.to_string(),
    }
  }

  pub fn is_known(&self) -> bool {
    self.matched.is_some()
  }
}

pub struct FaceMatcher {
  config: MatcherConfig,
  gallery: RwLock<Arc<Gallery>>,
  state: Arc<DetectionState>,
}

impl FaceMatcher {
  pub fn new(config: MatcherConfig, state: Arc<DetectionState>) -> Self {
    Self {
      config,
      gallery: RwLock::new(Arc::new(Gallery::default())),
      state,
    }
  }

  pub fn config(&self) -> &MatcherConfig {
    &self.config
  }

  pub fn state(&self) -> &Arc<DetectionState> {
    &self.state
  }

  /// 当前人脸库快照；正在比对的帧持有旧快照，替换不会撕裂读取
  pub fn gallery(&self) -> Arc<Gallery> {
    Arc::clone(&self.gallery.read().unwrap_or_else(PoisonError::into_inner))
  }

  pub fn replace_gallery(&self, gallery: Gallery) {
    let len = gallery.len();
    *self.gallery.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
    info!("人脸库已替换，共 {} 个条目", len);
  }

  /// 在人脸库中找距离最近且被接受的条目
  pub fn best_match(&self, gallery: &Gallery, embedding: &[f32], method: MatchMethod) -> Option<FaceMatch> {
    let (entry, distance) = gallery
      .entries()
      .iter()
      .filter_map(|entry| euclidean_distance(&entry.embedding, embedding).map(|d| (entry, d)))
      .min_by(|a, b| a.1.total_cmp(&b.1))?;

    if !self.config.accepts(method, distance) {
      return None;
    }
    Some(FaceMatch {
      name: entry.name.clone(),
      distance,
      confidence: self.config.confidence(method, distance),
    })
  }

  /// 比对一帧中的所有人脸
  ///
  /// `generation` 为帧开始处理时读到的会话代号。会话尚未抓拍时，
  /// 本帧按检测顺序第一个命中的人脸交给 `render_capture` 生成截图，
  /// 返回 None（例如编码失败）则本帧不抓拍。
  pub fn evaluate(
    &self,
    faces: &[FaceDetection],
    generation: u64,
    mut render_capture: impl FnMut(&FaceAnnotation) -> Option<Vec<u8>>,
  ) -> Vec<FaceAnnotation> {
    let gallery = self.gallery();
    let method = self.state.method();
    let mut capture_attempted = false;

    let mut annotations = Vec::with_capacity(faces.len());
    for face in faces {
      let annotation = FaceAnnotation {
        bbox: face.bbox,
        matched: self.best_match(&gallery, &face.embedding, method),
      };

      if let Some(matched) = &annotation.matched
        && !capture_attempted
        && self.state.capture_pending(generation)
      {
        capture_attempted = true;
        if let Some(screenshot) = render_capture(&annotation) {
          let captured = self.state.try_capture(
            generation,
            Capture {
              name: matched.name.clone(),
              confidence: matched.confidence,
              screenshot,
            },
          );
          if captured {
            info!(
              "抓拍人脸 {} (置信度 {:.0}%, 距离 {:.3})",
              matched.name, matched.confidence, matched.distance
            );
          }
        }
      }
      annotations.push(annotation);
    }
    debug!(
      "比对 {} 张人脸, 命中 {}",
      annotations.len(),
      annotations.iter().filter(|a| a.is_known()).count()
    );
    annotations
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn face(embedding: Vec<f32>, x: f32) -> FaceDetection {
    FaceDetection {
      bbox: BBox::new(x, 0.0, x + 50.0, 50.0),
      embedding,
    }
  }

  fn matcher_with(entries: Vec<(&str, Vec<f32>)>) -> FaceMatcher {
    let matcher = FaceMatcher::new(
      MatcherConfig::default(),
      Arc::new(DetectionState::default()),
    );
    matcher.replace_gallery(Gallery::new(
      entries
        .into_iter()
        .map(|(name, embedding)| GalleryEntry {
          name: name.to_string(),
          embedding,
        })
        .collect(),
    ));
    matcher
  }

  #[test]
  fn method_parses_wire_names() {
    assert_eq!("basic".parse::<MatchMethod>(), Ok(MatchMethod::Basic));
    assert_eq!("advanced".parse::<MatchMethod>(), Ok(MatchMethod::Advanced));
    assert!("fancy".parse::<MatchMethod>().is_err());
    assert_eq!(MatchMethod::default(), MatchMethod::Advanced);
  }

  #[test]
  fn confidence_spans_zero_to_hundred() {
    let config = MatcherConfig::default();
    assert_eq!(config.confidence(MatchMethod::Advanced, 0.0), 100.0);
    assert_eq!(config.confidence(MatchMethod::Advanced, 0.5), 0.0);
    assert_eq!(config.confidence(MatchMethod::Advanced, 0.9), 0.0);
    assert!((config.confidence(MatchMethod::Basic, 0.3) - 50.0).abs() < 1e-4);
  }

  #[test]
  fn basic_accepts_at_tolerance_advanced_rejects_at_threshold() {
    let config = MatcherConfig {
      tolerance: 0.5,
      threshold: 0.5,
    };
    assert!(config.accepts(MatchMethod::Basic, 0.5));
    assert!(!config.accepts(MatchMethod::Advanced, 0.5));
  }

  #[test]
  fn mismatched_dimensions_never_match() {
    assert_eq!(euclidean_distance(&[0.0, 0.0], &[0.0]), None);
    let matcher = matcher_with(vec![("alice", vec![0.0, 0.0, 0.0])]);
    let gallery = matcher.gallery();
    assert!(
      matcher
        .best_match(&gallery, &[0.0, 0.0], MatchMethod::Advanced)
        .is_none()
    );
  }

  #[test]
  fn nearest_entry_wins_and_closer_is_more_confident() {
    let matcher = matcher_with(vec![("alice", vec![0.0, 0.0]), ("bob", vec![1.0, 0.0])]);
    let gallery = matcher.gallery();
    let near = matcher
      .best_match(&gallery, &[0.1, 0.0], MatchMethod::Advanced)
      .unwrap();
    let far = matcher
      .best_match(&gallery, &[0.3, 0.0], MatchMethod::Advanced)
      .unwrap();
    assert_eq!(near.name, "alice");
    assert_eq!(far.name, "alice");
    assert!(near.confidence > far.confidence);
    assert!((0.0..=100.0).contains(&far.confidence));
  }

  #[test]
  fn empty_gallery_labels_everything_unknown() {
    let matcher = matcher_with(vec![]);
    let generation = matcher.state().generation();
    let annotations = matcher.evaluate(&[face(vec![0.0, 0.0], 0.0)], generation, |_| {
      panic!("empty gallery must not capture")
    });
    assert_eq!(annotations[0].label(), UNKNOWN_LABEL);
    assert!(!matcher.state().session().screenshot_available());
  }

  #[test]
  fn first_qualifying_face_in_frame_is_captured() {
    let matcher = matcher_with(vec![("alice", vec![0.0, 0.0]), ("bob", vec![5.0, 5.0])]);
    let generation = matcher.state().generation();
    let faces = [
      face(vec![9.0, 9.0], 0.0),
      face(vec![5.0, 5.1], 60.0),
      face(vec![0.0, 0.1], 120.0),
    ];
    let mut renders = 0;
    let annotations = matcher.evaluate(&faces, generation, |annotation| {
      renders += 1;
      assert_eq!(annotation.bbox.x1, 60.0);
      Some(vec![1, 2, 3])
    });
    assert_eq!(renders, 1);
    assert!(!annotations[0].is_known());
    assert!(annotations[1].is_known());
    assert!(annotations[2].is_known());

    let session = matcher.state().session();
    assert!(session.matched);
    assert_eq!(session.name.as_deref(), Some("bob"));
  }

  #[test]
  fn later_matches_do_not_replace_screenshot() {
    let matcher = matcher_with(vec![("alice", vec![0.0, 0.0])]);
    let generation = matcher.state().generation();
    matcher.evaluate(&[face(vec![0.0, 0.0], 0.0)], generation, |_| Some(vec![1]));
    let annotations = matcher.evaluate(&[face(vec![0.0, 0.1], 0.0)], generation, |_| {
      panic!("session already captured")
    });
    assert!(annotations[0].is_known());
    assert_eq!(
      matcher.state().session().screenshot.as_deref(),
      Some(&[1u8][..])
    );
  }

  #[test]
  fn capture_from_before_reset_is_dropped() {
    let matcher = matcher_with(vec![("alice", vec![0.0, 0.0])]);
    let stale = matcher.state().generation();
    matcher.state().reset_session();
    matcher.evaluate(&[face(vec![0.0, 0.0], 0.0)], stale, |_| Some(vec![1]));
    assert!(!matcher.state().session().matched);
  }

  #[test]
  fn failed_render_retries_on_next_frame() {
    let matcher = matcher_with(vec![("alice", vec![0.0, 0.0])]);
    let generation = matcher.state().generation();
    matcher.evaluate(&[face(vec![0.0, 0.0], 0.0)], generation, |_| None);
    assert!(!matcher.state().session().matched);
    matcher.evaluate(&[face(vec![0.0, 0.0], 0.0)], generation, |_| Some(vec![7]));
    assert!(matcher.state().session().matched);
  }
}
