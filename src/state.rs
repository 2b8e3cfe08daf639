// 该文件是 Shouwang （守望） 项目的一部分。
// src/state.rs - 共享检测状态
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

use std::sync::{
  Arc, PoisonError, RwLock,
  atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::face::MatchMethod;

/// 人群流发布的（人数, 武器标志）对，二者来自同一帧
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CrowdSnapshot {
  pub count: usize,
  pub weapon_detected: bool,
  /// 产生该快照的帧；重置后为 None
  pub frame_index: Option<u64>,
}

/// 当前人脸匹配会话
#[derive(Debug, Clone, Default)]
pub struct MatchSession {
  /// 每次重置加一，用于丢弃重置前开始计算的抓拍
  pub generation: u64,
  pub matched: bool,
  pub name: Option<String>,
  pub confidence: Option<f32>,
  pub screenshot: Option<Arc<[u8]>>,
  pub captured_at: Option<DateTime<Utc>>,
}

impl MatchSession {
  pub fn screenshot_available(&self) -> bool {
    self.screenshot.is_some()
  }
}

/// 一次会话抓拍的内容
#[derive(Debug, Clone)]
pub struct Capture {
  pub name: String,
  pub confidence: f32,
  pub screenshot: Vec<u8>,
}

/// 进程内共享的检测状态
///
/// 人数与武器标志由人群流写入，匹配会话由人脸流写入，
/// 两组字段各自在一把读写锁下整体替换，读者不会看到半更新的状态。
#[derive(Debug)]
pub struct DetectionState {
  crowd: RwLock<CrowdSnapshot>,
  session: RwLock<MatchSession>,
  face_enabled: AtomicBool,
  method: RwLock<MatchMethod>,
}

impl Default for DetectionState {
  fn default() -> Self {
    Self::new(MatchMethod::default())
  }
}

impl DetectionState {
  pub fn new(method: MatchMethod) -> Self {
    Self {
      crowd: RwLock::new(CrowdSnapshot::default()),
      session: RwLock::new(MatchSession::default()),
      face_enabled: AtomicBool::new(false),
      method: RwLock::new(method),
    }
  }

  pub fn crowd(&self) -> CrowdSnapshot {
    *self.crowd.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn publish_crowd(&self, snapshot: CrowdSnapshot) {
    *self.crowd.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
  }

  /// 在锁内读取并更新人群快照
  pub fn update_crowd<R>(&self, f: impl FnOnce(&mut CrowdSnapshot) -> R) -> R {
    let mut guard = self.crowd.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
  }

  pub fn session(&self) -> MatchSession {
    self
      .session
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn generation(&self) -> u64 {
    self
      .session
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .generation
  }

  /// 清空会话并进入新一代，返回新的代号
  pub fn reset_session(&self) -> u64 {
    let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
    let generation = session.generation + 1;
    *session = MatchSession {
      generation,
      ..MatchSession::default()
    };
    info!("人脸匹配会话已重置（第 {} 代）", generation);
    generation
  }

  /// 会话仍在 `generation` 且尚未抓拍
  pub fn capture_pending(&self, generation: u64) -> bool {
    let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
    session.generation == generation && !session.matched
  }

  /// 会话仍在 `generation` 且尚未抓拍时写入抓拍，返回是否写入
  pub fn try_capture(&self, generation: u64, capture: Capture) -> bool {
    let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
    if session.generation != generation || session.matched {
      return false;
    }
    session.matched = true;
    session.name = Some(capture.name);
    session.confidence = Some(capture.confidence);
    session.screenshot = Some(Arc::from(capture.screenshot));
    session.captured_at = Some(Utc::now());
    true
  }

  pub fn face_enabled(&self) -> bool {
    self.face_enabled.load(Ordering::Acquire)
  }

  /// 切换人脸识别开关，返回切换后的状态
  pub fn toggle_face_enabled(&self) -> bool {
    !self.face_enabled.fetch_xor(true, Ordering::AcqRel)
  }

  pub fn set_face_enabled(&self, enabled: bool) -> bool {
    self.face_enabled.swap(enabled, Ordering::AcqRel)
  }

  pub fn method(&self) -> MatchMethod {
    *self.method.read().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn set_method(&self, method: MatchMethod) {
    *self.method.write().unwrap_or_else(PoisonError::into_inner) = method;
    info!("人脸识别方法切换为 {}", method);
  }
}
