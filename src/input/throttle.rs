// 该文件是 Shouwang （守望） 项目的一部分。
// src/input/throttle.rs - 推理节流
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

/// 每 N 帧放行一帧做推理
///
/// 计数器先自增再判断，因此第 N、2N、3N... 帧被放行，
/// `every == 1` 时每帧都放行。
#[derive(Debug, Clone)]
pub struct Throttle {
  every: u64,
  counter: u64,
}

impl Throttle {
  pub fn new(every: u32) -> Self {
    Self {
      every: every.max(1) as u64,
      counter: 0,
    }
  }

  pub fn admit(&mut self) -> bool {
    self.counter = self.counter.wrapping_add(1);
    self.counter % self.every == 0
  }

  pub fn every(&self) -> u64 {
    self.every
  }
}
