// 该文件是 Shouwang （守望） 项目的一部分。
// src/geometry.rs - 像素坐标边界框
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

use serde::Serialize;

/// 像素坐标下的边界框 `[x1, y1, x2, y2]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl BBox {
  pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  /// 由中心点与宽高构造（YOLO 输出格式）
  pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
  }

  pub fn width(&self) -> f32 {
    (self.x2 - self.x1).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.y2 - self.y1).max(0.0)
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn center(&self) -> (f32, f32) {
    ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
  }

  /// 两框中心点之间的欧氏距离
  pub fn center_distance(&self, other: &BBox) -> f32 {
    let (ax, ay) = self.center();
    let (bx, by) = other.center();
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
  }

  pub fn iou(&self, other: &BBox) -> f32 {
    let x1 = self.x1.max(other.x1);
    let y1 = self.y1.max(other.y1);
    let x2 = self.x2.min(other.x2);
    let y2 = self.y2.min(other.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;
    if union > 0.0 { intersection / union } else { 0.0 }
  }

  /// 裁剪到 `width x height` 的图像范围内
  pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
    let (w, h) = (width as f32, height as f32);
    BBox {
      x1: self.x1.clamp(0.0, w),
      y1: self.y1.clamp(0.0, h),
      x2: self.x2.clamp(0.0, w),
      y2: self.y2.clamp(0.0, h),
    }
  }

  pub fn scale(&self, sx: f32, sy: f32) -> BBox {
    BBox {
      x1: self.x1 * sx,
      y1: self.y1 * sy,
      x2: self.x2 * sx,
      y2: self.y2 * sy,
    }
  }
}

impl From<[f32; 4]> for BBox {
  fn from(v: [f32; 4]) -> Self {
    BBox::new(v[0], v[1], v[2], v[3])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_of_identical_boxes_is_one() {
    let a = BBox::new(10.0, 10.0, 50.0, 90.0);
    assert!((a.iou(&a) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn iou_of_disjoint_boxes_is_zero() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(20.0, 20.0, 30.0, 30.0);
    assert_eq!(a.iou(&b), 0.0);
  }

  #[test]
  fn center_distance_is_euclidean() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(3.0, 4.0, 13.0, 14.0);
    assert!((a.center_distance(&b) - 5.0).abs() < 1e-6);
  }

  #[test]
  fn clamp_keeps_box_inside_image() {
    let b = BBox::new(-5.0, -5.0, 700.0, 500.0).clamp_to(640, 480);
    assert_eq!(b, BBox::new(0.0, 0.0, 640.0, 480.0));
  }
}
