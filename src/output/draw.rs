// 该文件是 Shouwang （守望） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_text_mut},
  rect::Rect,
};

use crate::{
  crowd::CrowdReport,
  face::FaceAnnotation,
  geometry::BBox,
  model::WithLabel,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;

pub const PERSON_COLOR: [u8; 3] = [0, 200, 0];
pub const WEAPON_COLOR: [u8; 3] = [220, 0, 0];
pub const KNOWN_FACE_COLOR: [u8; 3] = [0, 255, 0];
pub const UNKNOWN_FACE_COLOR: [u8; 3] = [255, 0, 0];
const PLACEHOLDER_BACKGROUND: [u8; 3] = [16, 16, 16];
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

pub struct Draw<'a> {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  font: FontRef<'a>,
}

impl<'a> Default for Draw<'a> {
  fn default() -> Self {
    let font_data = include_bytes!("../../assets/font.ttf"); // default font
    let font = FontRef::try_from_slice(font_data).expect("无法加载嵌入的字体文件");

    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      font,
    }
  }
}

impl<'a> Draw<'a> {
  /// 在图像上绘制像素坐标的矩形边框，并在框上方写标签
  pub fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &BBox, label: &str, color: [u8; 3]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox.x1.floor() as i32).clamp(0, w - 1);
    let y_min = (bbox.y1.floor() as i32).clamp(0, h - 1);
    let x_max = (bbox.x2.ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox.y2.ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 绘制边框（加粗为2像素）
    for thickness in 0..2 {
      let x_min_t = (x_min + thickness).min(w - 1);
      let y_min_t = (y_min + thickness).min(h - 1);
      let x_max_t = (x_max - thickness).max(0);
      let y_max_t = (y_max - thickness).max(0);

      for x in x_min_t..=x_max_t {
        image.put_pixel(x as u32, y_min_t as u32, Rgb(color));
        image.put_pixel(x as u32, y_max_t as u32, Rgb(color));
      }
      for y in y_min_t..=y_max_t {
        image.put_pixel(x_min_t as u32, y as u32, Rgb(color));
        image.put_pixel(x_max_t as u32, y as u32, Rgb(color));
      }
    }

    // 标签背景放在边框上方，贴顶时放在框内
    let label_y = (y_min - self.label_text_height).max(0);
    self.draw_label(image, x_min, label_y, label, color);
  }

  /// 在 `(x, y)` 处绘制带背景色的单行文本
  pub fn draw_label(&self, image: &mut RgbImage, x: i32, y: i32, label: &str, background: [u8; 3]) {
    let w = image.width() as i32;
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let label_x = x.max(0);
    let max_width = (w - label_x).max(0);
    let label_width = text_width.min(max_width) as u32;
    let label_height = self.label_text_height as u32;

    // 仅在标签有空间时绘制
    if label_width == 0 || y >= image.height() as i32 {
      return;
    }
    let rect = Rect::at(label_x, y).of_size(label_width, label_height);
    draw_filled_rect_mut(image, rect, Rgb(background));
    draw_text_mut(
      image,
      Rgb(TEXT_COLOR),
      label_x,
      y + self.label_text_vertical_padding,
      PxScale::from(self.font_size),
      &self.font,
      label,
    );
  }

  /// 人群画面：人带轨迹 ID，武器带类别与分数，左上角是人数
  pub fn draw_crowd(&self, image: &mut RgbImage, report: &CrowdReport) {
    for (id, item) in &report.persons {
      self.draw_bbox_with_label(image, &item.bbox, &format!("ID {}", id), PERSON_COLOR);
    }
    for item in &report.weapons {
      let label = format!("{} {:.2}", item.kind.to_label_str(), item.score);
      self.draw_bbox_with_label(image, &item.bbox, &label, WEAPON_COLOR);
    }

    self.draw_label(image, 8, 8, &format!("Count: {}", report.count), PERSON_COLOR);
    if report.weapon_detected {
      let text = "Weapon Detected";
      let text_width = (text.len() as f32 * self.label_char_width) as i32;
      let x = (image.width() as i32 - text_width - 8).max(0);
      self.draw_label(image, x, 8, text, WEAPON_COLOR);
    }
  }

  /// 人脸画面：命中为绿色 "名字 (NN%)"，未命中为红色 "Unknown"
  pub fn draw_faces(&self, image: &mut RgbImage, annotations: &[FaceAnnotation]) {
    for annotation in annotations {
      self.draw_face(image, annotation);
    }
  }

  pub fn draw_face(&self, image: &mut RgbImage, annotation: &FaceAnnotation) {
    let color = if annotation.is_known() {
      KNOWN_FACE_COLOR
    } else {
      UNKNOWN_FACE_COLOR
    };
    self.draw_bbox_with_label(image, &annotation.bbox, &annotation.label(), color);
  }

  /// 抓拍图：在私有副本上只标注命中的那张人脸
  pub fn draw_match(&self, image: &RgbImage, annotation: &FaceAnnotation) -> RgbImage {
    let mut copy = image.clone();
    let label = match &annotation.matched {
      Some(m) => format!("Match: {} ({:.0}%)", m.name, m.confidence),
      None => annotation.label(),
    };
    self.draw_bbox_with_label(&mut copy, &annotation.bbox, &label, KNOWN_FACE_COLOR);
    copy
  }

  /// 设备不可用时的占位画面
  pub fn placeholder(&self, width: u32, height: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, Rgb(PLACEHOLDER_BACKGROUND));
    let text = "Camera Error";
    let text_width = (text.len() as f32 * self.label_char_width) as i32;
    let x = (width as i32 - text_width) / 2;
    let y = (height as i32 - self.label_text_height) / 2;
    self.draw_label(&mut image, x, y, text, UNKNOWN_FACE_COLOR);
    image
  }
}

pub fn placeholder_image(width: u32, height: u32) -> RgbImage {
  Draw::default().placeholder(width, height)
}
