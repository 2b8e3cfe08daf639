// 该文件是 Shouwang （守望） 项目的一部分。
// tests/common/mod.rs - 集成测试公用的假模型与假帧源
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

#![allow(dead_code)]

use std::{
  io::Cursor,
  sync::{Arc, Mutex},
  thread,
  time::Duration,
};

use image::{Rgb, RgbImage};
use shouwang::{
  crowd::{CrowdAggregator, CrowdConfig},
  face::{FaceMatcher, MatcherConfig},
  frame::Frame,
  gallery::GalleryStore,
  geometry::BBox,
  input::{FrameHub, FrameSource, HubConfig, InputError},
  model::{DetectItem, DetectResult, FaceDetection, Model, ModelError, ObjectKind},
  server::{AppState, StreamConfig},
  state::DetectionState,
};

/// 每次返回同一张图像的帧源，模拟约 200 fps 的摄像头
pub struct SolidSource {
  pub image: RgbImage,
}

impl FrameSource for SolidSource {
  fn try_read(&mut self) -> Result<RgbImage, InputError> {
    thread::sleep(Duration::from_millis(5));
    Ok(self.image.clone())
  }
}

pub fn solid_hub(pixel: [u8; 3]) -> FrameHub {
  FrameHub::new(
    Box::new(move || {
      Ok(Box::new(SolidSource {
        image: RgbImage::from_pixel(64, 48, Rgb(pixel)),
      }) as Box<dyn FrameSource>)
    }),
    HubConfig {
      retry_interval: Duration::from_millis(1),
      ..HubConfig::default()
    },
  )
}

pub fn person(x: f32, y: f32) -> DetectItem<ObjectKind> {
  DetectItem {
    kind: ObjectKind::Person,
    score: 0.9,
    bbox: BBox::new(x, y, x + 20.0, y + 40.0),
  }
}

pub fn weapon(x: f32, y: f32, score: f32) -> DetectItem<ObjectKind> {
  DetectItem {
    kind: ObjectKind::Weapon,
    score,
    bbox: BBox::new(x, y, x + 10.0, y + 10.0),
  }
}

/// 每帧都返回同一组检测结果，并记录被调用的帧索引
#[derive(Default)]
pub struct FixedDetector {
  pub items: Vec<DetectItem<ObjectKind>>,
  pub calls: Mutex<Vec<u64>>,
}

impl FixedDetector {
  pub fn new(items: Vec<DetectItem<ObjectKind>>) -> Self {
    Self {
      items,
      calls: Mutex::new(Vec::new()),
    }
  }
}

impl Model for FixedDetector {
  type Input = Frame;
  type Output = DetectResult<ObjectKind>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.calls.lock().unwrap().push(input.index);
    Ok(self.items.clone().into())
  }
}

/// 左上角像素的红色通道是人脸数量，绿色通道是一维特征
pub struct PixelFaces;

impl Model for PixelFaces {
  type Input = RgbImage;
  type Output = Vec<FaceDetection>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let Rgb([faces, feature, _]) = *input.get_pixel(0, 0);
    Ok(
      (0..faces)
        .map(|i| FaceDetection {
          bbox: BBox::new(i as f32 * 12.0, 2.0, i as f32 * 12.0 + 10.0, 12.0),
          embedding: vec![feature as f32 / 255.0, 0.0],
        })
        .collect(),
    )
  }
}

pub fn png(faces: u8, feature: u8) -> Vec<u8> {
  let image = RgbImage::from_pixel(16, 16, Rgb([faces, feature, 0]));
  let mut bytes = Vec::new();
  image
    .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
    .unwrap();
  bytes
}

pub fn frame(index: u64, faces: u8, feature: u8) -> Arc<Frame> {
  Arc::new(Frame::new(
    RgbImage::from_pixel(64, 48, Rgb([faces, feature, 0])),
    index,
    index * 40,
  ))
}

pub struct TestApp {
  pub app: AppState,
  pub detector: Arc<FixedDetector>,
  pub dir: tempfile::TempDir,
}

impl TestApp {
  pub fn new(pixel: [u8; 3], items: Vec<DetectItem<ObjectKind>>) -> Self {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(DetectionState::default());
    let detector = Arc::new(FixedDetector::new(items));
    let store = GalleryStore::new(dir.path().join("known_faces"), Arc::new(PixelFaces));
    let app = AppState {
      hub: solid_hub(pixel),
      detector: detector.clone(),
      aggregator: CrowdAggregator::new(CrowdConfig::default(), Arc::clone(&state)).shared(),
      matcher: Arc::new(FaceMatcher::new(MatcherConfig::default(), Arc::clone(&state))),
      gallery: Some(Arc::new(store)),
      state,
      streams: StreamConfig {
        crowd_frame_skip: 1,
        face_frame_skip: 1,
        ..StreamConfig::default()
      },
    };
    Self { app, detector, dir }
  }
}
