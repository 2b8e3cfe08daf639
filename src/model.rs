// 该文件是 Shouwang （守望） 项目的一部分。
// src/model.rs - 模型
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

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::{frame::Frame, geometry::BBox};

#[cfg(feature = "onnx")]
mod face;
#[cfg(feature = "onnx")]
mod yolo;

#[cfg(feature = "onnx")]
pub use self::face::OnnxFaceModel;
#[cfg(feature = "onnx")]
pub use self::yolo::{COCO_CLASSES, OnnxYolo};

/// 黑盒推理接口：图像进，结构化结果出
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

impl<M: Model + ?Sized> Model for Arc<M> {
  type Input = M::Input;
  type Output = M::Output;
  type Error = M::Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    (**self).infer(input)
  }
}

#[derive(Debug, Clone)]
pub struct DetectItem<T> {
  pub kind: T,
  pub score: f32,
  /// 像素坐标
  pub bbox: BBox,
}

#[derive(Debug, Clone)]
pub struct DetectResult<T> {
  pub items: Box<[DetectItem<T>]>,
}

impl<T> DetectResult<T> {
  pub fn empty() -> Self {
    Self {
      items: Box::new([]),
    }
  }
}

impl<T> From<Vec<DetectItem<T>>> for DetectResult<T> {
  fn from(items: Vec<DetectItem<T>>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> String;
}

/// 业务关心的目标类别
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
  Person,
  Weapon,
  Other(String),
}

impl WithLabel for ObjectKind {
  fn to_label_str(&self) -> String {
    match self {
      ObjectKind::Person => "person".to_string(),
      ObjectKind::Weapon => "weapon".to_string(),
      ObjectKind::Other(label) => label.clone(),
    }
  }
}

pub const DEFAULT_WEAPON_CLASSES: [&str; 4] = ["weapon", "gun", "pistol", "rifle"];

/// 将检测模型的原始类别名映射为 `ObjectKind`
#[derive(Debug, Clone)]
pub struct LabelMap {
  weapon_classes: Vec<String>,
}

impl Default for LabelMap {
  fn default() -> Self {
    Self::new(DEFAULT_WEAPON_CLASSES.iter().map(|s| s.to_string()))
  }
}

impl LabelMap {
  pub fn new(weapon_classes: impl IntoIterator<Item = String>) -> Self {
    Self {
      weapon_classes: weapon_classes
        .into_iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect(),
    }
  }

  pub fn classify(&self, label: &str) -> ObjectKind {
    let normalized = label.trim().to_lowercase();
    if normalized == "person" {
      ObjectKind::Person
    } else if self.weapon_classes.contains(&normalized) {
      ObjectKind::Weapon
    } else {
      ObjectKind::Other(label.to_string())
    }
  }
}

/// 一张人脸：位置与特征向量
#[derive(Debug, Clone)]
pub struct FaceDetection {
  pub bbox: BBox,
  pub embedding: Vec<f32>,
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("推理后端不可用: {0}")]
  BackendUnavailable(String),
  #[error("模型输出无效: {0}")]
  InvalidOutput(String),
  #[cfg(feature = "onnx")]
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
}

pub type ObjectDetector =
  dyn Model<Input = Frame, Output = DetectResult<ObjectKind>, Error = ModelError> + Send + Sync;
pub type FaceModel =
  dyn Model<Input = RgbImage, Output = Vec<FaceDetection>, Error = ModelError> + Send + Sync;

/// 按 URL 构造目标检测模型（`yolo:///path/model.onnx?labels=FILE`）
pub fn detector_from_url(url: &Url, labels: LabelMap) -> Result<Arc<ObjectDetector>, ModelError> {
  #[cfg(feature = "onnx")]
  {
    if url.scheme() == OnnxYolo::SCHEME {
      let model = OnnxYolo::open(url, labels)?;
      return Ok(Arc::new(model));
    }
    Err(ModelError::ModelPathError(format!(
      "不支持的检测模型方案: {}",
      url.scheme()
    )))
  }
  #[cfg(not(feature = "onnx"))]
  {
    let _ = labels;
    Err(ModelError::BackendUnavailable(format!(
      "{}（编译时未启用 onnx 特性）",
      url
    )))
  }
}

/// 按 URL 构造人脸模型（`face:///path/detector.onnx?embedder=FILE`）
pub fn face_model_from_url(url: &Url) -> Result<Arc<FaceModel>, ModelError> {
  #[cfg(feature = "onnx")]
  {
    use crate::{FromUrl, FromUrlWithScheme};

    if url.scheme() == OnnxFaceModel::SCHEME {
      let model = OnnxFaceModel::from_url(url)?;
      return Ok(Arc::new(model));
    }
    Err(ModelError::ModelPathError(format!(
      "不支持的人脸模型方案: {}",
      url.scheme()
    )))
  }
  #[cfg(not(feature = "onnx"))]
  {
    Err(ModelError::BackendUnavailable(format!(
      "{}（编译时未启用 onnx 特性）",
      url
    )))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn label_map_classifies_person_and_weapons() {
    let labels = LabelMap::default();
    assert_eq!(labels.classify("person"), ObjectKind::Person);
    assert_eq!(labels.classify("Gun"), ObjectKind::Weapon);
    assert_eq!(
      labels.classify("knife"),
      ObjectKind::Other("knife".to_string())
    );
  }

  #[test]
  fn custom_weapon_classes_replace_defaults() {
    let labels = LabelMap::new(vec!["knife".to_string(), " ".to_string()]);
    assert_eq!(labels.classify("knife"), ObjectKind::Weapon);
    assert_eq!(labels.classify("gun"), ObjectKind::Other("gun".to_string()));
  }

  #[cfg(not(feature = "onnx"))]
  #[test]
  fn backends_unavailable_without_onnx() {
    let url = Url::parse("yolo:///models/yolov8n.onnx").unwrap();
    assert!(matches!(
      detector_from_url(&url, LabelMap::default()),
      Err(ModelError::BackendUnavailable(_))
    ));
  }

  #[cfg(feature = "onnx")]
  #[test]
  fn unknown_detector_scheme_is_rejected() {
    let url = Url::parse("tflite:///models/yolov8n.tflite").unwrap();
    assert!(matches!(
      detector_from_url(&url, LabelMap::default()),
      Err(ModelError::ModelPathError(_))
    ));
  }
}
