// 该文件是 Shouwang （守望） 项目的一部分。
// src/model/face.rs - 人脸检测与特征提取（ONNX Runtime）
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

use std::sync::{Mutex, PoisonError};

use image::RgbImage;
use ort::session::Session;
use tracing::{debug, info};
use url::Url;

use super::yolo::{build_session, nchw_tensor, nms};
use crate::{
  FromUrl, FromUrlWithScheme,
  geometry::BBox,
  model::{FaceDetection, Model, ModelError},
};

const DETECTOR_INPUT_SIZE: u32 = 640;
const EMBEDDER_INPUT_SIZE: u32 = 112;
const DEFAULT_FACE_CONFIDENCE: f32 = 0.5;
const FACE_NMS_IOU: f32 = 0.4;

/// 两阶段人脸模型：YOLO 格式人脸检测 + ArcFace 风格特征提取
///
/// 检测器输出 `[1, 5 + k, N]`（中心点框、置信度、可选关键点），
/// 特征提取器输入 112x112 的人脸裁剪，输出向量经 L2 归一化。
pub struct OnnxFaceModel {
  detector: Mutex<Session>,
  embedder: Mutex<Session>,
  confidence_threshold: f32,
}

impl FromUrlWithScheme for OnnxFaceModel {
  const SCHEME: &'static str = "face";
}

impl FromUrl for OnnxFaceModel {
  type Error = ModelError;

  /// `face:///models/yolov8n-face.onnx?embedder=/models/arcface.onnx&conf=0.5`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    let query = |key: &str| {
      url
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
    };
    let embedder_path = query("embedder")
      .ok_or_else(|| ModelError::ModelPathError("缺少 embedder 参数".to_string()))?;
    let confidence_threshold = query("conf")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_FACE_CONFIDENCE);

    let detector = build_session(url.path())?;
    let embedder = build_session(&embedder_path)?;
    info!("人脸模型就绪: {} + {}", url.path(), embedder_path);

    Ok(Self {
      detector: Mutex::new(detector),
      embedder: Mutex::new(embedder),
      confidence_threshold,
    })
  }
}

impl OnnxFaceModel {
  fn detect_faces(&self, image: &RgbImage) -> Result<Vec<BBox>, ModelError> {
    let tensor = nchw_tensor(image, DETECTOR_INPUT_SIZE, DETECTOR_INPUT_SIZE, |v| {
      v as f32 / 255.0
    })?;
    let mut session = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
    let outputs = session.run(ort::inputs![tensor])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    let dims: Vec<i64> = shape.iter().copied().collect();
    let (rows, candidates) = match dims.as_slice() {
      &[1, rows, candidates] if rows >= 5 => (rows as usize, candidates as usize),
      other => {
        return Err(ModelError::InvalidOutput(format!(
          "预期人脸检测输出形状为 [1, 5+, N]，实际为 {:?}",
          other
        )));
      }
    };
    if data.len() < rows * candidates {
      return Err(ModelError::InvalidOutput("人脸检测输出数据不完整".to_string()));
    }

    let scale_x = image.width() as f32 / DETECTOR_INPUT_SIZE as f32;
    let scale_y = image.height() as f32 / DETECTOR_INPUT_SIZE as f32;
    let mut faces = Vec::new();
    for i in 0..candidates {
      let at = |row: usize| data[row * candidates + i];
      let score = at(4);
      if score < self.confidence_threshold {
        continue;
      }
      let bbox = BBox::from_center(at(0), at(1), at(2), at(3))
        .scale(scale_x, scale_y)
        .clamp_to(image.width(), image.height());
      faces.push((0, score, bbox));
    }

    // 检测顺序：从左到右
    let mut kept: Vec<BBox> = nms(faces, FACE_NMS_IOU)
      .into_iter()
      .map(|(_, _, bbox)| bbox)
      .collect();
    kept.sort_by(|a, b| a.x1.total_cmp(&b.x1));
    Ok(kept)
  }

  fn embed(&self, image: &RgbImage, bbox: &BBox) -> Result<Vec<f32>, ModelError> {
    let x = bbox.x1.max(0.0) as u32;
    let y = bbox.y1.max(0.0) as u32;
    let w = (bbox.width() as u32).max(1).min(image.width().saturating_sub(x).max(1));
    let h = (bbox.height() as u32).max(1).min(image.height().saturating_sub(y).max(1));
    let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();

    let tensor = nchw_tensor(&crop, EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE, |v| {
      (v as f32 - 127.5) / 127.5
    })?;
    let mut session = self.embedder.lock().unwrap_or_else(PoisonError::into_inner);
    let outputs = session.run(ort::inputs![tensor])?;
    let (_, data) = outputs[0].try_extract_tensor::<f32>()?;

    let norm = data.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
      return Err(ModelError::InvalidOutput("人脸特征向量为零".to_string()));
    }
    Ok(data.iter().map(|v| v / norm).collect())
  }
}

impl Model for OnnxFaceModel {
  type Input = RgbImage;
  type Output = Vec<FaceDetection>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let boxes = self.detect_faces(input)?;
    debug!("检测到 {} 张人脸", boxes.len());
    boxes
      .into_iter()
      .map(|bbox| {
        let embedding = self.embed(input, &bbox)?;
        Ok(FaceDetection { bbox, embedding })
      })
      .collect()
  }
}
