// 该文件是 Shouwang （守望） 项目的一部分。
// src/model/yolo.rs - YOLO 目标检测器（ONNX Runtime）
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
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::{Tensor, Value},
};
use tracing::{debug, info};
use url::Url;

use crate::{
  frame::Frame,
  geometry::BBox,
  model::{DetectItem, DetectResult, LabelMap, Model, ModelError, ObjectKind},
};

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_NMS_IOU: f32 = 0.45;

/// YOLOv8 格式的目标检测器
///
/// 输出张量为 `[1, 4 + 类别数, 候选数]`，前四行是中心点格式的框，
/// 其余每行是一个类别的分数。
pub struct OnnxYolo {
  session: Mutex<Session>,
  class_names: Vec<String>,
  labels: LabelMap,
  input_size: u32,
  confidence_threshold: f32,
  nms_threshold: f32,
}

impl OnnxYolo {
  pub const SCHEME: &'static str = "yolo";
}

impl OnnxYolo {
  /// `yolo:///models/yolov8n.onnx?labels=FILE&conf=0.25&iou=0.45&size=640`
  pub fn open(url: &Url, labels: LabelMap) -> Result<Self, ModelError> {
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

    let class_names = match query("labels") {
      Some(path) => read_label_file(&path)?,
      None => COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
    };
    let input_size = query("size")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_INPUT_SIZE);
    let confidence_threshold = query("conf")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_CONFIDENCE);
    let nms_threshold = query("iou")
      .and_then(|v| v.parse().ok())
      .unwrap_or(DEFAULT_NMS_IOU);

    let session = build_session(url.path())?;
    info!(
      "目标检测模型就绪: {} ({} 类, 输入 {}x{})",
      url.path(),
      class_names.len(),
      input_size,
      input_size
    );

    Ok(Self {
      session: Mutex::new(session),
      class_names,
      labels,
      input_size,
      confidence_threshold,
      nms_threshold,
    })
  }

  fn postprocess(
    &self,
    shape: &[i64],
    data: &[f32],
    original_width: f32,
    original_height: f32,
  ) -> Result<Vec<DetectItem<ObjectKind>>, ModelError> {
    let (rows, candidates) = match shape {
      [1, rows, candidates] => (*rows as usize, *candidates as usize),
      _ => {
        return Err(ModelError::InvalidOutput(format!(
          "预期输出形状为 [1, C, N]，实际为 {:?}",
          shape
        )));
      }
    };
    if rows < 5 || data.len() < rows * candidates {
      return Err(ModelError::InvalidOutput(format!(
        "输出大小不匹配: 形状 {:?}, 数据 {}",
        shape,
        data.len()
      )));
    }
    let num_classes = rows - 4;
    let scale_x = original_width / self.input_size as f32;
    let scale_y = original_height / self.input_size as f32;

    let mut detections = Vec::new();
    for i in 0..candidates {
      let at = |row: usize| data[row * candidates + i];

      // 找到最高类别分数
      let mut max_score = 0.0f32;
      let mut max_class = 0usize;
      for class_id in 0..num_classes {
        let score = at(4 + class_id);
        if score > max_score {
          max_score = score;
          max_class = class_id;
        }
      }
      if max_score < self.confidence_threshold {
        continue;
      }

      let bbox = BBox::from_center(at(0), at(1), at(2), at(3))
        .scale(scale_x, scale_y)
        .clamp_to(original_width as u32, original_height as u32);
      detections.push((max_class, max_score, bbox));
    }

    let kept = nms(detections, self.nms_threshold);
    Ok(
      kept
        .into_iter()
        .map(|(class_id, score, bbox)| {
          let name = self
            .class_names
            .get(class_id)
            .map(String::as_str)
            .unwrap_or("unknown");
          DetectItem {
            kind: self.labels.classify(name),
            score,
            bbox,
          }
        })
        .collect(),
    )
  }
}

impl Model for OnnxYolo {
  type Input = Frame;
  type Output = DetectResult<ObjectKind>;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let image = &input.image;
    let tensor = nchw_tensor(image, self.input_size, self.input_size, |v| {
      v as f32 / 255.0
    })?;

    let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
    let outputs = session.run(ort::inputs![tensor])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
    let shape: Vec<i64> = shape.iter().copied().collect();

    let items = self.postprocess(
      &shape,
      data,
      image.width() as f32,
      image.height() as f32,
    )?;
    debug!("第 {} 帧检测到 {} 个物体", input.index, items.len());
    Ok(items.into())
  }
}

fn read_label_file(path: &str) -> Result<Vec<String>, ModelError> {
  let content = std::fs::read_to_string(path)?;
  Ok(
    content
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect(),
  )
}

/// 打开 ONNX 模型并创建推理会话
pub(crate) fn build_session(path: &str) -> Result<Session, ModelError> {
  info!("加载模型文件: {}", path);
  let model_data = std::fs::read(path)?;
  debug!(
    "模型文件大小: {:.2} MB",
    model_data.len() as f64 / (1024.0 * 1024.0)
  );
  let session = Session::builder()?
    .with_optimization_level(GraphOptimizationLevel::Level3)?
    .commit_from_memory(&model_data)?;
  Ok(session)
}

/// 缩放到 `width x height` 并转为 `[1, 3, H, W]` 浮点张量
pub(crate) fn nchw_tensor(
  image: &RgbImage,
  width: u32,
  height: u32,
  normalize: impl Fn(u8) -> f32,
) -> Result<Value, ModelError> {
  let resized = image::imageops::resize(
    image,
    width,
    height,
    image::imageops::FilterType::Triangle,
  );
  let (w, h) = (width as usize, height as usize);
  let mut data = Vec::with_capacity(3 * w * h);
  for c in 0..3 {
    for pixel in resized.pixels() {
      data.push(normalize(pixel[c]));
    }
  }
  let tensor = Tensor::from_array((vec![1usize, 3, h, w], data.into_boxed_slice()))?;
  Ok(tensor.into())
}

/// 非极大值抑制，同类别内按分数降序保留
pub(crate) fn nms(mut detections: Vec<(usize, f32, BBox)>, threshold: f32) -> Vec<(usize, f32, BBox)> {
  detections.sort_by(|a, b| b.1.total_cmp(&a.1));

  let mut result: Vec<(usize, f32, BBox)> = Vec::new();
  for det in detections {
    let suppressed = result
      .iter()
      .any(|kept| kept.0 == det.0 && kept.2.iou(&det.2) >= threshold);
    if !suppressed {
      result.push(det);
    }
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nms_keeps_best_of_overlapping_same_class() {
    let a = (0, 0.9, BBox::new(0.0, 0.0, 10.0, 10.0));
    let b = (0, 0.8, BBox::new(1.0, 1.0, 11.0, 11.0));
    let c = (1, 0.7, BBox::new(1.0, 1.0, 11.0, 11.0));
    let kept = nms(vec![b, a, c], 0.45);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].1, 0.9);
    assert_eq!(kept[1].0, 1);
  }

  #[test]
  fn coco_first_class_is_person() {
    assert_eq!(LabelMap::default().classify(COCO_CLASSES[0]), ObjectKind::Person);
  }
}
