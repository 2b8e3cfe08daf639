// 该文件是 Shouwang （守望） 项目的一部分。
// src/task.rs - 流水线任务
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

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Instant,
};

use image::{RgbImage, imageops::FilterType};
use tracing::{debug, info, warn};

use crate::{
  crowd::{CrowdAggregator, CrowdReport, SharedAggregator},
  face::{FaceAnnotation, FaceMatcher},
  frame::Frame,
  input::Throttle,
  model::{DetectResult, FaceDetection, Model, ObjectKind},
  output::{Render, RenderError, draw::Draw, encode_jpeg},
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 流水线的取消信号，每处理一帧检查一次
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }

  /// 返回一个在 Drop 时触发取消的守卫
  pub fn guard(&self) -> CancelGuard {
    CancelGuard(self.clone())
  }
}

pub struct CancelGuard(CancelToken);

impl Drop for CancelGuard {
  fn drop(&mut self) {
    self.0.cancel();
  }
}

/// 人数统计流水线：节流、检测、跟踪、发布、标注输出
pub struct CrowdTask {
  aggregator: SharedAggregator,
  throttle: Throttle,
  cancel: CancelToken,
  resize: Option<(u32, u32)>,
}

impl CrowdTask {
  pub fn new(aggregator: SharedAggregator, frame_skip: u32, cancel: CancelToken) -> Self {
    Self {
      aggregator,
      throttle: Throttle::new(frame_skip),
      cancel,
      resize: None,
    }
  }

  /// 推理前把帧缩放到固定尺寸
  pub fn with_resize(mut self, resize: Option<(u32, u32)>) -> Self {
    self.resize = resize.filter(|(w, h)| *w > 0 && *h > 0);
    self
  }

  fn prepare(&self, frame: Arc<Frame>) -> Arc<Frame> {
    match self.resize {
      Some((w, h)) if frame.image.dimensions() != (w, h) => {
        Arc::new(Frame {
          image: image::imageops::resize(&frame.image, w, h, FilterType::Triangle),
          index: frame.index,
          timestamp_ms: frame.timestamp_ms,
          placeholder: frame.placeholder,
        })
      }
      _ => frame,
    }
  }
}

impl<
  ME: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Arc<Frame>>,
  M: Model<Input = Frame, Output = DetectResult<ObjectKind>, Error = ME>,
  O: Render<Frame, CrowdReport, Error = RenderError>,
> Task<I, M, O> for CrowdTask
{
  type Error = anyhow::Error;

  fn run_task(mut self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("人数统计流开始 (每 {} 帧处理一帧)", self.throttle.every());
    for frame in input {
      if self.cancel.is_cancelled() {
        break;
      }
      if !self.throttle.admit() {
        continue;
      }
      let frame = self.prepare(frame);

      let report = if frame.placeholder {
        CrowdReport {
          frame_index: frame.index,
          ..CrowdReport::default()
        }
      } else {
        let cached = CrowdAggregator::lock(&self.aggregator).cached(frame.index);
        match cached {
          Some(report) => report,
          None => {
            let now = Instant::now();
            let detections = match model.infer(&frame) {
              Ok(detections) => detections,
              Err(e) => {
                warn!("第 {} 帧目标检测失败: {}", frame.index, e);
                continue;
              }
            };
            debug!("第 {} 帧推理耗时: {:.2?}", frame.index, now.elapsed());
            CrowdAggregator::lock(&self.aggregator).process(frame.index, &detections)
          }
        }
      };

      match output.render_result(&frame, &report) {
        Ok(()) => {}
        Err(RenderError::Disconnected) => {
          info!("人数统计流的消费者已断开");
          break;
        }
        Err(e) => warn!("第 {} 帧输出失败: {}", frame.index, e),
      }
    }
    info!("人数统计流结束");
    Ok(())
  }
}

/// 人脸比对流水线：节流、提取人脸、比对、一次性抓拍、标注输出
pub struct FaceTask {
  matcher: Arc<FaceMatcher>,
  throttle: Throttle,
  cancel: CancelToken,
  jpeg_quality: u8,
  draw: Draw<'static>,
}

impl FaceTask {
  pub fn new(matcher: Arc<FaceMatcher>, frame_skip: u32, cancel: CancelToken, jpeg_quality: u8) -> Self {
    Self {
      matcher,
      throttle: Throttle::new(frame_skip),
      cancel,
      jpeg_quality,
      draw: Draw::default(),
    }
  }

  fn capture(&self, image: &RgbImage, annotation: &FaceAnnotation) -> Option<Vec<u8>> {
    let annotated = self.draw.draw_match(image, annotation);
    match encode_jpeg(&annotated, self.jpeg_quality) {
      Ok(jpeg) => Some(jpeg),
      Err(e) => {
        warn!("抓拍编码失败: {}", e);
        None
      }
    }
  }
}

impl<
  ME: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = Arc<Frame>>,
  M: Model<Input = RgbImage, Output = Vec<FaceDetection>, Error = ME>,
  O: Render<Frame, Vec<FaceAnnotation>, Error = RenderError>,
> Task<I, M, O> for FaceTask
{
  type Error = anyhow::Error;

  fn run_task(mut self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("人脸比对流开始 (每 {} 帧处理一帧)", self.throttle.every());
    let state = Arc::clone(self.matcher.state());
    for frame in input {
      if self.cancel.is_cancelled() {
        break;
      }
      if !state.face_enabled() {
        info!("人脸识别已关闭，结束人脸比对流");
        break;
      }
      if !self.throttle.admit() {
        continue;
      }

      let annotations = if frame.placeholder {
        Vec::new()
      } else {
        let generation = state.generation();
        let faces = match model.infer(&frame.image) {
          Ok(faces) => faces,
          Err(e) => {
            warn!("第 {} 帧人脸提取失败: {}", frame.index, e);
            continue;
          }
        };
        self
          .matcher
          .evaluate(&faces, generation, |annotation| self.capture(&frame.image, annotation))
      };

      match output.render_result(&frame, &annotations) {
        Ok(()) => {}
        Err(RenderError::Disconnected) => {
          info!("人脸比对流的消费者已断开");
          break;
        }
        Err(e) => warn!("第 {} 帧输出失败: {}", frame.index, e),
      }
    }
    info!("人脸比对流结束");
    Ok(())
  }
}
