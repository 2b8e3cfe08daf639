// 该文件是 Shouwang （守望） 项目的一部分。
// src/output/mjpeg.rs - MJPEG 分块输出
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

use image::{RgbImage, codecs::jpeg::JpegEncoder};
use tokio::sync::mpsc::Sender;
use tracing::warn;

use crate::{
  crowd::CrowdReport,
  face::FaceAnnotation,
  frame::Frame,
  output::{Render, RenderError, draw::Draw},
};

pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
  let mut buffer = Vec::new();
  JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
  Ok(buffer)
}

/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
  const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
  let mut chunk = Vec::with_capacity(HEAD.len() + jpeg.len() + 2);
  chunk.extend_from_slice(HEAD);
  chunk.extend_from_slice(jpeg);
  chunk.extend_from_slice(b"\r\n");
  chunk
}

/// 一个 HTTP 视频流的出口：标注、编码、分块后交给响应体
///
/// 占位帧原样输出，不做标注。在流水线线程中调用，发送时阻塞直到响应体取走上一块，
/// 消费者断开后返回 `RenderError::Disconnected`。
pub struct MjpegSink<'a> {
  tx: Sender<Vec<u8>>,
  draw: Draw<'a>,
  quality: u8,
}

impl<'a> MjpegSink<'a> {
  pub fn new(tx: Sender<Vec<u8>>, quality: u8) -> Self {
    Self {
      tx,
      draw: Draw::default(),
      quality,
    }
  }

  /// 编码失败只丢弃这一帧
  pub fn send_image(&self, image: &RgbImage) -> Result<(), RenderError> {
    let jpeg = match encode_jpeg(image, self.quality) {
      Ok(jpeg) => jpeg,
      Err(e) => {
        warn!("帧编码失败，丢弃: {}", e);
        return Ok(());
      }
    };
    self
      .tx
      .blocking_send(multipart_chunk(&jpeg))
      .map_err(|_| RenderError::Disconnected)
  }
}

impl Render<Frame, CrowdReport> for MjpegSink<'_> {
  type Error = RenderError;

  fn render_result(&self, frame: &Frame, result: &CrowdReport) -> Result<(), Self::Error> {
    if frame.placeholder {
      return self.send_image(&frame.image);
    }
    let mut image = frame.image.clone();
    self.draw.draw_crowd(&mut image, result);
    self.send_image(&image)
  }
}

impl Render<Frame, Vec<FaceAnnotation>> for MjpegSink<'_> {
  type Error = RenderError;

  fn render_result(&self, frame: &Frame, result: &Vec<FaceAnnotation>) -> Result<(), Self::Error> {
    if frame.placeholder {
      return self.send_image(&frame.image);
    }
    let mut image = frame.image.clone();
    self.draw.draw_faces(&mut image, result);
    self.send_image(&image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_wraps_jpeg_in_multipart_part() {
    let chunk = multipart_chunk(b"JPEG");
    assert_eq!(
      chunk,
      b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n".to_vec()
    );
  }

  #[test]
  fn encodes_a_decodable_jpeg() {
    let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10]));
    let jpeg = encode_jpeg(&image, DEFAULT_JPEG_QUALITY).unwrap();
    assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (16, 8));
  }

  #[test]
  fn sink_reports_disconnect() {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let sink = MjpegSink::new(tx, DEFAULT_JPEG_QUALITY);
    drop(rx);
    let frame = Frame::new(RgbImage::new(8, 8), 0, 0);
    assert!(matches!(
      sink.render_result(&frame, &CrowdReport::default()),
      Err(RenderError::Disconnected)
    ));
  }

  #[test]
  fn sink_sends_one_chunk_per_frame() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    let sink = MjpegSink::new(tx, DEFAULT_JPEG_QUALITY);
    let frame = Frame::new(RgbImage::new(8, 8), 0, 0);
    sink.render_result(&frame, &Vec::<FaceAnnotation>::new()).unwrap();
    let chunk = rx.try_recv().unwrap();
    assert!(chunk.starts_with(b"--frame\r\n"));
    assert!(chunk.ends_with(b"\r\n"));
  }
}
