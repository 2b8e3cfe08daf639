// 该文件是 Shouwang （守望） 项目的一部分。
// src/input/v4l2_source.rs - V4L2 摄像头输入源
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

use std::pin::Pin;

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use crate::{FromUrl, FromUrlWithScheme, input::InputError};

#[derive(Error, Debug)]
pub enum V4l2InputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("V4L error: {0}")]
  V4lError(#[from] std::io::Error),
  #[error("Unsupported pixel format: {0}")]
  UnsupportedPixelFormat(String),
}

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

/// V4L2 摄像头输入源
///
/// 由于 v4l 库的 Stream 需要引用 Device，我们使用 Pin<Box<Device>> 来保证
/// Device 的内存地址稳定，从而可以安全地创建引用它的 Stream。
pub struct V4l2Input {
  /// 捕获流（生命周期与 device 关联，必须先于 device 释放）
  stream: Option<Stream<'static>>,
  /// V4L2 设备
  _device: Pin<Box<Device>>,
  width: u32,
  height: u32,
}

impl FromUrlWithScheme for V4l2Input {
  const SCHEME: &'static str = "v4l2";
}

impl FromUrl for V4l2Input {
  type Error = V4l2InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(V4l2InputError::SchemaMismatch);
    }

    // v4l2:///dev/video0?width=640&height=480
    let device_path = if url.path().is_empty() || url.path() == "/" {
      "/dev/video0".to_string()
    } else {
      url.path().to_string()
    };
    let query = |key: &str, default: u32| {
      url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse::<u32>().ok())
        .unwrap_or(default)
    };

    Self::open(
      &device_path,
      query("width", DEFAULT_WIDTH),
      query("height", DEFAULT_HEIGHT),
    )
  }
}

impl V4l2Input {
  /// 打开摄像头并以 YUYV 格式开始采集
  pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, V4l2InputError> {
    let device = Box::pin(Device::with_path(device_path)?);

    let mut format = device.format()?;
    format.width = width;
    format.height = height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;
    if format.fourcc != FourCC::new(b"YUYV") {
      return Err(V4l2InputError::UnsupportedPixelFormat(
        format.fourcc.to_string(),
      ));
    }

    // SAFETY: device 被 Pin<Box> 固定在堆上，不会移动；
    // stream 存放在同一结构体中，并在 Drop 中先于 device 释放。
    let device_ref: &Device = &device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, 4)?
    };

    info!(
      "打开 V4L2 设备: {} ({}x{})",
      device_path, format.width, format.height
    );

    Ok(Self {
      stream: Some(stream),
      _device: device,
      width: format.width,
      height: format.height,
    })
  }

  pub fn try_read(&mut self) -> Result<RgbImage, InputError> {
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| InputError::Unavailable("捕获流已关闭".to_string()))?;

    let (buffer, _meta) = stream
      .next()
      .map_err(|e| InputError::Unavailable(format!("无法捕获帧: {}", e)))?;

    let expected = (self.width * self.height * 2) as usize;
    if buffer.len() < expected {
      return Err(InputError::Unavailable(format!(
        "帧数据不完整: 期望 {} 字节, 实际 {} 字节",
        expected,
        buffer.len()
      )));
    }

    let rgb = yuyv_to_rgb(&buffer[..expected], self.width, self.height);
    RgbImage::from_raw(self.width, self.height, rgb)
      .ok_or_else(|| InputError::Unavailable("无法创建 RGB 图像".to_string()))
  }
}

impl Drop for V4l2Input {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn neutral_chroma_yields_grey_pixels() {
    let rgb = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1);
    assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
  }
}
