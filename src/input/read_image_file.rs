// 该文件是 Shouwang （守望） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::time::{Duration, Instant};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, input::InputError};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(image::ImageError),
  #[error("Invalid fps: {0}")]
  InvalidFps(String),
  #[error("Invalid path: {0}")]
  InvalidPath(String),
}

impl From<std::io::Error> for ImageFileInputError {
  fn from(err: std::io::Error) -> Self {
    ImageFileInputError::IoError(err)
  }
}

impl From<image::ImageError> for ImageFileInputError {
  fn from(err: image::ImageError) -> Self {
    ImageFileInputError::ImageLoadError(err)
  }
}

const DEFAULT_FPS: u32 = 15;

/// 静态图像帧源：按固定帧率重复输出同一张图像
///
/// URL 形如 `image:///path/to/frame.jpg?fps=15`，用于演示与长时间运行测试。
pub struct ImageFileInput {
  image: RgbImage,
  interval: Duration,
  last_read: Option<Instant>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let fps = match url.query_pairs().find(|(k, _)| k == "fps") {
      Some((_, v)) => v
        .parse::<u32>()
        .ok()
        .filter(|fps| *fps > 0)
        .ok_or_else(|| ImageFileInputError::InvalidFps(v.to_string()))?,
      None => DEFAULT_FPS,
    };

    let path = urlencoding::decode(url.path())
      .map_err(|e| ImageFileInputError::InvalidPath(e.to_string()))?;
    let image = ImageReader::open(&*path)?.decode()?.to_rgb8();
    info!(
      "打开图像文件输入: {} ({}x{}, {} fps)",
      path,
      image.width(),
      image.height(),
      fps
    );

    Ok(Self::new(image, fps))
  }
}

impl ImageFileInput {
  pub fn new(image: RgbImage, fps: u32) -> Self {
    Self {
      image,
      interval: Duration::from_secs(1) / fps.max(1),
      last_read: None,
    }
  }

  pub fn try_read(&mut self) -> Result<RgbImage, InputError> {
    if let Some(last) = self.last_read {
      let elapsed = last.elapsed();
      if elapsed < self.interval {
        std::thread::sleep(self.interval - elapsed);
      }
    }
    self.last_read = Some(Instant::now());
    Ok(self.image.clone())
  }
}
