// 该文件是 Shouwang （守望） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use image::RgbImage;
use thiserror::Error;

use crate::FromUrl;

mod hub;
mod throttle;

pub use self::hub::{FrameHub, HubConfig, SourceOpener, Subscription, SubscriptionFrames};
pub use self::throttle::Throttle;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "v4l2_input")]
mod v4l2_source;
#[cfg(feature = "v4l2_input")]
pub use self::v4l2_source::{V4l2Input, V4l2InputError};

/// 帧源：封装一个采集设备，每次调用读取下一帧或报告不可用
pub trait FrameSource: Send {
  fn try_read(&mut self) -> Result<RgbImage, InputError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn try_read(&mut self) -> Result<RgbImage, InputError> {
    (**self).try_read()
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "v4l2_input")]
  #[error("V4L2 input error: {0}")]
  V4l2InputError(#[from] V4l2InputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  #[error("Frame unavailable: {0}")]
  Unavailable(String),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "v4l2_input")]
  V4l2(V4l2Input),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    #[cfg(feature = "v4l2_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4l2Input::SCHEME {
        let input = V4l2Input::from_url(url)?;
        return Ok(InputWrapper::V4l2(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  fn try_read(&mut self) -> Result<RgbImage, InputError> {
    match *self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(ref mut input) => input.try_read(),
      #[cfg(feature = "v4l2_input")]
      InputWrapper::V4l2(ref mut input) => input.try_read(),
    }
  }
}

/// 为帧读取线程构造一个按 URL 打开设备的 opener
///
/// 设备在读取线程中打开，读取线程退出时释放，
/// 因此没有订阅者时不会占用摄像头。
pub fn url_opener(url: url::Url) -> SourceOpener {
  Box::new(move || {
    let input = InputWrapper::from_url(&url)?;
    Ok(Box::new(input) as Box<dyn FrameSource>)
  })
}
