// 该文件是 Shouwang （守望） 项目的一部分。
// src/gallery.rs - 人脸库目录
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
  path::{Path, PathBuf},
  sync::Arc,
};

use image::{ImageFormat, ImageReader, RgbImage};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  face::{FaceMatcher, Gallery, GalleryEntry},
  model::{FaceModel, ModelError},
};

const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const FALLBACK_NAME: &str = "uploaded_person";

#[derive(Error, Debug)]
pub enum GalleryError {
  #[error("{0}")]
  Validation(String),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Face model error: {0}")]
  ModelError(#[from] ModelError),
}

/// 登记成功后的结果
#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
  pub name: String,
  pub filename: String,
  pub total_faces: usize,
}

/// 磁盘上的人脸库：目录中每张 jpg/jpeg/png 图片是一个条目，文件名即名字
pub struct GalleryStore {
  dir: PathBuf,
  face_model: Arc<FaceModel>,
}

impl GalleryStore {
  pub fn new(dir: impl Into<PathBuf>, face_model: Arc<FaceModel>) -> Self {
    Self {
      dir: dir.into(),
      face_model,
    }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn face_model(&self) -> &Arc<FaceModel> {
    &self.face_model
  }

  /// 读取整个目录；无法解码或没有人脸的图片跳过
  pub fn load(&self) -> Result<Gallery, GalleryError> {
    std::fs::create_dir_all(&self.dir)?;

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
      .filter_map(|entry| entry.ok().map(|entry| entry.path()))
      .filter(|path| path.is_file() && has_supported_extension(path))
      .collect();
    paths.sort();

    let mut entries = Vec::new();
    for path in paths {
      let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        continue;
      };
      let image = match read_image(&path) {
        Ok(image) => image,
        Err(e) => {
          warn!("无法读取人脸图片 {}: {}", path.display(), e);
          continue;
        }
      };
      match self.face_model.infer(&image) {
        Ok(faces) => match faces.into_iter().next() {
          Some(face) => entries.push(GalleryEntry {
            name,
            embedding: face.embedding,
          }),
          None => warn!("图片中没有检测到人脸，跳过: {}", path.display()),
        },
        Err(e) => warn!("提取人脸特征失败 {}: {}", path.display(), e),
      }
    }

    let gallery = Gallery::new(entries);
    info!(
      "载入 {} 个已知人脸: {:?}",
      gallery.len(),
      gallery.names().collect::<Vec<_>>()
    );
    Ok(gallery)
  }

  /// 重新读取目录并整体替换比对器中的人脸库，返回条目数
  pub fn reload(&self, matcher: &FaceMatcher) -> Result<usize, GalleryError> {
    let gallery = self.load()?;
    let len = gallery.len();
    matcher.replace_gallery(gallery);
    Ok(len)
  }

  /// 登记一张新的人脸
  ///
  /// 图片先在内存中解码并校验恰好包含一张人脸，通过后才写入目录，
  /// 随后重新载入人脸库并重置匹配会话。校验失败时不产生任何副作用。
  pub fn enroll(
    &self,
    matcher: &FaceMatcher,
    original_filename: &str,
    bytes: &[u8],
  ) -> Result<Enrollment, GalleryError> {
    if original_filename.trim().is_empty() {
      return Err(GalleryError::Validation("Empty filename".to_string()));
    }

    let format = image::guess_format(bytes)
      .map_err(|e| GalleryError::Validation(format!("Invalid image: {}", e)))?;
    if !format
      .extensions_str()
      .iter()
      .any(|ext| SUPPORTED_EXTENSIONS.contains(ext))
    {
      return Err(GalleryError::Validation(format!(
        "Unsupported image format: {:?}",
        format
      )));
    }
    let image = image::load_from_memory_with_format(bytes, format)
      .map_err(|e| GalleryError::Validation(format!("Invalid image: {}", e)))?
      .to_rgb8();
    let faces = self.face_model.infer(&image)?;
    match faces.len() {
      0 => {
        return Err(GalleryError::Validation(
          "No face detected in the uploaded image".to_string(),
        ));
      }
      1 => {}
      n => {
        return Err(GalleryError::Validation(format!(
          "Exactly one face is required, found {}",
          n
        )));
      }
    }

    std::fs::create_dir_all(&self.dir)?;
    let name = entry_name(original_filename);
    let extension = saved_extension(original_filename, format);
    let filename = self.unique_filename(&name, &extension);
    std::fs::write(self.dir.join(&filename), bytes)?;
    info!("登记人脸 {} -> {}", name, filename);

    let total_faces = self.reload(matcher)?;
    matcher.state().reset_session();

    Ok(Enrollment {
      name,
      filename,
      total_faces,
    })
  }

  fn unique_filename(&self, name: &str, extension: &str) -> String {
    let mut filename = format!("{}{}", name, extension);
    let mut counter = 1;
    while self.dir.join(&filename).exists() {
      filename = format!("{}_{}{}", name, counter, extension);
      counter += 1;
    }
    filename
  }
}

fn has_supported_extension(path: &Path) -> bool {
  path
    .extension()
    .map(|ext| {
      let ext = ext.to_string_lossy().to_lowercase();
      SUPPORTED_EXTENSIONS.contains(&ext.as_str())
    })
    .unwrap_or(false)
}

/// 按内容识别格式读取图片，不依赖扩展名
fn read_image(path: &Path) -> Result<RgbImage, image::ImageError> {
  Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?.to_rgb8())
}

/// 字母数字、空格、`-`、`_` 保留，其余字符替换为 `_`
pub fn safe_name(raw: &str) -> String {
  let safe: String = raw
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_') {
        c
      } else {
        '_'
      }
    })
    .collect();
  let safe = safe.trim();
  if safe.is_empty() {
    FALLBACK_NAME.to_string()
  } else {
    safe.to_string()
  }
}

/// 上传文件名去掉扩展名后的安全名字
pub fn entry_name(original: &str) -> String {
  let stem = Path::new(original)
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default();
  safe_name(&stem)
}

/// 保存时的扩展名（带点）跟随图片的实际格式；原扩展名与格式一致时保留原写法
fn saved_extension(original: &str, format: ImageFormat) -> String {
  let known = format.extensions_str();
  match Path::new(original).extension().map(|e| e.to_string_lossy().into_owned()) {
    Some(ext) if known.contains(&ext.to_lowercase().as_str()) => format!(".{}", ext),
    _ => format!(".{}", known.first().copied().unwrap_or("jpg")),
  }
}
