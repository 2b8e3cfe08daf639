// 该文件是 Shouwang （守望） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use url::Url;

use crate::{
  crowd::CrowdConfig,
  face::{MatchMethod, MatcherConfig},
  input::HubConfig,
  model::LabelMap,
  output::DEFAULT_JPEG_QUALITY,
  tracker::TrackerConfig,
};

/// Shouwang 实时人群监测服务参数配置
///
/// 所有参数也可以通过 `SHOUWANG_` 前缀的环境变量设置。
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// HTTP 监听地址
  #[arg(long, env = "SHOUWANG_LISTEN", default_value = "0.0.0.0:5000", value_name = "ADDR")]
  pub listen: SocketAddr,

  /// 帧源 URL
  /// 支持格式:
  /// - 图片: image:///path/to/demo.jpg?fps=15
  /// - V4L2: v4l2:///dev/video0?width=640&height=480
  #[arg(long, env = "SHOUWANG_INPUT", value_name = "URL")]
  pub input: Url,

  /// 目标检测模型 URL，例如 yolo:///models/yolov8n.onnx?labels=labels.txt
  #[arg(long, env = "SHOUWANG_DETECTOR", value_name = "URL")]
  pub detector: Url,

  /// 人脸模型 URL，例如 face:///models/det.onnx?embedder=/models/arcface.onnx
  /// 未指定时人脸识别相关接口不可用
  #[arg(long, env = "SHOUWANG_FACE_MODEL", value_name = "URL")]
  pub face_model: Option<Url>,

  /// 已知人脸目录
  #[arg(long, env = "SHOUWANG_GALLERY_DIR", default_value = "known_faces", value_name = "DIR")]
  pub gallery_dir: PathBuf,

  /// 人数统计流每 N 帧处理一帧
  #[arg(long, env = "SHOUWANG_CROWD_FRAME_SKIP", default_value_t = 3, value_name = "N")]
  pub crowd_frame_skip: u32,

  /// 人脸比对流每 N 帧处理一帧
  #[arg(long, env = "SHOUWANG_FACE_FRAME_SKIP", default_value_t = 2, value_name = "N")]
  pub face_frame_skip: u32,

  /// 连续读取失败多少次后输出占位帧
  #[arg(long, env = "SHOUWANG_MAX_READ_FAILURES", default_value_t = 10, value_name = "COUNT")]
  pub max_read_failures: u32,

  /// 读取失败后的重试间隔（毫秒）
  #[arg(long, env = "SHOUWANG_READ_RETRY_MS", default_value_t = 50, value_name = "MS")]
  pub read_retry_ms: u64,

  /// 轨迹匹配的中心点距离阈值（像素）
  #[arg(long, env = "SHOUWANG_TRACK_MAX_DISTANCE", default_value_t = 35.0, value_name = "PIXELS")]
  pub track_max_distance: f32,

  /// 轨迹连续丢失多少个已处理帧后移除
  #[arg(long, env = "SHOUWANG_TRACK_MAX_MISSED", default_value_t = 15, value_name = "FRAMES")]
  pub track_max_missed: u32,

  /// 人的置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "SHOUWANG_PERSON_CONFIDENCE", default_value_t = 0.25, value_name = "THRESHOLD")]
  pub person_confidence: f32,

  /// 武器告警的置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "SHOUWANG_WEAPON_CONFIDENCE", default_value_t = 0.5, value_name = "THRESHOLD")]
  pub weapon_confidence: f32,

  /// 视为武器的类别名，逗号分隔
  #[arg(
    long,
    env = "SHOUWANG_WEAPON_CLASSES",
    value_delimiter = ',',
    default_value = "weapon,gun,pistol,rifle",
    value_name = "CLASSES"
  )]
  pub weapon_classes: Vec<String>,

  /// basic 方法的距离容差
  #[arg(long, env = "SHOUWANG_MATCH_TOLERANCE", default_value_t = 0.6, value_name = "DISTANCE")]
  pub match_tolerance: f32,

  /// advanced 方法的距离阈值
  #[arg(long, env = "SHOUWANG_MATCH_THRESHOLD", default_value_t = 0.5, value_name = "DISTANCE")]
  pub match_threshold: f32,

  /// 启动时的人脸比对方法 (basic | advanced)
  #[arg(long, env = "SHOUWANG_METHOD", default_value = "advanced", value_name = "METHOD")]
  pub method: MatchMethod,

  /// 人数统计前将帧缩放到的宽度（需同时指定高度）
  #[arg(long, env = "SHOUWANG_CROWD_WIDTH", requires = "crowd_height", value_name = "PIXELS")]
  pub crowd_width: Option<u32>,

  /// 人数统计前将帧缩放到的高度（需同时指定宽度）
  #[arg(long, env = "SHOUWANG_CROWD_HEIGHT", requires = "crowd_width", value_name = "PIXELS")]
  pub crowd_height: Option<u32>,

  /// 输出 JPEG 质量 (1 - 100)
  #[arg(
    long,
    env = "SHOUWANG_JPEG_QUALITY",
    default_value_t = DEFAULT_JPEG_QUALITY,
    value_parser = clap::value_parser!(u8).range(1..=100),
    value_name = "QUALITY"
  )]
  pub jpeg_quality: u8,
}

impl Args {
  pub fn hub_config(&self) -> HubConfig {
    HubConfig {
      max_read_failures: self.max_read_failures,
      retry_interval: Duration::from_millis(self.read_retry_ms),
      ..HubConfig::default()
    }
  }

  pub fn crowd_config(&self) -> CrowdConfig {
    CrowdConfig {
      person_confidence: self.person_confidence,
      weapon_confidence: self.weapon_confidence,
      tracker: TrackerConfig {
        max_distance: self.track_max_distance,
        max_missed: self.track_max_missed,
      },
    }
  }

  pub fn matcher_config(&self) -> MatcherConfig {
    MatcherConfig {
      tolerance: self.match_tolerance,
      threshold: self.match_threshold,
    }
  }

  pub fn label_map(&self) -> LabelMap {
    LabelMap::new(self.weapon_classes.iter().cloned())
  }

  pub fn crowd_resize(&self) -> Option<(u32, u32)> {
    self.crowd_width.zip(self.crowd_height)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::ObjectKind;

  const REQUIRED: [&str; 5] = [
    "shouwang",
    "--input",
    "v4l2:///dev/video0",
    "--detector",
    "yolo:///models/yolov8n.onnx",
  ];

  #[test]
  fn defaults_follow_the_configuration_structs() {
    let args = Args::try_parse_from(REQUIRED).unwrap();
    assert_eq!(args.listen.port(), 5000);
    assert_eq!(args.crowd_frame_skip, 3);
    assert_eq!(args.face_frame_skip, 2);
    assert_eq!(args.method, MatchMethod::Advanced);
    assert!(args.face_model.is_none());
    assert_eq!(args.crowd_resize(), None);

    let tracker = args.crowd_config().tracker;
    assert_eq!(tracker.max_distance, TrackerConfig::default().max_distance);
    assert_eq!(tracker.max_missed, TrackerConfig::default().max_missed);
    assert_eq!(args.hub_config().max_read_failures, HubConfig::default().max_read_failures);
    assert_eq!(args.matcher_config().tolerance, MatcherConfig::default().tolerance);
  }

  #[test]
  fn parses_lists_methods_and_resize() {
    let mut argv = REQUIRED.to_vec();
    argv.extend([
      "--weapon-classes",
      "knife,Gun",
      "--method",
      "basic",
      "--crowd-width",
      "640",
      "--crowd-height",
      "320",
    ]);
    let args = Args::try_parse_from(argv).unwrap();
    assert_eq!(args.method, MatchMethod::Basic);
    assert_eq!(args.crowd_resize(), Some((640, 320)));

    let labels = args.label_map();
    assert_eq!(labels.classify("knife"), ObjectKind::Weapon);
    assert_eq!(labels.classify("gun"), ObjectKind::Weapon);
    assert_eq!(labels.classify("pistol"), ObjectKind::Other("pistol".to_string()));
  }

  #[test]
  fn rejects_bad_values() {
    let mut argv = REQUIRED.to_vec();
    argv.extend(["--method", "fancy"]);
    assert!(Args::try_parse_from(argv).is_err());

    let mut argv = REQUIRED.to_vec();
    argv.extend(["--crowd-width", "640"]);
    assert!(Args::try_parse_from(argv).is_err());

    let mut argv = REQUIRED.to_vec();
    argv.extend(["--jpeg-quality", "0"]);
    assert!(Args::try_parse_from(argv).is_err());

    assert!(Args::try_parse_from(["shouwang"]).is_err());
  }
}
