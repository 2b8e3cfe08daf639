// 该文件是 Shouwang （守望） 项目的一部分。
// src/main.rs - 项目主程序
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use shouwang::{
  args::Args,
  crowd::CrowdAggregator,
  face::FaceMatcher,
  gallery::GalleryStore,
  input::{FrameHub, url_opener},
  model::{detector_from_url, face_model_from_url},
  server::{self, AppState, StreamConfig},
  state::DetectionState,
};

const DEFAULT_LOG_FILTER: &str = "shouwang=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
  let env_filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
  tracing_subscriber::registry()
    .with(fmt::layer().with_target(true))
    .with(env_filter)
    .init();

  let args = Args::parse();

  info!("监听地址: {}", args.listen);
  info!("帧源: {}", args.input);
  info!("目标检测模型: {}", args.detector);
  match &args.face_model {
    Some(url) => info!("人脸模型: {}", url),
    None => warn!("未配置人脸模型，人脸识别接口不可用"),
  }

  info!("正在加载模型...");
  let detector = detector_from_url(&args.detector, args.label_map())
    .with_context(|| format!("无法加载目标检测模型 {}", args.detector))?;

  let state = Arc::new(DetectionState::new(args.method));
  let matcher = Arc::new(FaceMatcher::new(args.matcher_config(), Arc::clone(&state)));

  let gallery = match &args.face_model {
    Some(url) => {
      let face_model =
        face_model_from_url(url).with_context(|| format!("无法加载人脸模型 {}", url))?;
      let store = Arc::new(GalleryStore::new(&args.gallery_dir, face_model));
      let loader = Arc::clone(&store);
      let loader_matcher = Arc::clone(&matcher);
      let loaded = tokio::task::spawn_blocking(move || loader.reload(&loader_matcher)).await?;
      match loaded {
        Ok(count) => info!("已知人脸目录 {} 共 {} 个条目", args.gallery_dir.display(), count),
        Err(e) => warn!("无法载入已知人脸目录 {}: {}", args.gallery_dir.display(), e),
      }
      Some(store)
    }
    None => None,
  };
  info!("模型加载完成");

  let hub = FrameHub::new(url_opener(args.input.clone()), args.hub_config());
  let app = AppState {
    hub: hub.clone(),
    detector,
    aggregator: CrowdAggregator::new(args.crowd_config(), Arc::clone(&state)).shared(),
    matcher,
    gallery,
    state,
    streams: StreamConfig {
      crowd_frame_skip: args.crowd_frame_skip,
      face_frame_skip: args.face_frame_skip,
      crowd_resize: args.crowd_resize(),
      jpeg_quality: args.jpeg_quality,
    },
  };

  let listener = tokio::net::TcpListener::bind(args.listen)
    .await
    .with_context(|| format!("无法监听 {}", args.listen))?;
  info!("服务已启动: http://{}", args.listen);
  axum::serve(listener, server::router(app))
    .with_graceful_shutdown(shutdown_signal(hub))
    .await?;

  info!("服务已退出");
  Ok(())
}

/// 收到 Ctrl-C 后关闭帧分发器，正在进行的视频流随之结束
async fn shutdown_signal(hub: FrameHub) {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("无法监听 Ctrl-C 信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到退出信号");
  hub.close();
}
