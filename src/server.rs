// 该文件是 Shouwang （守望） 项目的一部分。
// src/server.rs - HTTP 服务
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

//! HTTP 接口
//!
//! 每个视频流请求启动一条独立的流水线线程，线程通过容量为 1 的通道把
//! multipart 分块交给响应体。响应体被丢弃时取消守卫触发，流水线在下一帧退出，
//! 并随订阅一起释放对帧源的占用。

use std::{convert::Infallible, sync::Arc, thread};

use axum::{
  Json, Router,
  body::Body,
  extract::{DefaultBodyLimit, Multipart, State},
  http::header,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use futures_util::stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
  crowd::{CrowdAggregator, SharedAggregator},
  face::{FaceMatcher, MatchMethod},
  gallery::{GalleryStore, safe_name},
  input::FrameHub,
  model::ObjectDetector,
  output::{MULTIPART_CONTENT_TYPE, MjpegSink},
  state::DetectionState,
  task::{CancelGuard, CancelToken, CrowdTask, FaceTask, Task},
};

mod error;

pub use self::error::{ApiError, ApiResult};

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// 视频流参数
#[derive(Debug, Clone)]
pub struct StreamConfig {
  pub crowd_frame_skip: u32,
  pub face_frame_skip: u32,
  pub crowd_resize: Option<(u32, u32)>,
  pub jpeg_quality: u8,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      crowd_frame_skip: 3,
      face_frame_skip: 2,
      crowd_resize: None,
      jpeg_quality: crate::output::DEFAULT_JPEG_QUALITY,
    }
  }
}

/// 所有请求共享的服务状态
#[derive(Clone)]
pub struct AppState {
  pub hub: FrameHub,
  pub detector: Arc<ObjectDetector>,
  pub aggregator: SharedAggregator,
  pub matcher: Arc<FaceMatcher>,
  /// 未配置人脸模型时为 None
  pub gallery: Option<Arc<GalleryStore>>,
  pub state: Arc<DetectionState>,
  pub streams: StreamConfig,
}

impl AppState {
  fn gallery(&self) -> ApiResult<&Arc<GalleryStore>> {
    self
      .gallery
      .as_ref()
      .ok_or_else(|| ApiError::bad_request("Face recognition model is not configured"))
  }
}

pub fn router(app: AppState) -> Router {
  Router::new()
    .route("/video", get(video))
    .route("/start_crowd_count", get(start_crowd_count))
    .route("/crowd_count", get(crowd_count))
    .route("/weapon_status", get(weapon_status))
    .route("/face_video", get(face_video))
    .route("/toggle_face_detection", get(toggle_face_detection))
    .route("/upload_face", post(upload_face))
    .route("/face_match_status", get(face_match_status))
    .route("/face_screenshot", get(face_screenshot))
    .route("/set_face_recognition_method", post(set_face_recognition_method))
    .route("/healthz", get(healthz))
    .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(app)
}

/// 把流水线线程产生的分块包装成 multipart 响应，响应体持有取消守卫
fn mjpeg_response(rx: mpsc::Receiver<Vec<u8>>, guard: CancelGuard) -> Response {
  let chunks = stream::unfold((rx, guard), |(mut rx, guard)| async move {
    let chunk = rx.recv().await?;
    Some((Ok::<_, Infallible>(chunk), (rx, guard)))
  });
  (
    [
      (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
      (header::CACHE_CONTROL, "no-cache"),
    ],
    Body::from_stream(chunks),
  )
    .into_response()
}

fn spawn_stream(name: &str, run: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> ApiResult<()> {
  let label = name.to_string();
  thread::Builder::new()
    .name(name.to_string())
    .spawn(move || {
      if let Err(e) = run() {
        error!("{} 异常退出: {:#}", label, e);
      }
    })
    .map(|_| ())
    .map_err(|e| ApiError::internal(format!("Failed to start stream: {}", e)))
}

async fn video(State(app): State<AppState>) -> ApiResult<Response> {
  let subscription = app.hub.subscribe()?;
  let cancel = CancelToken::new();
  let (tx, rx) = mpsc::channel(1);

  let task = CrowdTask::new(
    Arc::clone(&app.aggregator),
    app.streams.crowd_frame_skip,
    cancel.clone(),
  )
  .with_resize(app.streams.crowd_resize);
  let frames = subscription.into_frames(cancel.clone());
  let detector = Arc::clone(&app.detector);
  let quality = app.streams.jpeg_quality;
  spawn_stream("crowd-stream", move || {
    task.run_task(frames, detector, MjpegSink::new(tx, quality))
  })?;

  info!("新的人数统计视频流");
  Ok(mjpeg_response(rx, cancel.guard()))
}

async fn start_crowd_count(State(app): State<AppState>) -> Json<Value> {
  CrowdAggregator::lock(&app.aggregator).reset();
  Json(json!({ "status": "Crowd Count Stream Restarted" }))
}

async fn crowd_count(State(app): State<AppState>) -> Json<Value> {
  Json(json!({ "count": app.state.crowd().count }))
}

async fn weapon_status(State(app): State<AppState>) -> Json<Value> {
  Json(json!({ "weapon_detected": app.state.crowd().weapon_detected }))
}

async fn face_video(State(app): State<AppState>) -> ApiResult<Response> {
  if !app.state.face_enabled() {
    return Err(ApiError::bad_request("Face detection is not enabled"));
  }
  let face_model = Arc::clone(app.gallery()?.face_model());
  let subscription = app.hub.subscribe()?;
  let cancel = CancelToken::new();
  let (tx, rx) = mpsc::channel(1);

  let task = FaceTask::new(
    Arc::clone(&app.matcher),
    app.streams.face_frame_skip,
    cancel.clone(),
    app.streams.jpeg_quality,
  );
  let frames = subscription.into_frames(cancel.clone());
  let quality = app.streams.jpeg_quality;
  spawn_stream("face-stream", move || {
    task.run_task(frames, face_model, MjpegSink::new(tx, quality))
  })?;

  info!("新的人脸比对视频流 (方法: {})", app.state.method());
  Ok(mjpeg_response(rx, cancel.guard()))
}

async fn toggle_face_detection(State(app): State<AppState>) -> ApiResult<Json<Value>> {
  let store = Arc::clone(app.gallery()?);
  let enabled = app.state.toggle_face_enabled();
  if enabled {
    let matcher = Arc::clone(&app.matcher);
    let reloaded = tokio::task::spawn_blocking(move || store.reload(&matcher))
      .await
      .map_err(|e| ApiError::internal(e.to_string()))?;
    if let Err(e) = reloaded {
      warn!("重新载入人脸库失败，继续使用旧的人脸库: {}", e);
    }
    app.state.reset_session();
  }
  info!("人脸识别{}", if enabled { "已开启" } else { "已关闭" });

  Ok(Json(json!({
    "status": if enabled { "Face detection started" } else { "Face detection stopped" },
    "enabled": enabled,
    "known_faces_count": app.matcher.gallery().len(),
  })))
}

async fn upload_face(State(app): State<AppState>, mut multipart: Multipart) -> ApiResult<Json<Value>> {
  let store = Arc::clone(app.gallery()?);

  let mut upload = None;
  while let Some(field) = multipart.next_field().await? {
    if field.name() == Some("image") {
      let filename = field.file_name().unwrap_or_default().to_string();
      let bytes = field.bytes().await?;
      upload = Some((filename, bytes));
      break;
    }
  }
  let Some((filename, bytes)) = upload else {
    return Err(ApiError::bad_request("No image file provided"));
  };
  if filename.trim().is_empty() {
    return Err(ApiError::bad_request("Empty filename"));
  }

  let matcher = Arc::clone(&app.matcher);
  let enrolled = tokio::task::spawn_blocking(move || store.enroll(&matcher, &filename, &bytes))
    .await
    .map_err(|e| ApiError::internal(format!("Failed to process image: {}", e)))??;

  Ok(Json(json!({
    "status": "Face uploaded and saved",
    "name": enrolled.name,
    "filename": enrolled.filename,
    "total_faces": enrolled.total_faces,
  })))
}

async fn face_match_status(State(app): State<AppState>) -> Json<Value> {
  let session = app.state.session();
  Json(json!({
    "matched": session.matched,
    "match_found": session.matched,
    "screenshot_available": session.screenshot_available(),
    "name": session.name,
    "confidence": session.confidence,
    "method": app.state.method(),
  }))
}

async fn face_screenshot(State(app): State<AppState>) -> ApiResult<Response> {
  let session = app.state.session();
  let Some(screenshot) = session.screenshot else {
    return Err(ApiError::not_found("No screenshot available"));
  };
  let name = session.name.as_deref().map(safe_name);
  let disposition = format!(
    "attachment; filename=\"{}_screenshot.jpg\"",
    name.as_deref().unwrap_or("match")
  );
  Ok(
    (
      [
        (header::CONTENT_TYPE, "image/jpeg".to_string()),
        (header::CONTENT_DISPOSITION, disposition),
      ],
      screenshot.to_vec(),
    )
      .into_response(),
  )
}

#[derive(Debug, Default, Deserialize)]
struct MethodRequest {
  #[serde(default)]
  method: Option<String>,
}

async fn set_face_recognition_method(
  State(app): State<AppState>,
  Json(request): Json<MethodRequest>,
) -> ApiResult<Json<Value>> {
  let method: MatchMethod = match request.method {
    Some(method) => method
      .parse()
      .map_err(|_| ApiError::bad_request("Method must be 'basic' or 'advanced'"))?,
    None => MatchMethod::default(),
  };
  app.state.set_method(method);
  Ok(Json(json!({
    "status": format!("Face recognition method set to {}", method),
    "method": method,
  })))
}

async fn healthz() -> &'static str {
  "ok"
}
