// 该文件是 Shouwang （守望） 项目的一部分。
// tests/pipeline.rs - 流水线集成测试
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

mod common;

use std::{
  sync::{Arc, Mutex},
  thread,
};

use common::*;
use shouwang::{
  crowd::{CrowdAggregator, CrowdConfig, CrowdReport},
  face::{FaceAnnotation, FaceMatcher, Gallery, GalleryEntry, MatcherConfig},
  frame::Frame,
  gallery::GalleryStore,
  output::{Render, RenderError},
  state::DetectionState,
  task::{CancelToken, CrowdTask, FaceTask, Task},
  tracker::TrackId,
};

/// 记录每帧的结果，收满后取消流水线
struct Collect<T> {
  seen: Mutex<Vec<(u64, T)>>,
  limit: usize,
  cancel: CancelToken,
}

impl<T> Collect<T> {
  fn new(limit: usize, cancel: CancelToken) -> Self {
    Self {
      seen: Mutex::new(Vec::new()),
      limit,
      cancel,
    }
  }

  fn push(&self, index: u64, value: T) {
    let mut seen = self.seen.lock().unwrap();
    seen.push((index, value));
    if seen.len() >= self.limit {
      self.cancel.cancel();
    }
  }

  fn into_seen(self) -> Vec<(u64, T)> {
    self.seen.into_inner().unwrap()
  }
}

impl Render<Frame, CrowdReport> for Collect<(usize, Vec<TrackId>)> {
  type Error = RenderError;

  fn render_result(&self, frame: &Frame, result: &CrowdReport) -> Result<(), Self::Error> {
    let ids = result.persons.iter().map(|(id, _)| *id).collect();
    self.push(frame.index, (result.count, ids));
    Ok(())
  }
}

impl Render<Frame, Vec<FaceAnnotation>> for Collect<Vec<String>> {
  type Error = RenderError;

  fn render_result(&self, frame: &Frame, result: &Vec<FaceAnnotation>) -> Result<(), Self::Error> {
    self.push(frame.index, result.iter().map(|a| a.label()).collect());
    Ok(())
  }
}

fn alice_matcher() -> (Arc<DetectionState>, Arc<FaceMatcher>) {
  let state = Arc::new(DetectionState::default());
  state.set_face_enabled(true);
  let matcher = Arc::new(FaceMatcher::new(MatcherConfig::default(), Arc::clone(&state)));
  matcher.replace_gallery(Gallery::new(vec![GalleryEntry {
    name: "alice".to_string(),
    embedding: vec![10.0 / 255.0, 0.0],
  }]));
  (state, matcher)
}

#[test]
fn stationary_person_is_counted_once_over_fifty_frames() {
  let state = Arc::new(DetectionState::default());
  let aggregator = CrowdAggregator::new(CrowdConfig::default(), Arc::clone(&state)).shared();
  let hub = solid_hub([0, 0, 0]);
  let cancel = CancelToken::new();
  let sink = Collect::new(50, cancel.clone());

  CrowdTask::new(aggregator, 1, cancel.clone())
    .run_task(
      hub.subscribe().unwrap().into_frames(cancel),
      Arc::new(FixedDetector::new(vec![person(100.0, 100.0)])),
      &sink,
    )
    .unwrap();

  let seen = sink.into_seen();
  assert_eq!(seen.len(), 50);
  for (_, (count, ids)) in &seen {
    assert_eq!(*count, 1);
    assert_eq!(ids, &vec![0]);
  }
  assert_eq!(state.crowd().count, 1);
  assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn two_video_consumers_share_one_reader_and_one_tracker() {
  let state = Arc::new(DetectionState::default());
  let aggregator = CrowdAggregator::new(CrowdConfig::default(), Arc::clone(&state)).shared();
  let hub = solid_hub([0, 0, 0]);
  let detector = Arc::new(FixedDetector::new(vec![
    person(10.0, 10.0),
    person(200.0, 10.0),
  ]));

  let consumers: Vec<_> = (0..2)
    .map(|_| {
      let cancel = CancelToken::new();
      let frames = hub.subscribe().unwrap().into_frames(cancel.clone());
      let aggregator = Arc::clone(&aggregator);
      let detector = Arc::clone(&detector);
      thread::spawn(move || {
        let sink = Collect::new(20, cancel.clone());
        CrowdTask::new(aggregator, 1, cancel)
          .run_task(frames, detector, &sink)
          .unwrap();
        sink.into_seen()
      })
    })
    .collect();

  for consumer in consumers {
    let seen = consumer.join().unwrap();
    assert_eq!(seen.len(), 20);
    for (_, (count, ids)) in seen {
      assert_eq!(count, 2);
      assert_eq!(ids, vec![0, 1]);
    }
  }
  assert_eq!(state.crowd().count, 2);
  assert_eq!(CrowdAggregator::lock(&aggregator).live_tracks(), 2);
}

#[test]
fn first_match_owns_the_screenshot() {
  let (state, matcher) = alice_matcher();
  let frames = (0..50u64).map(|i| match i {
    10 => frame(i, 1, 10),
    40 => frame(i, 1, 12),
    _ => frame(i, 0, 0),
  });
  let sink = Collect::new(usize::MAX, CancelToken::new());

  FaceTask::new(matcher, 1, CancelToken::new(), 80)
    .run_task(frames, Arc::new(PixelFaces), &sink)
    .unwrap();

  let seen = sink.into_seen();
  let labelled: Vec<_> = seen.iter().filter(|(_, labels)| !labels.is_empty()).collect();
  assert_eq!(labelled.len(), 2);
  assert_eq!(labelled[0].0, 10);
  assert!(labelled[0].1[0].starts_with("alice"));
  assert_eq!(labelled[1].0, 40);
  assert!(labelled[1].1[0].starts_with("alice"));

  let session = state.session();
  assert!(session.matched);
  assert_eq!(session.name.as_deref(), Some("alice"));
  assert_eq!(session.confidence, Some(100.0));
  let screenshot = session.screenshot.unwrap();
  assert_eq!(image::load_from_memory(&screenshot).unwrap().width(), 64);
}

#[test]
fn empty_gallery_never_captures() {
  let state = Arc::new(DetectionState::default());
  state.set_face_enabled(true);
  let matcher = Arc::new(FaceMatcher::new(MatcherConfig::default(), Arc::clone(&state)));
  let frames = (0..10u64).map(|i| frame(i, 2, 10));
  let sink = Collect::new(usize::MAX, CancelToken::new());

  FaceTask::new(matcher, 1, CancelToken::new(), 80)
    .run_task(frames, Arc::new(PixelFaces), &sink)
    .unwrap();

  for (_, labels) in sink.into_seen() {
    assert_eq!(labels, vec!["Unknown".to_string(), "Unknown".to_string()]);
  }
  let session = state.session();
  assert!(!session.matched);
  assert!(!session.screenshot_available());
}

#[test]
fn toggling_off_and_on_starts_a_fresh_session() {
  let (state, matcher) = alice_matcher();
  let sink = Collect::new(usize::MAX, CancelToken::new());
  FaceTask::new(Arc::clone(&matcher), 1, CancelToken::new(), 80)
    .run_task((0..3u64).map(|i| frame(i, 1, 10)), Arc::new(PixelFaces), &sink)
    .unwrap();
  assert!(state.session().matched);

  state.toggle_face_enabled();
  assert!(state.toggle_face_enabled());
  state.reset_session();

  let session = state.session();
  assert!(!session.matched);
  assert!(session.name.is_none());
  assert!(session.confidence.is_none());
  assert!(!session.screenshot_available());
}

#[test]
fn enrolled_face_is_recognised_with_confidence_ordering() {
  let dir = tempfile::tempdir().unwrap();
  let state = Arc::new(DetectionState::default());
  state.set_face_enabled(true);
  let matcher = Arc::new(FaceMatcher::new(MatcherConfig::default(), Arc::clone(&state)));
  let store = GalleryStore::new(dir.path(), Arc::new(PixelFaces));

  let enrolled = store.enroll(&matcher, "alice.png", &png(1, 10)).unwrap();
  assert_eq!(enrolled.name, "alice");

  let gallery = matcher.gallery();
  let method = state.method();
  let near = matcher.best_match(&gallery, &[12.0 / 255.0, 0.0], method).unwrap();
  let far = matcher.best_match(&gallery, &[40.0 / 255.0, 0.0], method).unwrap();
  assert_eq!(near.name, "alice");
  assert!((0.0..=100.0).contains(&near.confidence));
  assert!((0.0..=100.0).contains(&far.confidence));
  assert!(near.confidence > far.confidence);
}

#[test]
fn rejected_upload_leaves_gallery_and_session_alone() {
  let dir = tempfile::tempdir().unwrap();
  let (state, matcher) = alice_matcher();
  let store = GalleryStore::new(dir.path(), Arc::new(PixelFaces));
  let sink = Collect::new(usize::MAX, CancelToken::new());
  FaceTask::new(Arc::clone(&matcher), 1, CancelToken::new(), 80)
    .run_task(std::iter::once(frame(0, 1, 10)), Arc::new(PixelFaces), &sink)
    .unwrap();
  let before = state.session();
  assert!(before.matched);

  assert!(store.enroll(&matcher, "nobody.png", &png(0, 0)).is_err());

  let after = state.session();
  assert_eq!(after.generation, before.generation);
  assert!(after.matched);
  assert_eq!(matcher.gallery().len(), 1);
  assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}
