// 该文件是 Shouwang （守望） 项目的一部分。
// src/input/hub.rs - 单读取者帧分发
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

//! # 帧分发
//!
//! 摄像头只有一个，但人群流与人脸流各自拉取帧。`FrameHub` 让唯一的读取线程
//! 持有设备，把同一帧（`Arc<Frame>`）扇出给所有订阅者：
//!
//! - 第一个订阅者出现时打开设备并启动读取线程；
//! - 每个订阅者有独立的有界队列，读取线程只做非阻塞发送，
//!   慢订阅者丢帧，不会拖住读取线程或其他订阅者；
//! - 最后一个订阅者离开后读取线程退出并释放设备；
//! - 连续读取失败超过阈值后，每次失败发布一张占位帧，保证下游视频流不中断。

use std::{
  sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, info, warn};

use crate::{
  frame::{Frame, PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH},
  input::{FrameSource, InputError},
  output::draw::placeholder_image,
  task::CancelToken,
};

/// 打开帧源的工厂函数，在读取线程内调用
pub type SourceOpener = Box<dyn Fn() -> Result<Box<dyn FrameSource>, InputError> + Send + Sync>;

/// 订阅者检查取消信号的周期
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct HubConfig {
  /// 连续失败多少次之后开始输出占位帧
  pub max_read_failures: u32,
  /// 读取失败后的重试间隔
  pub retry_interval: Duration,
  /// 每个订阅者的队列深度
  pub queue_depth: usize,
}

impl Default for HubConfig {
  fn default() -> Self {
    Self {
      max_read_failures: 10,
      retry_interval: Duration::from_millis(50),
      queue_depth: 1,
    }
  }
}

struct Slot {
  id: u64,
  tx: Sender<Arc<Frame>>,
}

#[derive(Default)]
struct Registry {
  slots: Vec<Slot>,
  next_id: u64,
  reader_running: bool,
  closed: bool,
}

struct HubShared {
  opener: SourceOpener,
  config: HubConfig,
  registry: Mutex<Registry>,
  next_index: AtomicU64,
  started: Instant,
}

impl HubShared {
  fn registry(&self) -> MutexGuard<'_, Registry> {
    self.registry.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 没有订阅者时标记读取线程结束，返回是否继续
  fn keep_running(&self) -> bool {
    let mut registry = self.registry();
    if registry.slots.is_empty() {
      registry.reader_running = false;
      false
    } else {
      true
    }
  }

  fn broadcast(&self, frame: Arc<Frame>) {
    let mut registry = self.registry();
    registry.slots.retain(|slot| match slot.tx.try_send(Arc::clone(&frame)) {
      Ok(()) => true,
      Err(TrySendError::Full(_)) => {
        debug!("订阅者 {} 队列已满，丢弃第 {} 帧", slot.id, frame.index);
        true
      }
      Err(TrySendError::Disconnected(_)) => false,
    });
  }

  fn next_stamp(&self) -> (u64, u64) {
    let index = self.next_index.fetch_add(1, Ordering::Relaxed);
    let timestamp_ms = self.started.elapsed().as_millis() as u64;
    (index, timestamp_ms)
  }
}

/// 单读取者帧分发器，可廉价克隆
#[derive(Clone)]
pub struct FrameHub {
  shared: Arc<HubShared>,
}

impl FrameHub {
  pub fn new(opener: SourceOpener, config: HubConfig) -> Self {
    Self {
      shared: Arc::new(HubShared {
        opener,
        config,
        registry: Mutex::new(Registry::default()),
        next_index: AtomicU64::new(0),
        started: Instant::now(),
      }),
    }
  }

  /// 注册一个订阅者；如读取线程未运行则启动它
  pub fn subscribe(&self) -> Result<Subscription, InputError> {
    let (tx, rx) = bounded(self.shared.config.queue_depth.max(1));
    let mut registry = self.shared.registry();
    if registry.closed {
      return Err(InputError::Unavailable("frame hub is closed".to_string()));
    }
    let id = registry.next_id;
    registry.next_id += 1;
    registry.slots.push(Slot { id, tx });

    if !registry.reader_running {
      let shared = Arc::clone(&self.shared);
      let spawned = thread::Builder::new()
        .name("frame-reader".to_string())
        .spawn(move || reader_loop(shared));
      if let Err(e) = spawned {
        registry.slots.retain(|slot| slot.id != id);
        return Err(InputError::IoError(e));
      }
      registry.reader_running = true;
    }
    debug!("新增帧订阅者 {}", id);

    Ok(Subscription {
      id,
      rx,
      shared: Arc::clone(&self.shared),
    })
  }

  pub fn subscriber_count(&self) -> usize {
    self.shared.registry().slots.len()
  }

  pub fn is_reading(&self) -> bool {
    self.shared.registry().reader_running
  }

  /// 断开所有订阅者并拒绝新的订阅，读取线程随后退出
  pub fn close(&self) {
    let mut registry = self.shared.registry();
    registry.closed = true;
    let dropped = registry.slots.len();
    registry.slots.clear();
    info!("帧分发器关闭，断开 {} 个订阅者", dropped);
  }
}

/// 单个订阅者的帧接收端，Drop 时自动退订
pub struct Subscription {
  id: u64,
  rx: Receiver<Arc<Frame>>,
  shared: Arc<HubShared>,
}

impl Subscription {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Result<Arc<Frame>, RecvTimeoutError> {
    self.rx.recv_timeout(timeout)
  }

  /// 转为在取消信号触发后结束的帧迭代器
  pub fn into_frames(self, cancel: CancelToken) -> SubscriptionFrames {
    SubscriptionFrames {
      subscription: self,
      cancel,
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let mut registry = self.shared.registry();
    registry.slots.retain(|slot| slot.id != self.id);
    debug!("帧订阅者 {} 退出", self.id);
  }
}

/// 阻塞等待下一帧，周期性检查取消信号
pub struct SubscriptionFrames {
  subscription: Subscription,
  cancel: CancelToken,
}

impl Iterator for SubscriptionFrames {
  type Item = Arc<Frame>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if self.cancel.is_cancelled() {
        return None;
      }
      match self.subscription.recv_timeout(POLL_INTERVAL) {
        Ok(frame) => return Some(frame),
        Err(RecvTimeoutError::Timeout) => continue,
        Err(RecvTimeoutError::Disconnected) => return None,
      }
    }
  }
}

fn reader_loop(shared: Arc<HubShared>) {
  info!("帧读取线程启动");
  let config = shared.config.clone();
  let mut source: Option<Box<dyn FrameSource>> = None;
  let mut failures = 0u32;
  let mut frame_size = (PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT);

  while shared.keep_running() {
    let read = match source.as_mut() {
      Some(source) => source.try_read(),
      None => match (shared.opener)() {
        Ok(opened) => {
          info!("帧源已打开");
          source = Some(opened);
          continue;
        }
        Err(e) => Err(e),
      },
    };

    match read {
      Ok(image) => {
        if failures > 0 {
          info!("帧源恢复，此前连续失败 {} 次", failures);
        }
        failures = 0;
        frame_size = image.dimensions();
        let (index, timestamp_ms) = shared.next_stamp();
        shared.broadcast(Arc::new(Frame::new(image, index, timestamp_ms)));
      }
      Err(e) => {
        failures = failures.saturating_add(1);
        if failures > config.max_read_failures {
          warn!("帧源连续失败 {} 次，输出占位帧: {}", failures, e);
          // 重新打开设备，以便从拔插等故障中恢复
          source = None;
          let (index, timestamp_ms) = shared.next_stamp();
          let image = placeholder_image(frame_size.0, frame_size.1);
          shared.broadcast(Arc::new(Frame::placeholder(image, index, timestamp_ms)));
        } else {
          debug!("读取帧失败 ({}/{}): {}", failures, config.max_read_failures, e);
        }
        thread::sleep(config.retry_interval);
      }
    }
  }

  drop(source);
  info!("没有订阅者，帧读取线程退出并释放帧源");
}
