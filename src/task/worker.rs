// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/task/worker.rs - 推理线程与有界队列
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
  sync::Arc,
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use tracing::{debug, error, info, warn};

use super::DetectorConfig;
use crate::{
  frame::Frame,
  model::{DetectResult, Model},
};

/// 输入队列元素，`None` 为结束标记
type WorkItem = Option<Frame>;
pub type WorkResult = (Frame, DetectResult);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
  pub inferred: u64,
  pub failed: u64,
  pub results_dropped: u64,
}

/// 关闭推理线程后的结果
pub struct WorkerShutdown {
  /// 线程按时退出时的统计；超时或崩溃时为 `None`
  pub stats: Option<WorkerStats>,
  /// 输出队列中剩余的结果，按完成顺序排列
  pub remaining: Vec<WorkResult>,
}

/// 单个推理线程
///
/// 输入、输出各一个容量有限的队列。提交端只在输入队列为空时放入帧，
/// 否则直接丢弃；推理端在输出队列满时丢弃结果。双方都不会阻塞。
pub struct InferenceWorker {
  input: Sender<WorkItem>,
  output: Receiver<WorkResult>,
  handle: Option<JoinHandle<WorkerStats>>,
  idle_backoff: Duration,
  join_timeout: Duration,
}

fn worker_loop(
  model: Arc<dyn Model>,
  input: Receiver<WorkItem>,
  output: Sender<WorkResult>,
  idle_backoff: Duration,
) -> WorkerStats {
  let mut stats = WorkerStats::default();

  loop {
    let frame = match input.try_recv() {
      Ok(Some(frame)) => frame,
      Ok(None) => {
        debug!("收到结束标记");
        break;
      }
      Err(TryRecvError::Empty) => {
        thread::sleep(idle_backoff);
        continue;
      }
      Err(TryRecvError::Disconnected) => break,
    };

    let now = Instant::now();
    let result = match model.infer(&frame.image) {
      Ok(result) => result,
      Err(e) => {
        error!("第 {} 帧推理失败: {}", frame.index, e);
        stats.failed += 1;
        thread::sleep(idle_backoff);
        continue;
      }
    };
    stats.inferred += 1;
    debug!(
      "第 {} 帧推理完成，耗时: {:.2?}，{} 个目标",
      frame.index,
      now.elapsed(),
      result.len()
    );

    match output.try_send((frame, result)) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) => stats.results_dropped += 1,
      Err(TrySendError::Disconnected(_)) => break,
    }
  }

  stats
}

impl InferenceWorker {
  pub fn spawn(model: Arc<dyn Model>, config: &DetectorConfig) -> std::io::Result<Self> {
    let capacity = config.queue_capacity.max(1);
    let (input_tx, input_rx) = bounded::<WorkItem>(capacity);
    let (output_tx, output_rx) = bounded::<WorkResult>(capacity);
    let idle_backoff = config.idle_backoff;

    let handle = thread::Builder::new()
      .name("kengwa-infer".to_string())
      .spawn(move || worker_loop(model, input_rx, output_tx, idle_backoff))?;
    info!("推理线程已启动，队列容量 {}", capacity);

    Ok(Self {
      input: input_tx,
      output: output_rx,
      handle: Some(handle),
      idle_backoff,
      join_timeout: config.join_timeout,
    })
  }

  /// 输入队列为空时提交，返回是否提交成功
  pub fn try_submit(&self, frame: Frame) -> bool {
    if !self.input.is_empty() {
      return false;
    }
    self.input.try_send(Some(frame)).is_ok()
  }

  /// 取出一个已完成的结果（若有）
  pub fn try_take(&self) -> Option<WorkResult> {
    self.output.try_recv().ok()
  }

  /// 发送结束标记，在超时内等待线程退出，然后取出全部剩余结果
  pub fn shutdown(mut self) -> WorkerShutdown {
    let stats = self.handle.take().and_then(|handle| {
      if self.input.send_timeout(None, self.join_timeout).is_err() {
        warn!("无法发送结束标记");
      }

      let deadline = Instant::now() + self.join_timeout;
      while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(self.idle_backoff.min(Duration::from_millis(10)));
      }

      if !handle.is_finished() {
        warn!("推理线程未在 {:?} 内退出，放弃等待", self.join_timeout);
        return None;
      }
      match handle.join() {
        Ok(stats) => Some(stats),
        Err(_) => {
          error!("推理线程异常退出");
          None
        }
      }
    });

    let remaining = self.output.try_iter().collect::<Vec<_>>();
    debug!("关闭推理线程，剩余 {} 个结果", remaining.len());
    WorkerShutdown { stats, remaining }
  }
}

impl Drop for InferenceWorker {
  fn drop(&mut self) {
    // 未正常关闭（例如写出失败提前返回）时通知线程退出
    if self.handle.is_some() {
      let _ = self.input.try_send(None);
    }
  }
}

#[cfg(test)]
mod tests {
  use image::RgbImage;

  use super::*;
  use crate::model::ModelError;

  struct Slow(Duration);

  impl Model for Slow {
    fn infer(&self, _: &RgbImage) -> Result<DetectResult, ModelError> {
      thread::sleep(self.0);
      Ok(DetectResult::empty())
    }

    fn class_names(&self) -> &[String] {
      &[]
    }

    fn device(&self) -> &str {
      "test"
    }
  }

  struct Failing;

  impl Model for Failing {
    fn infer(&self, _: &RgbImage) -> Result<DetectResult, ModelError> {
      Err(ModelError::Inference("boom".to_string()))
    }

    fn class_names(&self) -> &[String] {
      &[]
    }

    fn device(&self) -> &str {
      "test"
    }
  }

  fn frame(index: u64) -> Frame {
    Frame::new(RgbImage::new(2, 2), index, 0)
  }

  #[test]
  fn busy_worker_drops_submissions() {
    let worker = InferenceWorker::spawn(
      Arc::new(Slow(Duration::from_millis(200))),
      &DetectorConfig::default(),
    )
    .unwrap();

    assert!(worker.try_submit(frame(1)));
    thread::sleep(Duration::from_millis(60));
    // 第一帧已被取走，队列为空
    assert!(worker.try_submit(frame(2)));
    // 线程仍在推理第一帧，第二帧留在队列中
    assert!(!worker.try_submit(frame(3)));

    let done = worker.shutdown();
    let stats = done.stats.unwrap();
    assert_eq!(stats.inferred, 2);
    let indices = done.remaining.iter().map(|(f, _)| f.index).collect::<Vec<_>>();
    assert_eq!(indices, vec![1, 2]);
  }

  #[test]
  fn inference_errors_do_not_stop_the_worker() {
    let worker = InferenceWorker::spawn(Arc::new(Failing), &DetectorConfig::default()).unwrap();
    assert!(worker.try_submit(frame(1)));
    thread::sleep(Duration::from_millis(100));
    assert!(worker.try_submit(frame(2)));

    let done = worker.shutdown();
    assert_eq!(done.stats.unwrap().failed, 2);
    assert!(done.remaining.is_empty());
  }

  #[test]
  fn stuck_worker_is_abandoned_after_timeout() {
    let config = DetectorConfig::default()
      .with_join_timeout(Duration::from_millis(50))
      .with_idle_backoff(Duration::from_millis(2));
    let worker = InferenceWorker::spawn(Arc::new(Slow(Duration::from_secs(2))), &config).unwrap();
    assert!(worker.try_submit(frame(1)));
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let done = worker.shutdown();
    assert!(done.stats.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
  }
}
