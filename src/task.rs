// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/task.rs - 检测流程
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
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  alert::{AlertContext, MediaKind},
  input::{ImageSource, InputError, InputSource, open_video},
  model::{Model, ModelError},
  output::{OutputError, OutputWriter, create_video_output, draw::Annotator, save_image},
};

mod webcam;
mod worker;

pub use self::webcam::{ControlCommand, WebcamSummary, spawn_stdin_controls};
pub use self::worker::{InferenceWorker, WorkResult, WorkerShutdown, WorkerStats};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("无法加载图片: {0}")]
  Load(#[source] InputError),
  #[error("无法打开输入源: {0}")]
  Open(#[source] InputError),
  #[error("模型错误: {0}")]
  Model(#[from] ModelError),
  #[error("输出错误: {0}")]
  Output(#[from] OutputError),
  #[error("配置错误: {0}")]
  Config(String),
  #[error("无法启动推理线程: {0}")]
  Worker(#[source] std::io::Error),
}

/// 检测参数
#[derive(Debug, Clone)]
pub struct DetectorConfig {
  pub confidence: f32,
  pub queue_capacity: usize,
  pub idle_backoff: Duration,
  pub join_timeout: Duration,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      confidence: 0.5,
      queue_capacity: 2,
      idle_backoff: Duration::from_millis(10),
      join_timeout: Duration::from_secs(1),
    }
  }
}

impl DetectorConfig {
  pub fn with_confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
    self.queue_capacity = queue_capacity;
    self
  }

  pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
    self.idle_backoff = idle_backoff;
    self
  }

  pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
    self.join_timeout = join_timeout;
    self
  }

  pub fn validate(&self) -> Result<(), PipelineError> {
    if !(0.0..=1.0).contains(&self.confidence) {
      return Err(PipelineError::Config(format!(
        "置信度阈值必须在 0 到 1 之间，当前为 {}",
        self.confidence
      )));
    }
    if self.queue_capacity == 0 {
      return Err(PipelineError::Config("队列容量不能为 0".to_string()));
    }
    Ok(())
  }
}

/// 视频或摄像头处理的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Idle,
  Running,
  Draining,
  Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
  pub frames_read: u64,
  pub frames_sampled: u64,
  pub frames_submitted: u64,
  pub frames_dropped_busy: u64,
  pub frames_inferred: u64,
  pub frames_written: u64,
  pub results_dropped: u64,
}

impl StreamStats {
  fn absorb(&mut self, worker: Option<WorkerStats>) {
    if let Some(worker) = worker {
      self.frames_inferred = worker.inferred;
      self.results_dropped = worker.results_dropped;
    }
  }
}

/// 一次图片或视频处理的结果
#[derive(Debug, Clone)]
pub struct PipelineResult {
  pub inference_time: Duration,
  pub pothole_detected: bool,
  pub output_path: PathBuf,
  pub video_duration: Option<f64>,
  pub stats: Option<StreamStats>,
  /// 未配置告警时为 `None`
  pub alert_sent: Option<bool>,
}

/// 帧序号从 1 开始，`skip` 为两次采样之间跳过的帧数
pub fn should_sample(frame_number: u64, skip: u32) -> bool {
  frame_number % (u64::from(skip) + 1) == 0
}

/// 输出视频的帧率，至少为 1
pub fn output_fps(fps: u32, skip: u32) -> u32 {
  (fps / (skip.saturating_add(1))).max(1)
}

fn log_state(state: PipelineState) {
  debug!("流程状态: {:?}", state);
}

/// 坑洼检测器
///
/// 图片在当前线程同步处理；视频与摄像头使用一个推理线程，
/// 驱动线程负责读取、采样、标注与写出。
pub struct PotholeDetector {
  model: Arc<dyn Model>,
  config: DetectorConfig,
  annotator: Annotator,
  alerts: Option<AlertContext>,
}

impl PotholeDetector {
  pub fn new(model: Arc<dyn Model>, config: DetectorConfig) -> Self {
    info!("检测器使用设备: {}", model.device());
    Self {
      model,
      config,
      annotator: Annotator::default(),
      alerts: None,
    }
  }

  pub fn with_annotator(mut self, annotator: Annotator) -> Self {
    self.annotator = annotator;
    self
  }

  pub fn with_alerts(mut self, alerts: AlertContext) -> Self {
    self.alerts = Some(alerts);
    self
  }

  fn notify(
    &self,
    kind: MediaKind,
    input: &Path,
    output: &Path,
    inference_time: Duration,
    video_duration: Option<f64>,
  ) -> Option<bool> {
    let alerts = self.alerts.as_ref()?;
    Some(alerts.notify(kind, input, output, inference_time, video_duration))
  }

  /// 处理单张图片
  pub fn process_image(&self, input: &Path, output: &Path) -> Result<PipelineResult, PipelineError> {
    info!("处理图片: {}", input.display());
    let mut source = ImageSource::new(input).map_err(PipelineError::Load)?;
    let frame = source
      .next()
      .ok_or_else(|| PipelineError::Load(InputError::Open(input.display().to_string())))?
      .map_err(PipelineError::Load)?;

    let now = Instant::now();
    let result = self.model.infer(&frame.image)?;
    let inference_time = now.elapsed();
    info!("推理完成，耗时: {:.2?}，{} 个目标", inference_time, result.len());

    let (annotated, pothole_detected) =
      self
        .annotator
        .annotate(frame, &result, self.config.confidence);
    save_image(output, &annotated.image)?;
    info!("结果已保存到 {}", output.display());

    let alert_sent = if pothole_detected {
      self.notify(MediaKind::Image, input, output, inference_time, None)
    } else {
      None
    };

    Ok(PipelineResult {
      inference_time,
      pothole_detected,
      output_path: output.to_path_buf(),
      video_duration: None,
      stats: None,
      alert_sent,
    })
  }

  /// 处理视频文件
  pub fn process_video(
    &self,
    input: &Path,
    output: &Path,
    frame_skip: u32,
  ) -> Result<PipelineResult, PipelineError> {
    info!("处理视频: {}", input.display());
    let mut source = open_video(input).map_err(PipelineError::Open)?;
    let fps = source.fps().map(|f| f.round() as u32).unwrap_or(0);
    let mut writer = create_video_output(
      output,
      source.width(),
      source.height(),
      output_fps(fps, frame_skip),
    )?;
    self.process_video_source(&mut source, &mut writer, input, output, frame_skip)
  }

  /// 在已打开的输入与输出上运行视频流程
  pub fn process_video_source(
    &self,
    source: &mut dyn InputSource,
    writer: &mut dyn OutputWriter,
    input: &Path,
    output: &Path,
    frame_skip: u32,
  ) -> Result<PipelineResult, PipelineError> {
    self.config.validate()?;
    let fps = source.fps().map(|f| f.round() as u32).unwrap_or(0);
    let total = source.frame_count().unwrap_or(0);
    let video_duration = if fps > 0 {
      total as f64 / f64::from(fps)
    } else {
      0.0
    };
    info!(
      "视频信息: {}x{}, {} fps, {} 帧, {:.2} 秒",
      source.width(),
      source.height(),
      fps,
      total,
      video_duration
    );

    let now = Instant::now();
    let (stats, pothole_detected) = self.run_stream(source, writer, frame_skip)?;
    let inference_time = now.elapsed();
    info!(
      "视频处理完成，耗时: {:.2?}，读取 {} 帧，写出 {} 帧",
      inference_time, stats.frames_read, stats.frames_written
    );

    let alert_sent = if pothole_detected {
      self.notify(
        MediaKind::Video,
        input,
        output,
        inference_time,
        Some(video_duration),
      )
    } else {
      None
    };

    Ok(PipelineResult {
      inference_time,
      pothole_detected,
      output_path: output.to_path_buf(),
      video_duration: Some(video_duration),
      stats: Some(stats),
      alert_sent,
    })
  }

  fn run_stream(
    &self,
    source: &mut dyn InputSource,
    writer: &mut dyn OutputWriter,
    frame_skip: u32,
  ) -> Result<(StreamStats, bool), PipelineError> {
    let threshold = self.config.confidence;
    let mut stats = StreamStats::default();
    let mut pothole_detected = false;

    log_state(PipelineState::Idle);
    let worker =
      InferenceWorker::spawn(self.model.clone(), &self.config).map_err(PipelineError::Worker)?;
    log_state(PipelineState::Running);

    // 写出失败后停止读取，仍然经过收尾阶段
    let mut sink_error: Option<OutputError> = None;
    let mut frame_number = 0u64;
    while let Some(next) = source.next() {
      let mut frame = match next {
        Ok(frame) => frame,
        Err(e) => {
          error!("读取第 {} 帧失败: {}", frame_number + 1, e);
          break;
        }
      };
      frame_number += 1;
      stats.frames_read += 1;
      if !should_sample(frame_number, frame_skip) {
        continue;
      }
      stats.frames_sampled += 1;
      frame.index = frame_number;

      if worker.try_submit(frame) {
        stats.frames_submitted += 1;
      } else {
        stats.frames_dropped_busy += 1;
      }

      if let Some((frame, result)) = worker.try_take() {
        let (annotated, found) = self.annotator.annotate(frame, &result, threshold);
        pothole_detected |= found;
        match writer.write_frame(&annotated.image) {
          Ok(()) => stats.frames_written += 1,
          Err(e) => {
            error!("写出第 {} 帧失败: {}", frame_number, e);
            sink_error = Some(e);
            break;
          }
        }
      }
    }

    log_state(PipelineState::Draining);
    let done = worker.shutdown();
    stats.absorb(done.stats);
    for (frame, result) in done.remaining {
      let (annotated, found) = self.annotator.annotate(frame, &result, threshold);
      pothole_detected |= found;
      if sink_error.is_some() {
        continue;
      }
      match writer.write_frame(&annotated.image) {
        Ok(()) => stats.frames_written += 1,
        Err(e) => {
          error!("写出剩余结果失败: {}", e);
          sink_error = Some(e);
        }
      }
    }
    if let Err(e) = writer.finish() {
      error!("关闭输出失败: {}", e);
      if sink_error.is_none() {
        sink_error = Some(e);
      }
    }
    log_state(PipelineState::Closed);
    if let Some(e) = sink_error {
      return Err(e.into());
    }

    if stats.frames_dropped_busy > 0 {
      warn!("推理繁忙，丢弃了 {} 帧", stats.frames_dropped_busy);
    }
    Ok((stats, pothole_detected))
  }

  /// 摄像头实时检测
  pub fn process_webcam(
    &self,
    camera_index: usize,
    frame_skip: u32,
    output: Option<&Path>,
    show_display: bool,
  ) -> Result<WebcamSummary, PipelineError> {
    webcam::process_webcam(self, camera_index, frame_skip, output, show_display)
  }

  /// 摄像头循环，控制命令通过 `controls` 传入
  pub fn run_webcam_session(
    &self,
    source: &mut dyn InputSource,
    display: Option<&mut dyn OutputWriter>,
    recorder: Option<&mut dyn OutputWriter>,
    controls: &std::sync::mpsc::Receiver<ControlCommand>,
    frame_skip: u32,
    snapshot_dir: &Path,
  ) -> Result<WebcamSummary, PipelineError> {
    webcam::run_session(
      self,
      source,
      display,
      recorder,
      controls,
      frame_skip,
      snapshot_dir,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sampling_keeps_every_nth_frame() {
    let sampled = (1..=9).filter(|n| should_sample(*n, 2)).collect::<Vec<_>>();
    assert_eq!(sampled, vec![3, 6, 9]);
    assert!((1..=5).all(|n| should_sample(n, 0)));
  }

  #[test]
  fn output_fps_has_floor_of_one() {
    assert_eq!(output_fps(30, 2), 10);
    assert_eq!(output_fps(25, 2), 8);
    assert_eq!(output_fps(2, 5), 1);
    assert_eq!(output_fps(0, 0), 1);
  }

  #[test]
  fn config_rejects_bad_values() {
    assert!(DetectorConfig::default().validate().is_ok());
    assert!(matches!(
      DetectorConfig::default().with_confidence(1.5).validate(),
      Err(PipelineError::Config(_))
    ));
    assert!(matches!(
      DetectorConfig::default().with_queue_capacity(0).validate(),
      Err(PipelineError::Config(_))
    ));
  }
}
