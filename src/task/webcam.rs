// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/task/webcam.rs - 摄像头实时检测
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
  io::BufRead,
  path::{Path, PathBuf},
  sync::mpsc::{self, Receiver, Sender, TryRecvError},
  thread,
};

use tracing::{error, info, warn};

use super::{
  InferenceWorker, PipelineError, PipelineState, PotholeDetector, StreamStats, log_state,
  output_fps, should_sample,
};
use crate::{
  input::{InputSource, open_camera},
  output::{OutputError, OutputWriter, create_display_output, create_video_output, save_image},
};

const WINDOW_TITLE: &str = "Pothole Detection";
const DEFAULT_CAMERA_FPS: u32 = 30;

/// 摄像头循环的控制命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
  Quit,
  Save,
}

impl ControlCommand {
  /// `q` 退出，`s` 保存当前帧
  pub fn parse(line: &str) -> Option<Self> {
    match line.trim() {
      "q" | "Q" => Some(Self::Quit),
      "s" | "S" => Some(Self::Save),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct WebcamSummary {
  pub stats: StreamStats,
  /// 检测到坑洼的帧数
  pub pothole_frames: u64,
  pub snapshots: Vec<PathBuf>,
}

/// 从标准输入读取控制命令
///
/// 读取线程阻塞在标准输入上，随进程退出。
pub fn spawn_stdin_controls(tx: Sender<ControlCommand>) {
  let spawned = thread::Builder::new()
    .name("kengwa-controls".to_string())
    .spawn(move || {
      let stdin = std::io::stdin();
      for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if let Some(command) = ControlCommand::parse(&line) {
          if tx.send(command).is_err() {
            break;
          }
        }
      }
    });
  if let Err(e) = spawned {
    warn!("无法启动键盘控制线程: {}", e);
  }
}

fn install_ctrlc(tx: Sender<ControlCommand>) {
  if let Err(e) = ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(ControlCommand::Quit);
  }) {
    warn!("无法设置 Ctrl-C 处理: {}", e);
  }
}

pub(super) fn process_webcam(
  detector: &PotholeDetector,
  camera_index: usize,
  frame_skip: u32,
  output: Option<&Path>,
  show_display: bool,
) -> Result<WebcamSummary, PipelineError> {
  let mut source = open_camera(camera_index).map_err(PipelineError::Open)?;
  let (width, height) = (source.width(), source.height());
  let fps = source
    .fps()
    .map(|f| f.round() as u32)
    .filter(|f| *f > 0)
    .unwrap_or(DEFAULT_CAMERA_FPS);
  info!("摄像头 {} 已打开: {}x{}, {} fps", camera_index, width, height, fps);

  let mut recorder = output
    .map(|path| create_video_output(path, width, height, output_fps(fps, frame_skip)))
    .transpose()?;
  let mut display = if show_display {
    Some(create_display_output(WINDOW_TITLE, width, height, fps)?)
  } else {
    None
  };

  let (tx, rx) = mpsc::channel();
  install_ctrlc(tx.clone());
  spawn_stdin_controls(tx);
  info!("输入 q 回车退出，输入 s 回车保存当前帧");

  let summary = run_session(
    detector,
    &mut source,
    display.as_mut().map(|d| d.as_mut() as &mut dyn OutputWriter),
    recorder.as_mut().map(|r| r.as_mut() as &mut dyn OutputWriter),
    &rx,
    frame_skip,
    Path::new("."),
  )?;

  if let Some(display) = display.as_mut() {
    display.finish()?;
  }
  if let Some(path) = output {
    info!("录像已保存到 {}", path.display());
  }
  Ok(summary)
}

fn snapshot_path(dir: &Path) -> PathBuf {
  dir.join(format!("frame_{}.jpg", chrono::Utc::now().timestamp()))
}

pub(super) fn run_session(
  detector: &PotholeDetector,
  source: &mut dyn InputSource,
  mut display: Option<&mut dyn OutputWriter>,
  mut recorder: Option<&mut dyn OutputWriter>,
  controls: &Receiver<ControlCommand>,
  frame_skip: u32,
  snapshot_dir: &Path,
) -> Result<WebcamSummary, PipelineError> {
  detector.config.validate()?;
  let threshold = detector.config.confidence;
  let mut summary = WebcamSummary::default();

  log_state(PipelineState::Idle);
  let worker = InferenceWorker::spawn(detector.model.clone(), &detector.config)
    .map_err(PipelineError::Worker)?;
  log_state(PipelineState::Running);

  // 录像写入失败后停止读取，仍然经过收尾阶段
  let mut sink_error: Option<OutputError> = None;
  let mut frame_number = 0u64;
  while let Some(next) = source.next() {
    let mut frame = match next {
      Ok(frame) => frame,
      Err(e) => {
        error!("摄像头读取失败: {}", e);
        break;
      }
    };
    frame_number += 1;
    summary.stats.frames_read += 1;
    frame.index = frame_number;

    let shown = if should_sample(frame_number, frame_skip) {
      summary.stats.frames_sampled += 1;
      let raw = frame.image.clone();
      if worker.try_submit(frame) {
        summary.stats.frames_submitted += 1;
      } else {
        summary.stats.frames_dropped_busy += 1;
      }

      match worker.try_take() {
        Some((done, result)) => {
          let (annotated, found) = detector.annotator.annotate(done, &result, threshold);
          let mut image = annotated.image;
          if found {
            summary.pothole_frames += 1;
            detector.annotator.draw_alert_banner(&mut image);
          }
          if let Some(recorder) = recorder.as_deref_mut() {
            match recorder.write_frame(&image) {
              Ok(()) => summary.stats.frames_written += 1,
              Err(e) => {
                error!("写入录像失败: {}", e);
                sink_error = Some(e);
              }
            }
          }
          image
        }
        None => raw,
      }
    } else {
      frame.image
    };

    if let Some(window) = display.as_deref_mut() {
      if let Err(e) = window.write_frame(&shown) {
        warn!("预览窗口已关闭: {}", e);
        break;
      }
    }

    match controls.try_recv() {
      Ok(ControlCommand::Quit) => {
        info!("收到退出命令");
        break;
      }
      Ok(ControlCommand::Save) => {
        let path = snapshot_path(snapshot_dir);
        match save_image(&path, &shown) {
          Ok(()) => {
            info!("当前帧已保存到 {}", path.display());
            summary.snapshots.push(path);
          }
          Err(e) => warn!("保存当前帧到 {} 失败: {}", path.display(), e),
        }
      }
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
    }

    if sink_error.is_some() {
      break;
    }
  }

  log_state(PipelineState::Draining);
  let done = worker.shutdown();
  summary.stats.absorb(done.stats);
  for (frame, result) in done.remaining {
    let (annotated, found) = detector.annotator.annotate(frame, &result, threshold);
    let mut image = annotated.image;
    if found {
      summary.pothole_frames += 1;
      detector.annotator.draw_alert_banner(&mut image);
    }
    if sink_error.is_some() {
      continue;
    }
    if let Some(recorder) = recorder.as_deref_mut() {
      match recorder.write_frame(&image) {
        Ok(()) => summary.stats.frames_written += 1,
        Err(e) => {
          error!("写入录像失败: {}", e);
          sink_error = Some(e);
        }
      }
    }
  }
  if let Some(recorder) = recorder.as_deref_mut() {
    if let Err(e) = recorder.finish() {
      error!("关闭录像失败: {}", e);
      if sink_error.is_none() {
        sink_error = Some(e);
      }
    }
  }
  log_state(PipelineState::Closed);
  if let Some(e) = sink_error {
    return Err(e.into());
  }

  info!(
    "摄像头检测结束: 读取 {} 帧，推理 {} 帧，{} 帧检测到坑洼",
    summary.stats.frames_read, summary.stats.frames_inferred, summary.pothole_frames
  );
  Ok(summary)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_control_lines() {
    assert_eq!(ControlCommand::parse("q\n"), Some(ControlCommand::Quit));
    assert_eq!(ControlCommand::parse(" S "), Some(ControlCommand::Save));
    assert_eq!(ControlCommand::parse("x"), None);
    assert_eq!(ControlCommand::parse(""), None);
  }

  #[test]
  fn snapshot_name_uses_unix_seconds() {
    let path = snapshot_path(Path::new("/tmp"));
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("frame_"));
    assert!(name.ends_with(".jpg"));
    assert!(name["frame_".len()..name.len() - 4].parse::<i64>().is_ok());
  }
}
