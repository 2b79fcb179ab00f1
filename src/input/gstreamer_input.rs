// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
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

//! # GStreamer 视频输入
//!
//! 通过 `decodebin` 解码视频文件，统一转换为 RGB 后由 `appsink` 拉取。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! **macOS:**
//! ```bash
//! brew install gstreamer
//! ```
//!
//! 打开时先进入 PAUSED 状态完成预滚，从预滚样本读取分辨率和帧率，
//! 再根据容器时长估算总帧数。`appsink` 不丢帧，读取慢时上游自然阻塞。

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, error, info};

use super::{InputError, InputSource, InputSourceType};
use crate::frame::Frame;

const PREROLL_TIMEOUT_SECS: u64 = 10;

/// 管道片段
pub enum GStreamerInputBuilderItem {
  FileSource,
  TargetFormat { format: String },
  AppSink { max_buffers: u32 },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      // 路径通过属性设置，避免路径中的空格和引号破坏管道描述
      GStreamerInputBuilderItem::FileSource => "filesrc name=src ! decodebin".to_string(),
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::AppSink { max_buffers } => format!(
        "appsink name=sink sync=false max-buffers={} drop=false",
        max_buffers
      ),
    }
  }
}

/// GStreamer 视频文件输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  width: u32,
  height: u32,
  fps: Option<f64>,
  frame_count: Option<u64>,
  frame_index: u64,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      tracing::warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn open_file(path: &Path) -> Result<Self, InputError> {
    if !path.is_file() {
      return Err(InputError::Open(format!("文件不存在: {}", path.display())));
    }

    gst::init()?;

    let items = [
      GStreamerInputBuilderItem::FileSource,
      GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      },
      GStreamerInputBuilderItem::AppSink { max_buffers: 4 },
    ];
    let desc = items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    info!("GStreamer pipeline description: {}", desc);

    let pipeline = gst::parse::launch(&desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| InputError::Open("无法创建管道".to_string()))?;

    pipeline
      .by_name("src")
      .ok_or_else(|| InputError::Open("找不到 filesrc 元素".to_string()))?
      .set_property("location", path.to_string_lossy().to_string());

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| InputError::Open("找不到 appsink 元素".to_string()))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| InputError::Open("无法转换为 appsink".to_string()))?;

    pipeline.set_state(gst::State::Paused)?;
    let (state, _, _) = pipeline.state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
    if let Err(e) = state {
      let _ = pipeline.set_state(gst::State::Null);
      return Err(InputError::Open(format!("{}: {}", path.display(), e)));
    }

    let preroll = appsink
      .pull_preroll()
      .map_err(|e| InputError::Open(format!("预滚失败: {}", e)))?;
    let caps = preroll
      .caps()
      .ok_or_else(|| InputError::Open("预滚样本缺少 caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)?;

    let fps = info.fps();
    let fps = (fps.numer() > 0 && fps.denom() > 0).then(|| fps.numer() as f64 / fps.denom() as f64);
    let frame_count = match (pipeline.query_duration::<gst::ClockTime>(), fps) {
      (Some(duration), Some(fps)) => Some((duration.nseconds() as f64 / 1e9 * fps).round() as u64),
      _ => None,
    };

    pipeline.set_state(gst::State::Playing)?;
    info!(
      "视频已打开: {}x{} fps={:?} 总帧数={:?}",
      info.width(),
      info.height(),
      fps,
      frame_count
    );

    Ok(Self {
      pipeline,
      appsink,
      width: info.width(),
      height: info.height(),
      fps,
      frame_count,
      frame_index: 0,
      finished: false,
    })
  }

  fn convert_sample(&self, sample: &gst::Sample) -> Result<(RgbImage, u64), InputError> {
    let buffer = sample
      .buffer()
      .ok_or_else(|| InputError::Capture("样本中没有缓冲区".to_string()))?;
    let caps = sample
      .caps()
      .ok_or_else(|| InputError::Capture("样本中没有 caps".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)?;

    let (width, height) = (info.width(), info.height());
    let stride = info.stride()[0] as usize;
    let row_len = width as usize * 3;

    let map = buffer.map_readable()?;
    let data = map.as_slice();
    let needed = stride * (height as usize).saturating_sub(1) + row_len;
    if height == 0 || data.len() < needed {
      return Err(InputError::Capture(format!(
        "缓冲区大小不匹配: 期望 {} 字节, 实际 {} 字节",
        needed,
        data.len()
      )));
    }

    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for y in 0..height as usize {
      pixels.extend_from_slice(&data[y * stride..y * stride + row_len]);
    }
    let image = RgbImage::from_raw(width, height, pixels)
      .ok_or_else(|| InputError::Capture("无法创建 RGB 图像".to_string()))?;

    let timestamp_ms = buffer.pts().map(|t| t.mseconds()).unwrap_or(0);
    Ok((image, timestamp_ms))
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(e) => {
        self.finished = true;
        if self.appsink.is_eos() {
          debug!("视频读取结束，共 {} 帧", self.frame_index);
          return None;
        }
        error!("Failed to pull sample: {}", e);
        return Some(Err(InputError::Capture(e.to_string())));
      }
    };

    self.frame_index += 1;
    Some(
      self
        .convert_sample(&sample)
        .map(|(image, timestamp_ms)| Frame::new(image, self.frame_index, timestamp_ms)),
    )
  }
}

impl InputSource for GStreamerInput {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Video
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    self.fps
  }

  fn frame_count(&self) -> Option<u64> {
    self.frame_count
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_items_join_into_description() {
    let desc = [
      GStreamerInputBuilderItem::FileSource,
      GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      },
      GStreamerInputBuilderItem::AppSink { max_buffers: 4 },
    ]
    .iter()
    .map(GStreamerInputBuilderItem::to_pipeline)
    .collect::<Vec<_>>()
    .join(" ! ");
    assert_eq!(
      desc,
      "filesrc name=src ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
       appsink name=sink sync=false max-buffers=4 drop=false"
    );
  }

  #[test]
  fn missing_file_is_an_open_error() {
    let err = GStreamerInput::open_file(Path::new("/definitely/not/here.mp4")).unwrap_err();
    assert!(matches!(err, InputError::Open(_)));
  }
}
