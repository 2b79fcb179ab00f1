// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件与预览窗口输出
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

//! # GStreamer 输出
//!
//! 通过 `appsrc` 把 RGB 帧送入编码或显示管道。
//!
//! - [`GStreamerVideoOutput`]：按扩展名选择编码与封装，写入视频文件
//!   （`.mp4`、`.mkv`、`.avi`、`.webm`，其他扩展名按 MP4 处理）
//! - [`GStreamerDisplayOutput`]：`autovideosink` 预览窗口
//!
//! 写入的帧率为构造时给定的帧率，时间戳按已写帧数递增。

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{info, warn};

use super::{OutputError, OutputWriter};

const EOS_TIMEOUT_SECS: u64 = 10;

fn encoder_for(path: &Path) -> &'static str {
  let ext = path
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_ascii_lowercase);
  match ext.as_deref() {
    Some("mkv") => {
      "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux"
    }
    Some("avi") => "video/x-raw,format=I420 ! x264enc ! avimux",
    Some("webm") => "vp8enc ! webmmux",
    _ => "video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux",
  }
}

/// `appsrc` 推流管道
struct AppSrcPipeline {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  info: gst_video::VideoInfo,
  fps: u64,
  frame_count: u64,
  wait_eos: bool,
  closed: bool,
}

impl AppSrcPipeline {
  fn launch(tail: &str, width: u32, height: u32, fps: u32) -> Result<Self, OutputError> {
    gst::init()?;

    let fps = fps.max(1);
    let desc = format!("appsrc name=src ! videoconvert ! {}", tail);
    info!("创建输出管道: {}", desc);

    let pipeline = gst::parse::launch(&desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| OutputError::Pipeline("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or_else(|| OutputError::Pipeline("找不到 appsrc 元素".to_string()))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| OutputError::Pipeline("无法转换为 appsrc".to_string()))?;

    let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, width, height)
      .fps(gst::Fraction::new(fps as i32, 1))
      .build()?;
    appsrc.set_caps(Some(&info.to_caps()?));
    appsrc.set_format(gst::Format::Time);

    Ok(Self {
      pipeline,
      appsrc,
      info,
      fps: fps as u64,
      frame_count: 0,
      wait_eos: true,
      closed: false,
    })
  }

  fn start(&self) -> Result<(), OutputError> {
    self.pipeline.set_state(gst::State::Playing)?;
    Ok(())
  }

  fn push(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.closed {
      return Err(OutputError::Closed);
    }

    let expected = (self.info.width(), self.info.height());
    if image.dimensions() != expected {
      return Err(OutputError::SizeMismatch {
        expected,
        actual: image.dimensions(),
      });
    }

    let mut buffer = gst::Buffer::with_size(self.info.size())?;
    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or_else(|| OutputError::Pipeline("缓冲区不可写".to_string()))?;
      let timestamp = self.frame_count * 1_000_000_000 / self.fps;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(timestamp));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(1_000_000_000 / self.fps));

      // RGB 行按 4 字节对齐，逐行拷贝
      let stride = self.info.stride()[0] as usize;
      let row_len = image.width() as usize * 3;
      let mut map = buffer_ref.map_writable()?;
      let data = map.as_mut_slice();
      for (y, row) in image.as_raw().chunks_exact(row_len).enumerate() {
        data[y * stride..y * stride + row_len].copy_from_slice(row);
      }
    }
    self.frame_count += 1;

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| OutputError::Pipeline(format!("推送缓冲区失败: {:?}", e)))?;
    Ok(())
  }

  fn close(&mut self) -> Result<(), OutputError> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;

    let _ = self.appsrc.end_of_stream();

    let mut result = Ok(());
    if self.wait_eos
      && let Some(bus) = self.pipeline.bus()
      && let Some(msg) = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      )
      && let gst::MessageView::Error(err) = msg.view()
    {
      result = Err(OutputError::Pipeline(format!(
        "{} ({:?})",
        err.error(),
        err.debug()
      )));
    }

    self.pipeline.set_state(gst::State::Null)?;
    info!("输出管道已关闭，共写入 {} 帧", self.frame_count);
    result
  }
}

impl Drop for AppSrcPipeline {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("关闭输出管道失败: {}", e);
    }
  }
}

/// GStreamer 视频文件输出
pub struct GStreamerVideoOutput {
  inner: AppSrcPipeline,
}

impl GStreamerVideoOutput {
  pub fn new(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self, OutputError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let tail = format!("{} ! filesink name=sink", encoder_for(path));
    let inner = AppSrcPipeline::launch(&tail, width, height, fps)?;

    let filesink = inner
      .pipeline
      .by_name("sink")
      .ok_or_else(|| OutputError::Pipeline("找不到 filesink 元素".to_string()))?;
    filesink.set_property("location", path.to_string_lossy().to_string());

    inner.start()?;
    info!(
      "视频输出初始化: {}x{} @ {} fps -> {}",
      width,
      height,
      fps,
      path.display()
    );
    Ok(Self { inner })
  }
}

impl OutputWriter for GStreamerVideoOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    self.inner.push(image)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.inner.close()
  }
}

/// GStreamer 预览窗口
pub struct GStreamerDisplayOutput {
  inner: AppSrcPipeline,
}

impl GStreamerDisplayOutput {
  pub fn new(title: &str, width: u32, height: u32, fps: u32) -> Result<Self, OutputError> {
    let mut inner = AppSrcPipeline::launch("autovideosink sync=false", width, height, fps)?;
    inner.wait_eos = false;
    inner.start()?;
    info!("预览窗口已打开: {} ({}x{})", title, width, height);
    Ok(Self { inner })
  }
}

impl OutputWriter for GStreamerDisplayOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    self.inner.push(image)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.inner.close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encoder_follows_extension() {
    assert!(encoder_for(Path::new("a.MKV")).ends_with("matroskamux"));
    assert!(encoder_for(Path::new("a.webm")).starts_with("vp8enc"));
    assert!(encoder_for(Path::new("a.mov")).ends_with("mp4mux"));
  }
}
