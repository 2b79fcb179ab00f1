// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/output.rs - 输出定义
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

use std::path::Path;

use image::RgbImage;
use thiserror::Error;

/// 帧写出端
///
/// 由驱动线程独占，按到达顺序写出已标注的帧。
pub trait OutputWriter {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError>;

  /// 刷新并关闭输出，之后不再接受帧
  fn finish(&mut self) -> Result<(), OutputError>;
}

impl<W: OutputWriter + ?Sized> OutputWriter for Box<W> {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    (**self).write_frame(image)
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    (**self).finish()
  }
}

pub mod draw;

mod save_image_file;
pub use self::save_image_file::{SaveImageFileOutput, save_image};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerDisplayOutput, GStreamerVideoOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer error: {0}")]
  GStreamer(#[from] gstreamer::glib::Error),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer boolean error: {0}")]
  GStreamerBool(#[from] gstreamer::glib::BoolError),
  #[cfg(feature = "gstreamer_output")]
  #[error("State change error: {0}")]
  StateChange(#[from] gstreamer::StateChangeError),
  #[error("管道错误: {0}")]
  Pipeline(String),
  #[error("帧尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  SizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("输出已关闭")]
  Closed,
  #[error("未启用视频输出功能")]
  Unsupported,
}

/// 打开视频文件输出
pub fn create_video_output(
  path: &Path,
  width: u32,
  height: u32,
  fps: u32,
) -> Result<Box<dyn OutputWriter>, OutputError> {
  #[cfg(feature = "gstreamer_output")]
  {
    Ok(Box::new(GStreamerVideoOutput::new(path, width, height, fps)?))
  }
  #[cfg(not(feature = "gstreamer_output"))]
  {
    let _ = (path, width, height, fps);
    Err(OutputError::Unsupported)
  }
}

/// 打开预览窗口
pub fn create_display_output(
  title: &str,
  width: u32,
  height: u32,
  fps: u32,
) -> Result<Box<dyn OutputWriter>, OutputError> {
  #[cfg(feature = "gstreamer_output")]
  {
    Ok(Box::new(GStreamerDisplayOutput::new(title, width, height, fps)?))
  }
  #[cfg(not(feature = "gstreamer_output"))]
  {
    let _ = (title, width, height, fps);
    Err(OutputError::Unsupported)
  }
}
