// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/input.rs - 输入源
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

use thiserror::Error;

use crate::frame::Frame;

/// 输入源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSourceType {
  /// 图片文件
  Image,
  /// 视频文件
  Video,
  /// 摄像头
  Camera,
}

/// 输入源
///
/// 迭代产生帧；返回 `None` 表示流结束，`Some(Err(_))` 表示读取失败。
pub trait InputSource: Iterator<Item = Result<Frame, InputError>> {
  fn source_type(&self) -> InputSourceType;

  fn width(&self) -> u32;

  fn height(&self) -> u32;

  /// 帧率（如果适用）
  fn fps(&self) -> Option<f64>;

  /// 总帧数（仅在容器提供时长时可知）
  fn frame_count(&self) -> Option<u64> {
    None
  }
}

impl<S: InputSource + ?Sized> InputSource for Box<S> {
  fn source_type(&self) -> InputSourceType {
    (**self).source_type()
  }

  fn width(&self) -> u32 {
    (**self).width()
  }

  fn height(&self) -> u32 {
    (**self).height()
  }

  fn fps(&self) -> Option<f64> {
    (**self).fps()
  }

  fn frame_count(&self) -> Option<u64> {
    (**self).frame_count()
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("无法解码图片 {path}: {source}")]
  Decode {
    path: String,
    #[source]
    source: image::ImageError,
  },
  #[error("无法打开输入源: {0}")]
  Open(String),
  #[error("无法捕获帧: {0}")]
  Capture(String),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer error: {0}")]
  GStreamer(#[from] gstreamer::glib::Error),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer boolean error: {0}")]
  GStreamerBool(#[from] gstreamer::glib::BoolError),
  #[cfg(feature = "gstreamer_input")]
  #[error("State change error: {0}")]
  StateChange(#[from] gstreamer::StateChangeError),
  #[error("未启用该输入功能: {0}")]
  Unsupported(&'static str),
}

mod image_source;
pub use self::image_source::ImageSource;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerInput, GStreamerInputBuilderItem};

#[cfg(feature = "v4l2_input")]
mod v4l2_input;
#[cfg(feature = "v4l2_input")]
pub use self::v4l2_input::V4l2Input;

/// 打开视频文件
pub fn open_video(path: &Path) -> Result<Box<dyn InputSource>, InputError> {
  #[cfg(feature = "gstreamer_input")]
  {
    Ok(Box::new(GStreamerInput::open_file(path)?))
  }
  #[cfg(not(feature = "gstreamer_input"))]
  {
    let _ = path;
    Err(InputError::Unsupported("gstreamer_input"))
  }
}

/// 打开摄像头，`index` 为设备序号
pub fn open_camera(index: usize) -> Result<Box<dyn InputSource>, InputError> {
  #[cfg(feature = "v4l2_input")]
  {
    Ok(Box::new(V4l2Input::new(index)?))
  }
  #[cfg(not(feature = "v4l2_input"))]
  {
    let _ = index;
    Err(InputError::Unsupported("v4l2_input"))
  }
}
