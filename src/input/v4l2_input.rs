// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/input/v4l2_input.rs - V4L2 摄像头输入源
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

use std::pin::Pin;
use std::time::Instant;

use image::RgbImage;
use tracing::{info, warn};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::{InputError, InputSource, InputSourceType};
use crate::frame::Frame;

const DEFAULT_CAMERA_FPS: f64 = 30.0;
const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
  Yuyv,
  Mjpeg,
}

/// V4L2 摄像头输入源
///
/// v4l 的 Stream 需要引用 Device，用 Pin<Box<Device>> 固定设备地址，
/// 再创建引用它的 Stream。
pub struct V4l2Input {
  /// V4L2 设备（使用 Pin<Box> 固定内存位置）
  device: Pin<Box<Device>>,
  /// 捕获流（生命周期与 device 关联）
  stream: Option<Stream<'static>>,
  layout: PixelLayout,
  frame_index: u64,
  width: u32,
  height: u32,
  fps: f64,
  start_time: Instant,
}

impl V4l2Input {
  /// 打开 `/dev/video{index}`
  pub fn new(index: usize) -> Result<Self, InputError> {
    let device = Box::pin(
      Device::new(index).map_err(|e| InputError::Open(format!("无法打开摄像头 {}: {}", index, e)))?,
    );

    let mut format = device.format()?;
    format.width = CAPTURE_WIDTH;
    format.height = CAPTURE_HEIGHT;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;

    let layout = if format.fourcc == FourCC::new(b"YUYV") {
      PixelLayout::Yuyv
    } else if format.fourcc == FourCC::new(b"MJPG") {
      PixelLayout::Mjpeg
    } else {
      return Err(InputError::Open(format!(
        "摄像头不支持的像素格式: {}",
        format.fourcc
      )));
    };

    // 驱动未报告帧间隔时按 30 fps 处理
    let fps = match device.params() {
      Ok(params) if params.interval.numerator > 0 && params.interval.denominator > 0 => {
        params.interval.denominator as f64 / params.interval.numerator as f64
      }
      _ => DEFAULT_CAMERA_FPS,
    };

    let mut source = Self {
      device,
      stream: None,
      layout,
      frame_index: 0,
      width: format.width,
      height: format.height,
      fps,
      start_time: Instant::now(),
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上，不会移动；
    // stream 在 Drop 中先于 device 释放
    let device_ref: &Device = &source.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, 4)
        .map_err(|e| InputError::Open(format!("无法创建捕获流: {}", e)))?
    };
    source.stream = Some(stream);

    info!(
      "摄像头 {} 已打开: {}x{} {:?} @ {:.1} fps",
      index, source.width, source.height, layout, fps
    );
    Ok(source)
  }

  fn decode(&self, buffer: &[u8]) -> Result<RgbImage, InputError> {
    match self.layout {
      PixelLayout::Yuyv => {
        let rgb = yuyv_to_rgb(buffer, self.width, self.height);
        RgbImage::from_raw(self.width, self.height, rgb)
          .ok_or_else(|| InputError::Capture("无法创建 RGB 图像".to_string()))
      }
      PixelLayout::Mjpeg => image::load_from_memory_with_format(buffer, image::ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| InputError::Capture(format!("MJPEG 解码失败: {}", e))),
    }
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  let pixel = |y: f32, u: f32, v: f32| {
    [
      (y + 1.402 * v).clamp(0.0, 255.0) as u8,
      (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8,
      (y + 1.772 * u).clamp(0.0, 255.0) as u8,
    ]
  };

  for chunk in yuyv.chunks_exact(4) {
    let u = chunk[1] as f32 - 128.0;
    let v = chunk[3] as f32 - 128.0;
    rgb.extend_from_slice(&pixel(chunk[0] as f32, u, v));
    rgb.extend_from_slice(&pixel(chunk[2] as f32, u, v));
  }

  rgb
}

impl Drop for V4l2Input {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
  }
}

impl Iterator for V4l2Input {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    let stream = self.stream.as_mut()?;

    let buffer = match stream.next() {
      Ok((buffer, _meta)) => buffer.to_vec(),
      Err(e) => {
        warn!("摄像头读取失败: {}", e);
        return Some(Err(InputError::Capture(e.to_string())));
      }
    };

    self.frame_index += 1;
    let timestamp_ms = self.start_time.elapsed().as_millis() as u64;
    Some(
      self
        .decode(&buffer)
        .map(|image| Frame::new(image, self.frame_index, timestamp_ms)),
    )
  }
}

impl InputSource for V4l2Input {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Camera
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    Some(self.fps)
  }
}
