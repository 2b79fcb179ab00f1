// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/input/image_source.rs - 图片输入源
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

use image::{ImageReader, RgbImage};

use super::{InputError, InputSource, InputSourceType};
use crate::frame::Frame;

/// 图片输入源，只产生一帧
pub struct ImageSource {
  image: Option<RgbImage>,
  width: u32,
  height: u32,
}

impl ImageSource {
  pub fn new(path: &Path) -> Result<Self, InputError> {
    let decode = |source| InputError::Decode {
      path: path.display().to_string(),
      source,
    };
    let img = ImageReader::open(path)?
      .with_guessed_format()?
      .decode()
      .map_err(decode)?
      .to_rgb8();

    let (width, height) = img.dimensions();
    Ok(Self {
      image: Some(img),
      width,
      height,
    })
  }
}

impl Iterator for ImageSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().map(|image| Ok(Frame::from(image)))
  }
}

impl InputSource for ImageSource {
  fn source_type(&self) -> InputSourceType {
    InputSourceType::Image
  }

  fn width(&self) -> u32 {
    self.width
  }

  fn height(&self) -> u32 {
    self.height
  }

  fn fps(&self) -> Option<f64> {
    None
  }

  fn frame_count(&self) -> Option<u64> {
    Some(1)
  }
}
