// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::info;

use super::{OutputError, OutputWriter};

/// 保存单张图像，自动创建父目录，格式由扩展名决定
pub fn save_image(path: &Path, image: &RgbImage) -> Result<(), OutputError> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)?;
  }

  image.save(path)?;
  info!("保存图像到文件: {}", path.display());
  Ok(())
}

/// 图像文件输出，每次写入覆盖同一文件
pub struct SaveImageFileOutput {
  path: PathBuf,
  written: u64,
  closed: bool,
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      written: 0,
      closed: false,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl OutputWriter for SaveImageFileOutput {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), OutputError> {
    if self.closed {
      return Err(OutputError::Closed);
    }
    save_image(&self.path, image)?;
    self.written += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), OutputError> {
    self.closed = true;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn creates_missing_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out.png");
    let mut output = SaveImageFileOutput::new(&path);
    output.write_frame(&RgbImage::new(4, 4)).unwrap();
    output.finish().unwrap();
    assert!(path.is_file());
    assert!(matches!(
      output.write_frame(&RgbImage::new(4, 4)),
      Err(OutputError::Closed)
    ));
  }
}
