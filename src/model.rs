// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/model.rs - 模型
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
use thiserror::Error;

/// 未提供标签时使用的默认类别
pub const DEFAULT_LABELS: [&str; 1] = ["pothole"];

/// 检测模型
///
/// 推理线程只读访问模型，因此要求 `Send + Sync`，通过 `Arc` 共享。
pub trait Model: Send + Sync {
  fn infer(&self, image: &RgbImage) -> Result<DetectResult, ModelError>;
  fn class_names(&self) -> &[String];
  fn device(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub class_name: String,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &DetectItem> {
    self.items.iter()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("模型加载错误: {0}")]
  Load(String),
  #[error("标签文件读取错误: {0}")]
  Labels(#[from] std::io::Error),
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("不支持的输出张量形状: {0:?}")]
  UnsupportedOutput(Vec<usize>),
}

/// 从文本文件读取标签，每行一个类别名，忽略空行
pub fn load_labels(path: &Path) -> Result<Vec<String>, ModelError> {
  let text = std::fs::read_to_string(path)?;
  Ok(
    text
      .lines()
      .map(str::trim)
      .filter(|l| !l.is_empty())
      .map(String::from)
      .collect(),
  )
}

/// 解析导出器写入的 `names` 元数据，形如 `{0: 'pothole', 1: 'crack'}`
///
/// 类别名按引号切分，名称内可以包含逗号与冒号；遇到无法识别的片段即停止。
pub fn parse_names_metadata(raw: &str) -> Vec<String> {
  let body = raw.trim().trim_start_matches('{').trim_end_matches('}');
  let mut entries: Vec<(u32, String)> = Vec::new();
  let mut rest = body;

  while let Some((id, after)) = rest.split_once(':') {
    let Ok(id) = id.trim().trim_start_matches(',').trim().parse::<u32>() else {
      break;
    };
    let after = after.trim_start();
    let Some(quote) = after.chars().next().filter(|c| *c == '\'' || *c == '"') else {
      break;
    };
    let Some(end) = after[1..].find(quote) else {
      break;
    };
    entries.push((id, after[1..1 + end].to_string()));
    rest = &after[end + 2..];
  }

  entries.sort_by_key(|(id, _)| *id);
  entries.into_iter().map(|(_, name)| name).collect()
}

mod postprocess;
pub use self::postprocess::{DecodeParams, decode_output, iou, nms};

#[cfg(feature = "model_yolo")]
mod yolo;
#[cfg(feature = "model_yolo")]
pub use self::yolo::{YoloBuilder, YoloModel};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_exporter_names() {
    let names = parse_names_metadata("{1: 'crack', 0: 'pothole'}");
    assert_eq!(names, vec!["pothole".to_string(), "crack".to_string()]);
  }

  #[test]
  fn names_may_contain_commas() {
    let names = parse_names_metadata(r#"{0: 'pothole', 1: 'crack, wide', 2: "kerb's edge"}"#);
    assert_eq!(names, vec!["pothole", "crack, wide", "kerb's edge"]);
  }

  #[test]
  fn labels_file_skips_blank_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "pothole\n\n  ph \n").unwrap();
    assert_eq!(load_labels(&path).unwrap(), vec!["pothole", "ph"]);
  }
}
