// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/alert/report.rs - 告警内容
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
  time::Duration,
};

use crate::gps::GeoCoordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
  Image,
  Video,
}

impl MediaKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      MediaKind::Image => "image",
      MediaKind::Video => "video",
    }
  }

  fn title(&self) -> &'static str {
    match self {
      MediaKind::Image => "Image",
      MediaKind::Video => "Video",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationDetails {
  pub coordinate: GeoCoordinate,
  pub address: String,
  pub maps_link: String,
}

#[derive(Debug, Clone)]
pub struct PotholeReport<'a> {
  pub kind: MediaKind,
  pub input_path: &'a Path,
  pub output_path: &'a Path,
  pub inference_time: Duration,
  pub video_duration: Option<f64>,
  pub location: Option<LocationDetails>,
}

impl PotholeReport<'_> {
  /// 输入文件总是附上，输出文件存在时附上
  pub fn attachments(&self) -> Vec<PathBuf> {
    let mut files = vec![self.input_path.to_path_buf()];
    if self.output_path.is_file() {
      files.push(self.output_path.to_path_buf());
    }
    files
  }
}

fn file_name(path: &Path) -> String {
  path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.display().to_string())
}

/// 生成告警主题与正文
pub fn compose_pothole_alert(report: &PotholeReport<'_>) -> (String, String) {
  let kind = report.kind.as_str();
  let subject = format!("🚨 Pothole Detected in {}!", report.kind.title());

  let mut lines = vec![
    format!(
      "A pothole has been detected in the {}: {}",
      kind,
      file_name(report.input_path)
    ),
    String::new(),
    format!("📁 Output {}: {}", kind, file_name(report.output_path)),
    format!(
      "⏱️ Inference time: {:.2} seconds",
      report.inference_time.as_secs_f64()
    ),
  ];

  if report.kind == MediaKind::Video
    && let Some(duration) = report.video_duration.filter(|d| *d > 0.0)
  {
    lines.push(format!("🎬 Video duration: {:.2} seconds", duration));
  }

  match &report.location {
    Some(loc) => lines.extend([
      String::new(),
      "📍 Location Details:".to_string(),
      format!("   Latitude: {:.6}", loc.coordinate.latitude),
      format!("   Longitude: {:.6}", loc.coordinate.longitude),
      format!("   Address: {}", loc.address),
      format!("   🗺️ Google Maps: {}", loc.maps_link),
    ]),
    None => lines.extend([
      String::new(),
      format!("⚠️ No GPS data available in the {} file.", kind),
    ]),
  }

  (subject, lines.join("\n"))
}
