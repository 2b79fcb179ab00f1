// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/gps.rs - GPS 元数据提取
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

//! 从图片 EXIF 或视频容器标签中读取拍摄位置。
//!
//! 所有读取都是尽力而为：任何失败都只返回 `None`。

use std::{fs::File, io::BufReader, path::Path, time::Duration};

use exif::{In, Reader, Tag, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ffmpeg::{check_and_install_ffmpeg, run_with_timeout, tool_available};

const FFPROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// 视频容器中可能携带位置的标签
const LOCATION_TAGS: [&str; 3] = [
  "location",
  "location-eng",
  "com.apple.quicktime.location.ISO6709",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
  pub latitude: f64,
  pub longitude: f64,
}

impl GeoCoordinate {
  pub fn new(latitude: f64, longitude: f64) -> Self {
    Self {
      latitude,
      longitude,
    }
  }
}

/// 度分秒转十进制度，`S`/`W` 取负
pub fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, reference: &str) -> f64 {
  let value = degrees + minutes / 60.0 + seconds / 3600.0;
  match reference.trim().to_ascii_uppercase().as_str() {
    "S" | "W" => -value,
    _ => value,
  }
}

#[derive(Debug, Clone, Default)]
pub struct GpsExtractor {
  auto_install: bool,
}

impl GpsExtractor {
  pub fn new() -> Self {
    Self::default()
  }

  /// 缺少 ffprobe 时是否尝试自动安装 FFmpeg
  pub fn with_auto_install(mut self, auto_install: bool) -> Self {
    self.auto_install = auto_install;
    self
  }

  pub fn from_image(&self, path: &Path) -> Option<GeoCoordinate> {
    let file = File::open(path)
      .map_err(|e| debug!("无法打开图片 {}: {}", path.display(), e))
      .ok()?;
    let exif = Reader::new()
      .read_from_container(&mut BufReader::new(file))
      .map_err(|e| debug!("图片没有可读的 EXIF: {}", e))
      .ok()?;

    let dms = |tag: Tag| -> Option<[f64; 3]> {
      match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Rational(v) if v.len() >= 3 => {
          let mut out = [0.0; 3];
          for (slot, r) in out.iter_mut().zip(v.iter()) {
            if r.denom == 0 {
              return None;
            }
            *slot = r.num as f64 / r.denom as f64;
          }
          Some(out)
        }
        _ => None,
      }
    };
    let reference = |tag: Tag, default: &str| -> String {
      exif
        .get_field(tag, In::PRIMARY)
        .and_then(|f| match &f.value {
          Value::Ascii(v) => v.first().map(|s| String::from_utf8_lossy(s).into_owned()),
          _ => None,
        })
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
    };

    let [lat_d, lat_m, lat_s] = dms(Tag::GPSLatitude)?;
    let [lon_d, lon_m, lon_s] = dms(Tag::GPSLongitude)?;
    let lat_ref = reference(Tag::GPSLatitudeRef, "N");
    let lon_ref = reference(Tag::GPSLongitudeRef, "E");

    let coord = GeoCoordinate::new(
      dms_to_decimal(lat_d, lat_m, lat_s, &lat_ref),
      dms_to_decimal(lon_d, lon_m, lon_s, &lon_ref),
    );
    debug!("图片 GPS: {:?}", coord);
    Some(coord)
  }

  pub fn from_video(&self, path: &Path) -> Option<GeoCoordinate> {
    if !self.ffprobe_ready() {
      warn!("ffprobe 不可用，跳过视频 GPS 提取");
      return None;
    }

    let path_str = path.to_str()?;
    let output = run_with_timeout(
      "ffprobe",
      &["-v", "error", "-show_entries", "format_tags", "-of", "json", path_str],
      FFPROBE_TIMEOUT,
    )
    .map_err(|e| warn!("ffprobe 失败: {}", e))
    .ok()?;

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    let tags = json.get("format")?.get("tags")?;
    let coord = LOCATION_TAGS
      .iter()
      .find_map(|key| tags.get(*key)?.as_str().and_then(parse_location));
    debug!("视频 GPS: {:?}", coord);
    coord
  }

  fn ffprobe_ready(&self) -> bool {
    if tool_available("ffprobe") {
      return true;
    }
    self.auto_install && check_and_install_ffmpeg() && tool_available("ffprobe")
  }
}

/// 解析位置标签，支持 `"lat, lon"` 与 ISO 6709（`+40.4461-079.9822/`）
pub fn parse_location(raw: &str) -> Option<GeoCoordinate> {
  let raw = raw.trim();
  if let Some((lat, lon)) = raw.split_once(',') {
    let lat = lat.trim().parse::<f64>().ok()?;
    let lon = lon.trim().parse::<f64>().ok()?;
    return Some(GeoCoordinate::new(lat, lon));
  }

  let body = raw.trim_end_matches('/');
  let starts = body
    .char_indices()
    .filter(|(_, c)| *c == '+' || *c == '-')
    .map(|(i, _)| i)
    .collect::<Vec<_>>();
  if starts.len() < 2 || starts[0] != 0 {
    return None;
  }
  let end = starts.get(2).copied().unwrap_or(body.len());
  let lat = body[starts[0]..starts[1]].parse::<f64>().ok()?;
  let lon = body[starts[1]..end].parse::<f64>().ok()?;
  Some(GeoCoordinate::new(lat, lon))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dms_north_and_south() {
    let north = dms_to_decimal(40.0, 26.0, 46.0, "N");
    assert!((north - 40.446111).abs() < 1e-5);
    assert!((dms_to_decimal(40.0, 26.0, 46.0, "S") + 40.446111).abs() < 1e-5);
    assert!(dms_to_decimal(79.0, 58.0, 56.0, "w") < 0.0);
  }

  #[test]
  fn parses_comma_and_iso6709_locations() {
    assert_eq!(
      parse_location("40.4461, -79.9822"),
      Some(GeoCoordinate::new(40.4461, -79.9822))
    );
    assert_eq!(
      parse_location("+40.4461-079.9822+010.000/"),
      Some(GeoCoordinate::new(40.4461, -79.9822))
    );
    assert_eq!(parse_location("somewhere"), None);
  }

  #[test]
  fn image_without_exif_has_no_gps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.png");
    image::RgbImage::new(4, 4).save(&path).unwrap();
    assert_eq!(GpsExtractor::new().from_image(&path), None);
    assert_eq!(GpsExtractor::new().from_image(&dir.path().join("missing.jpg")), None);
  }
}
