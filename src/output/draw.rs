// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/output/draw.rs - 检测结果标注
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

use std::path::PathBuf;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::{debug, warn};

use crate::{
  frame::Frame,
  model::{DetectItem, DetectResult},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BANNER_FONT_SIZE: f32 = 36.0;
const BOX_THICKNESS: i32 = 2;

pub const POTHOLE_COLOR: [u8; 3] = [255, 0, 0]; // 红色
pub const OTHER_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

/// 字体查找环境变量
pub const FONT_ENV: &str = "KENGWA_FONT";

const SYSTEM_FONTS: [&str; 6] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

/// 判断类别名是否为坑洼（大小写不敏感，接受 `ph` 缩写）
pub fn is_pothole_class(class_name: &str) -> bool {
  let name = class_name.trim();
  name.eq_ignore_ascii_case("pothole") || name.eq_ignore_ascii_case("ph")
}

fn find_font() -> Option<FontArc> {
  let candidates = std::env::var_os(FONT_ENV)
    .map(PathBuf::from)
    .into_iter()
    .chain(SYSTEM_FONTS.iter().map(PathBuf::from));

  for path in candidates {
    let Ok(bytes) = std::fs::read(&path) else {
      continue;
    };
    match FontArc::try_from_vec(bytes) {
      Ok(font) => {
        debug!("使用字体: {}", path.display());
        return Some(font);
      }
      Err(e) => warn!("无法解析字体 {}: {}", path.display(), e),
    }
  }

  warn!("未找到可用字体，标注将不包含文字");
  None
}

/// 标注器
///
/// 在帧上绘制检测框与标签，并判断是否存在达到阈值的坑洼。
pub struct Annotator {
  font: Option<FontArc>,
  font_size: f32,
}

impl Default for Annotator {
  fn default() -> Self {
    Self {
      font: find_font(),
      font_size: LABEL_FONT_SIZE,
    }
  }
}

impl Annotator {
  pub fn with_font(font: Option<FontArc>) -> Self {
    Self {
      font,
      font_size: LABEL_FONT_SIZE,
    }
  }

  /// 标注一帧，返回标注后的帧以及是否检测到坑洼
  ///
  /// 空结果不修改任何像素。
  pub fn annotate(&self, mut frame: Frame, batch: &DetectResult, threshold: f32) -> (Frame, bool) {
    let mut pothole_detected = false;

    for item in batch.iter() {
      let is_pothole = is_pothole_class(&item.class_name) && item.score >= threshold;
      pothole_detected |= is_pothole;
      let color = if is_pothole {
        POTHOLE_COLOR
      } else {
        OTHER_COLOR
      };
      self.draw_bbox_with_label(&mut frame.image, item, color);
    }

    (frame, pothole_detected)
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, item: &DetectItem, color: [u8; 3]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (item.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (item.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (item.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (item.bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 边框加粗
    for t in 0..BOX_THICKNESS {
      let bw = x_max - x_min - 2 * t;
      let bh = y_max - y_min - 2 * t;
      if bw <= 0 || bh <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(bw as u32 + 1, bh as u32 + 1);
      draw_hollow_rect_mut(image, rect, Rgb(color));
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", item.class_name, item.score);
    let scale = PxScale::from(self.font_size);
    let (text_w, text_h) = text_size(scale, font, &label);
    let label_h = text_h as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;

    // 标签放在边框上方，空间不足时贴顶
    let label_x = x_min;
    let label_y = (y_min - label_h).max(0);
    let label_w = (text_w as i32).min(w - label_x);
    if label_w <= 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_w as u32, label_h as u32);
    draw_filled_rect_mut(image, rect, Rgb(color));
    draw_text_mut(
      image,
      Rgb(TEXT_COLOR),
      label_x,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      scale,
      font,
      &label,
    );
  }

  /// 摄像头模式下的 "POTHOLE DETECTED!" 提示
  pub fn draw_alert_banner(&self, image: &mut RgbImage) {
    const BANNER: &str = "POTHOLE DETECTED!";
    let (x, y) = (50, 50);

    match &self.font {
      Some(font) => {
        let scale = PxScale::from(BANNER_FONT_SIZE);
        draw_text_mut(image, Rgb(POTHOLE_COLOR), x, y, scale, font, BANNER);
      }
      None => {
        if image.width() > 60 && image.height() > 60 {
          let bw = (image.width() - 50).min(300);
          let rect = Rect::at(x, y).of_size(bw, 10);
          draw_filled_rect_mut(image, rect, Rgb(POTHOLE_COLOR));
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn item(name: &str, score: f32) -> DetectItem {
    DetectItem {
      class_id: 0,
      class_name: name.to_string(),
      score,
      bbox: [10.0, 10.0, 40.0, 40.0],
    }
  }

  fn blank() -> Frame {
    Frame::new(RgbImage::from_pixel(64, 64, Rgb([7, 7, 7])), 1, 0)
  }

  #[test]
  fn empty_batch_keeps_pixels() {
    let annotator = Annotator::with_font(None);
    let original = blank();
    let (annotated, detected) = annotator.annotate(original.clone(), &DetectResult::empty(), 0.5);
    assert!(!detected);
    assert_eq!(annotated.image, original.image);
  }

  #[test]
  fn threshold_is_inclusive() {
    let annotator = Annotator::with_font(None);
    let batch = DetectResult::from(vec![item("pothole", 0.5)]);
    let (frame, detected) = annotator.annotate(blank(), &batch, 0.5);
    assert!(detected);
    assert_eq!(frame.image.get_pixel(10, 10), &Rgb(POTHOLE_COLOR));
  }

  #[test]
  fn abbreviation_matches_case_insensitively() {
    assert!(is_pothole_class("PH"));
    assert!(is_pothole_class("Pothole"));
    assert!(!is_pothole_class("crack"));
  }

  #[test]
  fn weak_or_other_class_is_green() {
    let annotator = Annotator::with_font(None);
    let batch = DetectResult::from(vec![item("pothole", 0.3), item("crack", 0.99)]);
    let (frame, detected) = annotator.annotate(blank(), &batch, 0.5);
    assert!(!detected);
    assert_eq!(frame.image.get_pixel(10, 10), &Rgb(OTHER_COLOR));
  }
}
