// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/model/postprocess.rs - YOLO 输出解码与 NMS
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

use std::cmp::Ordering;

use tracing::debug;

use super::{DetectItem, ModelError};

/// 解码参数
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
  /// 模型输入边长
  pub input_size: f32,
  /// 原图宽度
  pub frame_width: f32,
  /// 原图高度
  pub frame_height: f32,
  /// 低于该分数的框直接丢弃
  pub score_floor: f32,
  /// NMS IoU 阈值
  pub iou_threshold: f32,
}

impl DecodeParams {
  fn scale(&self) -> (f32, f32) {
    (
      self.frame_width / self.input_size,
      self.frame_height / self.input_size,
    )
  }

  fn to_frame(&self, x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> [f32; 4] {
    let (sx, sy) = self.scale();
    [
      (x_min * sx).clamp(0.0, self.frame_width),
      (y_min * sy).clamp(0.0, self.frame_height),
      (x_max * sx).clamp(0.0, self.frame_width),
      (y_max * sy).clamp(0.0, self.frame_height),
    ]
  }
}

fn class_name(names: &[String], class_id: u32) -> String {
  names
    .get(class_id as usize)
    .cloned()
    .unwrap_or_else(|| format!("class{}", class_id))
}

/// 解码输出张量
///
/// - `[1, N, 6]`：端到端头（YOLOv10），每行 `x1, y1, x2, y2, score, class`，N 不限
/// - `[1, 4 + C, N]`：密集头（YOLOv8 布局），每列 `cx, cy, w, h, C 个类别分数`，解码后做 NMS
///
/// 最后一维为 6 时总是按端到端头解码；密集头的锚点数远大于 6，不会与之混淆。
pub fn decode_output(
  shape: &[usize],
  data: &[f32],
  params: &DecodeParams,
  names: &[String],
) -> Result<Vec<DetectItem>, ModelError> {
  match *shape {
    [1, rows, 6] => decode_end_to_end(rows, data, params, names),
    [1, features, anchors] if features > 4 => {
      let items = decode_dense(features, anchors, data, params, names);
      Ok(nms(items, params.iou_threshold))
    }
    _ => Err(ModelError::UnsupportedOutput(shape.to_vec())),
  }
}

fn decode_end_to_end(
  rows: usize,
  data: &[f32],
  params: &DecodeParams,
  names: &[String],
) -> Result<Vec<DetectItem>, ModelError> {
  if data.len() < rows * 6 {
    return Err(ModelError::Inference(format!(
      "输出数据长度不足: 期望 {}, 实际 {}",
      rows * 6,
      data.len()
    )));
  }

  let items = data
    .chunks_exact(6)
    .take(rows)
    .filter(|row| row[4] >= params.score_floor)
    .map(|row| {
      let class_id = row[5].max(0.0) as u32;
      DetectItem {
        class_id,
        class_name: class_name(names, class_id),
        score: row[4],
        bbox: params.to_frame(row[0], row[1], row[2], row[3]),
      }
    })
    .collect::<Vec<_>>();
  debug!("端到端解码得到 {} 个候选框", items.len());
  Ok(items)
}

fn decode_dense(
  features: usize,
  anchors: usize,
  data: &[f32],
  params: &DecodeParams,
  names: &[String],
) -> Vec<DetectItem> {
  let value = |f: usize, i: usize| data.get(f * anchors + i).copied().unwrap_or(0.0);
  let mut items = Vec::new();

  for i in 0..anchors {
    let (mut best_class, mut best_score) = (0usize, f32::MIN);
    for c in 4..features {
      let score = value(c, i);
      if score > best_score {
        best_score = score;
        best_class = c - 4;
      }
    }
    if best_score < params.score_floor {
      continue;
    }

    let (cx, cy, w, h) = (value(0, i), value(1, i), value(2, i), value(3, i));
    let class_id = best_class as u32;
    items.push(DetectItem {
      class_id,
      class_name: class_name(names, class_id),
      score: best_score,
      bbox: params.to_frame(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
    });
  }

  debug!("密集解码得到 {} 个候选框", items.len());
  items
}

/// 按类别的非极大值抑制
pub fn nms(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  // 按置信度降序排序
  items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

  let mut kept: Vec<DetectItem> = Vec::new();
  for item in items {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == item.class_id && iou(&k.bbox, &item.bbox) >= iou_threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

/// 计算两个 xyxy 边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}
