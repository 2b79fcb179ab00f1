// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/model/yolo.rs - ONNX YOLO 检测模型
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

use image::{RgbImage, imageops::FilterType};
use tracing::{debug, info, warn};
use tract_onnx::prelude::*;

use crate::download::onnx_export_command;

use super::{
  DEFAULT_LABELS, DecodeParams, DetectResult, Model, ModelError, decode_output, load_labels,
  parse_names_metadata,
};

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_SCORE_FLOOR: f32 = 0.25;
const YOLO_IOU_THRESHOLD: f32 = 0.45;

pub struct YoloModel {
  plan: TypedRunnableModel<TypedModel>,
  input_size: u32,
  score_floor: f32,
  iou_threshold: f32,
  class_names: Vec<String>,
}

pub struct YoloBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  input_size: u32,
  score_floor: f32,
  iou_threshold: f32,
}

impl YoloBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      input_size: YOLO_INPUT_SIZE,
      score_floor: YOLO_SCORE_FLOOR,
      iou_threshold: YOLO_IOU_THRESHOLD,
    }
  }

  pub fn with_labels(mut self, labels_path: Option<PathBuf>) -> Self {
    self.labels_path = labels_path;
    self
  }

  pub fn with_input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn with_score_floor(mut self, score_floor: f32) -> Self {
    self.score_floor = score_floor;
    self
  }

  pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  pub fn build(self) -> Result<YoloModel, ModelError> {
    let extension = self
      .model_path
      .extension()
      .and_then(|e| e.to_str())
      .map(str::to_ascii_lowercase);
    if matches!(extension.as_deref(), Some("pt" | "pth")) {
      return Err(ModelError::Load(format!(
        "需要 ONNX 格式的模型，{} 是 PyTorch 权重，请先导出: {}",
        self.model_path.display(),
        onnx_export_command(&self.model_path)
      )));
    }
    if !self.model_path.is_file() {
      return Err(ModelError::NotFound(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let load_err = |e: TractError| ModelError::Load(format!("{:#}", e));

    let onnx = tract_onnx::onnx();
    let proto = onnx.proto_model_for_path(&self.model_path).map_err(load_err)?;

    let embedded = proto
      .metadata_props
      .iter()
      .find(|p| p.key == "names")
      .map(|p| parse_names_metadata(&p.value))
      .filter(|names| !names.is_empty());

    let class_names = match (&self.labels_path, embedded) {
      (Some(path), _) => load_labels(path)?,
      (None, Some(names)) => names,
      (None, None) => {
        warn!("模型未携带类别元数据，使用默认类别");
        DEFAULT_LABELS.iter().map(|s| s.to_string()).collect()
      }
    };
    debug!("模型类别: {:?}", class_names);

    let size = self.input_size as usize;
    let plan = onnx
      .model_for_proto_model(&proto)
      .and_then(|m| {
        m.with_input_fact(
          0,
          InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
        )
      })
      .and_then(|m| m.into_optimized())
      .and_then(|m| m.into_runnable())
      .map_err(load_err)?;
    info!("模型加载完成");

    Ok(YoloModel {
      plan,
      input_size: self.input_size,
      score_floor: self.score_floor,
      iou_threshold: self.iou_threshold,
      class_names,
    })
  }
}

impl YoloModel {
  fn preprocess(&self, image: &RgbImage) -> Tensor {
    let size = self.input_size;
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let side = size as usize;
    tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
      resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
    .into()
  }
}

impl Model for YoloModel {
  fn infer(&self, image: &RgbImage) -> Result<DetectResult, ModelError> {
    let input = self.preprocess(image);
    let outputs = self
      .plan
      .run(tvec!(input.into()))
      .map_err(|e| ModelError::Inference(format!("{:#}", e)))?;

    let output = outputs
      .first()
      .ok_or_else(|| ModelError::Inference("模型没有输出".to_string()))?;
    let view = output
      .to_array_view::<f32>()
      .map_err(|e| ModelError::Inference(format!("{:#}", e)))?;
    let shape = view.shape().to_vec();
    let data = view.iter().copied().collect::<Vec<f32>>();

    let params = DecodeParams {
      input_size: self.input_size as f32,
      frame_width: image.width() as f32,
      frame_height: image.height() as f32,
      score_floor: self.score_floor,
      iou_threshold: self.iou_threshold,
    };
    let items = decode_output(&shape, &data, &params, &self.class_names)?;
    Ok(DetectResult::from(items))
  }

  fn class_names(&self) -> &[String] {
    &self.class_names
  }

  fn device(&self) -> &str {
    "cpu"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_overrides_defaults() {
    let builder = YoloBuilder::new("m.onnx")
      .with_labels(Some(PathBuf::from("labels.txt")))
      .with_input_size(320)
      .with_score_floor(0.1)
      .with_iou_threshold(0.6);
    assert_eq!(builder.input_size, 320);
    assert_eq!(builder.score_floor, 0.1);
    assert_eq!(builder.iou_threshold, 0.6);
    assert_eq!(builder.labels_path, Some(PathBuf::from("labels.txt")));
  }

  #[test]
  fn pytorch_weights_are_rejected_with_export_hint() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("yolov10n.pt");
    std::fs::write(&weights, b"PK\x03\x04").unwrap();

    match YoloBuilder::new(&weights).build() {
      Err(ModelError::Load(message)) => {
        assert!(message.contains("ONNX"));
        assert!(message.contains("format=onnx"));
      }
      Err(other) => panic!("unexpected error: {}", other),
      Ok(_) => panic!("PyTorch weights must not load"),
    }
  }

  #[test]
  fn missing_model_is_not_found() {
    assert!(matches!(
      YoloBuilder::new("/definitely/not/here.onnx").build(),
      Err(ModelError::NotFound(_))
    ));
  }
}
