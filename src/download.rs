// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/download.rs - 模型权重下载
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
  fs::File,
  io::{self, BufWriter, Write},
  path::{Path, PathBuf},
  time::Duration,
};

use clap::ValueEnum;
use thiserror::Error;
use tracing::{info, warn};

pub const GITHUB_BASE_URL: &str = "https://github.com/ultralytics/assets/releases/download/v8.3.0";
pub const HF_BASE_URL: &str = "https://huggingface.co/datasets/Anshulgada/RT-PDS-Models/resolve/main";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// YOLOv10 规模
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelVariant {
  N,
  S,
  M,
  B,
  L,
  X,
}

impl ModelVariant {
  pub const ALL: [ModelVariant; 6] = [
    ModelVariant::N,
    ModelVariant::S,
    ModelVariant::M,
    ModelVariant::B,
    ModelVariant::L,
    ModelVariant::X,
  ];

  pub fn file_name(&self) -> String {
    let suffix = match self {
      ModelVariant::N => "n",
      ModelVariant::S => "s",
      ModelVariant::M => "m",
      ModelVariant::B => "b",
      ModelVariant::L => "l",
      ModelVariant::X => "x",
    };
    format!("yolov10{}.pt", suffix)
  }
}

#[derive(Error, Debug)]
pub enum DownloadError {
  #[error("I/O 错误: {0}")]
  Io(#[from] io::Error),
  #[error("{file} 下载失败（GitHub: {github}; Hugging Face: {hf}）")]
  AllSourcesFailed {
    file: String,
    github: String,
    hf: String,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
  AlreadyPresent,
  GitHub,
  HuggingFace,
}

pub struct ModelDownloader {
  output_dir: PathBuf,
  agent: ureq::Agent,
  github_base: String,
  hf_base: String,
}

impl ModelDownloader {
  pub fn new(output_dir: impl Into<PathBuf>) -> Self {
    Self {
      output_dir: output_dir.into(),
      agent: ureq::AgentBuilder::new().timeout(DOWNLOAD_TIMEOUT).build(),
      github_base: GITHUB_BASE_URL.to_string(),
      hf_base: HF_BASE_URL.to_string(),
    }
  }

  pub fn with_sources(mut self, github_base: impl Into<String>, hf_base: impl Into<String>) -> Self {
    self.github_base = github_base.into();
    self.hf_base = hf_base.into();
    self
  }

  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }

  /// 下载一个规模的权重，已存在则跳过；GitHub 失败时回退到 Hugging Face
  pub fn download(&self, variant: ModelVariant) -> Result<DownloadOutcome, DownloadError> {
    let file = variant.file_name();
    let target = self.output_dir.join(&file);
    if target.exists() {
      info!("{} 已存在于 {}，跳过下载", file, self.output_dir.display());
      return Ok(DownloadOutcome::AlreadyPresent);
    }
    std::fs::create_dir_all(&self.output_dir)?;

    info!("从 GitHub 下载 {}...", file);
    let github = match self.fetch(&format!("{}/{}", self.github_base, file), &target) {
      Ok(()) => return Ok(DownloadOutcome::GitHub),
      Err(e) => {
        warn!("GitHub 下载 {} 失败: {}", file, e);
        e
      }
    };

    info!("从 Hugging Face 下载 {}...", file);
    match self.fetch(&format!("{}/{}", self.hf_base, file), &target) {
      Ok(()) => Ok(DownloadOutcome::HuggingFace),
      Err(hf) => Err(DownloadError::AllSourcesFailed {
        file,
        github,
        hf,
      }),
    }
  }

  /// 逐个下载，单个失败不影响其余规模
  pub fn download_all(
    &self,
    variants: &[ModelVariant],
  ) -> Vec<(ModelVariant, Result<DownloadOutcome, DownloadError>)> {
    let variants = if variants.is_empty() {
      &ModelVariant::ALL[..]
    } else {
      variants
    };
    variants.iter().map(|v| (*v, self.download(*v))).collect()
  }

  /// 先写入 `.part` 文件，完成后重命名
  fn fetch(&self, url: &str, target: &Path) -> Result<(), String> {
    let partial = target.with_extension("pt.part");
    let result = (|| -> Result<u64, String> {
      let response = self.agent.get(url).call().map_err(|e| e.to_string())?;
      let mut reader = response.into_reader();
      let mut writer = BufWriter::new(File::create(&partial).map_err(|e| e.to_string())?);
      let bytes = io::copy(&mut reader, &mut writer).map_err(|e| e.to_string())?;
      writer.flush().map_err(|e| e.to_string())?;
      Ok(bytes)
    })();

    match result {
      Ok(bytes) => {
        std::fs::rename(&partial, target).map_err(|e| e.to_string())?;
        info!("已保存 {} ({} 字节)", target.display(), bytes);
        Ok(())
      }
      Err(e) => {
        let _ = std::fs::remove_file(&partial);
        Err(e)
      }
    }
  }
}

/// 将 PyTorch 权重导出为 ONNX 的命令
pub fn onnx_export_command(weights: &Path) -> String {
  format!("yolo export model={} format=onnx", weights.display())
}

/// 下载指定规模的权重到 `output_dir`，为空时下载全部
pub fn download_models(
  variants: &[ModelVariant],
  output_dir: &Path,
) -> Vec<(ModelVariant, Result<DownloadOutcome, DownloadError>)> {
  ModelDownloader::new(output_dir).download_all(variants)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn export_command_names_the_weights() {
    assert_eq!(
      onnx_export_command(Path::new("models/yolov10n.pt")),
      "yolo export model=models/yolov10n.pt format=onnx"
    );
  }

  #[test]
  fn variant_file_names() {
    assert_eq!(ModelVariant::N.file_name(), "yolov10n.pt");
    assert_eq!(ModelVariant::X.file_name(), "yolov10x.pt");
  }

  #[test]
  fn existing_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("yolov10s.pt"), b"weights").unwrap();
    let downloader = ModelDownloader::new(dir.path());
    assert_eq!(
      downloader.download(ModelVariant::S).unwrap(),
      DownloadOutcome::AlreadyPresent
    );
  }

  #[test]
  fn unreachable_sources_fail_without_leaving_partial_files() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = ModelDownloader::new(dir.path())
      .with_sources("http://127.0.0.1:9/gh", "http://127.0.0.1:9/hf");
    let results = downloader.download_all(&[ModelVariant::N]);
    assert_eq!(results.len(), 1);
    assert!(matches!(
      results[0].1,
      Err(DownloadError::AllSourcesFailed { .. })
    ));
    assert!(!dir.path().join("yolov10n.pt").exists());
    assert!(!dir.path().join("yolov10n.pt.part").exists());
  }
}
