// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/args.rs - 命令行参数
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

use clap::{Args as ClapArgs, Parser, Subcommand};
use kengwa::download::ModelVariant;

/// Kengwa 坑洼检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  pub command: Command,

  /// Gmail OAuth 客户端凭据文件
  #[arg(
    long,
    global = true,
    env = "KENGWA_CREDENTIALS",
    default_value = "credentials.json",
    value_name = "FILE"
  )]
  pub credentials: PathBuf,

  /// OAuth 令牌缓存文件
  #[arg(
    long,
    global = true,
    env = "KENGWA_TOKEN",
    default_value = "token.json",
    value_name = "FILE"
  )]
  pub token: PathBuf,
}

/// 模型相关参数
#[derive(ClapArgs, Debug, Clone)]
pub struct ModelArgs {
  /// ONNX 模型文件路径（.pt 权重需先导出）
  #[arg(long, value_name = "FILE")]
  pub model: PathBuf,

  /// 类别名称文件，每行一个
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
}

/// 告警相关参数
#[derive(ClapArgs, Debug, Clone)]
pub struct AlertArgs {
  /// 发件人邮箱
  #[arg(long, value_name = "EMAIL")]
  pub sender_email: Option<String>,

  /// 收件人列表，以空格分隔
  #[arg(long, value_name = "EMAILS")]
  pub recipients: Option<String>,

  /// 检测到坑洼时发送邮件告警
  #[arg(long)]
  pub enable_alerts: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// 检测单张图片
  Image {
    #[command(flatten)]
    model: ModelArgs,

    /// 输入图片
    #[arg(long, value_name = "FILE")]
    input: PathBuf,

    /// 标注结果输出路径
    #[arg(long, value_name = "FILE")]
    output: PathBuf,

    /// 置信度阈值 (0.0 - 1.0)
    #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
    confidence: f32,

    #[command(flatten)]
    alert: AlertArgs,
  },
  /// 检测视频文件
  Video {
    #[command(flatten)]
    model: ModelArgs,

    /// 输入视频
    #[arg(long, value_name = "FILE")]
    input: PathBuf,

    /// 标注视频输出路径
    #[arg(long, value_name = "FILE")]
    output: PathBuf,

    /// 每次推理之间跳过的帧数
    #[arg(long, default_value = "2", value_name = "N")]
    frame_skip: u32,

    /// 置信度阈值 (0.0 - 1.0)
    #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
    confidence: f32,

    #[command(flatten)]
    alert: AlertArgs,
  },
  /// 摄像头实时检测
  Webcam {
    #[command(flatten)]
    model: ModelArgs,

    /// 录像输出路径
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// 置信度阈值 (0.0 - 1.0)
    #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
    confidence: f32,

    /// 每次推理之间跳过的帧数
    #[arg(long, default_value = "2", value_name = "N")]
    frame_skip: u32,

    /// 摄像头序号
    #[arg(long, default_value = "0", value_name = "INDEX")]
    camera: usize,

    /// 不打开预览窗口
    #[arg(long)]
    no_display: bool,
  },
  /// 完成 Gmail 授权并保存令牌
  Setup,
  /// 下载 YOLOv10 PyTorch 权重（使用前需导出为 ONNX）
  Download {
    /// 要下载的规模，缺省时全部下载
    #[arg(long, value_enum, num_args = 1.., value_name = "VARIANT")]
    model_download: Vec<ModelVariant>,

    /// 保存目录
    #[arg(long, default_value = "models", value_name = "DIR")]
    output_dir: PathBuf,
  },
  /// 检查模型并可选地跑一张测试图片
  Test {
    #[command(flatten)]
    model: ModelArgs,

    /// 测试图片
    #[arg(long, value_name = "FILE")]
    test_image: Option<PathBuf>,
  },
}

#[cfg(test)]
mod tests {
  use clap::CommandFactory;

  use super::*;

  #[test]
  fn cli_is_consistent() {
    Args::command().debug_assert();
  }

  #[test]
  fn video_defaults() {
    let args = Args::try_parse_from([
      "kengwa", "video", "--model", "m.onnx", "--input", "in.mp4", "--output", "out.mp4",
    ])
    .unwrap();
    match args.command {
      Command::Video {
        frame_skip,
        confidence,
        alert,
        ..
      } => {
        assert_eq!(frame_skip, 2);
        assert_eq!(confidence, 0.5);
        assert!(!alert.enable_alerts);
      }
      other => panic!("unexpected command: {:?}", other),
    }
  }

  #[test]
  fn download_accepts_several_variants() {
    let args = Args::try_parse_from(["kengwa", "download", "--model-download", "n", "s"]).unwrap();
    match args.command {
      Command::Download {
        model_download,
        output_dir,
      } => {
        assert_eq!(model_download, vec![ModelVariant::N, ModelVariant::S]);
        assert_eq!(output_dir, PathBuf::from("models"));
      }
      other => panic!("unexpected command: {:?}", other),
    }
  }

  #[test]
  fn global_credentials_after_subcommand() {
    let args = Args::try_parse_from(["kengwa", "setup", "--credentials", "secret.json"]).unwrap();
    assert_eq!(args.credentials, PathBuf::from("secret.json"));
    assert!(matches!(args.command, Command::Setup));
  }
}
