// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use args::{AlertArgs, Args, Command, ModelArgs};
use kengwa::{
  alert::{AlertContext, AlertDispatcher, GmailService, parse_recipients},
  download::{DownloadOutcome, download_models, onnx_export_command},
  gps::GpsExtractor,
  location::LocationService,
  model::Model,
  task::{DetectorConfig, PipelineResult, PotholeDetector},
};

#[cfg(feature = "model_yolo")]
fn load_model(args: &ModelArgs) -> Result<Arc<dyn Model>> {
  let model = kengwa::model::YoloBuilder::new(&args.model)
    .with_labels(args.labels.clone())
    .build()
    .with_context(|| format!("无法加载模型 {}", args.model.display()))?;
  Ok(Arc::new(model))
}

#[cfg(not(feature = "model_yolo"))]
fn load_model(_args: &ModelArgs) -> Result<Arc<dyn Model>> {
  bail!("未启用 model_yolo 功能，无法加载模型")
}

fn build_alerts(args: &Args, alert: &AlertArgs) -> Result<Option<AlertContext>> {
  if !alert.enable_alerts {
    return Ok(None);
  }

  let Some(sender) = alert.sender_email.as_deref().filter(|s| !s.is_empty()) else {
    bail!("启用告警时必须提供 --sender-email");
  };
  let recipients = alert
    .recipients
    .as_deref()
    .map(parse_recipients)
    .unwrap_or_default();
  if recipients.is_empty() {
    bail!("启用告警时必须提供 --recipients");
  }

  let gmail = GmailService::new(&args.credentials, &args.token);
  gmail.authenticate().context("Gmail 认证失败")?;
  info!("告警已启用，{} 位收件人", recipients.len());

  Ok(Some(
    AlertContext::new(AlertDispatcher::new(gmail), sender, recipients)
      .with_gps(GpsExtractor::new().with_auto_install(true)),
  ))
}

fn detector(model: &ModelArgs, confidence: f32, alerts: Option<AlertContext>) -> Result<PotholeDetector> {
  let config = DetectorConfig::default().with_confidence(confidence);
  config.validate()?;
  let detector = PotholeDetector::new(load_model(model)?, config);
  Ok(match alerts {
    Some(alerts) => detector.with_alerts(alerts),
    None => detector,
  })
}

fn print_result(title: &str, result: &PipelineResult) {
  println!();
  println!("{}", title);
  println!("==================");
  println!("输出文件: {}", result.output_path.display());
  println!("检测到坑洼: {}", if result.pothole_detected { "是" } else { "否" });
  println!("处理耗时: {:.2?}", result.inference_time);
  if let Some(duration) = result.video_duration {
    println!("视频时长: {:.2} 秒", duration);
  }
  if let Some(stats) = &result.stats {
    println!(
      "读取 {} 帧，采样 {} 帧，推理 {} 帧，写出 {} 帧，繁忙丢弃 {} 帧",
      stats.frames_read,
      stats.frames_sampled,
      stats.frames_inferred,
      stats.frames_written,
      stats.frames_dropped_busy
    );
  }
  match result.alert_sent {
    Some(true) => println!("告警邮件: 已发送"),
    Some(false) => println!("告警邮件: 发送失败"),
    None => {}
  }
}

fn run_test(model_args: &ModelArgs, test_image: Option<&Path>) -> Result<()> {
  let model = load_model(model_args)?;
  println!("模型: {}", model_args.model.display());
  println!("设备: {}", model.device());
  println!("类别: {}", model.class_names().join(", "));

  let Some(image) = test_image else {
    return Ok(());
  };
  if !image.exists() {
    bail!("测试图片不存在: {}", image.display());
  }

  let output = format!("test_output_{}.jpg", chrono::Utc::now().timestamp());
  let detector = PotholeDetector::new(model, DetectorConfig::default());
  let result = detector.process_image(image, Path::new(&output))?;
  print_result("测试结果", &result);

  match GpsExtractor::new().from_image(image) {
    Some(coordinate) => {
      let location = LocationService::new();
      println!(
        "GPS: {:.6}, {:.6}",
        coordinate.latitude, coordinate.longitude
      );
      println!(
        "地址: {}",
        location.get_address(coordinate.latitude, coordinate.longitude)
      );
      println!(
        "地图: {}",
        location.get_maps_link(coordinate.latitude, coordinate.longitude)
      );
    }
    None => println!("GPS: 无"),
  }
  Ok(())
}

fn run_setup(args: &Args) -> Result<()> {
  if !args.credentials.exists() {
    bail!(
      "未找到客户端凭据文件 {}，请先从 Google Cloud Console 下载",
      args.credentials.display()
    );
  }
  let gmail = GmailService::new(&args.credentials, &args.token);
  gmail.authenticate().context("Gmail 授权失败")?;
  println!("授权完成，令牌已保存到 {}", args.token.display());
  Ok(())
}

fn run_download(variants: &[kengwa::download::ModelVariant], output_dir: &Path) -> Result<()> {
  let mut failed = 0;
  let mut ready = Vec::new();
  for (variant, outcome) in download_models(variants, output_dir) {
    let file = variant.file_name();
    if outcome.is_ok() {
      ready.push(output_dir.join(&file));
    }
    match outcome {
      Ok(DownloadOutcome::AlreadyPresent) => println!("{}: 已存在", file),
      Ok(DownloadOutcome::GitHub) => println!("{}: 已从 GitHub 下载", file),
      Ok(DownloadOutcome::HuggingFace) => println!("{}: 已从 Hugging Face 下载", file),
      Err(e) => {
        warn!("{}", e);
        println!("{}: 下载失败", file);
        failed += 1;
      }
    }
  }
  if !ready.is_empty() {
    println!();
    println!("下载的是 PyTorch 权重，检测命令需要 ONNX 模型，请先导出:");
    for weights in &ready {
      println!("  {}", onnx_export_command(weights));
    }
  }
  if failed > 0 {
    bail!("{} 个模型下载失败", failed);
  }
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  match &args.command {
    Command::Image {
      model,
      input,
      output,
      confidence,
      alert,
    } => {
      let alerts = build_alerts(&args, alert)?;
      let detector = detector(model, *confidence, alerts)?;
      let result = detector.process_image(input, output)?;
      print_result("图片检测结果", &result);
    }
    Command::Video {
      model,
      input,
      output,
      frame_skip,
      confidence,
      alert,
    } => {
      let alerts = build_alerts(&args, alert)?;
      let detector = detector(model, *confidence, alerts)?;
      let result = detector.process_video(input, output, *frame_skip)?;
      print_result("视频检测结果", &result);
    }
    Command::Webcam {
      model,
      output,
      confidence,
      frame_skip,
      camera,
      no_display,
    } => {
      let detector = detector(model, *confidence, None)?;
      let summary =
        detector.process_webcam(*camera, *frame_skip, output.as_deref(), !*no_display)?;
      println!();
      println!("摄像头检测结束");
      println!("==================");
      println!(
        "读取 {} 帧，推理 {} 帧，检测到坑洼 {} 帧，保存截图 {} 张",
        summary.stats.frames_read,
        summary.stats.frames_inferred,
        summary.pothole_frames,
        summary.snapshots.len()
      );
    }
    Command::Setup => run_setup(&args)?,
    Command::Download {
      model_download,
      output_dir,
    } => run_download(model_download, output_dir)?,
    Command::Test { model, test_image } => run_test(model, test_image.as_deref())?,
  }

  Ok(())
}
