// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/alert.rs - 邮件告警
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

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{gps::GpsExtractor, location::LocationService};

mod gmail;
mod oauth;
mod report;

pub use self::gmail::{GMAIL_SCOPE, GMAIL_SEND_URL, GmailService, build_mime};
pub use self::oauth::{ClientSecret, StoredToken, authorization_url, parse_callback};
pub use self::report::{LocationDetails, MediaKind, PotholeReport, compose_pothole_alert};

#[derive(Error, Debug)]
pub enum AlertError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("HTTP 错误: {0}")]
  Http(Box<ureq::Error>),
  #[error("邮件地址无效: {0}")]
  Address(#[from] lettre::address::AddressError),
  #[error("邮件构造失败: {0}")]
  Mime(String),
  #[error("凭据文件不存在: {0}")]
  CredentialsMissing(PathBuf),
  #[error("OAuth 授权失败: {0}")]
  OAuth(String),
  #[error("Gmail 服务未认证")]
  NotAuthenticated,
  #[error("Gmail API 返回异常: {0}")]
  Api(String),
}

impl From<ureq::Error> for AlertError {
  fn from(err: ureq::Error) -> Self {
    AlertError::Http(Box::new(err))
  }
}

/// 一封告警邮件
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
  pub sender: String,
  pub recipients: Vec<String>,
  pub subject: String,
  pub body: String,
  pub attachments: Vec<PathBuf>,
}

/// 邮件通道，成功时返回服务端消息 ID
pub trait MailChannel: Send {
  fn send_message(&self, message: &AlertMessage) -> Result<String, AlertError>;
}

/// 告警分发
///
/// 发送失败只记录日志并返回 `false`。
pub struct AlertDispatcher {
  channel: Box<dyn MailChannel>,
}

impl AlertDispatcher {
  pub fn new(channel: impl MailChannel + 'static) -> Self {
    Self {
      channel: Box::new(channel),
    }
  }

  pub fn send_alert(
    &self,
    sender: &str,
    recipients: &[String],
    subject: &str,
    body: &str,
    attachments: &[PathBuf],
  ) -> bool {
    if recipients.is_empty() {
      warn!("没有收件人，跳过告警");
      return false;
    }

    let message = AlertMessage {
      sender: sender.to_string(),
      recipients: recipients.to_vec(),
      subject: subject.to_string(),
      body: body.to_string(),
      attachments: attachments.to_vec(),
    };

    match self.channel.send_message(&message) {
      Ok(id) => {
        info!("告警邮件发送成功 (ID: {})", id);
        true
      }
      Err(e) => {
        error!("告警邮件发送失败: {}", e);
        false
      }
    }
  }
}

/// 检测到坑洼后的告警上下文
pub struct AlertContext {
  pub dispatcher: AlertDispatcher,
  pub gps: GpsExtractor,
  pub location: LocationService,
  pub sender: String,
  pub recipients: Vec<String>,
}

impl AlertContext {
  pub fn new(dispatcher: AlertDispatcher, sender: impl Into<String>, recipients: Vec<String>) -> Self {
    Self {
      dispatcher,
      gps: GpsExtractor::new(),
      location: LocationService::new(),
      sender: sender.into(),
      recipients,
    }
  }

  pub fn with_gps(mut self, gps: GpsExtractor) -> Self {
    self.gps = gps;
    self
  }

  pub fn with_location(mut self, location: LocationService) -> Self {
    self.location = location;
    self
  }

  /// 汇总位置与耗时信息并发送一次告警
  pub fn notify(
    &self,
    kind: MediaKind,
    input_path: &Path,
    output_path: &Path,
    inference_time: Duration,
    video_duration: Option<f64>,
  ) -> bool {
    let coordinate = match kind {
      MediaKind::Image => self.gps.from_image(input_path),
      MediaKind::Video => self.gps.from_video(input_path),
    };
    let location = coordinate.map(|c| LocationDetails {
      coordinate: c,
      address: self.location.get_address(c.latitude, c.longitude),
      maps_link: self.location.get_maps_link(c.latitude, c.longitude),
    });

    let report = PotholeReport {
      kind,
      input_path,
      output_path,
      inference_time,
      video_duration,
      location,
    };
    let (subject, body) = compose_pothole_alert(&report);
    let attachments = report.attachments();

    info!("发送坑洼告警给 {} 位收件人", self.recipients.len());
    self
      .dispatcher
      .send_alert(&self.sender, &self.recipients, &subject, &body, &attachments)
  }
}

/// 解析以空白分隔的收件人列表
pub fn parse_recipients(raw: &str) -> Vec<String> {
  raw.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};

  use super::*;

  struct Recorder(Arc<Mutex<Vec<AlertMessage>>>);

  impl MailChannel for Recorder {
    fn send_message(&self, message: &AlertMessage) -> Result<String, AlertError> {
      self.0.lock().unwrap().push(message.clone());
      Ok("id-1".to_string())
    }
  }

  struct Broken;

  impl MailChannel for Broken {
    fn send_message(&self, _: &AlertMessage) -> Result<String, AlertError> {
      Err(AlertError::NotAuthenticated)
    }
  }

  #[test]
  fn dispatcher_reports_channel_outcome() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let ok = AlertDispatcher::new(Recorder(sent.clone()));
    let to = vec!["a@example.com".to_string()];
    assert!(ok.send_alert("me@example.com", &to, "s", "b", &[]));
    assert_eq!(sent.lock().unwrap()[0].recipients, to);

    assert!(!AlertDispatcher::new(Broken).send_alert("me@example.com", &to, "s", "b", &[]));
    assert!(!ok.send_alert("me@example.com", &[], "s", "b", &[]));
  }

  #[test]
  fn recipients_are_whitespace_separated() {
    assert_eq!(
      parse_recipients(" a@x.com  b@y.org\n"),
      vec!["a@x.com".to_string(), "b@y.org".to_string()]
    );
  }

  #[test]
  fn notify_without_gps_sends_image_alert() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("road.png");
    image::RgbImage::new(2, 2).save(&input).unwrap();

    let sent = Arc::new(Mutex::new(Vec::new()));
    let ctx = AlertContext::new(
      AlertDispatcher::new(Recorder(sent.clone())),
      "me@example.com",
      vec!["a@example.com".to_string()],
    )
    .with_location(LocationService::offline());

    assert!(ctx.notify(
      MediaKind::Image,
      &input,
      &dir.path().join("missing_out.png"),
      Duration::from_millis(1500),
      None,
    ));
    let sent = sent.lock().unwrap();
    assert_eq!(sent[0].subject, "🚨 Pothole Detected in Image!");
    assert!(sent[0].body.contains("No GPS data available in the image file."));
    assert_eq!(sent[0].attachments, vec![input.clone()]);
  }
}
