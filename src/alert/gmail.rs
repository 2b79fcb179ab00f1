// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/alert/gmail.rs - Gmail 邮件通道
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
  sync::Mutex,
  time::Duration,
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use lettre::{
  Message,
  message::{Attachment, Mailbox, MultiPart, SinglePart, header::ContentType},
};
use tracing::{info, warn};

use super::{
  AlertError, AlertMessage, MailChannel,
  oauth::{ClientSecret, StoredToken, refresh, run_installed_app_flow},
};

pub const GMAIL_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";
pub const GMAIL_SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// 构造 multipart MIME 邮件：纯文本正文加上存在的附件
pub fn build_mime(message: &AlertMessage) -> Result<Vec<u8>, AlertError> {
  let mut builder = Message::builder()
    .from(message.sender.parse::<Mailbox>()?)
    .subject(message.subject.clone());
  for recipient in &message.recipients {
    builder = builder.to(recipient.parse::<Mailbox>()?);
  }

  let octet_stream =
    ContentType::parse("application/octet-stream").map_err(|e| AlertError::Mime(e.to_string()))?;
  let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone()));
  for path in &message.attachments {
    if !path.is_file() {
      warn!("附件不存在，跳过: {}", path.display());
      continue;
    }
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "attachment".to_string());
    let body = std::fs::read(path)?;
    multipart = multipart.singlepart(Attachment::new(name).body(body, octet_stream.clone()));
  }

  let email = builder
    .multipart(multipart)
    .map_err(|e| AlertError::Mime(e.to_string()))?;
  Ok(email.formatted())
}

/// Gmail API 邮件通道
pub struct GmailService {
  credentials_file: PathBuf,
  token_file: PathBuf,
  agent: ureq::Agent,
  token: Mutex<Option<StoredToken>>,
}

impl GmailService {
  pub fn new(credentials_file: impl Into<PathBuf>, token_file: impl Into<PathBuf>) -> Self {
    Self {
      credentials_file: credentials_file.into(),
      token_file: token_file.into(),
      agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
      token: Mutex::new(None),
    }
  }

  pub fn credentials_file(&self) -> &Path {
    &self.credentials_file
  }

  pub fn token_file(&self) -> &Path {
    &self.token_file
  }

  /// 加载或获取有效令牌
  ///
  /// 顺序：本地令牌有效则直接使用；过期且有刷新令牌则刷新；
  /// 否则读取客户端密钥文件执行浏览器授权。新令牌写回本地。
  pub fn authenticate(&self) -> Result<(), AlertError> {
    let stored = StoredToken::load(&self.token_file).unwrap_or_else(|e| {
      warn!("本地令牌无法读取，将重新授权: {}", e);
      None
    });

    let token = match stored {
      Some(token) if token.is_valid() => token,
      Some(token) if token.refresh_token.is_some() => match refresh(&self.agent, &token) {
        Ok(token) => {
          token.save(&self.token_file)?;
          token
        }
        Err(e) => {
          warn!("刷新令牌失败，将重新授权: {}", e);
          self.interactive()?
        }
      },
      _ => self.interactive()?,
    };

    *self.lock_token() = Some(token);
    info!("Gmail 认证成功");
    Ok(())
  }

  fn interactive(&self) -> Result<StoredToken, AlertError> {
    let secret = ClientSecret::load(&self.credentials_file)?;
    let token = run_installed_app_flow(&self.agent, &secret, GMAIL_SCOPE)?;
    token.save(&self.token_file)?;
    Ok(token)
  }

  fn lock_token(&self) -> std::sync::MutexGuard<'_, Option<StoredToken>> {
    self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn access_token(&self) -> Result<String, AlertError> {
    let mut guard = self.lock_token();
    let token = guard.as_mut().ok_or(AlertError::NotAuthenticated)?;
    if !token.is_valid() {
      let renewed = refresh(&self.agent, token)?;
      renewed.save(&self.token_file)?;
      *token = renewed;
    }
    Ok(token.access_token.clone())
  }
}

impl MailChannel for GmailService {
  fn send_message(&self, message: &AlertMessage) -> Result<String, AlertError> {
    let access_token = self.access_token()?;
    let raw = URL_SAFE.encode(build_mime(message)?);

    let response = self
      .agent
      .post(GMAIL_SEND_URL)
      .set("Authorization", &format!("Bearer {}", access_token))
      .send_json(serde_json::json!({ "raw": raw }))?;
    let body: serde_json::Value = response.into_json()?;

    body
      .get("id")
      .and_then(serde_json::Value::as_str)
      .map(String::from)
      .ok_or_else(|| AlertError::Api(body.to_string()))
  }
}
