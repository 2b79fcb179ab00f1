// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/alert/oauth.rs - Google OAuth 2.0 已安装应用授权
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

//! 授权码流程：本地监听回环端口接收回调，用授权码换取令牌，
//! 令牌以 JSON 保存在本地，过期后用刷新令牌续期。

use std::{
  io::{BufRead, BufReader, Write},
  net::TcpListener,
  path::Path,
  process::{Command, Stdio},
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::AlertError;

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// 提前视为过期的余量（秒）
const EXPIRY_SKEW_SECS: i64 = 60;

fn default_auth_uri() -> String {
  DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
  DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
  pub client_id: String,
  pub client_secret: String,
  #[serde(default = "default_auth_uri")]
  pub auth_uri: String,
  #[serde(default = "default_token_uri")]
  pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
  installed: Option<ClientSecret>,
  web: Option<ClientSecret>,
}

impl ClientSecret {
  /// 读取控制台下载的客户端密钥文件（`installed` 或 `web` 段）
  pub fn load(path: &Path) -> Result<Self, AlertError> {
    if !path.is_file() {
      return Err(AlertError::CredentialsMissing(path.to_path_buf()));
    }
    let file: ClientSecretFile = serde_json::from_slice(&std::fs::read(path)?)?;
    file
      .installed
      .or(file.web)
      .ok_or_else(|| AlertError::OAuth("凭据文件缺少 installed/web 段".to_string()))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredToken {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub expires_at: DateTime<Utc>,
  pub token_uri: String,
  pub client_id: String,
  pub client_secret: String,
  pub scopes: Vec<String>,
}

impl StoredToken {
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    !self.access_token.is_empty() && now + ChronoDuration::seconds(EXPIRY_SKEW_SECS) < self.expires_at
  }

  pub fn is_valid(&self) -> bool {
    self.is_valid_at(Utc::now())
  }

  pub fn load(path: &Path) -> Result<Option<Self>, AlertError> {
    if !path.is_file() {
      return Ok(None);
    }
    let token = serde_json::from_slice(&std::fs::read(path)?)?;
    Ok(Some(token))
  }

  pub fn save(&self, path: &Path) -> Result<(), AlertError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
    debug!("令牌已保存: {}", path.display());
    Ok(())
  }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: String,
  #[serde(default)]
  expires_in: Option<i64>,
  #[serde(default)]
  refresh_token: Option<String>,
}

fn post_token_form(
  agent: &ureq::Agent,
  token_uri: &str,
  form: &[(&str, &str)],
) -> Result<TokenResponse, AlertError> {
  let response = agent.post(token_uri).send_form(form)?;
  Ok(response.into_json()?)
}

/// 用刷新令牌续期，保留原刷新令牌
pub fn refresh(agent: &ureq::Agent, token: &StoredToken) -> Result<StoredToken, AlertError> {
  let refresh_token = token
    .refresh_token
    .as_deref()
    .ok_or_else(|| AlertError::OAuth("没有刷新令牌".to_string()))?;

  info!("刷新访问令牌...");
  let response = post_token_form(
    agent,
    &token.token_uri,
    &[
      ("client_id", token.client_id.as_str()),
      ("client_secret", token.client_secret.as_str()),
      ("refresh_token", refresh_token),
      ("grant_type", "refresh_token"),
    ],
  )?;

  Ok(StoredToken {
    access_token: response.access_token,
    refresh_token: response.refresh_token.or_else(|| token.refresh_token.clone()),
    expires_at: Utc::now() + ChronoDuration::seconds(response.expires_in.unwrap_or(3600)),
    ..token.clone()
  })
}

/// 构造授权页面地址
pub fn authorization_url(secret: &ClientSecret, redirect_uri: &str, scope: &str, state: &str) -> String {
  format!(
    "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&access_type=offline&prompt=consent",
    secret.auth_uri,
    urlencoding::encode(&secret.client_id),
    urlencoding::encode(redirect_uri),
    urlencoding::encode(scope),
    urlencoding::encode(state),
  )
}

/// 从回调请求行（`GET /?code=...&state=... HTTP/1.1`）中取出授权码
pub fn parse_callback(request_line: &str, expected_state: &str) -> Result<String, AlertError> {
  let target = request_line
    .split_whitespace()
    .nth(1)
    .ok_or_else(|| AlertError::OAuth("回调请求格式错误".to_string()))?;
  let url = Url::parse(&format!("http://localhost{}", target))
    .map_err(|e| AlertError::OAuth(format!("回调地址无法解析: {}", e)))?;

  let mut code = None;
  let mut state = None;
  for (key, value) in url.query_pairs() {
    match key.as_ref() {
      "code" => code = Some(value.into_owned()),
      "state" => state = Some(value.into_owned()),
      "error" => return Err(AlertError::OAuth(format!("用户拒绝授权: {}", value))),
      _ => {}
    }
  }

  if state.as_deref() != Some(expected_state) {
    return Err(AlertError::OAuth("state 不匹配".to_string()));
  }
  code.ok_or_else(|| AlertError::OAuth("回调中没有授权码".to_string()))
}

fn open_browser(url: &str) {
  let opener: &[&str] = match std::env::consts::OS {
    "macos" => &["open"],
    "windows" => &["cmd", "/C", "start", ""],
    _ => &["xdg-open"],
  };
  if let Some((program, args)) = opener.split_first() {
    let spawned = Command::new(program)
      .args(args)
      .arg(url)
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn();
    if let Err(e) = spawned {
      debug!("无法自动打开浏览器: {}", e);
    }
  }
}

/// 交互式授权：打开浏览器，等待回环回调，换取令牌
pub fn run_installed_app_flow(
  agent: &ureq::Agent,
  secret: &ClientSecret,
  scope: &str,
) -> Result<StoredToken, AlertError> {
  let listener = TcpListener::bind("127.0.0.1:0")?;
  let port = listener.local_addr()?.port();
  let redirect_uri = format!("http://localhost:{}/", port);
  let state = format!("{:016x}", rand::thread_rng().r#gen::<u64>());

  let auth_url = authorization_url(secret, &redirect_uri, scope, &state);
  info!("请在浏览器中完成授权");
  println!("请在浏览器中打开以下地址完成授权:\n{}", auth_url);
  open_browser(&auth_url);

  let code = loop {
    let (mut stream, peer) = listener.accept()?;
    let mut request_line = String::new();
    BufReader::new(&stream).read_line(&mut request_line)?;
    debug!("收到来自 {} 的回调: {}", peer, request_line.trim());

    // 浏览器可能顺带请求 favicon 等路径
    if !request_line.contains("code=") && !request_line.contains("error=") {
      let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
      continue;
    }

    let result = parse_callback(&request_line, &state);
    let page = match &result {
      Ok(_) => "The authentication flow has completed. You may close this window.",
      Err(_) => "Authentication failed. Please return to the terminal.",
    };
    let response = format!(
      "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
      page.len(),
      page
    );
    if let Err(e) = stream.write_all(response.as_bytes()) {
      warn!("回调响应写入失败: {}", e);
    }
    break result?;
  };

  let response = post_token_form(
    agent,
    &secret.token_uri,
    &[
      ("code", code.as_str()),
      ("client_id", secret.client_id.as_str()),
      ("client_secret", secret.client_secret.as_str()),
      ("redirect_uri", redirect_uri.as_str()),
      ("grant_type", "authorization_code"),
    ],
  )?;
  info!("授权完成");

  Ok(StoredToken {
    access_token: response.access_token,
    refresh_token: response.refresh_token,
    expires_at: Utc::now() + ChronoDuration::seconds(response.expires_in.unwrap_or(3600)),
    token_uri: secret.token_uri.clone(),
    client_id: secret.client_id.clone(),
    client_secret: secret.client_secret.clone(),
    scopes: vec![scope.to_string()],
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn secret() -> ClientSecret {
    ClientSecret {
      client_id: "id.apps".to_string(),
      client_secret: "shh".to_string(),
      auth_uri: default_auth_uri(),
      token_uri: default_token_uri(),
    }
  }

  #[test]
  fn callback_yields_code_when_state_matches() {
    let line = "GET /?state=abc&code=4%2F0Ab&scope=x HTTP/1.1\r\n";
    assert_eq!(parse_callback(line, "abc").unwrap(), "4/0Ab");
    assert!(parse_callback(line, "other").is_err());
    assert!(parse_callback("GET /?error=access_denied&state=abc HTTP/1.1", "abc").is_err());
  }

  #[test]
  fn authorization_url_is_encoded() {
    let url = authorization_url(&secret(), "http://localhost:8080/", "https://scope/a", "s1");
    assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?response_type=code"));
    assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2F"));
    assert!(url.contains("client_id=id.apps"));
  }

  #[test]
  fn client_secret_reads_installed_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");
    std::fs::write(
      &path,
      r#"{"installed":{"client_id":"cid","client_secret":"cs","redirect_uris":["http://localhost"]}}"#,
    )
    .unwrap();
    let secret = ClientSecret::load(&path).unwrap();
    assert_eq!(secret.client_id, "cid");
    assert_eq!(secret.token_uri, DEFAULT_TOKEN_URI);

    assert!(matches!(
      ClientSecret::load(&dir.path().join("none.json")),
      Err(AlertError::CredentialsMissing(_))
    ));
  }

  #[test]
  fn token_round_trips_and_expires() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("token.json");
    let now = Utc::now();
    let token = StoredToken {
      access_token: "at".to_string(),
      refresh_token: Some("rt".to_string()),
      expires_at: now + ChronoDuration::seconds(30),
      token_uri: default_token_uri(),
      client_id: "cid".to_string(),
      client_secret: "cs".to_string(),
      scopes: vec!["s".to_string()],
    };
    token.save(&path).unwrap();
    let loaded = StoredToken::load(&path).unwrap().unwrap();
    assert_eq!(loaded, token);
    // 30 秒后过期，落在提前量之内
    assert!(!loaded.is_valid_at(now));
    assert!(loaded.is_valid_at(now - ChronoDuration::seconds(120)));
  }
}
