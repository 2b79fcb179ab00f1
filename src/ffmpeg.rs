// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/ffmpeg.rs - FFmpeg 工具检测与安装
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
  io::Read,
  process::{Command, Output, Stdio},
  thread,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum CommandError {
  #[error("无法启动 {0}: {1}")]
  Spawn(String, std::io::Error),
  #[error("{0} 超时")]
  Timeout(String),
  #[error("{0} 退出状态异常: {1}")]
  Failed(String, std::process::ExitStatus),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 运行外部命令并限制最长耗时，超时后结束子进程
pub fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<Output, CommandError> {
  debug!("运行命令: {} {:?}", program, args);
  let mut child = Command::new(program)
    .args(args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .map_err(|e| CommandError::Spawn(program.to_string(), e))?;

  // 在独立线程中读取输出，避免管道写满导致子进程阻塞
  let mut stdout = child.stdout.take();
  let mut stderr = child.stderr.take();
  let out_reader = thread::spawn(move || {
    let mut buf = Vec::new();
    if let Some(s) = stdout.as_mut() {
      let _ = s.read_to_end(&mut buf);
    }
    buf
  });
  let err_reader = thread::spawn(move || {
    let mut buf = Vec::new();
    if let Some(s) = stderr.as_mut() {
      let _ = s.read_to_end(&mut buf);
    }
    buf
  });

  let deadline = Instant::now() + timeout;
  let status = loop {
    if let Some(status) = child.try_wait()? {
      break status;
    }
    if Instant::now() >= deadline {
      let _ = child.kill();
      let _ = child.wait();
      return Err(CommandError::Timeout(program.to_string()));
    }
    thread::sleep(POLL_INTERVAL);
  };

  let output = Output {
    status,
    stdout: out_reader.join().unwrap_or_default(),
    stderr: err_reader.join().unwrap_or_default(),
  };
  if !output.status.success() {
    return Err(CommandError::Failed(program.to_string(), output.status));
  }
  Ok(output)
}

/// 检查命令行工具是否可用（`<tool> -version` 成功退出）
pub fn tool_available(tool: &str) -> bool {
  run_with_timeout(tool, &["-version"], VERSION_TIMEOUT).is_ok()
}

/// 各平台的安装方案，每个方案内的命令依次执行
fn install_plans(os: &str) -> Vec<Vec<Vec<&'static str>>> {
  match os {
    "windows" => vec![
      vec![vec!["winget", "install", "ffmpeg"]],
      vec![vec!["choco", "install", "ffmpeg-full", "-y"]],
    ],
    "macos" => vec![vec![vec!["brew", "install", "ffmpeg"]]],
    "linux" => vec![
      vec![vec!["apt", "update"], vec!["apt", "install", "-y", "ffmpeg"]],
      vec![vec!["yum", "install", "-y", "ffmpeg"]],
      vec![vec!["dnf", "install", "-y", "ffmpeg"]],
      vec![vec!["pacman", "-S", "--noconfirm", "ffmpeg"]],
    ],
    _ => Vec::new(),
  }
}

/// 检查 FFmpeg 是否可用，不可用时尝试通过系统包管理器安装
pub fn check_and_install_ffmpeg() -> bool {
  if tool_available("ffmpeg") {
    return true;
  }

  warn!("未找到 FFmpeg，尝试自动安装...");
  for plan in install_plans(std::env::consts::OS) {
    let installed = plan.iter().all(|cmd| match cmd.split_first() {
      Some((program, args)) => run_with_timeout(program, args, INSTALL_TIMEOUT)
        .map_err(|e| debug!("安装步骤失败: {}", e))
        .is_ok(),
      None => false,
    });
    if installed {
      info!("FFmpeg 安装成功: {}", plan[0].join(" "));
      return true;
    }
  }

  error!("FFmpeg 自动安装失败，请手动安装");
  error!("  Windows: winget install FFmpeg 或 choco install ffmpeg");
  error!("  macOS:   brew install ffmpeg");
  error!("  Linux:   sudo apt install ffmpeg 或 sudo yum install ffmpeg");
  false
}
