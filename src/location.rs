// 该文件是 Kengwa （坑洼探测） 项目的一部分。
// src/location.rs - 逆地理编码
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

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

pub const NOMINATIM_REVERSE_URL: &str = "https://nominatim.openstreetmap.org/reverse";
pub const USER_AGENT: &str = "pothole_detection_system";
const GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ReverseResponse {
  display_name: Option<String>,
}

/// 地址解析服务
///
/// 查询失败时退化为坐标文本，不返回错误。
pub struct LocationService {
  agent: Option<ureq::Agent>,
  endpoint: String,
}

impl Default for LocationService {
  fn default() -> Self {
    Self::new()
  }
}

impl LocationService {
  pub fn new() -> Self {
    let agent = ureq::AgentBuilder::new()
      .timeout(GEOCODE_TIMEOUT)
      .user_agent(USER_AGENT)
      .build();
    Self {
      agent: Some(agent),
      endpoint: NOMINATIM_REVERSE_URL.to_string(),
    }
  }

  /// 不访问网络，始终返回坐标文本
  pub fn offline() -> Self {
    Self {
      agent: None,
      endpoint: NOMINATIM_REVERSE_URL.to_string(),
    }
  }

  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.endpoint = endpoint.into();
    self
  }

  pub fn get_address(&self, latitude: f64, longitude: f64) -> String {
    match self.lookup(latitude, longitude) {
      Some(address) => address,
      None => fallback_address(latitude, longitude),
    }
  }

  fn lookup(&self, latitude: f64, longitude: f64) -> Option<String> {
    let agent = self.agent.as_ref()?;
    let response = agent
      .get(&self.endpoint)
      .query("format", "jsonv2")
      .query("lat", &latitude.to_string())
      .query("lon", &longitude.to_string())
      .call()
      .map_err(|e| warn!("逆地理编码请求失败: {}", e))
      .ok()?;
    let body: ReverseResponse = response
      .into_json()
      .map_err(|e| warn!("逆地理编码响应无法解析: {}", e))
      .ok()?;
    debug!("逆地理编码结果: {:?}", body.display_name);
    body.display_name.filter(|s| !s.is_empty())
  }

  pub fn get_maps_link(&self, latitude: f64, longitude: f64) -> String {
    maps_link(latitude, longitude)
  }
}

pub fn fallback_address(latitude: f64, longitude: f64) -> String {
  format!("Latitude: {:.6}, Longitude: {:.6}", latitude, longitude)
}

pub fn maps_link(latitude: f64, longitude: f64) -> String {
  format!("https://www.google.com/maps?q={},{}", latitude, longitude)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn offline_service_falls_back_to_coordinates() {
    let service = LocationService::offline();
    assert_eq!(
      service.get_address(40.4461, -79.9822),
      "Latitude: 40.446100, Longitude: -79.982200"
    );
  }

  #[test]
  fn unreachable_endpoint_falls_back_to_coordinates() {
    let service = LocationService::new().with_endpoint("http://127.0.0.1:9/reverse");
    assert_eq!(service.get_address(1.0, 2.0), fallback_address(1.0, 2.0));
  }

  #[test]
  fn maps_link_uses_plain_coordinates() {
    assert_eq!(
      LocationService::offline().get_maps_link(40.4461, -79.9822),
      "https://www.google.com/maps?q=40.4461,-79.9822"
    );
  }
}
