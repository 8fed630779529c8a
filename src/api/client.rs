//! 控制 API 客户端
//!
//! 面向核心进程在回环地址上暴露的 HTTP+JSON 管理接口。
//! 客户端内部不做任何重试——就绪轮询、延迟探测各有自己的语义，
//! 重试策略归调用方。

use std::time::Duration;

use reqwest::{Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::api::models::{DelayResponse, ModePatch, ProxiesResponse, ProxyEntry, SelectRequest, TrafficReading};
use crate::common::{Error, Result};

use std::collections::HashMap;

/// 默认单次请求超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Typed client for the core's loopback control API.
///
/// Cheap to clone; all clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ControlApiClient {
    http: reqwest::Client,
    base: Url,
    secret: Option<String>,
    timeout: Duration,
}

impl ControlApiClient {
    /// `addr` is the controller's `host:port`, e.g. `127.0.0.1:9090`.
    pub fn new(addr: &str, secret: Option<String>) -> Result<Self> {
        let base = Url::parse(&format!("http://{}/", addr))
            .map_err(|e| Error::Config(format!("invalid control API address '{}': {}", addr, e)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            secret,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 根端点健康检查。核心的控制器就绪后对 `/` 返回 200。
    pub async fn ready(&self) -> Result<()> {
        let resp = self.request(Method::GET, self.base.clone(), self.timeout).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Api { status: status.as_u16() })
        }
    }

    /// 累计流量计数器
    pub async fn traffic(&self) -> Result<TrafficReading> {
        self.get_json(self.endpoint(&["traffic"]), self.timeout).await
    }

    /// 全部代理/组条目
    pub async fn proxies(&self) -> Result<HashMap<String, ProxyEntry>> {
        let resp: ProxiesResponse = self.get_json(self.endpoint(&["proxies"]), self.timeout).await?;
        Ok(resp.proxies)
    }

    /// 单节点延迟探测。`timeout_ms` 由核心执行，客户端侧留出余量。
    pub async fn delay(&self, node: &str, probe_url: &str, timeout_ms: u64) -> Result<u64> {
        let mut url = self.endpoint(&["proxies", node, "delay"]);
        url.query_pairs_mut()
            .append_pair("timeout", &timeout_ms.to_string())
            .append_pair("url", probe_url);
        // 核心按 timeout_ms 截止，客户端超时加 1s 余量
        let timeout = Duration::from_millis(timeout_ms) + Duration::from_secs(1);
        let resp: DelayResponse = self.get_json(url, timeout).await?;
        Ok(resp.delay)
    }

    /// 切换组的选中成员（PUT /proxies/{group}）
    pub async fn select(&self, group: &str, node: &str) -> Result<()> {
        let url = self.endpoint(&["proxies", group]);
        self.send_mutation(Method::PUT, url, &SelectRequest { name: node }).await
    }

    /// 切换路由模式（PATCH /configs）
    pub async fn set_mode(&self, mode: &str) -> Result<()> {
        let url = self.endpoint(&["configs"]);
        self.send_mutation(Method::PATCH, url, &ModePatch { mode }).await
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear();
            for s in segments {
                path.push(s);
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url, timeout: Duration) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url).timeout(timeout);
        if let Some(secret) = &self.secret {
            req = req.bearer_auth(secret);
        }
        req
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, timeout: Duration) -> Result<T> {
        trace!(url = %url, "control API GET");
        let resp = self.request(Method::GET, url, timeout).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Api { status: status.as_u16() });
        }
        resp.json::<T>().await.map_err(|e| Error::Decode(e.to_string()))
    }

    /// 变更端点成功时返回空的 200/204，不解码响应体。
    async fn send_mutation<B: Serialize>(&self, method: Method, url: Url, body: &B) -> Result<()> {
        trace!(url = %url, method = %method, "control API mutation");
        let resp = self.request(method, url, self.timeout).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Api { status: status.as_u16() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_garbage_address() {
        assert!(ControlApiClient::new("not an address", None).is_err());
    }

    #[test]
    fn endpoint_builds_and_encodes_segments() {
        let client = ControlApiClient::new("127.0.0.1:9090", None).unwrap();
        let url = client.endpoint(&["proxies", "HK 01", "delay"]);
        assert_eq!(url.as_str(), "http://127.0.0.1:9090/proxies/HK%2001/delay");
    }

    #[test]
    fn endpoint_root_segments() {
        let client = ControlApiClient::new("127.0.0.1:9090", None).unwrap();
        assert_eq!(client.endpoint(&["traffic"]).as_str(), "http://127.0.0.1:9090/traffic");
        assert_eq!(client.endpoint(&["configs"]).as_str(), "http://127.0.0.1:9090/configs");
    }
}
