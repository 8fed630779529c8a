//! 控制 API 的请求/响应模型
//!
//! 每个端点一个窄类型，不用通用字典，结构漂移在编译期暴露。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// GET /traffic 响应：累计上下行字节数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrafficReading {
    pub up: u64,
    pub down: u64,
}

/// GET /proxies 响应
#[derive(Debug, Deserialize)]
pub struct ProxiesResponse {
    pub proxies: HashMap<String, ProxyEntry>,
}

/// /proxies 中的单个条目，节点和组共用一个结构
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    /// 组专有：当前选中的成员
    #[serde(default)]
    pub now: Option<String>,
    /// 组专有：成员名列表
    #[serde(default)]
    pub all: Option<Vec<String>>,
    #[serde(default)]
    pub history: Vec<DelayRecord>,
}

impl ProxyEntry {
    /// 选择策略组（selector / url-test / fallback 等）
    pub fn is_group(&self) -> bool {
        self.all.is_some() || is_group_tag(&self.entry_type)
    }

    /// 内置 direct/reject 直通条目，注册表完全排除
    pub fn is_builtin(&self) -> bool {
        matches!(
            self.entry_type.to_ascii_lowercase().as_str(),
            "direct" | "reject" | "block" | "blackhole" | "compatible"
        )
    }
}

pub(crate) fn is_group_tag(tag: &str) -> bool {
    matches!(
        tag.to_ascii_lowercase().replace('-', "").as_str(),
        "selector" | "select" | "urltest" | "fallback" | "loadbalance" | "relay"
    )
}

/// 延迟历史记录
#[derive(Debug, Clone, Deserialize)]
pub struct DelayRecord {
    pub delay: u64,
    #[serde(default, alias = "timestamp")]
    pub time: Option<String>,
}

/// GET /proxies/{name}/delay 响应
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DelayResponse {
    pub delay: u64,
}

/// PUT /proxies/{group} 请求体
#[derive(Debug, Serialize)]
pub struct SelectRequest<'a> {
    pub name: &'a str,
}

/// PATCH /configs 请求体
#[derive(Debug, Serialize)]
pub struct ModePatch<'a> {
    pub mode: &'a str,
}
