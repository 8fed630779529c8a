//! 核心原生配置格式（Clash 子集）的静态模型
//!
//! 核心停止时注册表回退读取这里的数据；它比实时 API 更丰富
//! （带 server/port/凭据），但不代表核心当前实际持有的状态。

use std::path::Path;

use serde::Deserialize;

use crate::common::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClashConfig {
    /// HTTP 入站端口
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(rename = "socks-port", default)]
    pub socks_port: Option<u16>,
    #[serde(rename = "mixed-port", default)]
    pub mixed_port: Option<u16>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(rename = "external-controller", default)]
    pub external_controller: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub proxies: Vec<ProxyDef>,
    #[serde(rename = "proxy-groups", default)]
    pub proxy_groups: Vec<GroupDef>,
}

/// 单个上游节点定义
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyDef {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub cipher: Option<String>,
    #[serde(default)]
    pub alpn: Vec<String>,
    #[serde(rename = "skip-cert-verify", default)]
    pub skip_cert_verify: bool,
}

/// 策略组定义
#[derive(Debug, Clone, Deserialize)]
pub struct GroupDef {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    #[serde(default)]
    pub proxies: Vec<String>,
    /// url-test / fallback 的健康检查地址
    #[serde(default)]
    pub url: Option<String>,
    /// 健康检查间隔（秒）
    #[serde(default)]
    pub interval: Option<u64>,
}

impl ClashConfig {
    /// 系统代理指向的 HTTP 端口：mixed-port 优先
    pub fn http_port(&self) -> Option<u16> {
        self.mixed_port.or(self.port)
    }

    pub fn socks_port(&self) -> Option<u16> {
        self.mixed_port.or(self.socks_port)
    }
}

/// 读取并解析核心配置文件。解析失败返回 `Error::Config`。
pub fn load_config(path: &Path) -> Result<ClashConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<ClashConfig> {
    serde_yml::from_str(content).map_err(|e| Error::Config(format!("invalid core config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
port: 7890
socks-port: 7891
mode: rule
external-controller: 127.0.0.1:9090
proxies:
  - name: "HK-Premium-01"
    type: trojan
    server: hk1.example.com
    port: 443
    password: secret
    alpn:
      - h2
      - http/1.1
    skip-cert-verify: true
  - name: "JP-02"
    type: ss
    server: jp2.example.com
    port: 8388
    cipher: aes-256-gcm
    password: pw
proxy-groups:
  - name: "Proxies"
    type: select
    proxies:
      - "HK-Premium-01"
      - "JP-02"
  - name: "Auto"
    type: url-test
    url: http://www.gstatic.com/generate_204
    interval: 300
    proxies:
      - "HK-Premium-01"
      - "JP-02"
"#;

    #[test]
    fn parses_clash_subset() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.port, Some(7890));
        assert_eq!(cfg.mode.as_deref(), Some("rule"));
        assert_eq!(cfg.external_controller.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(cfg.proxies.len(), 2);
        assert_eq!(cfg.proxy_groups.len(), 2);

        let trojan = &cfg.proxies[0];
        assert_eq!(trojan.name, "HK-Premium-01");
        assert_eq!(trojan.server.as_deref(), Some("hk1.example.com"));
        assert_eq!(trojan.port, Some(443));
        assert_eq!(trojan.alpn, vec!["h2", "http/1.1"]);
        assert!(trojan.skip_cert_verify);

        let auto = &cfg.proxy_groups[1];
        assert_eq!(auto.group_type, "url-test");
        assert_eq!(auto.interval, Some(300));
        assert!(auto.url.is_some());
    }

    #[test]
    fn http_port_prefers_mixed() {
        let cfg = parse_config("mixed-port: 7892\nport: 7890\n").unwrap();
        assert_eq!(cfg.http_port(), Some(7892));
        assert_eq!(cfg.socks_port(), Some(7892));

        let cfg = parse_config("port: 7890\nsocks-port: 7891\n").unwrap();
        assert_eq!(cfg.http_port(), Some(7890));
        assert_eq!(cfg.socks_port(), Some(7891));
    }

    #[test]
    fn missing_sections_default_empty() {
        let cfg = parse_config("mode: global\n").unwrap();
        assert!(cfg.proxies.is_empty());
        assert!(cfg.proxy_groups.is_empty());
        assert_eq!(cfg.http_port(), None);
    }

    #[test]
    fn malformed_yaml_is_config_error() {
        let err = parse_config("proxies: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
