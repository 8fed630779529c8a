//! macOS 系统代理设置
//!
//! 通过 `networksetup` 命令行工具写网络服务的代理配置，避免直接
//! 调 SystemConfiguration FFI。失败对调用方是单个不透明错误。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// 系统代理指向的本地端口组合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoints {
    pub host: String,
    pub http_port: u16,
    pub socks_port: u16,
}

impl fmt::Display for ProxyEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "http://{}:{} socks5://{}:{}",
            self.host, self.http_port, self.host, self.socks_port
        )
    }
}

/// OS 网络设置协作方的窄契约：幂等的 apply/clear 加一个查询。
pub trait SystemProxy: Send + Sync {
    fn apply(&self, endpoints: &ProxyEndpoints) -> Result<(), String>;
    fn clear(&self) -> Result<(), String>;
    fn currently_applied(&self) -> bool;
}

/// 需要改写代理设置的网络服务名
const DEFAULT_SERVICES: &[&str] = &["Wi-Fi", "Ethernet"];

/// `networksetup` 实现
pub struct NetworksetupProxy {
    services: Vec<String>,
}

impl NetworksetupProxy {
    pub fn new() -> Self {
        Self {
            services: DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_services(services: Vec<String>) -> Self {
        Self { services }
    }

    fn run(args: &[&str]) -> Result<String, String> {
        let output = std::process::Command::new("networksetup")
            .args(args)
            .output()
            .map_err(|e| format!("networksetup 执行失败: {}", e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(format!(
                "networksetup {} 失败: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr)
            ))
        }
    }
}

impl Default for NetworksetupProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProxy for NetworksetupProxy {
    fn apply(&self, endpoints: &ProxyEndpoints) -> Result<(), String> {
        let http_port = endpoints.http_port.to_string();
        let socks_port = endpoints.socks_port.to_string();
        for service in &self.services {
            Self::run(&["-setwebproxy", service, &endpoints.host, &http_port])?;
            Self::run(&["-setsecurewebproxy", service, &endpoints.host, &http_port])?;
            Self::run(&["-setsocksfirewallproxy", service, &endpoints.host, &socks_port])?;
        }
        tracing::info!(endpoints = %endpoints, "系统代理已启用");
        Ok(())
    }

    fn clear(&self) -> Result<(), String> {
        for service in &self.services {
            Self::run(&["-setwebproxystate", service, "off"])?;
            Self::run(&["-setsecurewebproxystate", service, "off"])?;
            Self::run(&["-setsocksfirewallproxystate", service, "off"])?;
        }
        tracing::info!("系统代理已清除");
        Ok(())
    }

    fn currently_applied(&self) -> bool {
        // networksetup -getwebproxy 输出 "Enabled: Yes/No"
        let Some(service) = self.services.first() else {
            return false;
        };
        match Self::run(&["-getwebproxy", service]) {
            Ok(out) => out
                .lines()
                .any(|l| l.trim().eq_ignore_ascii_case("enabled: yes")),
            Err(_) => false,
        }
    }
}

/// 测试与非 macOS 平台用的记录型实现
#[derive(Default)]
pub struct NoopSystemProxy {
    applied: AtomicBool,
}

impl NoopSystemProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemProxy for NoopSystemProxy {
    fn apply(&self, endpoints: &ProxyEndpoints) -> Result<(), String> {
        tracing::debug!(endpoints = %endpoints, "noop system proxy apply");
        self.applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<(), String> {
        self.applied.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn currently_applied(&self) -> bool {
        self.applied.load(Ordering::SeqCst)
    }
}
