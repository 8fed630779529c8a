//! 会话编排
//!
//! 把进程监护、节点注册表、流量采样、profile 存储和系统代理
//! 粘成一个对外的门面。各组件相互独立，全部依赖在这里注入；
//! 组件之间只通过 watch/broadcast 通道观察彼此。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::app::mode::RoutingMode;
use crate::app::nodes::{NodeRegistry, RegistrySettings};
use crate::app::supervisor::{CoreState, CoreSupervisor};
use crate::app::system_proxy::{ProxyEndpoints, SystemProxy};
use crate::app::traffic::TrafficSampler;
use crate::common::{Error, Result};
use crate::config::{load_config, ProfileStore};

/// 配置里找不到入站端口时的回退值
const FALLBACK_HTTP_PORT: u16 = 7890;
const FALLBACK_SOCKS_PORT: u16 = 7891;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// 是否在核心启停时改写 OS 的代理设置
    pub enable_system_proxy: bool,
    /// 系统代理指向的本机地址
    pub proxy_host: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enable_system_proxy: true,
            proxy_host: "127.0.0.1".to_string(),
        }
    }
}

/// 启动结果。核心已经在跑，但系统代理可能没设上——这算部分
/// 成功而不是失败，代理本身是可用的。
#[derive(Debug, Default)]
pub struct StartReport {
    pub system_proxy_error: Option<String>,
}

impl StartReport {
    pub fn is_clean(&self) -> bool {
        self.system_proxy_error.is_none()
    }
}

/// 停止结果。两半都是尽力而为，谁失败记谁的账。
#[derive(Debug, Default)]
pub struct StopReport {
    pub core_error: Option<Error>,
    pub system_proxy_error: Option<String>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.core_error.is_none() && self.system_proxy_error.is_none()
    }
}

#[derive(Debug)]
pub enum ToggleOutcome {
    Started(StartReport),
    Stopped(StopReport),
}

struct Inner {
    supervisor: CoreSupervisor,
    registry: NodeRegistry,
    sampler: TrafficSampler,
    profiles: Mutex<ProfileStore>,
    system_proxy: Arc<dyn SystemProxy>,
    /// 本会话是否成功设置过系统代理。stop 只回收自己设置的，
    /// 不碰别处（用户手动或其它工具）写入的代理配置。
    proxy_applied: AtomicBool,
    mode: RwLock<RoutingMode>,
    settings: SessionSettings,
}

/// Application session facade. Cheap to clone, safe to share.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(
        supervisor: CoreSupervisor,
        profiles: ProfileStore,
        system_proxy: Arc<dyn SystemProxy>,
        registry_settings: RegistrySettings,
        settings: SessionSettings,
    ) -> Self {
        let registry = NodeRegistry::new(
            supervisor.api().clone(),
            supervisor.state_receiver(),
            registry_settings,
        );
        let sampler = TrafficSampler::new(supervisor.api().clone(), supervisor.state_receiver());
        Self {
            inner: Arc::new(Inner {
                supervisor,
                registry,
                sampler,
                profiles: Mutex::new(profiles),
                system_proxy,
                proxy_applied: AtomicBool::new(false),
                mode: RwLock::new(RoutingMode::default()),
                settings,
            }),
        }
    }

    pub fn supervisor(&self) -> &CoreSupervisor {
        &self.inner.supervisor
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn sampler(&self) -> &TrafficSampler {
        &self.inner.sampler
    }

    pub async fn profiles(&self) -> MutexGuard<'_, ProfileStore> {
        self.inner.profiles.lock().await
    }

    pub async fn mode(&self) -> RoutingMode {
        *self.inner.mode.read().await
    }

    /// 常驻后台任务：流量采样循环和节点健康检查循环
    pub fn spawn_background_tasks(&self) {
        let sampler = self.inner.sampler.clone();
        tokio::spawn(async move { sampler.run().await });
        let registry = self.inner.registry.clone();
        tokio::spawn(async move { registry.run_health_loop().await });
    }

    /// 启动代理会话：拉起核心，然后按需改写系统代理。核心启动
    /// 失败整体失败；系统代理失败只降级为部分成功。
    pub async fn start_proxy(&self) -> Result<StartReport> {
        let config_path = {
            let store = self.inner.profiles.lock().await;
            store.active_config_path()?
        };
        self.inner.supervisor.start(&config_path).await?;

        // 解析配置给注册表当回退数据，顺带拿入站端口
        let (http_port, socks_port) = match load_config(&config_path) {
            Ok(cfg) => {
                let ports = (cfg.http_port(), cfg.socks_port());
                self.inner.registry.set_static_config(cfg).await;
                ports
            }
            Err(e) => {
                warn!(error = %e, "active config unreadable after start");
                (None, None)
            }
        };

        let mut report = StartReport::default();
        if self.inner.settings.enable_system_proxy {
            let endpoints = ProxyEndpoints {
                host: self.inner.settings.proxy_host.clone(),
                http_port: http_port.unwrap_or(FALLBACK_HTTP_PORT),
                socks_port: socks_port.unwrap_or(FALLBACK_SOCKS_PORT),
            };
            match self.inner.system_proxy.apply(&endpoints) {
                Ok(()) => self.inner.proxy_applied.store(true, Ordering::SeqCst),
                Err(e) => {
                    warn!(error = %e, "system proxy apply failed, core keeps running");
                    report.system_proxy_error = Some(e);
                }
            }
        }

        if let Err(e) = self.inner.registry.load_nodes().await {
            debug!(error = %e, "initial node load failed");
        }
        info!("proxy session started");
        Ok(report)
    }

    /// 停止代理会话。两半都尽力执行完，不因前一半失败而跳过
    /// 后一半；先摘系统代理避免流量黑洞。
    pub async fn stop_proxy(&self) -> StopReport {
        let mut report = StopReport::default();
        if self.inner.proxy_applied.load(Ordering::SeqCst) {
            match self.inner.system_proxy.clear() {
                Ok(()) => self.inner.proxy_applied.store(false, Ordering::SeqCst),
                Err(e) => {
                    warn!(error = %e, "system proxy clear failed");
                    report.system_proxy_error = Some(e);
                }
            }
        }
        if let Err(e) = self.inner.supervisor.stop().await {
            warn!(error = %e, "core stop failed");
            report.core_error = Some(e);
        }
        if report.is_clean() {
            info!("proxy session stopped");
        }
        report
    }

    /// 按当前状态启停。过渡态（Starting/Stopping）下拒绝。
    pub async fn toggle_proxy(&self) -> Result<ToggleOutcome> {
        match self.inner.supervisor.state() {
            CoreState::Running => Ok(ToggleOutcome::Stopped(self.stop_proxy().await)),
            CoreState::Stopped => Ok(ToggleOutcome::Started(self.start_proxy().await?)),
            _ => Err(Error::OperationInProgress),
        }
    }

    /// 用 active profile 重启核心
    pub async fn restart_proxy(&self) -> Result<()> {
        let config_path = {
            let store = self.inner.profiles.lock().await;
            store.active_config_path()?
        };
        self.inner.supervisor.restart(&config_path).await
    }

    /// 切换路由模式。核心运行时先写核心，成功才提交本地；未运行
    /// 时只更新本地，留待下次启动的配置生效。
    pub async fn set_mode(&self, mode: RoutingMode) -> Result<()> {
        if self.inner.supervisor.state() == CoreState::Running {
            self.inner.supervisor.api().set_mode(mode.as_str()).await?;
        }
        *self.inner.mode.write().await = mode;
        info!(mode = %mode, "routing mode set");
        Ok(())
    }
}
