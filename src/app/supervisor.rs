//! 核心进程生命周期
//!
//! 负责拉起/停止/重启外部代理核心进程，等待其控制 API 就绪，
//! 并在其意外退出时广播事件。同一时刻至多存在一个核心进程；
//! start/stop/restart 通过单把生命周期锁互斥，已有操作在途时
//! 立即返回 `OperationInProgress` 而不是排队。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::ControlApiClient;
use crate::common::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Core process state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoreState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl CoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreState::Stopped => "stopped",
            CoreState::Starting => "starting",
            CoreState::Running => "running",
            CoreState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态变化通告。UI 绑定方订阅这里，而不是反应式属性。
#[derive(Debug, Clone)]
pub enum CoreEvent {
    StateChanged(CoreState),
    /// Running 态下核心自行退出（非 stop 触发）。不自动重启——
    /// 重启策略归调用方。
    UnexpectedExit { code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// 核心可执行文件
    pub executable: PathBuf,
    /// 核心工作目录（-d）
    pub work_dir: PathBuf,
    /// 控制 API 绑定地址（-ext-ctl）
    pub api_addr: SocketAddr,
    /// 控制 API 共享密钥
    pub secret: Option<String>,
    /// 核心 stdout/stderr 落盘位置，追加写，运行期间不截断
    pub log_path: PathBuf,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    pub settle_delay: Duration,
    pub stop_grace: Duration,
}

impl SupervisorSettings {
    pub fn new(executable: PathBuf, work_dir: PathBuf, api_addr: SocketAddr) -> Self {
        let log_path = work_dir.join("core.log");
        Self {
            executable,
            work_dir,
            api_addr,
            secret: None,
            log_path,
            poll_interval: DEFAULT_POLL_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

struct Inner {
    settings: SupervisorSettings,
    api: ControlApiClient,
    state: watch::Sender<CoreState>,
    events: broadcast::Sender<CoreEvent>,
    /// 唯一的进程句柄槽位
    child: Mutex<Option<Child>>,
    /// 生命周期互斥锁：start/stop/restart 单飞
    lifecycle: Mutex<()>,
}

/// Supervisor over the external core process. Cheap to clone.
#[derive(Clone)]
pub struct CoreSupervisor {
    inner: Arc<Inner>,
}

impl CoreSupervisor {
    pub fn new(settings: SupervisorSettings) -> Result<Self> {
        let api = ControlApiClient::new(&settings.api_addr.to_string(), settings.secret.clone())?;
        let (state, _) = watch::channel(CoreState::Stopped);
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                api,
                state,
                events,
                child: Mutex::new(None),
                lifecycle: Mutex::new(()),
            }),
        })
    }

    pub fn state(&self) -> CoreState {
        *self.inner.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<CoreState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    /// 共享控制 API 客户端（采样器/注册表复用同一份配置）
    pub fn api(&self) -> &ControlApiClient {
        &self.inner.api
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.child.lock().await.as_ref().and_then(|c| c.id())
    }

    /// 拉起核心进程并等待其控制 API 就绪。
    ///
    /// 状态 ≠ Stopped 时返回 `AlreadyRunning`；另一个生命周期操作
    /// 在途时返回 `OperationInProgress`。
    pub async fn start(&self, config_path: &Path) -> Result<()> {
        let _gate = self
            .inner
            .lifecycle
            .try_lock()
            .map_err(|_| Error::OperationInProgress)?;
        self.start_locked(config_path).await
    }

    /// 停止核心进程。已是 Stopped 时为成功的空操作。
    pub async fn stop(&self) -> Result<()> {
        let _gate = self
            .inner
            .lifecycle
            .try_lock()
            .map_err(|_| Error::OperationInProgress)?;
        self.stop_locked().await
    }

    /// stop + 固定的沉降延迟 + start。延迟是因为核心在收到信号后
    /// 可能短暂占着控制端口。
    pub async fn restart(&self, config_path: &Path) -> Result<()> {
        let _gate = self
            .inner
            .lifecycle
            .try_lock()
            .map_err(|_| Error::OperationInProgress)?;
        self.stop_locked().await?;
        tokio::time::sleep(self.inner.settings.settle_delay).await;
        self.start_locked(config_path).await
    }

    async fn start_locked(&self, config_path: &Path) -> Result<()> {
        if self.state() != CoreState::Stopped {
            return Err(Error::AlreadyRunning);
        }
        let settings = &self.inner.settings;
        if !settings.executable.is_file() {
            return Err(Error::ExecutableMissing(settings.executable.clone()));
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.log_path)?;

        let mut child = Command::new(&settings.executable)
            .arg("-d")
            .arg(&settings.work_dir)
            .arg("-f")
            .arg(config_path)
            .arg("-ext-ctl")
            .arg(settings.api_addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()?;

        self.set_state(CoreState::Starting);
        info!(
            executable = %settings.executable.display(),
            config = %config_path.display(),
            api = %settings.api_addr,
            "core spawned"
        );

        let deadline = Instant::now() + settings.startup_timeout;
        loop {
            // 进程先死说明配置坏了或二进制起不来
            if let Some(status) = child.try_wait()? {
                self.set_state(CoreState::Stopped);
                return Err(Error::ProcessExited {
                    code: status.code(),
                });
            }
            if self.inner.api.ready().await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.set_state(CoreState::Stopped);
                return Err(Error::StartupTimeout(settings.startup_timeout));
            }
            tokio::time::sleep(settings.poll_interval).await;
        }

        let pid = child.id();
        *self.inner.child.lock().await = Some(child);
        self.set_state(CoreState::Running);
        info!(pid, "core control API ready");
        self.spawn_exit_watcher();
        Ok(())
    }

    async fn stop_locked(&self) -> Result<()> {
        if self.state() == CoreState::Stopped {
            return Ok(());
        }
        self.set_state(CoreState::Stopping);

        let child = self.inner.child.lock().await.take();
        let Some(mut child) = child else {
            // 退出监视任务已经回收了进程
            self.set_state(CoreState::Stopped);
            return Ok(());
        };

        Self::terminate(&mut child);
        match tokio::time::timeout(self.inner.settings.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(code = ?status.code(), "core exited"),
            Ok(Err(e)) => warn!(error = %e, "waiting for core exit failed"),
            Err(_) => {
                warn!("core ignored termination signal, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.set_state(CoreState::Stopped);
        Ok(())
    }

    /// 先礼后兵：unix 下发 SIGTERM，其它平台直接 kill
    #[cfg(unix)]
    fn terminate(child: &mut Child) {
        match child.id() {
            Some(pid) => unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            },
            None => {
                let _ = child.start_kill();
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(child: &mut Child) {
        let _ = child.start_kill();
    }

    /// Running 态下轮询进程是否还活着；意外退出时转 Stopped 并广播。
    fn spawn_exit_watcher(&self) {
        let sup = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sup.inner.settings.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if sup.state() != CoreState::Running {
                    return;
                }
                let mut slot = sup.inner.child.lock().await;
                let Some(child) = slot.as_mut() else {
                    // stop 拿走了句柄
                    return;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *slot = None;
                        drop(slot);
                        sup.set_state(CoreState::Stopped);
                        warn!(code = ?status.code(), "core exited unexpectedly");
                        let _ = sup.inner.events.send(CoreEvent::UnexpectedExit {
                            code: status.code(),
                        });
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "exit watcher lost track of core process");
                        return;
                    }
                }
            }
        });
    }

    fn set_state(&self, next: CoreState) {
        let prev = *self.inner.state.borrow();
        if prev == next {
            return;
        }
        self.inner.state.send_replace(next);
        debug!(from = prev.as_str(), to = next.as_str(), "core state");
        let _ = self.inner.events.send(CoreEvent::StateChanged(next));
    }
}
