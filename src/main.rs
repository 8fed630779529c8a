use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use corelink::app::{
    CoreEvent, CoreSupervisor, RegistrySettings, Session, SessionSettings, SupervisorSettings,
    SystemProxy,
};
use corelink::config::ProfileStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("CoreLink starting...");

    let executable = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: corelink <core-executable> [work-dir]")?;
    let work_dir = std::env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let api_addr = std::env::var("CORELINK_API_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:9090".to_string())
        .parse()
        .context("invalid CORELINK_API_ADDR")?;

    let mut settings = SupervisorSettings::new(executable, work_dir.clone(), api_addr);
    settings.secret = std::env::var("CORELINK_SECRET").ok();
    let supervisor = CoreSupervisor::new(settings)?;

    let profiles = ProfileStore::load(&work_dir.join("profiles")).await?;

    let system_proxy: Arc<dyn SystemProxy> = if cfg!(target_os = "macos") {
        Arc::new(corelink::app::NetworksetupProxy::new())
    } else {
        Arc::new(corelink::app::NoopSystemProxy::new())
    };

    let session = Session::new(
        supervisor,
        profiles,
        system_proxy,
        RegistrySettings::default(),
        SessionSettings::default(),
    );
    session.spawn_background_tasks();

    let report = session.start_proxy().await?;
    if let Some(e) = &report.system_proxy_error {
        warn!(error = %e, "running without system proxy");
    }

    // 核心意外退出时结束进程，重启交给外层（launchd 或用户）
    let mut events = session.supervisor().subscribe_events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = events.recv() => {
                if let Ok(CoreEvent::UnexpectedExit { code }) = event {
                    warn!(?code, "core exited unexpectedly");
                    break;
                }
            }
        }
    }

    let report = session.stop_proxy().await;
    if !report.is_clean() {
        warn!(?report, "shutdown was not clean");
    }
    Ok(())
}
