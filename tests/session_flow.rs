//! 会话层端到端：假核心 + 模拟控制 API + 记录型系统代理

#![cfg(unix)]

mod support;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use corelink::app::{
    CoreState, CoreSupervisor, NoopSystemProxy, RegistrySettings, RoutingMode, Session,
    SessionSettings, SupervisorSettings, SystemProxy, ToggleOutcome,
};
use corelink::config::ProfileStore;

use support::{MockCore, spawn_mock};

const PROFILE_YAML: &str = r#"
mixed-port: 7892
external-controller: 127.0.0.1:9090
proxies:
  - name: "HK-01"
    type: trojan
    server: hk.example.com
    port: 443
proxy-groups:
  - name: "Proxies"
    type: select
    proxies: ["HK-01"]
"#;

async fn build_session(dir: &Path, core: Arc<MockCore>) -> (Session, Arc<NoopSystemProxy>) {
    let api_addr = spawn_mock(core).await;

    let exe = dir.join("fake-core");
    std::fs::write(&exe, "#!/bin/sh\nexec sleep 30\n").unwrap();
    let mut perm = std::fs::metadata(&exe).unwrap().permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(&exe, perm).unwrap();

    let mut settings = SupervisorSettings::new(exe, dir.to_path_buf(), api_addr);
    settings.poll_interval = Duration::from_millis(50);
    settings.startup_timeout = Duration::from_millis(1500);
    let supervisor = CoreSupervisor::new(settings).unwrap();

    let mut profiles = ProfileStore::load(&dir.join("profiles")).await.unwrap();
    profiles.add_local("main", PROFILE_YAML).await.unwrap();

    let proxy = Arc::new(NoopSystemProxy::new());
    let session = Session::new(
        supervisor,
        profiles,
        proxy.clone(),
        RegistrySettings::default(),
        SessionSettings::default(),
    );
    (session, proxy)
}

#[tokio::test]
async fn full_session_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let core = MockCore::new();
    core.set_proxies(json!({
        "Proxies": {"type": "Selector", "now": "HK-01", "all": ["HK-01"]},
        "HK-01": {"type": "Trojan"}
    }));
    let (session, proxy) = build_session(dir.path(), core.clone()).await;

    let report = session.start_proxy().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(session.supervisor().state(), CoreState::Running);
    assert!(proxy.currently_applied());

    // 启动时顺带加载了实时节点数据
    assert_eq!(session.registry().selected_node().await.as_deref(), Some("HK-01"));

    // 运行中切换模式要写到核心
    session.set_mode(RoutingMode::Global).await.unwrap();
    assert_eq!(session.mode().await, RoutingMode::Global);
    assert_eq!(*core.modes.lock().unwrap(), vec!["global"]);

    let report = session.stop_proxy().await;
    assert!(report.is_clean());
    assert_eq!(session.supervisor().state(), CoreState::Stopped);
    assert!(!proxy.currently_applied());
}

#[tokio::test]
async fn toggle_runs_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let core = MockCore::new();
    core.set_proxies(json!({
        "Proxies": {"type": "Selector", "now": "HK-01", "all": ["HK-01"]},
        "HK-01": {"type": "Trojan"}
    }));
    let (session, proxy) = build_session(dir.path(), core).await;

    match session.toggle_proxy().await.unwrap() {
        ToggleOutcome::Started(report) => assert!(report.is_clean()),
        other => panic!("expected start, got {:?}", other),
    }
    assert!(proxy.currently_applied());

    match session.toggle_proxy().await.unwrap() {
        ToggleOutcome::Stopped(report) => assert!(report.is_clean()),
        other => panic!("expected stop, got {:?}", other),
    }
    assert_eq!(session.supervisor().state(), CoreState::Stopped);
    assert!(!proxy.currently_applied());
}
