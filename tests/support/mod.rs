//! 测试用的模拟核心控制 API
//!
//! 只实现被管控核心暴露的那几个端点，行为可编程：流量计数、
//! 每节点延迟脚本、选择与模式变更的记录。

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, put};
use serde_json::{Value, json};

/// 单个节点的延迟探测脚本
#[derive(Clone, Copy)]
pub enum DelayScript {
    /// 返回测得的毫秒数
    Ok(u64),
    /// 返回指定状态码（504 模拟探测超时）
    Status(u16),
    /// 长时间不响应，调用方只能靠自己的超时/取消脱身
    Hang,
}

#[derive(Default)]
pub struct MockCore {
    pub secret: Option<String>,
    pub traffic: Mutex<(u64, u64)>,
    /// 返回坏 JSON，验证解码错误路径
    pub broken_traffic: AtomicBool,
    pub proxies: Mutex<Value>,
    pub delays: Mutex<HashMap<String, DelayScript>>,
    /// 记录到的 (组, 节点) 选择
    pub selections: Mutex<Vec<(String, String)>>,
    /// 记录到的模式变更
    pub modes: Mutex<Vec<String>>,
}

impl MockCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_secret(secret: &str) -> Arc<Self> {
        Arc::new(Self {
            secret: Some(secret.to_string()),
            ..Self::default()
        })
    }

    pub fn set_traffic(&self, up: u64, down: u64) {
        *self.traffic.lock().unwrap() = (up, down);
    }

    pub fn set_proxies(&self, proxies: Value) {
        *self.proxies.lock().unwrap() = proxies;
    }

    pub fn set_delay(&self, node: &str, script: DelayScript) {
        self.delays.lock().unwrap().insert(node.to_string(), script);
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.secret {
            None => true,
            Some(secret) => headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == format!("Bearer {}", secret)),
        }
    }
}

/// 起一个监听随机端口的模拟核心，返回其地址
pub async fn spawn_mock(core: Arc<MockCore>) -> SocketAddr {
    let app = axum::Router::new()
        .route("/", get(root))
        .route("/traffic", get(traffic))
        .route("/proxies", get(proxies))
        .route("/proxies/{name}", put(select))
        .route("/proxies/{name}/delay", get(delay))
        .route("/configs", patch(configs))
        .with_state(core);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"message": "Unauthorized"}))).into_response()
}

async fn root(State(core): State<Arc<MockCore>>, headers: HeaderMap) -> Response {
    if !core.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"hello": "clash"})).into_response()
}

async fn traffic(State(core): State<Arc<MockCore>>, headers: HeaderMap) -> Response {
    if !core.authorized(&headers) {
        return unauthorized();
    }
    if core.broken_traffic.load(Ordering::SeqCst) {
        return (StatusCode::OK, "not json at all").into_response();
    }
    let (up, down) = *core.traffic.lock().unwrap();
    Json(json!({"up": up, "down": down})).into_response()
}

async fn proxies(State(core): State<Arc<MockCore>>, headers: HeaderMap) -> Response {
    if !core.authorized(&headers) {
        return unauthorized();
    }
    let proxies = core.proxies.lock().unwrap().clone();
    Json(json!({"proxies": proxies})).into_response()
}

async fn delay(
    State(core): State<Arc<MockCore>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !core.authorized(&headers) {
        return unauthorized();
    }
    // 先拷出脚本再响应，锁不跨 await
    let script = core.delays.lock().unwrap().get(&name).copied();
    match script {
        Some(DelayScript::Ok(ms)) => Json(json!({"delay": ms})).into_response(),
        Some(DelayScript::Hang) => {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Json(json!({"delay": 0})).into_response()
        }
        Some(DelayScript::Status(code)) => (
            StatusCode::from_u16(code).unwrap(),
            Json(json!({"message": "An error occurred in the delay test"})),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"message": "Proxy not found"}))).into_response(),
    }
}

async fn select(
    State(core): State<Arc<MockCore>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !core.authorized(&headers) {
        return unauthorized();
    }
    let node = body["name"].as_str().unwrap_or_default().to_string();
    core.selections.lock().unwrap().push((name, node));
    StatusCode::NO_CONTENT.into_response()
}

async fn configs(
    State(core): State<Arc<MockCore>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !core.authorized(&headers) {
        return unauthorized();
    }
    let mode = body["mode"].as_str().unwrap_or_default().to_string();
    core.modes.lock().unwrap().push(mode);
    StatusCode::NO_CONTENT.into_response()
}
