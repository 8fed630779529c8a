//! 节点注册表
//!
//! 持有全部已知节点/策略组，承载所有选择与延迟测试逻辑。
//! 数据有两个来源：核心运行时以实时 API 为准（但拿不到
//! server/port），停止时回退到最近解析的配置 profile（细节齐全）。
//! 外部观察者只拿只读快照，所有变更都走注册表自己的操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::api::models::ProxyEntry;
use crate::api::ControlApiClient;
use crate::app::supervisor::CoreState;
use crate::common::{Error, Result};
use crate::config::ClashConfig;

/// 延迟测量结果。「测过但失败」和「从未测过」是两种状态。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeLatency {
    #[default]
    Untested,
    Failed,
    Millis(u64),
}

impl NodeLatency {
    pub fn millis(&self) -> Option<u64> {
        match self {
            NodeLatency::Millis(ms) => Some(*ms),
            _ => None,
        }
    }

    /// 排序键：有测量的在前，未测/失败统一排最后
    fn sort_key(&self) -> u64 {
        self.millis().unwrap_or(u64::MAX)
    }
}

/// 单个上游节点。latency 是构造后唯一可变的字段，只被延迟测试改写。
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyNode {
    pub name: String,
    pub proxy_type: String,
    /// 实时 API 不暴露 server/port，Live 来源下为 None
    pub server: Option<String>,
    pub port: Option<u16>,
    pub latency: NodeLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStrategy {
    Select,
    UrlTest,
    Fallback,
    LoadBalance,
}

impl GroupStrategy {
    /// 容忍各种大小写/连字符写法；未知 tag 按手动选择处理
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().replace('-', "").as_str() {
            "urltest" => GroupStrategy::UrlTest,
            "fallback" => GroupStrategy::Fallback,
            "loadbalance" => GroupStrategy::LoadBalance,
            _ => GroupStrategy::Select,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStrategy::Select => "select",
            GroupStrategy::UrlTest => "url-test",
            GroupStrategy::Fallback => "fallback",
            GroupStrategy::LoadBalance => "load-balance",
        }
    }
}

/// 策略组。members 按名字弱引用节点——外部状态可能带着我们还没
/// 加载的成员，悬空引用在明细视图里按缺席处理，不报错。
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyGroup {
    pub name: String,
    pub strategy: GroupStrategy,
    pub members: Vec<String>,
    pub now: Option<String>,
    pub test_url: Option<String>,
    pub interval: Option<u64>,
}

impl ProxyGroup {
    /// 解析得到的成员节点，悬空名字直接缺席
    pub fn resolved_members<'a>(&self, nodes: &'a [ProxyNode]) -> Vec<&'a ProxyNode> {
        self.members
            .iter()
            .filter_map(|m| nodes.iter().find(|n| &n.name == m))
            .collect()
    }
}

/// 本次节点数据来自哪里
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSource {
    Live,
    StaticConfig,
}

/// 聚合统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub total: usize,
    /// 有成功测量的节点数
    pub tested: usize,
    pub fast: usize,
    /// 仅对有测量的节点求均值
    pub mean_latency_ms: Option<u64>,
}

/// 地区关键字表。顺序即匹配顺序，长词在前避免误配
/// （比如 "russia" 必须先于 "us" 试）。无匹配落入 "other"。
const REGION_KEYWORDS: &[(&str, &str)] = &[
    ("hongkong", "HK"),
    ("hong kong", "HK"),
    ("香港", "HK"),
    ("hk", "HK"),
    ("taiwan", "TW"),
    ("台湾", "TW"),
    ("tw", "TW"),
    ("singapore", "SG"),
    ("新加坡", "SG"),
    ("sg", "SG"),
    ("japan", "JP"),
    ("日本", "JP"),
    ("jp", "JP"),
    ("korea", "KR"),
    ("韩国", "KR"),
    ("kr", "KR"),
    ("russia", "RU"),
    ("俄罗斯", "RU"),
    ("united states", "US"),
    ("america", "US"),
    ("美国", "US"),
    ("us", "US"),
    ("united kingdom", "UK"),
    ("英国", "UK"),
    ("uk", "UK"),
];

/// 按名字把节点归到地区桶，首个命中的关键字生效
pub fn region_of(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    for (keyword, region) in REGION_KEYWORDS {
        if lower.contains(keyword) {
            return region;
        }
    }
    "other"
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// 延迟探测目标，低负载返回
    pub probe_url: String,
    pub probe_timeout_ms: u64,
    /// 并发探测上限，避免压垮核心
    pub max_inflight: usize,
    pub fast_threshold_ms: u64,
    pub unhealthy_threshold_ms: u64,
    pub health_interval: Duration,
    /// 健康检查是唯一不经用户触发的纠正动作，测试时可关
    pub health_check_enabled: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            probe_url: "http://www.gstatic.com/generate_204".to_string(),
            probe_timeout_ms: 5000,
            max_inflight: 8,
            fast_threshold_ms: 300,
            unhealthy_threshold_ms: 1000,
            health_interval: Duration::from_secs(300),
            health_check_enabled: true,
        }
    }
}

struct Inner {
    api: ControlApiClient,
    core_state: watch::Receiver<CoreState>,
    settings: RegistrySettings,
    nodes: RwLock<Vec<ProxyNode>>,
    groups: RwLock<Vec<ProxyGroup>>,
    selected: RwLock<Option<String>>,
    source: RwLock<Option<NodeSource>>,
    static_config: RwLock<Option<ClashConfig>>,
    /// 选择路径串行化：组成员读取和选择写入不交错
    selection: Mutex<()>,
    /// 全量延迟测试单飞。try_lock 守卫而不是布尔标志，
    /// 批次 future 被丢弃时锁随之释放。
    testing_all: Mutex<()>,
}

#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<Inner>,
}

impl NodeRegistry {
    pub fn new(
        api: ControlApiClient,
        core_state: watch::Receiver<CoreState>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                core_state,
                settings,
                nodes: RwLock::new(Vec::new()),
                groups: RwLock::new(Vec::new()),
                selected: RwLock::new(None),
                source: RwLock::new(None),
                static_config: RwLock::new(None),
                selection: Mutex::new(()),
                testing_all: Mutex::new(()),
            }),
        }
    }

    fn is_running(&self) -> bool {
        *self.inner.core_state.borrow() == CoreState::Running
    }

    /// 注册静态回退数据（最近解析的配置 profile）
    pub async fn set_static_config(&self, config: ClashConfig) {
        *self.inner.static_config.write().await = Some(config);
    }

    /// 重新加载节点/组。核心运行时实时数据为准，否则回退静态配置；
    /// 两个来源都没有时报 `ConfigNotFound`。
    pub async fn load_nodes(&self) -> Result<NodeSource> {
        let (mut nodes, groups, source) = if self.is_running() {
            let entries = self.inner.api.proxies().await?;
            let (nodes, groups) = partition_live(entries);
            (nodes, groups, NodeSource::Live)
        } else {
            let config = self
                .inner
                .static_config
                .read()
                .await
                .clone()
                .ok_or(Error::ConfigNotFound)?;
            let (nodes, groups) = partition_static(&config);
            (nodes, groups, NodeSource::StaticConfig)
        };

        // 同名节点保留已有测量
        {
            let old = self.inner.nodes.read().await;
            for node in &mut nodes {
                if let Some(known) = old.iter().find(|o| o.name == node.name) {
                    node.latency = known.latency;
                }
            }
        }

        // 手动选择组的 now 是核心当前实际选中的节点
        let observed = groups
            .iter()
            .find(|g| g.strategy == GroupStrategy::Select)
            .and_then(|g| g.now.clone());

        info!(
            nodes = nodes.len(),
            groups = groups.len(),
            source = ?source,
            "node registry loaded"
        );

        *self.inner.nodes.write().await = nodes;
        *self.inner.groups.write().await = groups;
        if source == NodeSource::Live {
            if let Some(sel) = observed {
                *self.inner.selected.write().await = Some(sel);
            }
        }
        *self.inner.source.write().await = Some(source);
        Ok(source)
    }

    /// 上一次 load 用的数据来源，UI 可以据此标注
    pub async fn source(&self) -> Option<NodeSource> {
        *self.inner.source.read().await
    }

    pub async fn nodes(&self) -> Vec<ProxyNode> {
        self.inner.nodes.read().await.clone()
    }

    pub async fn groups(&self) -> Vec<ProxyGroup> {
        self.inner.groups.read().await.clone()
    }

    pub async fn selected_node(&self) -> Option<String> {
        self.inner.selected.read().await.clone()
    }

    /// 切换选中节点。核心未运行时只做本地乐观更新；运行时先写
    /// 控制 API，成功才更新本地观察。节点不属于任何组时直接上报。
    pub async fn select_node(&self, name: &str) -> Result<()> {
        let _guard = self.inner.selection.lock().await;

        if !self.is_running() {
            *self.inner.selected.write().await = Some(name.to_string());
            debug!(node = name, "local-only selection (core not running)");
            return Ok(());
        }

        let owning_group = {
            let groups = self.inner.groups.read().await;
            groups
                .iter()
                .find(|g| g.members.iter().any(|m| m == name))
                .map(|g| g.name.clone())
        };
        let Some(group) = owning_group else {
            return Err(Error::NodeNotInAnyGroup(name.to_string()));
        };

        self.inner.api.select(&group, name).await?;

        {
            let mut groups = self.inner.groups.write().await;
            if let Some(g) = groups.iter_mut().find(|g| g.name == group) {
                g.now = Some(name.to_string());
            }
        }
        *self.inner.selected.write().await = Some(name.to_string());
        info!(node = name, group = %group, "node selected");
        Ok(())
    }

    /// 单节点延迟探测。超时/非 2xx 记为 Failed——这是操作的正常
    /// 结果之一，不是错误。
    pub async fn test_node_delay(&self, name: &str) -> NodeLatency {
        let settings = &self.inner.settings;
        let latency = match self
            .inner
            .api
            .delay(name, &settings.probe_url, settings.probe_timeout_ms)
            .await
        {
            Ok(ms) => NodeLatency::Millis(ms),
            Err(e) => {
                debug!(node = name, error = %e, "delay probe failed");
                NodeLatency::Failed
            }
        };
        let mut nodes = self.inner.nodes.write().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.name == name) {
            node.latency = latency;
        }
        latency
    }

    /// 对所有已知节点并发探测，单个失败不影响其它节点，整批结果
    /// 一次性写回。已有一轮在途时本次调用是空操作。
    pub async fn test_all_nodes_delay(&self) {
        let Ok(_flight) = self.inner.testing_all.try_lock() else {
            debug!("latency test already in progress, skipping");
            return;
        };

        let names: Vec<String> = {
            let nodes = self.inner.nodes.read().await;
            nodes.iter().map(|n| n.name.clone()).collect()
        };
        let semaphore = Arc::new(Semaphore::new(self.inner.settings.max_inflight));

        let probes = names.into_iter().map(|name| {
            let api = self.inner.api.clone();
            let semaphore = semaphore.clone();
            let url = self.inner.settings.probe_url.clone();
            let timeout_ms = self.inner.settings.probe_timeout_ms;
            async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (name, NodeLatency::Failed);
                };
                let latency = match api.delay(&name, &url, timeout_ms).await {
                    Ok(ms) => NodeLatency::Millis(ms),
                    Err(e) => {
                        debug!(node = %name, error = %e, "delay probe failed");
                        NodeLatency::Failed
                    }
                };
                (name, latency)
            }
        });
        let results = join_all(probes).await;

        {
            let mut nodes = self.inner.nodes.write().await;
            for (name, latency) in results {
                if let Some(node) = nodes.iter_mut().find(|n| n.name == name) {
                    node.latency = latency;
                }
            }
        }
        info!("latency test batch complete");
    }

    /// 全量测一轮延迟后选出最快节点。没有任何成功测量时不动。
    pub async fn select_fastest_node(&self) -> Result<Option<String>> {
        self.test_all_nodes_delay().await;

        let fastest = {
            let nodes = self.inner.nodes.read().await;
            nodes
                .iter()
                .filter_map(|n| n.latency.millis().map(|ms| (ms, n.name.clone())))
                .min_by_key(|(ms, _)| *ms)
                .map(|(_, name)| name)
        };
        match fastest {
            Some(name) => {
                self.select_node(&name).await?;
                Ok(Some(name))
            }
            None => {
                debug!("no node has a successful measurement, keeping selection");
                Ok(None)
            }
        }
    }

    // ─── 派生视图（纯函数，无副作用）──────────────────────────────

    /// 按延迟升序；未测/失败的排在所有有测量的之后，彼此间保持
    /// 原有顺序。
    pub async fn sorted_by_latency(&self) -> Vec<ProxyNode> {
        let mut nodes = self.inner.nodes.read().await.clone();
        nodes.sort_by_key(|n| n.latency.sort_key());
        nodes
    }

    pub async fn fast_nodes(&self) -> Vec<ProxyNode> {
        let threshold = self.inner.settings.fast_threshold_ms;
        self.inner
            .nodes
            .read()
            .await
            .iter()
            .filter(|n| n.latency.millis().is_some_and(|ms| ms < threshold))
            .cloned()
            .collect()
    }

    pub async fn nodes_by_region(&self) -> HashMap<&'static str, Vec<ProxyNode>> {
        let nodes = self.inner.nodes.read().await;
        let mut buckets: HashMap<&'static str, Vec<ProxyNode>> = HashMap::new();
        for node in nodes.iter() {
            buckets.entry(region_of(&node.name)).or_default().push(node.clone());
        }
        buckets
    }

    pub async fn stats(&self) -> NodeStats {
        let nodes = self.inner.nodes.read().await;
        let threshold = self.inner.settings.fast_threshold_ms;
        let measured: Vec<u64> = nodes.iter().filter_map(|n| n.latency.millis()).collect();
        let mean = if measured.is_empty() {
            None
        } else {
            Some(measured.iter().sum::<u64>() / measured.len() as u64)
        };
        NodeStats {
            total: nodes.len(),
            tested: measured.len(),
            fast: measured.iter().filter(|ms| **ms < threshold).count(),
            mean_latency_ms: mean,
        }
    }

    // ─── 健康检查 ─────────────────────────────────────────────────

    /// 当前选中节点不健康（失败或超过阈值）时自动改选最快节点。
    /// 返回改选后的节点名。
    pub async fn health_check_once(&self) -> Result<Option<String>> {
        if !self.inner.settings.health_check_enabled {
            return Ok(None);
        }
        let Some(selected) = self.selected_node().await else {
            return Ok(None);
        };
        let unhealthy = {
            let nodes = self.inner.nodes.read().await;
            match nodes.iter().find(|n| n.name == selected) {
                Some(node) => match node.latency {
                    NodeLatency::Failed => true,
                    NodeLatency::Millis(ms) => ms > self.inner.settings.unhealthy_threshold_ms,
                    NodeLatency::Untested => false,
                },
                // 悬空的选中名：没有数据，不动
                None => false,
            }
        };
        if !unhealthy {
            return Ok(None);
        }
        warn!(node = %selected, "selected node unhealthy, reselecting");
        self.select_fastest_node().await
    }

    /// 周期健康检查循环，由调用方 spawn。瞬时失败只记日志。
    pub async fn run_health_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.settings.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // 首个 tick 立即到期，跳过它
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.is_running() {
                continue;
            }
            if let Err(e) = self.health_check_once().await {
                debug!(error = %e, "health check skipped");
            }
        }
    }
}

/// 把实时 /proxies 条目切成节点和组。内置 direct/reject 完全排除；
/// 实时 API 不暴露 server/port，留空。按名字排序保证确定性。
pub(crate) fn partition_live(
    entries: HashMap<String, ProxyEntry>,
) -> (Vec<ProxyNode>, Vec<ProxyGroup>) {
    let mut nodes = Vec::new();
    let mut groups = Vec::new();
    for (name, entry) in entries {
        if entry.is_builtin() {
            continue;
        }
        if entry.is_group() {
            groups.push(ProxyGroup {
                name,
                strategy: GroupStrategy::from_tag(&entry.entry_type),
                members: entry.all.unwrap_or_default(),
                now: entry.now,
                test_url: None,
                interval: None,
            });
        } else {
            nodes.push(ProxyNode {
                name,
                proxy_type: entry.entry_type,
                server: None,
                port: None,
                latency: NodeLatency::Untested,
            });
        }
    }
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    (nodes, groups)
}

/// 静态配置来源：节点细节齐全
pub(crate) fn partition_static(config: &ClashConfig) -> (Vec<ProxyNode>, Vec<ProxyGroup>) {
    let nodes = config
        .proxies
        .iter()
        .filter(|p| !matches!(p.proxy_type.to_ascii_lowercase().as_str(), "direct" | "reject"))
        .map(|p| ProxyNode {
            name: p.name.clone(),
            proxy_type: p.proxy_type.clone(),
            server: p.server.clone(),
            port: p.port,
            latency: NodeLatency::Untested,
        })
        .collect();
    let groups = config
        .proxy_groups
        .iter()
        .map(|g| ProxyGroup {
            name: g.name.clone(),
            strategy: GroupStrategy::from_tag(&g.group_type),
            members: g.proxies.clone(),
            now: None,
            test_url: g.url.clone(),
            interval: g.interval,
        })
        .collect();
    (nodes, groups)
}
