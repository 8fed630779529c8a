//! 流量采样
//!
//! 每秒从控制 API 读一次累计计数器，差分出瞬时速率。核心的计数器
//! 单调递增，但核心重启会清零——计数回退视为基线重置而不是错误。
//! 采样失败一律吞掉：核心停止或重启窗口内失败是常态，不是用户
//! 可见错误。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

use crate::api::ControlApiClient;
use crate::app::supervisor::CoreState;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// 一次计数器读数
#[derive(Debug, Clone, Copy)]
pub struct TrafficSample {
    pub up: u64,
    pub down: u64,
    pub at: Instant,
}

/// 瞬时速率（字节/秒）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficRates {
    pub up_bps: u64,
    pub down_bps: u64,
}

/// 相邻两次读数差分出速率。任一计数器回退说明核心重启过，
/// 当前读数成为新基线，本轮速率归零，绝不报负。
pub fn derive_rates(prev: &TrafficSample, cur: &TrafficSample) -> TrafficRates {
    let elapsed = cur.at.duration_since(prev.at).as_secs_f64();
    if elapsed <= 0.0 {
        return TrafficRates::default();
    }
    if cur.up < prev.up || cur.down < prev.down {
        return TrafficRates::default();
    }
    TrafficRates {
        up_bps: ((cur.up - prev.up) as f64 / elapsed) as u64,
        down_bps: ((cur.down - prev.down) as f64 / elapsed) as u64,
    }
}

struct Inner {
    api: ControlApiClient,
    interval: Duration,
    core_state: watch::Receiver<CoreState>,
    rates: watch::Sender<TrafficRates>,
}

/// Periodic traffic poller. Only samples while the core is Running;
/// leaving Running clears the baseline so a restart never produces a
/// bogus delta.
#[derive(Clone)]
pub struct TrafficSampler {
    inner: Arc<Inner>,
}

impl TrafficSampler {
    pub fn new(api: ControlApiClient, core_state: watch::Receiver<CoreState>) -> Self {
        Self::with_interval(api, core_state, DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn with_interval(
        api: ControlApiClient,
        core_state: watch::Receiver<CoreState>,
        interval: Duration,
    ) -> Self {
        let (rates, _) = watch::channel(TrafficRates::default());
        Self {
            inner: Arc::new(Inner {
                api,
                interval,
                core_state,
                rates,
            }),
        }
    }

    /// 最近一次计算出的速率快照
    pub fn rates(&self) -> TrafficRates {
        *self.inner.rates.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrafficRates> {
        self.inner.rates.subscribe()
    }

    /// 采样循环，由调用方 spawn。核心不在 Running 态时挂起等状态
    /// 变化；tick 落后时跳过而不是排队补发。
    pub async fn run(&self) {
        let mut state = self.inner.core_state.clone();
        let mut prev: Option<TrafficSample> = None;
        let mut ticker = tokio::time::interval(self.inner.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *state.borrow_and_update() != CoreState::Running {
                prev = None;
                self.publish(TrafficRates::default());
                if state.changed().await.is_err() {
                    return;
                }
                ticker.reset();
                continue;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.inner.api.traffic().await {
                        Ok(reading) => {
                            let cur = TrafficSample {
                                up: reading.up,
                                down: reading.down,
                                at: Instant::now(),
                            };
                            if let Some(p) = prev {
                                self.publish(derive_rates(&p, &cur));
                            }
                            prev = Some(cur);
                        }
                        // 核心停止/重启窗口内的失败是预期的，跳过本轮
                        Err(e) => debug!(error = %e, "traffic sample skipped"),
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn publish(&self, rates: TrafficRates) {
        self.inner.rates.send_replace(rates);
    }
}
