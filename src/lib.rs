//! CoreLink: 外部代理核心的本地管家。
//!
//! 负责核心进程的生命周期、控制 API 交互、节点选择与延迟测试、
//! 流量采样、配置 profile 管理和系统代理开关。不做任何流量转发，
//! 数据面完全归核心进程。

pub mod api;
pub mod app;
pub mod common;
pub mod config;

pub use api::ControlApiClient;
pub use app::{CoreState, CoreSupervisor, NodeRegistry, Session, TrafficSampler};
pub use common::{Error, ErrorKind, Result};
