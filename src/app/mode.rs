//! 路由模式
//!
//! 三种模式:
//! - Rule: 走规则路由（默认）
//! - Global: 所有流量走选中的代理出站
//! - Direct: 所有流量直连

/// Core routing mode, wire-compatible with `PATCH /configs`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoutingMode {
    /// Route traffic based on rules (default)
    #[default]
    Rule,
    /// Route all traffic through the selected proxy
    Global,
    /// Route all traffic directly
    Direct,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Global => "global",
            Self::Direct => "direct",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rule" | "rules" => Some(Self::Rule),
            "global" => Some(Self::Global),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
