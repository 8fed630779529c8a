pub mod mode;
pub mod nodes;
pub mod session;
pub mod supervisor;
pub mod system_proxy;
pub mod traffic;

pub use mode::RoutingMode;
pub use nodes::{NodeLatency, NodeRegistry, NodeSource, ProxyGroup, ProxyNode, RegistrySettings};
pub use session::{Session, SessionSettings, StartReport, StopReport, ToggleOutcome};
pub use supervisor::{CoreEvent, CoreState, CoreSupervisor, SupervisorSettings};
pub use system_proxy::{NetworksetupProxy, NoopSystemProxy, ProxyEndpoints, SystemProxy};
pub use traffic::{TrafficRates, TrafficSampler};
