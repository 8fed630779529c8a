pub mod client;
pub mod models;

pub use client::ControlApiClient;
pub use models::{ProxyEntry, TrafficReading};
