//! Acoustics kernel: device state, monitor feed ingestion, timeline dispatch
//! to the external scheduler and live fan-out to dashboards.

pub mod audit;
pub mod config;
pub mod devices;
pub mod health;
pub mod http;
pub mod hub;
pub mod inbound;
pub mod log_store;
pub mod models;
pub mod monitor;
pub mod scheduler;
pub mod state;
pub mod timeline;

pub use devices::DeviceStore;
pub use hub::BroadcastHub;
pub use log_store::{BoundedLog, LogStores};
pub use monitor::MonitorClient;
pub use timeline::TimelineService;
