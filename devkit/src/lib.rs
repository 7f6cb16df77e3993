/*!
# Acoustics DevKit - Test support for the acoustics kernel

- Scratch-dir harness with fake scheduler scripts
- Mock monitor WebSocket server
- Feed message and timeline fixtures
*/

pub mod message_builders;
pub mod monitor_stub;
pub mod test_utils;

pub use message_builders::{MonitorMessageBuilder, TimelineBuilder};
pub use monitor_stub::MockMonitorServer;
pub use test_utils::{wait_until, wait_until_async, TestHarness};
