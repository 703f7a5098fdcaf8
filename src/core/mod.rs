//! Provisioning agent runtime.
//!
//! Bottom-up: [`crypto`] and [`certs`] handle key material, [`control_plane`]
//! talks to the backend, [`provisioning`] chains those into flows,
//! [`orchestrator`] drives the flows from the reported status, and
//! [`telemetry`] publishes once the device holds its identity, gated by
//! [`connectivity`].

pub mod certs;
pub mod connectivity;
pub mod control_plane;
pub mod crypto;
pub mod error;
pub mod orchestrator;
pub mod provisioning;
pub mod status;
pub mod telemetry;

pub use error::AgentError;
pub use status::DeviceStatus;
