//! Liveness registry: an in-memory table of services with heartbeat-based
//! staleness eviction, the HTTP surface that exposes it, and the client
//! library services use to register, heartbeat and discover each other.

pub mod client;
pub mod clock;
pub mod http;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod types;

pub use client::{HeartbeatEvent, RegistryClient, ServiceRegistration};
pub use clock::{Clock, ManualClock, SystemClock};
pub use server::RegistryServer;
pub use store::RegistryStore;
pub use sweeper::StaleSweeper;
pub use types::{Metadata, ServiceInfo, ServiceRecord, ServiceUpdate};
