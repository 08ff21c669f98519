//! Shared view of every agent that has contacted the server.

mod registry;

pub use registry::{AgentFilter, FleetEvent, FleetRegistry};
