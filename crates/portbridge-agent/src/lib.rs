//! The Agent endpoint: holds the outbound control connection, dials the
//! local service on demand, and drives the transfer-socket splice path.

mod agent;
mod config;
mod tunnel;

pub use agent::Agent;
pub use config::AgentConfig;
