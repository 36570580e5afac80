//! The Relay (Server) endpoint: accepts public client connections,
//! asks the Agent over the control channel to open a matching transfer
//! connection for each one, and pairs the two together once the
//! transfer socket arrives.

mod config;
mod relay;
mod tunnel;

pub use config::RelayConfig;
pub use relay::Relay;
