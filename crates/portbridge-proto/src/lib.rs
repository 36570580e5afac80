//! Wire schema shared by the control messenger, agent, and relay.

mod message;

pub use message::{ControlMessage, ProtoError};

/// Current wire version. Bumped whenever `ControlMessage`'s on-wire shape
/// changes in a way that breaks compatibility with a previous build.
pub const WIRE_VERSION: u16 = 1;

/// Maximum accepted frame length, guarding the messenger against a
/// corrupt or hostile length prefix before it allocates a read buffer.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
