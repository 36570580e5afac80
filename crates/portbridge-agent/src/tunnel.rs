use std::collections::HashMap;
use std::sync::Arc;

use portbridge_connectivity::BoxedStream;
use tokio::io::WriteHalf;
use tokio::sync::{oneshot, Mutex};

/// A tunnel opened by a `Forward` message: the write half of the local
/// service socket, plus a cancel signal for its read pump so that
/// tearing the tunnel down (from the coordinator) eventually drops both
/// the read pump's `ReadHalf` and this `WriteHalf`, closing the
/// underlying socket.
pub struct LocalTunnel {
    pub write_half: WriteHalf<BoxedStream>,
    pub cancel: oneshot::Sender<()>,
}

pub type TunnelTable = Arc<Mutex<HashMap<u32, LocalTunnel>>>;
