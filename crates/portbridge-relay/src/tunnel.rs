use std::collections::HashMap;
use std::sync::Arc;

use portbridge_connectivity::BoxedStream;
use tokio::sync::Mutex;

/// Client sockets waiting to be paired with a transfer socket, keyed by
/// the tunnel id the Relay handed out when it accepted them. An entry
/// is removed the moment its transfer socket arrives and the two are
/// handed to the splice proxy; the original removes the entry only
/// when the splice itself finishes, but Rust ownership does not allow
/// a socket to sit in both the table and a running splice at once, so
/// removal happens at pairing time instead.
pub type ClientTable = Arc<Mutex<HashMap<u32, BoxedStream>>>;

pub fn new_client_table() -> ClientTable {
    Arc::new(Mutex::new(HashMap::new()))
}
