use std::sync::Arc;

use portbridge_connectivity::{BoxedStream, ConnectionFactory};
use portbridge_messenger::{ControlEvent, ControlOverlay};
use portbridge_splice::SpliceProxy;
use rand::RngCore;
use tokio::io::AsyncReadExt;

use crate::config::RelayConfig;
use crate::tunnel::{new_client_table, ClientTable};

/// Owns the client table and drives one control epoch on the Server
/// side: accepting public client connections, asking the Agent to open
/// a matching transfer connection for each one, and pairing transfer
/// sockets back up with their waiting client as they arrive.
pub struct Relay {
    client_factory: Arc<dyn ConnectionFactory>,
    transfer_factory: Arc<dyn ConnectionFactory>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(
        client_factory: Arc<dyn ConnectionFactory>,
        transfer_factory: Arc<dyn ConnectionFactory>,
        config: RelayConfig,
    ) -> Self {
        Self {
            client_factory,
            transfer_factory,
            config,
        }
    }

    /// Runs one control epoch to completion: binds fresh client and
    /// transfer listeners, drives control events until the connection
    /// is lost, then tears both listeners and the client table down.
    /// A bind failure ends the epoch immediately; the caller's
    /// reconnect loop decides how long to wait before the next one.
    pub async fn run_epoch(&self, control_stream: BoxedStream) {
        let client_listener = match self.client_factory.listen().await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%err, "could not bind client listener, aborting epoch");
                return;
            }
        };
        let transfer_listener = match self.transfer_factory.listen().await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(%err, "could not bind transfer listener, aborting epoch");
                return;
            }
        };

        let (overlay, mut events) = ControlOverlay::new(control_stream, self.config.ping_timeout);
        let table = new_client_table();

        let keep_alive = self.spawn_keep_alive(overlay.clone());
        let client_accept = spawn_client_accept_loop(client_listener, table.clone(), overlay.clone());
        let transfer_accept = spawn_transfer_accept_loop(transfer_listener, table.clone());

        let loss_reason = loop {
            match events.recv().await {
                Some(ControlEvent::Forward {
                    remote_conn_id,
                    payload,
                    ..
                }) => {
                    Self::handle_forward(remote_conn_id, payload, &table, &overlay).await;
                }
                Some(ControlEvent::CloseConnection { remote_conn_id }) => {
                    Self::handle_close_connection(remote_conn_id, &table).await;
                }
                Some(ControlEvent::OpenConnection { remote_conn_id, .. }) => {
                    tracing::debug!(remote_conn_id, "ignoring unexpected open-connection from agent");
                }
                Some(ControlEvent::Ping) => {
                    tracing::debug!("received ping from agent");
                }
                Some(ControlEvent::ControlLost(reason)) => break reason,
                None => break "control event channel closed".to_string(),
            }
        };

        tracing::warn!(reason = %loss_reason, "control connection lost, closing listeners and pending clients");
        keep_alive.abort();
        client_accept.abort();
        transfer_accept.abort();
        table.lock().await.clear();
    }

    fn spawn_keep_alive(&self, overlay: ControlOverlay<BoxedStream>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            if interval.is_zero() {
                tracing::warn!("keep-alive pings disabled (ping interval is zero)");
                return;
            }
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = overlay.send_ping().await {
                    tracing::warn!(%err, "ping failed, stopping keep-alive");
                    return;
                }
            }
        })
    }

    async fn handle_forward(
        id: u32,
        payload: Vec<u8>,
        table: &ClientTable,
        overlay: &ControlOverlay<BoxedStream>,
    ) {
        let mut table_guard = table.lock().await;
        let Some(client_stream) = table_guard.get_mut(&id) else {
            tracing::debug!(id, "forward for unknown or already-paired client, dropping");
            drop(table_guard);
            let _ = overlay.send_close_connection(id).await;
            return;
        };
        if let Err(err) = tokio::io::AsyncWriteExt::write_all(client_stream, &payload).await {
            tracing::error!(id, %err, "write to client connection failed, dropping it");
            table_guard.remove(&id);
            drop(table_guard);
            let _ = overlay.send_close_connection(id).await;
        }
    }

    async fn handle_close_connection(id: u32, table: &ClientTable) {
        tracing::info!(id, "closing client connection on agent request");
        if table.lock().await.remove(&id).is_none() {
            tracing::debug!(id, "close request for unknown client, ignoring");
        }
    }
}

/// Rejection-sampled tunnel ids: the original draws a plain
/// `rand.Uint32()` with no collision check, which can in principle
/// hand two different clients the same id while both are pending.
/// Looping until the id is not already in the table removes that
/// possibility at a negligible cost given the table's expected size.
fn next_tunnel_id(table_guard: &std::collections::HashMap<u32, BoxedStream>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.next_u32();
        if !table_guard.contains_key(&id) {
            return id;
        }
    }
}

fn spawn_client_accept_loop(
    mut listener: Box<dyn portbridge_connectivity::Listener>,
    table: ClientTable,
    overlay: ControlOverlay<BoxedStream>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let client_stream = match listener.accept().await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(%err, "client accept failed, stopping client listener");
                    return;
                }
            };

            let id = {
                let mut table_guard = table.lock().await;
                let id = next_tunnel_id(&table_guard);
                table_guard.insert(id, client_stream);
                id
            };

            tracing::info!(id, "accepted client connection, asking agent to open transfer connection");
            if overlay.send_open_connection(id, 0).await.is_err() {
                table.lock().await.remove(&id);
                return;
            }
        }
    })
}

fn spawn_transfer_accept_loop(
    mut listener: Box<dyn portbridge_connectivity::Listener>,
    table: ClientTable,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let transfer_stream = match listener.accept().await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(%err, "transfer accept failed, stopping transfer listener");
                    return;
                }
            };
            let table = table.clone();
            tokio::spawn(pair_transfer_connection(transfer_stream, table));
        }
    })
}

async fn pair_transfer_connection(mut transfer_stream: BoxedStream, table: ClientTable) {
    let mut id_buf = [0u8; 4];
    if let Err(err) = transfer_stream.read_exact(&mut id_buf).await {
        tracing::warn!(%err, "transfer connection closed before sending its tunnel id");
        return;
    }
    let id = u32::from_le_bytes(id_buf);

    let client_stream = table.lock().await.remove(&id);
    let Some(client_stream) = client_stream else {
        tracing::warn!(id, "transfer connection for unknown or already-paired client, dropping");
        return;
    };

    SpliceProxy::new(transfer_stream, client_stream).run_async();
}

#[cfg(test)]
mod tests {
    use super::*;
    use portbridge_connectivity::TcpConnectionFactory;
    use portbridge_messenger::Messenger;
    use portbridge_proto::ControlMessage;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    async fn control_socket_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let relay_side = tokio::net::TcpStream::connect(addr).await.unwrap();
        (accept.await.unwrap(), relay_side)
    }

    async fn free_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn accepted_client_triggers_open_connection_and_pairs_with_transfer_socket() {
        let client_addr = free_address().await;
        let transfer_addr = free_address().await;
        let (agent_side, relay_control) = control_socket_pair().await;

        let relay = Relay::new(
            Arc::new(TcpConnectionFactory::new("tcp", client_addr.clone())),
            Arc::new(TcpConnectionFactory::new("tcp", transfer_addr.clone())),
            RelayConfig {
                ping_interval: Duration::ZERO,
                ping_timeout: Duration::ZERO,
            },
        );

        let epoch = tokio::spawn(async move {
            relay
                .run_epoch(portbridge_connectivity::box_stream(relay_control))
                .await;
        });

        // give the epoch a moment to bind both listeners.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = tokio::net::TcpStream::connect(&client_addr).await.unwrap();

        let (_agent_messenger, mut agent_read_half) = Messenger::split(agent_side, Duration::ZERO);
        let open = Messenger::recv(&mut agent_read_half, Duration::ZERO)
            .await
            .unwrap();
        let ControlMessage::OpenConnection { remote_conn_id, .. } = open else {
            panic!("expected an open-connection message, got {open:?}");
        };

        let mut transfer = tokio::net::TcpStream::connect(&transfer_addr).await.unwrap();
        transfer.write_all(&remote_conn_id.to_le_bytes()).await.unwrap();

        client.write_all(b"from-client").await.unwrap();
        let mut buf = [0u8; 11];
        transfer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-client");

        transfer.write_all(b"from-agent!").await.unwrap();
        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-agent!");

        drop(client);
        drop(transfer);
        drop(agent_read_half);
        let _ = tokio::time::timeout(Duration::from_secs(1), epoch).await;
    }

    #[tokio::test]
    async fn close_connection_for_unknown_id_is_ignored() {
        let table = new_client_table();
        Relay::handle_close_connection(99, &table).await;
        assert!(table.lock().await.is_empty());
    }

    #[tokio::test]
    async fn forward_for_unknown_id_triggers_close_connection_reply() {
        let table = new_client_table();
        let (agent_side, relay_control) = control_socket_pair().await;
        let (overlay, _events) =
            ControlOverlay::new(portbridge_connectivity::box_stream(relay_control), Duration::ZERO);

        Relay::handle_forward(7, b"ignored".to_vec(), &table, &overlay).await;
        assert!(table.lock().await.is_empty());

        let (_agent_messenger, mut agent_read_half) = Messenger::split(agent_side, Duration::ZERO);
        let reply = Messenger::recv(&mut agent_read_half, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reply, ControlMessage::CloseConnection { remote_conn_id: 7 });
    }
}
