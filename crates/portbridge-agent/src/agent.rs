use std::sync::Arc;

use portbridge_connectivity::{BoxedStream, ConnectionFactory};
use portbridge_messenger::{ControlEvent, ControlOverlay};
use portbridge_splice::SpliceProxy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};

use crate::config::AgentConfig;
use crate::tunnel::{LocalTunnel, TunnelTable};

/// Owns the tunnel table and reacts to control events for a single
/// control epoch. A fresh `Agent::run_epoch` call starts with an empty
/// table, matching the "no state carried across epochs" invariant.
pub struct Agent {
    local_factory: Arc<dyn ConnectionFactory>,
    transfer_factory: Arc<dyn ConnectionFactory>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        local_factory: Arc<dyn ConnectionFactory>,
        transfer_factory: Arc<dyn ConnectionFactory>,
        config: AgentConfig,
    ) -> Self {
        Self {
            local_factory,
            transfer_factory,
            config,
        }
    }

    /// Runs one control epoch to completion: drives events until the
    /// control connection is lost, then drains the tunnel table and
    /// returns. The caller (the reconnect loop) decides how long to
    /// wait before starting the next epoch.
    pub async fn run_epoch(&self, control_stream: BoxedStream) {
        let (overlay, mut events) = ControlOverlay::new(control_stream, self.config.ping_timeout);
        let table: TunnelTable = Arc::new(Mutex::new(std::collections::HashMap::new()));

        let keep_alive = self.spawn_keep_alive(overlay.clone());

        let loss_reason = loop {
            match events.recv().await {
                Some(ControlEvent::Forward {
                    remote_conn_id,
                    service,
                    payload,
                }) => {
                    self.handle_forward(remote_conn_id, service, payload, &table, &overlay)
                        .await;
                }
                Some(ControlEvent::OpenConnection {
                    remote_conn_id,
                    service,
                }) => {
                    self.handle_open_connection(remote_conn_id, service).await;
                }
                Some(ControlEvent::CloseConnection { remote_conn_id }) => {
                    Self::handle_close_connection(remote_conn_id, &table).await;
                }
                Some(ControlEvent::Ping) => {
                    tracing::debug!("received ping from server");
                }
                Some(ControlEvent::ControlLost(reason)) => break reason,
                None => break "control event channel closed".to_string(),
            }
        };

        tracing::warn!(reason = %loss_reason, "control connection lost, closing all tunnels");
        keep_alive.abort();
        Self::drain(&table).await;
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
        &self,
        id: u32,
        service: u32,
        payload: Vec<u8>,
        table: &TunnelTable,
        overlay: &ControlOverlay<BoxedStream>,
    ) {
        let needs_dial = !table.lock().await.contains_key(&id);
        if needs_dial {
            tracing::info!(id, "no local connection for tunnel, opening one");
            match self.local_factory.connect().await {
                Ok(local_stream) => {
                    let (read_half, write_half) = tokio::io::split(local_stream);
                    let (cancel_tx, cancel_rx) = oneshot::channel();
                    table.lock().await.insert(
                        id,
                        LocalTunnel {
                            write_half,
                            cancel: cancel_tx,
                        },
                    );
                    spawn_local_read_pump(
                        id,
                        service,
                        read_half,
                        cancel_rx,
                        self.config.buffer_size_bytes,
                        table.clone(),
                        overlay.clone(),
                    );
                }
                Err(err) => {
                    tracing::error!(id, %err, "could not open local connection, closing tunnel");
                    let _ = overlay.send_close_connection(id).await;
                    return;
                }
            }
        }

        let mut table_guard = table.lock().await;
        let Some(tunnel) = table_guard.get_mut(&id) else {
            return;
        };
        if let Err(err) = tunnel.write_half.write_all(&payload).await {
            tracing::error!(id, %err, "write to local connection failed, closing tunnel");
            if let Some(tunnel) = table_guard.remove(&id) {
                let _ = tunnel.cancel.send(());
            }
            drop(table_guard);
            let _ = overlay.send_close_connection(id).await;
        }
    }

    async fn handle_open_connection(&self, id: u32, _service: u32) {
        let mut transfer_stream = match self.transfer_factory.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(id, %err, "could not open transfer connection, dropping request");
                return;
            }
        };

        if let Err(err) = transfer_stream.write_all(&id.to_le_bytes()).await {
            tracing::error!(id, %err, "failed to write transfer handshake");
            return;
        }

        let local_stream = match self.local_factory.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(id, %err, "could not open local connection for splice, closing transfer connection");
                let _ = transfer_stream.shutdown().await;
                return;
            }
        };

        SpliceProxy::new(transfer_stream, local_stream).run_async();
    }

    async fn handle_close_connection(id: u32, table: &TunnelTable) {
        tracing::info!(id, "closing tunnel on peer request");
        if let Some(tunnel) = table.lock().await.remove(&id) {
            let _ = tunnel.cancel.send(());
        } else {
            tracing::debug!(id, "close request for unknown tunnel, ignoring");
        }
    }

    async fn drain(table: &TunnelTable) {
        let mut table_guard = table.lock().await;
        for (_, tunnel) in table_guard.drain() {
            let _ = tunnel.cancel.send(());
        }
    }
}

fn spawn_local_read_pump(
    id: u32,
    service: u32,
    mut read_half: tokio::io::ReadHalf<BoxedStream>,
    mut cancel_rx: oneshot::Receiver<()>,
    buffer_size: usize,
    table: TunnelTable,
    overlay: ControlOverlay<BoxedStream>,
) {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; buffer_size.max(1)];
        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!(id, "local read pump cancelled");
                    return;
                }
                result = read_half.read(&mut buffer) => {
                    match result {
                        Ok(0) => {
                            tracing::warn!(id, "local connection read zero bytes, closing tunnel");
                            break;
                        }
                        Ok(n) => {
                            if overlay.send_forward(id, service, buffer[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::error!(id, %err, "local connection read failed, closing tunnel");
                            break;
                        }
                    }
                }
            }
        }
        table.lock().await.remove(&id);
        let _ = overlay.send_close_connection(id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use portbridge_connectivity::TcpConnectionFactory;
    use portbridge_messenger::Messenger;
    use portbridge_proto::ControlMessage;
    use std::time::Duration;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    async fn spawn_echo_service() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn control_socket_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        (accept.await.unwrap(), client)
    }

    #[tokio::test]
    async fn forward_to_new_tunnel_dials_local_service_and_echoes_back() {
        let echo_addr = spawn_echo_service().await;
        let (agent_side, server_side) = control_socket_pair().await;

        let agent = Agent::new(
            Arc::new(TcpConnectionFactory::new("tcp", echo_addr)),
            Arc::new(TcpConnectionFactory::new("tcp", "127.0.0.1:1")),
            AgentConfig {
                ping_interval: Duration::ZERO,
                ping_timeout: Duration::ZERO,
                buffer_size_bytes: 4096,
            },
        );

        let epoch = tokio::spawn(async move {
            agent
                .run_epoch(portbridge_connectivity::box_stream(agent_side))
                .await;
        });

        let (server_messenger, mut server_read_half) = Messenger::split(server_side, Duration::ZERO);
        server_messenger
            .send(&ControlMessage::Forward {
                remote_conn_id: 1,
                service: 0,
                payload: b"hello".to_vec(),
            })
            .await
            .unwrap();

        let echoed = Messenger::recv(&mut server_read_half, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            echoed,
            ControlMessage::Forward {
                remote_conn_id: 1,
                service: 0,
                payload: b"hello".to_vec(),
            }
        );

        drop(server_messenger);
        drop(server_read_half);
        let _ = tokio::time::timeout(Duration::from_secs(1), epoch).await;
    }

    #[tokio::test]
    async fn close_connection_for_unknown_id_is_ignored() {
        let table: TunnelTable = Arc::new(Mutex::new(std::collections::HashMap::new()));
        Agent::handle_close_connection(42, &table).await;
        assert!(table.lock().await.is_empty());
    }
}
