use std::time::Duration;

use portbridge_proto::ControlMessage;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::messenger::Messenger;

/// Decoded control-channel events, posted by the receive loop onto a
/// channel consumed by a single coordinator task. Posting rather than
/// invoking a callback inline means a send failure discovered while
/// handling one event never re-enters the coordinator while it still
/// holds state for another — see `ControlLost`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Forward {
        remote_conn_id: u32,
        service: u32,
        payload: Vec<u8>,
    },
    OpenConnection {
        remote_conn_id: u32,
        service: u32,
    },
    CloseConnection {
        remote_conn_id: u32,
    },
    Ping,
    /// The control connection is gone (read error, decode error, or a
    /// send failure reported by a caller of [`ControlOverlay::send`]
    /// methods). Ends the current control epoch.
    ControlLost(String),
}

impl From<ControlMessage> for ControlEvent {
    fn from(message: ControlMessage) -> Self {
        match message {
            ControlMessage::Forward {
                remote_conn_id,
                service,
                payload,
            } => ControlEvent::Forward {
                remote_conn_id,
                service,
                payload,
            },
            ControlMessage::OpenConnection {
                remote_conn_id,
                service,
            } => ControlEvent::OpenConnection {
                remote_conn_id,
                service,
            },
            ControlMessage::CloseConnection { remote_conn_id } => {
                ControlEvent::CloseConnection { remote_conn_id }
            }
            ControlMessage::Ping => ControlEvent::Ping,
        }
    }
}

/// Typed send/receive overlay on top of a [`Messenger`]. One instance
/// covers one control epoch: once its receive loop observes an error, or
/// any `send_*` call fails, it posts `ControlEvent::ControlLost` onto the
/// shared event channel exactly once per failure and the sender's own
/// error is still returned to its caller.
pub struct ControlOverlay<S> {
    messenger: std::sync::Arc<Messenger<S>>,
    events: mpsc::Sender<ControlEvent>,
}

impl<S> ControlOverlay<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits `stream`, spawns the receive loop, and returns the overlay
    /// (for sending) paired with the channel the coordinator reads
    /// events from. The same channel backs both the receive loop and any
    /// `send_*` failure, so the coordinator never needs to watch more
    /// than one source of truth for "the control connection is gone".
    pub fn new(stream: S, timeout: Duration) -> (Self, mpsc::Receiver<ControlEvent>) {
        let (messenger, mut read_half) = Messenger::split(stream, timeout);
        let messenger = std::sync::Arc::new(messenger);
        let (tx, rx) = mpsc::channel(64);

        let recv_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match Messenger::<S>::recv(&mut read_half, timeout).await {
                    Ok(message) => {
                        if recv_tx.send(ControlEvent::from(message)).await.is_err() {
                            // coordinator gone; nothing left to post to.
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = recv_tx.send(ControlEvent::ControlLost(err.to_string())).await;
                        return;
                    }
                }
            }
        });

        (
            Self {
                messenger,
                events: tx,
            },
            rx,
        )
    }

    /// Posts `ControlLost` for a send failure; never invoked inline from
    /// the coordinator's own context, only from whichever task's `send_*`
    /// call just failed.
    async fn report_send_failure(&self, reason: String) -> String {
        let _ = self.events.send(ControlEvent::ControlLost(reason.clone())).await;
        reason
    }

    pub async fn send_forward(
        &self,
        remote_conn_id: u32,
        service: u32,
        payload: Vec<u8>,
    ) -> Result<(), String> {
        match self
            .messenger
            .send(&ControlMessage::Forward {
                remote_conn_id,
                service,
                payload,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.report_send_failure(err.to_string()).await),
        }
    }

    pub async fn send_open_connection(
        &self,
        remote_conn_id: u32,
        service: u32,
    ) -> Result<(), String> {
        match self
            .messenger
            .send(&ControlMessage::OpenConnection {
                remote_conn_id,
                service,
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.report_send_failure(err.to_string()).await),
        }
    }

    pub async fn send_close_connection(&self, remote_conn_id: u32) -> Result<(), String> {
        match self
            .messenger
            .send(&ControlMessage::CloseConnection { remote_conn_id })
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.report_send_failure(err.to_string()).await),
        }
    }

    pub async fn send_ping(&self) -> Result<(), String> {
        match self.messenger.send(&ControlMessage::Ping).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.report_send_failure(err.to_string()).await),
        }
    }
}

impl<S> Clone for ControlOverlay<S> {
    fn clone(&self) -> Self {
        Self {
            messenger: self.messenger.clone(),
            events: self.events.clone(),
        }
    }
}
