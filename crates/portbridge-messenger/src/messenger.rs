use std::time::Duration;

use portbridge_proto::{ControlMessage, ProtoError, MAX_FRAME_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("control socket read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("control socket write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("frame length {0} exceeds the {1}-byte maximum")]
    FrameTooLarge(u32, u32),
    #[error("timed out waiting for the control socket")]
    Timeout,
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// The write side of a framed control connection. The read side is
/// handed off (via [`Messenger::split`]) to whichever task owns the
/// receive loop, since `tokio::io::split`'s halves are independently
/// `'static` and a single spawned task is the only safe way to drive
/// reads concurrently with writes.
pub struct Messenger<S> {
    writer: Mutex<WriteHalf<S>>,
    timeout: Duration,
}

impl<S> Messenger<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits `stream` into this messenger's write half (kept here,
    /// behind a lock so only one send is ever in flight) and the raw
    /// read half, returned to the caller to drive a receive loop with.
    ///
    /// `timeout` bounds both sends and receives; zero disables the
    /// bound, matching the original's "0 = no read/write deadline"
    /// convention.
    pub fn split(stream: S, timeout: Duration) -> (Self, ReadHalf<S>) {
        let (read_half, write_half) = tokio::io::split(stream);
        (
            Self {
                writer: Mutex::new(write_half),
                timeout,
            },
            read_half,
        )
    }

    /// Encodes and writes `message`. On any encode or write error the
    /// write half is shut down before the error is returned, so a
    /// broken control connection can never be reused for a later send
    /// within the same epoch.
    pub async fn send(&self, message: &ControlMessage) -> Result<(), MessengerError> {
        let mut writer = self.writer.lock().await;
        let result: Result<(), MessengerError> = async {
            let body = message.encode()?;
            let len = body.len() as u32;
            let write = async {
                writer.write_all(&len.to_le_bytes()).await?;
                writer.write_all(&body).await?;
                writer.flush().await
            };
            with_timeout(self.timeout, write)
                .await
                .map_err(MessengerError::Write)
        }
        .await;

        if result.is_err() {
            let _ = writer.shutdown().await;
        }
        result
    }

    /// Reads exactly one framed [`ControlMessage`] from `read_half`.
    /// A free function rather than a method so it can be called from a
    /// task that owns the `ReadHalf` without also needing a reference
    /// to the `Messenger` (and thus to its write-side lock).
    pub async fn recv(
        read_half: &mut ReadHalf<S>,
        timeout: Duration,
    ) -> Result<ControlMessage, MessengerError> {
        let read = async {
            let mut len_buf = [0u8; 4];
            read_half.read_exact(&mut len_buf).await?;
            let len = u32::from_le_bytes(len_buf);
            if len > MAX_FRAME_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
                ));
            }
            let mut body = vec![0u8; len as usize];
            read_half.read_exact(&mut body).await?;
            Ok(body)
        };
        let body = with_timeout(timeout, read)
            .await
            .map_err(MessengerError::Read)?;
        Ok(ControlMessage::decode(&body)?)
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "control socket operation timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::net::{TcpListener, TcpStream};

    /// A stream whose every write fails, used to check that `send`
    /// shuts down the write half on error rather than leaving it open
    /// for reuse.
    struct FailingStream {
        shutdown_called: Arc<AtomicBool>,
    }

    impl AsyncRead for FailingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for FailingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write failed",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            self.get_mut().shutdown_called.store(true, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, _write_half) = tokio::io::split(stream);
            Messenger::<TcpStream>::recv(&mut read_half, Duration::ZERO)
                .await
                .unwrap()
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let (messenger, _read_half) = Messenger::split(client, Duration::ZERO);
        let msg = ControlMessage::OpenConnection {
            remote_conn_id: 7,
            service: 1,
        };
        messenger.send(&msg).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, _write_half) = tokio::io::split(stream);
            Messenger::<TcpStream>::recv(&mut read_half, Duration::ZERO).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_le_bytes())
            .await
            .unwrap();

        let result = server.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_failure_shuts_down_the_write_half() {
        let shutdown_called = Arc::new(AtomicBool::new(false));
        let stream = FailingStream {
            shutdown_called: shutdown_called.clone(),
        };
        let (messenger, _read_half) = Messenger::split(stream, Duration::ZERO);

        let result = messenger.send(&ControlMessage::Ping).await;

        assert!(result.is_err());
        assert!(shutdown_called.load(Ordering::SeqCst));
    }
}
