//! Bidirectional byte-splice between two owned streams.
//!
//! Each direction runs as its own spawned task so a panic in one copy
//! loop is caught by its `JoinHandle` rather than unwinding the other
//! direction or the process; `run()` treats a panicked copy task the
//! same as one that finished normally, per the "either direction
//! finishing ends the whole splice" contract. The two tasks share a
//! [`Notify`] so that whichever direction ends first (EOF, error, or
//! panic) promptly shuts down the other, rather than relying on the
//! remote peer to notice the half-close and hang up on its own.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Splices `a` and `b` together until either direction's copy completes
/// (clean EOF, error, or panic), then runs `on_finished` exactly once.
pub struct SpliceProxy<A, B> {
    a: A,
    b: B,
    on_finished: Option<Box<dyn FnOnce() + Send>>,
}

impl<A, B> SpliceProxy<A, B>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(a: A, b: B) -> Self {
        Self {
            a,
            b,
            on_finished: None,
        }
    }

    /// Registers a callback run once both copy directions have ended.
    pub fn on_finished(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finished = Some(Box::new(callback));
        self
    }

    /// Runs the splice to completion on the current task.
    pub async fn run(self) {
        let (a_read, a_write) = tokio::io::split(self.a);
        let (b_read, b_write) = tokio::io::split(self.b);
        let finished = Arc::new(Notify::new());

        let a_to_b: JoinHandle<()> = tokio::spawn(race_copy(a_read, b_write, "a->b", finished.clone()));
        let b_to_a: JoinHandle<()> = tokio::spawn(race_copy(b_read, a_write, "b->a", finished));

        // Whichever direction ends first wakes the other via `finished`,
        // so this join completes as soon as one side closes rather than
        // waiting on the other peer to notice and hang up in turn.
        let _ = tokio::join!(a_to_b, b_to_a);

        if let Some(callback) = self.on_finished {
            callback();
        }
    }

    /// Spawns `run` as its own task and returns its handle.
    pub fn run_async(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Copies `reader` into `writer` until EOF/error, or until `finished` is
/// woken by the opposite direction's copy ending first. Either way, a
/// guard wakes `finished` again on the way out — including on panic
/// unwind — so the peer task is never left waiting on a direction that
/// already died.
async fn race_copy<R, W>(mut reader: R, mut writer: W, label: &'static str, finished: Arc<Notify>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    struct WakeOnDrop(Arc<Notify>);
    impl Drop for WakeOnDrop {
        fn drop(&mut self) {
            self.0.notify_one();
        }
    }
    let _wake_on_drop = WakeOnDrop(finished.clone());

    let cancelled = finished.notified();
    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => {
            match result {
                Ok(bytes) => tracing::debug!(direction = label, bytes, "splice direction finished"),
                Err(err) => tracing::debug!(direction = label, %err, "splice direction ended with an error"),
            }
        }
        _ = cancelled => {
            tracing::debug!(direction = label, "splice direction closed because its peer direction ended");
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
}
