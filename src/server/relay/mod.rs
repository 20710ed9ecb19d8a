//! Frame-aware bidirectional relay
//!
//! Each direction has a reader task that pulls one frame at a time from
//! its socket and hands it to the relay loop through a [`DirectionPump`].
//! The reader does not read the next frame until the loop has written the
//! current one and acknowledged it, so at most one frame per direction is
//! in flight and per-direction order is preserved.
//!
//! The loop itself is a single biased `select!`: cancellation first, then
//! client frames, then backend frames. Cancellation is observed even while
//! both readers are blocked on their sockets.

pub mod mysql;
pub mod postgres;

pub use mysql::{MySqlFrameSource, MySqlPacket, MySqlRelayHandler};
pub use postgres::{PostgresFrameSource, PostgresRelayHandler};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ProxyError, Result};
use crate::session::{ActivityClock, CancellationSignal};

/// A stream of protocol frames read from one socket.
#[async_trait]
pub trait FrameSource: Send + 'static {
    type Frame: Send + 'static;

    async fn next_frame(&mut self) -> Result<Self::Frame>;
}

/// Why a relay ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Client sent COM_QUIT or Terminate
    ClientTerminated,
    /// Client socket closed
    ClientClosed,
    /// Backend socket closed
    BackendClosed,
    /// The session's cancellation signal fired
    Cancelled,
}

/// What the loop should do after a frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop(RelayOutcome),
}

/// Per-protocol frame handling.
///
/// `on_client_frame` forwards to the backend and records statements;
/// `on_backend_frame` forwards to the client. A handler must have fully
/// written a frame before it returns.
#[async_trait]
pub trait RelayHandler: Send {
    type ClientFrame: Send + 'static;
    type BackendFrame: Send + 'static;

    async fn on_client_frame(&mut self, frame: Self::ClientFrame) -> Result<Flow>;

    async fn on_backend_frame(&mut self, frame: Self::BackendFrame) -> Result<Flow>;

    /// Tell the client the session was terminated.
    async fn on_cancelled(&mut self) -> Result<()>;
}

/// Receiving end of one direction's reader task.
pub struct DirectionPump<F> {
    frames: mpsc::Receiver<F>,
    next: mpsc::Sender<()>,
    error: oneshot::Receiver<ProxyError>,
    task: JoinHandle<()>,
}

impl<F: Send + 'static> DirectionPump<F> {
    /// Wait for the next frame.
    ///
    /// Fails with the reader's error once the reader has stopped.
    pub async fn next(&mut self) -> Result<F> {
        match self.frames.recv().await {
            Some(frame) => Ok(frame),
            None => Err((&mut self.error)
                .await
                .unwrap_or_else(|_| ProxyError::Relay("reader stopped".into()))),
        }
    }

    /// Allow the reader to read the next frame.
    pub async fn ack(&self) {
        // A closed channel means the reader already stopped and has
        // reported why through the error channel.
        let _ = self.next.send(()).await;
    }
}

impl<F> Drop for DirectionPump<F> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a reader task for one direction.
pub fn spawn_reader<S: FrameSource>(mut source: S) -> DirectionPump<S::Frame> {
    let (frame_tx, frames) = mpsc::channel(1);
    let (next, mut next_rx) = mpsc::channel::<()>(1);
    let (error_tx, error) = oneshot::channel();

    let task = tokio::spawn(async move {
        loop {
            match source.next_frame().await {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        return;
                    }
                    if next_rx.recv().await.is_none() {
                        return;
                    }
                }
                Err(e) => {
                    // Error first, then the frame channel closes on return
                    let _ = error_tx.send(e);
                    return;
                }
            }
        }
    });

    DirectionPump {
        frames,
        next,
        error,
        task,
    }
}

/// Relay frames in both directions until one side ends or `cancel` fires.
///
/// Peer disconnects are outcomes, not errors. Any other failure is
/// returned as-is.
pub async fn run_relay<H: RelayHandler>(
    handler: &mut H,
    mut client: DirectionPump<H::ClientFrame>,
    mut backend: DirectionPump<H::BackendFrame>,
    cancel: &CancellationSignal,
    activity: Option<&ActivityClock>,
) -> Result<RelayOutcome> {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = handler.on_cancelled().await {
                    debug!("Could not notify client of termination: {}", e);
                }
                return Ok(RelayOutcome::Cancelled);
            }

            frame = client.next() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) if e.is_peer_disconnect() => return Ok(RelayOutcome::ClientClosed),
                    Err(e) => return Err(e),
                };
                if let Some(clock) = activity {
                    clock.touch();
                }
                match handler.on_client_frame(frame).await {
                    Ok(Flow::Continue) => client.ack().await,
                    Ok(Flow::Stop(outcome)) => return Ok(outcome),
                    Err(e) if e.is_peer_disconnect() => return Ok(RelayOutcome::BackendClosed),
                    Err(e) => return Err(e),
                }
            }

            frame = backend.next() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) if e.is_peer_disconnect() => return Ok(RelayOutcome::BackendClosed),
                    Err(e) => return Err(e),
                };
                if let Some(clock) = activity {
                    clock.touch();
                }
                match handler.on_backend_frame(frame).await {
                    Ok(Flow::Continue) => backend.ack().await,
                    Ok(Flow::Stop(outcome)) => return Ok(outcome),
                    Err(e) if e.is_peer_disconnect() => return Ok(RelayOutcome::ClientClosed),
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
