//! Background audit recorders
//!
//! Both recorders follow the same shape: the relay hands records over with
//! a non-blocking `try_send`, and a background task drains the bounded
//! queue into [`AuditStorage`]. A full queue drops the record and counts
//! it; the relay never waits on audit I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::record::{Command, ReplayChunk};
use super::storage::AuditStorage;
use crate::config::AuditConfig;
use crate::session::Session;

/// Stop signal plus join handle for one background task.
struct Worker {
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(shutdown: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn end(&self) {
        self.shutdown.cancel();
    }

    async fn wait(&self) {
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Audit worker panicked: {}", e);
            }
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Batches commands into [`AuditStorage::upload_commands`].
pub struct CommandRecorder {
    tx: mpsc::Sender<Command>,
    dropped: AtomicU64,
    worker: Worker,
}

impl CommandRecorder {
    pub fn start(storage: Arc<dyn AuditStorage>, config: &AuditConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_queue_size.max(1));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_command_worker(
            rx,
            storage,
            config.command_batch_size.max(1),
            config.flush_interval(),
            shutdown.clone(),
        ));
        Self {
            tx,
            dropped: AtomicU64::new(0),
            worker: Worker::new(shutdown, handle),
        }
    }

    /// Queue a command without blocking.
    ///
    /// Returns `false` if it was dropped.
    pub fn record(&self, command: Command) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "recorder closed",
                };
                warn!("Dropped audit command ({}), {} dropped so far", reason, total);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the worker to upload what is queued and stop. Idempotent.
    pub fn end(&self) {
        self.worker.end();
    }

    pub async fn end_and_wait(&self) {
        self.end();
        self.worker.wait().await;
    }
}

async fn run_command_worker(
    mut rx: mpsc::Receiver<Command>,
    storage: Arc<dyn AuditStorage>,
    batch_size: usize,
    flush_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => {
                    batch.push(command);
                    if batch.len() >= batch_size {
                        upload(&*storage, &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    upload(&*storage, &mut batch).await;
                }
            }
        }
    }

    rx.close();
    while let Ok(command) = rx.try_recv() {
        batch.push(command);
        if batch.len() >= batch_size {
            upload(&*storage, &mut batch).await;
        }
    }
    if !batch.is_empty() {
        upload(&*storage, &mut batch).await;
    }
    trace!("Command recorder stopped");
}

async fn upload(storage: &dyn AuditStorage, batch: &mut Vec<Command>) {
    if let Err(e) = storage.upload_commands(batch).await {
        error!("Failed to upload {} audit commands: {}", batch.len(), e);
    }
    batch.clear();
}

// ============================================================================
// Replay
// ============================================================================

/// Streams timestamped chunks into [`AuditStorage::append_replay`].
pub struct ReplayRecorder {
    tx: mpsc::Sender<ReplayChunk>,
    started: Instant,
    dropped: AtomicU64,
    worker: Worker,
}

impl ReplayRecorder {
    pub fn start(session_id: Uuid, storage: Arc<dyn AuditStorage>, config: &AuditConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.replay_queue_size.max(1));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_replay_worker(session_id, rx, storage, shutdown.clone()));
        Self {
            tx,
            started: Instant::now(),
            dropped: AtomicU64::new(0),
            worker: Worker::new(shutdown, handle),
        }
    }

    pub fn record(&self, data: &[u8]) -> bool {
        let chunk = ReplayChunk {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            data: data.to_vec(),
        };
        if self.tx.try_send(chunk).is_ok() {
            return true;
        }
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Dropped replay chunk, {} dropped so far", total);
        false
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush queued chunks and finalize the replay. Idempotent.
    pub fn end(&self) {
        self.worker.end();
    }

    pub async fn end_and_wait(&self) {
        self.end();
        self.worker.wait().await;
    }
}

async fn run_replay_worker(
    session_id: Uuid,
    mut rx: mpsc::Receiver<ReplayChunk>,
    storage: Arc<dyn AuditStorage>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => append(&*storage, session_id, &chunk).await,
                None => break,
            },
        }
    }

    rx.close();
    while let Ok(chunk) = rx.try_recv() {
        append(&*storage, session_id, &chunk).await;
    }
    if let Err(e) = storage.finalize_replay(session_id).await {
        error!("Failed to finalize replay for session {}: {}", session_id, e);
    }
}

async fn append(storage: &dyn AuditStorage, session_id: Uuid, chunk: &ReplayChunk) {
    if let Err(e) = storage.append_replay(session_id, chunk).await {
        error!("Failed to append replay for session {}: {}", session_id, e);
    }
}

// ============================================================================
// Both
// ============================================================================

/// Command and replay recording for one session.
pub struct AuditRecorder {
    session: Session,
    commands: CommandRecorder,
    replay: ReplayRecorder,
}

impl AuditRecorder {
    pub fn start(session: &Session, storage: Arc<dyn AuditStorage>, config: &AuditConfig) -> Self {
        Self {
            session: session.clone(),
            commands: CommandRecorder::start(storage.clone(), config),
            replay: ReplayRecorder::start(session.id, storage, config),
        }
    }

    /// Record one statement as a command and as a replay line.
    ///
    /// `prompt` is prepended to the replay line only, e.g. `mysql>`.
    pub fn record_query(&self, text: &str, prompt: &str) {
        self.commands.record(Command::new(&self.session, text));
        self.replay
            .record(format!("{}{}\r\n", prompt, text).as_bytes());
    }

    pub fn commands(&self) -> &CommandRecorder {
        &self.commands
    }

    pub fn replay(&self) -> &ReplayRecorder {
        &self.replay
    }

    pub fn end(&self) {
        self.commands.end();
        self.replay.end();
    }

    pub async fn end_and_wait(&self) {
        self.end();
        self.commands.end_and_wait().await;
        self.replay.end_and_wait().await;
    }
}
