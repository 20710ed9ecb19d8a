//! PostgreSQL typed-phase relay
//!
//! Both writers are buffered. The backend writer is flushed when the
//! client ends a request; the client writer is flushed when the backend
//! is ready for the next one, or sends something the client must see
//! without waiting.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};

use super::{FrameSource, Flow, RelayHandler, RelayOutcome};
use crate::audit::AuditRecorder;
use crate::error::Result;
use crate::protocol::postgres::constants::*;
use crate::protocol::postgres::{read_frame, write_frame, ErrorNoticeResponse, Frame, FrontendMessage};
use crate::protocol::DatabaseProtocol;

pub struct PostgresFrameSource<R> {
    reader: R,
}

impl<R> PostgresFrameSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for PostgresFrameSource<R> {
    type Frame = Frame;

    async fn next_frame(&mut self) -> Result<Frame> {
        read_frame(&mut self.reader).await
    }
}

/// Forwards frames verbatim and records Query and Parse statements.
pub struct PostgresRelayHandler<C: AsyncWrite, B: AsyncWrite> {
    client: BufWriter<C>,
    backend: BufWriter<B>,
    recorder: Arc<AuditRecorder>,
    // Client sent Flush; pass backend output through until ReadyForQuery
    eager_flush: bool,
}

impl<C: AsyncWrite, B: AsyncWrite> PostgresRelayHandler<C, B> {
    pub fn new(client: C, backend: B, recorder: Arc<AuditRecorder>) -> Self {
        Self {
            client: BufWriter::new(client),
            backend: BufWriter::new(backend),
            recorder,
            eager_flush: false,
        }
    }

    fn record(&self, frame: &Frame) {
        let sql = match frame.frontend() {
            Ok(FrontendMessage::Query(sql)) => sql,
            Ok(FrontendMessage::Parse { query, .. }) => query,
            Ok(_) => return,
            Err(e) => {
                debug!("Unreadable '{}' frame not recorded: {}", frame.tag as char, e);
                return;
            }
        };
        if !sql.is_empty() {
            self.recorder
                .record_query(&sql, DatabaseProtocol::Postgres.prompt());
        }
    }
}

fn ends_client_request(tag: u8) -> bool {
    matches!(
        tag,
        MSG_QUERY | MSG_SYNC | MSG_FLUSH | MSG_COPY_DONE | MSG_COPY_FAIL | MSG_FUNCTION_CALL
    )
}

fn needs_immediate_delivery(tag: u8) -> bool {
    matches!(
        tag,
        MSG_READY_FOR_QUERY
            | MSG_ERROR_RESPONSE
            | MSG_NOTICE_RESPONSE
            | MSG_NOTIFICATION
            | MSG_COPY_IN_RESPONSE
            | MSG_COPY_OUT_RESPONSE
            | MSG_COPY_BOTH_RESPONSE
    )
}

#[async_trait]
impl<C, B> RelayHandler for PostgresRelayHandler<C, B>
where
    C: AsyncWrite + Unpin + Send,
    B: AsyncWrite + Unpin + Send,
{
    type ClientFrame = Frame;
    type BackendFrame = Frame;

    async fn on_client_frame(&mut self, frame: Frame) -> Result<Flow> {
        wire!(tag = %(frame.tag as char), len = frame.payload.len(), "client -> backend");
        write_frame(&mut self.backend, &frame).await?;

        if frame.tag == MSG_TERMINATE {
            self.backend.flush().await?;
            debug!("Client sent Terminate");
            return Ok(Flow::Stop(RelayOutcome::ClientTerminated));
        }
        if frame.tag == MSG_FLUSH {
            self.eager_flush = true;
        }
        if ends_client_request(frame.tag) {
            self.backend.flush().await?;
        }
        if matches!(frame.tag, MSG_QUERY | MSG_PARSE) {
            self.record(&frame);
        }
        Ok(Flow::Continue)
    }

    async fn on_backend_frame(&mut self, frame: Frame) -> Result<Flow> {
        wire!(tag = %(frame.tag as char), len = frame.payload.len(), "backend -> client");
        write_frame(&mut self.client, &frame).await?;

        if frame.tag == MSG_READY_FOR_QUERY {
            self.eager_flush = false;
            self.client.flush().await?;
        } else if self.eager_flush || needs_immediate_delivery(frame.tag) {
            self.client.flush().await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_cancelled(&mut self) -> Result<()> {
        write_frame(&mut self.client, &ErrorNoticeResponse::admin_shutdown().to_frame()).await?;
        self.client.flush().await?;
        Ok(())
    }
}
