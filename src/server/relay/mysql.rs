//! MySQL command-phase relay

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{FrameSource, Flow, RelayHandler, RelayOutcome};
use crate::audit::AuditRecorder;
use crate::error::Result;
use crate::protocol::mysql::{build_err_packet, read_packet, write_packet, ClientCommand, ErrPacket};
use crate::protocol::DatabaseProtocol;

/// One packet as read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlPacket {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
}

pub struct MySqlFrameSource<R> {
    reader: R,
}

impl<R> MySqlFrameSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for MySqlFrameSource<R> {
    type Frame = MySqlPacket;

    async fn next_frame(&mut self) -> Result<MySqlPacket> {
        let (header, payload) = read_packet(&mut self.reader).await?;
        Ok(MySqlPacket {
            sequence_id: header.sequence_id,
            payload,
        })
    }
}

/// Forwards packets verbatim and records statements sent by the client.
pub struct MySqlRelayHandler<C, B> {
    client: C,
    backend: B,
    recorder: Arc<AuditRecorder>,
}

impl<C, B> MySqlRelayHandler<C, B> {
    /// `client` and `backend` are the write halves of the two sockets.
    pub fn new(client: C, backend: B, recorder: Arc<AuditRecorder>) -> Self {
        Self {
            client,
            backend,
            recorder,
        }
    }
}

#[async_trait]
impl<C, B> RelayHandler for MySqlRelayHandler<C, B>
where
    C: AsyncWrite + Unpin + Send,
    B: AsyncWrite + Unpin + Send,
{
    type ClientFrame = MySqlPacket;
    type BackendFrame = MySqlPacket;

    async fn on_client_frame(&mut self, packet: MySqlPacket) -> Result<Flow> {
        wire!(seq = packet.sequence_id, len = packet.payload.len(), "client -> backend");
        write_packet(&mut self.backend, packet.sequence_id, &packet.payload).await?;

        // Only the first packet of a command carries the command byte
        if packet.sequence_id != 0 {
            return Ok(Flow::Continue);
        }
        let command = ClientCommand::decode(&packet.payload);
        if command == ClientCommand::Quit {
            debug!("Client sent COM_QUIT");
            return Ok(Flow::Stop(RelayOutcome::ClientTerminated));
        }
        if let Some(sql) = command.sql() {
            if !sql.is_empty() {
                self.recorder
                    .record_query(sql, DatabaseProtocol::MySql.prompt());
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_backend_frame(&mut self, packet: MySqlPacket) -> Result<Flow> {
        wire!(seq = packet.sequence_id, len = packet.payload.len(), "backend -> client");
        write_packet(&mut self.client, packet.sequence_id, &packet.payload).await?;
        Ok(Flow::Continue)
    }

    async fn on_cancelled(&mut self) -> Result<()> {
        let err = build_err_packet(&ErrPacket::connection_killed());
        write_packet(&mut self.client, 1, &err).await
    }
}
