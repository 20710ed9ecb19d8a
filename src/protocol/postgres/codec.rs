//! PostgreSQL message codec
//!
//! Async framing over any `AsyncRead`/`AsyncWrite`. Length fields are
//! validated before anything is allocated.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::*;
use super::messages::*;
use crate::error::{ProxyError, Result};

// ============================================================================
// Startup phase
// ============================================================================

/// Read the untagged message a new connection opens with
pub async fn read_startup_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<StartupRequest> {
    let length = reader.read_u32().await?;
    if length < 8 {
        return Err(ProxyError::Protocol(format!(
            "Startup message too short: {} bytes",
            length
        )));
    }
    if length > MAX_STARTUP_PACKET_LENGTH {
        return Err(ProxyError::Protocol(format!(
            "Startup message too large: {} bytes",
            length
        )));
    }

    let code = reader.read_u32().await?;
    let mut body = vec![0u8; (length - 8) as usize];
    reader.read_exact(&mut body).await?;

    match code {
        SSL_REQUEST_CODE => Ok(StartupRequest::SslRequest),
        CANCEL_REQUEST_CODE => {
            if body.len() < 8 {
                return Err(ProxyError::Protocol("CancelRequest truncated".into()));
            }
            Ok(StartupRequest::CancelRequest(CancelRequest {
                process_id: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                secret_key: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            }))
        }
        PROTOCOL_VERSION_3_0 => {
            let parameters = parse_startup_parameters(&body)?;
            let msg = StartupMessage {
                protocol_version: code,
                parameters,
            };
            if msg.user().map_or(true, str::is_empty) {
                return Err(ProxyError::Protocol(
                    "StartupMessage has no \"user\" parameter".into(),
                ));
            }
            Ok(StartupRequest::Startup(msg))
        }
        other => Err(ProxyError::Protocol(format!(
            "protocol mismatch: unsupported startup code {} (expected {})",
            other, PROTOCOL_VERSION_3_0
        ))),
    }
}

fn parse_startup_parameters(body: &[u8]) -> Result<Vec<(String, String)>> {
    let mut parameters = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let (key, used) = read_cstring(body, pos, "startup parameter name")?;
        pos += used;
        if key.is_empty() {
            return Ok(parameters);
        }
        let (value, used) = read_cstring(body, pos, "startup parameter value")?;
        pos += used;
        parameters.push((key, value));
    }
    Err(ProxyError::Protocol("StartupMessage missing terminator".into()))
}

/// Write a StartupMessage and flush
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &StartupMessage,
) -> Result<()> {
    writer.write_all(&msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an SSLRequest and flush
pub async fn write_ssl_request<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_u32(8).await?;
    writer.write_u32(SSL_REQUEST_CODE).await?;
    writer.flush().await?;
    Ok(())
}

/// Answer an SSLRequest with 'N'
pub async fn refuse_ssl<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&[SSL_NOT_SUPPORTED]).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Typed phase
// ============================================================================

/// Read one tagged frame
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let tag = reader.read_u8().await?;
    let length = reader.read_u32().await?;
    if length < 4 {
        return Err(ProxyError::Protocol(format!(
            "Invalid message length {} for '{}'",
            length, tag as char
        )));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(ProxyError::Protocol(format!(
            "Message too large: {} bytes (max: {})",
            length, MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; (length - 4) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { tag, payload })
}

/// Write one frame without flushing
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_u8(frame.tag).await?;
    writer.write_u32((frame.payload.len() + 4) as u32).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}

/// Write one frame and flush
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    write_frame(writer, frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Send an ErrorResponse and flush
pub async fn send_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    error: &ErrorNoticeResponse,
) -> Result<()> {
    send_frame(writer, &error.to_frame()).await
}

// ============================================================================
// Frontend builders
// ============================================================================

pub fn build_sasl_initial_response(mechanism: &str, data: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(mechanism.len() + 5 + data.len());
    payload.extend_from_slice(mechanism.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&(data.len() as i32).to_be_bytes());
    payload.extend_from_slice(data);
    Frame::new(MSG_PASSWORD, payload)
}

pub fn build_sasl_response(data: &[u8]) -> Frame {
    Frame::new(MSG_PASSWORD, data.to_vec())
}

/// PasswordMessage (cleartext or MD5 digest)
pub fn build_password_message(password: &str) -> Frame {
    let mut payload = Vec::with_capacity(password.len() + 1);
    payload.extend_from_slice(password.as_bytes());
    payload.push(0);
    Frame::new(MSG_PASSWORD, payload)
}

pub fn build_query(sql: &str) -> Frame {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.push(0);
    Frame::new(MSG_QUERY, payload)
}

pub fn build_terminate() -> Frame {
    Frame::new(MSG_TERMINATE, Vec::new())
}

// ============================================================================
// Backend builders
// ============================================================================

pub fn build_ready_for_query(status: TransactionStatus) -> Frame {
    Frame::new(MSG_READY_FOR_QUERY, vec![status.to_byte()])
}

pub fn build_parameter_status(name: &str, value: &str) -> Frame {
    let mut payload = Vec::with_capacity(name.len() + value.len() + 2);
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    Frame::new(MSG_PARAMETER_STATUS, payload)
}

pub fn build_backend_key_data(process_id: u32, secret_key: u32) -> Frame {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&process_id.to_be_bytes());
    payload.extend_from_slice(&secret_key.to_be_bytes());
    Frame::new(MSG_BACKEND_KEY_DATA, payload)
}

/// CommandComplete with the given tag (e.g. "SELECT 1")
pub fn build_command_complete(tag: &str) -> Frame {
    let mut payload = Vec::with_capacity(tag.len() + 1);
    payload.extend_from_slice(tag.as_bytes());
    payload.push(0);
    Frame::new(b'C', payload)
}
