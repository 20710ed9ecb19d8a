//! MySQL packet parser
//!
//! Functions to read, write, decode and build MySQL protocol packets.
//! Every decoder is bounds-checked: truncated input yields
//! `ProxyError::Protocol`, never a panic.

use super::packets::*;
use crate::error::{ProxyError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ============================================================================
// Packet Reading
// ============================================================================

/// Read one complete MySQL packet from a stream.
///
/// `read_exact` reassembles the payload however the bytes were segmented.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(PacketHeader, Vec<u8>)> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw).await?;
    let header = PacketHeader::decode(raw);

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await?;

    Ok((header, payload))
}

/// Write a MySQL packet and flush it
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sequence_id: u8,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > PacketHeader::MAX_PAYLOAD_LENGTH as usize {
        return Err(ProxyError::Protocol(format!(
            "Payload of {} bytes exceeds a single packet",
            payload.len()
        )));
    }
    let header = PacketHeader::new(payload.len() as u32, sequence_id);
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Byte cursor
// ============================================================================

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated(&self, field: &str) -> ProxyError {
        ProxyError::Protocol(format!("{} truncated at {}", self.what, field))
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.truncated(field));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn u16_le(&mut self, field: &str) -> Result<u16> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self, field: &str) -> Result<u32> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn null_terminated(&mut self, field: &str) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProxyError::Protocol(format!("{}: {} missing NUL", self.what, field)))?;
        self.pos += nul + 1;
        Ok(&rest[..nul])
    }

    /// NUL-terminated, or running to the end of the payload
    fn null_terminated_or_eof(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => {
                self.pos += nul + 1;
                &rest[..nul]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn length_encoded_int(&mut self, field: &str) -> Result<u64> {
        match self.u8(field)? {
            0xFC => Ok(self.u16_le(field)? as u64),
            0xFD => {
                let b = self.take(3, field)?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64)
            }
            0xFE => {
                let b = self.take(8, field)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_le_bytes(raw))
            }
            0xFB | 0xFF => Err(ProxyError::Protocol(format!(
                "{}: invalid length-encoded integer in {}",
                self.what, field
            ))),
            n => Ok(n as u64),
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// ============================================================================
// Connection phase
// ============================================================================

/// Parse a HandshakeV10 packet from payload bytes
pub fn parse_handshake_v10(payload: &[u8]) -> Result<HandshakeV10> {
    let mut r = ByteReader::new(payload, "HandshakeV10");

    let protocol_version = r.u8("protocol version")?;
    if protocol_version != 10 {
        return Err(ProxyError::Protocol(format!(
            "protocol mismatch: expected handshake v10, got {}",
            protocol_version
        )));
    }

    let server_version = lossy(r.null_terminated("server version")?);
    let connection_id = r.u32_le("connection id")?;

    let mut auth_plugin_data_part_1 = [0u8; 8];
    auth_plugin_data_part_1.copy_from_slice(r.take(8, "auth plugin data part 1")?);

    if r.u8("filler")? != 0 {
        return Err(ProxyError::Protocol("HandshakeV10 filler byte is not 0x00".into()));
    }

    let capability_flags_lower = r.u16_le("capability flags")?;

    let mut handshake = HandshakeV10 {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data_part_1,
        capability_flags_lower,
        character_set: 0,
        status_flags: 0,
        capability_flags_upper: 0,
        auth_plugin_data_length: 0,
        auth_plugin_data_part_2: Vec::new(),
        auth_plugin_name: String::new(),
    };

    // Pre-4.1 servers stop here
    if r.is_empty() {
        return Ok(handshake);
    }

    handshake.character_set = r.u8("character set")?;
    handshake.status_flags = r.u16_le("status flags")?;
    handshake.capability_flags_upper = r.u16_le("capability flags upper")?;
    handshake.auth_plugin_data_length = r.u8("auth plugin data length")?;
    r.take(10, "reserved")?;

    let caps = handshake.capability_flags();
    let data_len = if caps & CLIENT_PLUGIN_AUTH != 0 {
        handshake.auth_plugin_data_length as usize
    } else {
        0
    };

    if caps & CLIENT_SECURE_CONNECTION != 0 {
        let part2_len = std::cmp::max(13, data_len.saturating_sub(8));
        let mut part2 = r.take(part2_len, "auth plugin data part 2")?.to_vec();
        if part2.last() == Some(&0) {
            part2.pop();
        }
        handshake.auth_plugin_data_part_2 = part2;
    }

    if caps & CLIENT_PLUGIN_AUTH != 0 {
        handshake.auth_plugin_name = lossy(r.null_terminated_or_eof());
    }

    Ok(handshake)
}

/// Build a HandshakeV10 packet payload; the inverse of [`parse_handshake_v10`]
pub fn build_handshake_v10(handshake: &HandshakeV10) -> Vec<u8> {
    let mut payload = Vec::with_capacity(96);

    payload.push(handshake.protocol_version);
    payload.extend_from_slice(handshake.server_version.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&handshake.connection_id.to_le_bytes());
    payload.extend_from_slice(&handshake.auth_plugin_data_part_1);
    payload.push(0); // filler
    payload.extend_from_slice(&handshake.capability_flags_lower.to_le_bytes());
    payload.push(handshake.character_set);
    payload.extend_from_slice(&handshake.status_flags.to_le_bytes());
    payload.extend_from_slice(&handshake.capability_flags_upper.to_le_bytes());
    payload.push(handshake.auth_plugin_data_length);
    payload.extend_from_slice(&[0u8; 10]);

    let caps = handshake.capability_flags();
    if caps & CLIENT_SECURE_CONNECTION != 0 {
        let data_len = if caps & CLIENT_PLUGIN_AUTH != 0 {
            handshake.auth_plugin_data_length as usize
        } else {
            0
        };
        let part2_len = std::cmp::max(13, data_len.saturating_sub(8));
        let part2 = &handshake.auth_plugin_data_part_2;
        payload.extend_from_slice(part2);
        // Pad (usually just the NUL terminator) up to the advertised length
        payload.resize(payload.len() + part2_len.saturating_sub(part2.len()), 0);
    }

    if caps & CLIENT_PLUGIN_AUTH != 0 {
        payload.extend_from_slice(handshake.auth_plugin_name.as_bytes());
        payload.push(0);
    }

    payload
}

/// Parse a HandshakeResponse41 packet from payload bytes
pub fn parse_handshake_response41(payload: &[u8]) -> Result<HandshakeResponse41> {
    let mut r = ByteReader::new(payload, "HandshakeResponse41");

    let capability_flags = r.u32_le("capability flags")?;
    if capability_flags & CLIENT_PROTOCOL_41 == 0 {
        return Err(ProxyError::Protocol(
            "protocol mismatch: client does not speak protocol 4.1".into(),
        ));
    }
    let max_packet_size = r.u32_le("max packet size")?;
    let character_set = r.u8("character set")?;
    r.take(23, "reserved")?;

    let username = lossy(r.null_terminated("username")?);

    let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let len = r.length_encoded_int("auth response length")? as usize;
        r.take(len, "auth response")?.to_vec()
    } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        let len = r.u8("auth response length")? as usize;
        r.take(len, "auth response")?.to_vec()
    } else {
        r.null_terminated("auth response")?.to_vec()
    };

    let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
        Some(lossy(r.null_terminated_or_eof()))
    } else {
        None
    };

    let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
        Some(lossy(r.null_terminated_or_eof()))
    } else {
        None
    };

    // Connection attributes are accepted but not carried to the backend
    if !r.is_empty() {
        trace!(bytes = r.remaining(), "Ignoring trailing handshake response data");
    }

    Ok(HandshakeResponse41 {
        capability_flags,
        max_packet_size,
        character_set,
        username,
        auth_response,
        database,
        auth_plugin_name,
    })
}

/// Build a HandshakeResponse41 packet payload
pub fn build_handshake_response41(response: &HandshakeResponse41) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);

    payload.extend_from_slice(&response.capability_flags.to_le_bytes());
    payload.extend_from_slice(&response.max_packet_size.to_le_bytes());
    payload.push(response.character_set);
    payload.extend_from_slice(&[0u8; 23]);
    payload.extend_from_slice(response.username.as_bytes());
    payload.push(0);

    if response.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        write_length_encoded_int(&mut payload, response.auth_response.len() as u64);
        payload.extend_from_slice(&response.auth_response);
    } else if response.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        payload.push(response.auth_response.len() as u8);
        payload.extend_from_slice(&response.auth_response);
    } else {
        payload.extend_from_slice(&response.auth_response);
        payload.push(0);
    }

    if response.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
        if let Some(ref db) = response.database {
            payload.extend_from_slice(db.as_bytes());
        }
        payload.push(0);
    }

    if response.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
        if let Some(ref name) = response.auth_plugin_name {
            payload.extend_from_slice(name.as_bytes());
        }
        payload.push(0);
    }

    payload
}

/// Parse an AuthSwitchRequest (0xFE header during authentication)
pub fn parse_auth_switch_request(payload: &[u8]) -> Result<AuthSwitchRequest> {
    let mut r = ByteReader::new(payload, "AuthSwitchRequest");
    if r.u8("header")? != AUTH_SWITCH_REQUEST {
        return Err(ProxyError::Protocol("AuthSwitchRequest header is not 0xFE".into()));
    }
    let plugin_name = lossy(r.null_terminated_or_eof());
    let mut plugin_data = r.rest().to_vec();
    if plugin_data.last() == Some(&0) {
        plugin_data.pop();
    }
    Ok(AuthSwitchRequest {
        plugin_name,
        plugin_data,
    })
}

/// Build an AuthSwitchRequest asking the client to answer with `plugin`
pub fn build_auth_switch_request(request: &AuthSwitchRequest) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + request.plugin_name.len() + request.plugin_data.len());
    payload.push(AUTH_SWITCH_REQUEST);
    payload.extend_from_slice(request.plugin_name.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&request.plugin_data);
    payload.push(0);
    payload
}

// ============================================================================
// Generic responses
// ============================================================================

/// Parse an ERR packet (CLIENT_PROTOCOL_41 layout)
pub fn parse_err_packet(payload: &[u8]) -> Result<ErrPacket> {
    let mut r = ByteReader::new(payload, "ERR packet");
    if r.u8("header")? != ERR_HEADER {
        return Err(ProxyError::Protocol("ERR packet header is not 0xFF".into()));
    }
    let error_code = r.u16_le("error code")?;

    let mut sql_state = *b"HY000";
    if r.remaining() >= 6 && payload[r.pos] == b'#' {
        r.take(1, "sql state marker")?;
        sql_state.copy_from_slice(r.take(5, "sql state")?);
    }
    let error_message = lossy(r.rest());

    Ok(ErrPacket {
        error_code,
        sql_state,
        error_message,
    })
}

/// Build an OK packet payload
pub fn build_ok_packet(ok: &OkPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.push(OK_HEADER);
    write_length_encoded_int(&mut payload, ok.affected_rows);
    write_length_encoded_int(&mut payload, ok.last_insert_id);
    payload.extend_from_slice(&ok.status_flags.to_le_bytes());
    payload.extend_from_slice(&ok.warnings.to_le_bytes());
    payload
}

/// Build an ERR packet payload
pub fn build_err_packet(err: &ErrPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + err.error_message.len());
    payload.push(ERR_HEADER);
    payload.extend_from_slice(&err.error_code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(&err.sql_state);
    payload.extend_from_slice(err.error_message.as_bytes());
    payload
}

/// Check if a packet is an OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

/// Check if a packet is an ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// Check if a packet is an EOF packet
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

fn write_length_encoded_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 0x1_0000 {
        buf.push(0xFC);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 0x100_0000 {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xFE);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}
