//! MySQL packet structures
//!
//! Wire structures for the connection phase and the command phase.
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

/// MySQL packet header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence ID (1 byte)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Maximum payload size (2^24 - 1)
    pub const MAX_PAYLOAD_LENGTH: u32 = 0xFF_FF_FF;

    pub fn new(payload_length: u32, sequence_id: u8) -> Self {
        Self {
            payload_length,
            sequence_id,
        }
    }

    /// Decode the raw 4-byte header
    pub fn decode(raw: [u8; 4]) -> Self {
        Self {
            payload_length: u32::from_le_bytes([raw[0], raw[1], raw[2], 0]),
            sequence_id: raw[3],
        }
    }

    /// Encode into the raw 4-byte header
    pub fn encode(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// MySQL Handshake V10 packet (server -> client)
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake_v10.html>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeV10 {
    /// Protocol version (always 10)
    pub protocol_version: u8,
    /// Server version string (null-terminated on the wire)
    pub server_version: String,
    /// Connection ID
    pub connection_id: u32,
    /// First 8 bytes of the salt
    pub auth_plugin_data_part_1: [u8; 8],
    /// Capability flags (lower 2 bytes)
    pub capability_flags_lower: u16,
    /// Character set
    pub character_set: u8,
    /// Status flags
    pub status_flags: u16,
    /// Capability flags (upper 2 bytes)
    pub capability_flags_upper: u16,
    /// Length of the whole salt plus its terminator (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_data_length: u8,
    /// Rest of the salt, without the trailing NUL (if CLIENT_SECURE_CONNECTION)
    pub auth_plugin_data_part_2: Vec<u8>,
    /// Auth plugin name (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_name: String,
}

impl Default for HandshakeV10 {
    fn default() -> Self {
        Self {
            protocol_version: 10,
            server_version: "8.0.30".to_string(),
            connection_id: 1,
            auth_plugin_data_part_1: [0u8; 8],
            capability_flags_lower: 0,
            character_set: 0xFF,  // utf8mb4_0900_ai_ci
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            capability_flags_upper: 0,
            auth_plugin_data_length: 21,
            auth_plugin_data_part_2: vec![0u8; 12],
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }
}

impl HandshakeV10 {
    /// Build the gateway's own handshake around a 20-byte salt
    pub fn synthetic(server_version: &str, connection_id: u32, salt: &[u8; 20]) -> Self {
        let mut part1 = [0u8; 8];
        part1.copy_from_slice(&salt[..8]);
        let mut handshake = Self {
            server_version: server_version.to_string(),
            connection_id,
            auth_plugin_data_part_1: part1,
            auth_plugin_data_part_2: salt[8..].to_vec(),
            ..Self::default()
        };
        handshake.set_capability_flags(GATEWAY_SERVER_CAPABILITIES);
        handshake
    }

    /// The full salt (part 1 followed by part 2)
    pub fn scramble(&self) -> Vec<u8> {
        let mut scramble = Vec::with_capacity(8 + self.auth_plugin_data_part_2.len());
        scramble.extend_from_slice(&self.auth_plugin_data_part_1);
        scramble.extend_from_slice(&self.auth_plugin_data_part_2);
        scramble
    }

    /// Combined capability flags (32-bit)
    pub fn capability_flags(&self) -> u32 {
        (self.capability_flags_upper as u32) << 16 | self.capability_flags_lower as u32
    }

    pub fn set_capability_flags(&mut self, flags: u32) {
        self.capability_flags_lower = (flags & 0xFFFF) as u16;
        self.capability_flags_upper = ((flags >> 16) & 0xFFFF) as u16;
    }
}

/// MySQL Handshake Response 41 packet (client -> server)
/// Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake_response.html>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse41 {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    /// Username (the access token on the client side)
    pub username: String,
    pub auth_response: Vec<u8>,
    /// Database name (if CLIENT_CONNECT_WITH_DB)
    pub database: Option<String>,
    /// Auth plugin name (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_name: Option<String>,
}

impl Default for HandshakeResponse41 {
    fn default() -> Self {
        Self {
            capability_flags: 0,
            max_packet_size: 0x00FF_FFFF,
            character_set: 0x21, // utf8_general_ci
            username: String::new(),
            auth_response: Vec::new(),
            database: None,
            auth_plugin_name: None,
        }
    }
}

/// AuthSwitchRequest sent by a backend that wants a different plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    /// New salt, without the trailing NUL
    pub plugin_data: Vec<u8>,
}

/// MySQL OK Packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl Default for OkPacket {
    fn default() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }
}

/// MySQL ERR Packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: [u8; 5],
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: *b"HY000",
            error_message: error_message.into(),
        }
    }

    /// ER_CONNECTION_KILLED, sent when an administrator ends the session
    pub fn connection_killed() -> Self {
        Self::new(ER_CONNECTION_KILLED, "Connection was killed by administrator")
    }
}

/// A decoded command-phase packet from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// COM_QUIT
    Quit,
    /// COM_QUERY with its SQL text
    Query(String),
    /// COM_STMT_PREPARE with its SQL text
    StmtPrepare(String),
    /// Any other command byte
    Other(u8),
    /// Zero-length payload
    Empty,
}

impl ClientCommand {
    /// Decode a command packet payload. Never fails; unknown bytes map to `Other`.
    pub fn decode(payload: &[u8]) -> Self {
        let Some((&cmd, rest)) = payload.split_first() else {
            return ClientCommand::Empty;
        };
        match cmd {
            COM_QUIT => ClientCommand::Quit,
            COM_QUERY => ClientCommand::Query(sql_text(rest)),
            COM_STMT_PREPARE => ClientCommand::StmtPrepare(sql_text(rest)),
            other => ClientCommand::Other(other),
        }
    }

    /// SQL text worth auditing, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            ClientCommand::Query(sql) | ClientCommand::StmtPrepare(sql) => Some(sql),
            _ => None,
        }
    }
}

fn sql_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\0', "")
}

// ============================================================================
// Capability Flags
// Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__capabilities__flags.html
// ============================================================================

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_FOUND_ROWS: u32 = 0x0000_0002;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
pub const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_INTERACTIVE: u32 = 0x0000_0400;
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
/// Also known as CLIENT_RESERVED2
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;
pub const CLIENT_QUERY_ATTRIBUTES: u32 = 0x0800_0000;

/// Capabilities the gateway advertises to clients.
///
/// The backend is only dialed after the client authenticated, so nothing here
/// may depend on what the backend supports: no TLS, no compression, no
/// DEPRECATE_EOF and no query attributes.
pub const GATEWAY_SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_LOCAL_FILES
    | CLIENT_PROTOCOL_41
    | CLIENT_INTERACTIVE
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

/// Bits the gateway must never negotiate with a backend
pub const GATEWAY_FORBIDDEN_CAPABILITIES: u32 =
    CLIENT_SSL | CLIENT_COMPRESS | CLIENT_DEPRECATE_EOF | CLIENT_QUERY_ATTRIBUTES | CLIENT_CONNECT_ATTRS;

pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

// ============================================================================
// Plugins, headers, commands and error codes
// ============================================================================

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CACHING_SHA2_PLUGIN: &str = "caching_sha2_password";

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xFE;
pub const ERR_HEADER: u8 = 0xFF;
/// Same byte as EOF; only meaningful during authentication
pub const AUTH_SWITCH_REQUEST: u8 = 0xFE;
pub const AUTH_MORE_DATA: u8 = 0x01;
/// caching_sha2_password: fast authentication succeeded
pub const CACHING_SHA2_FAST_AUTH_OK: u8 = 0x03;
/// caching_sha2_password: server wants the full exchange
pub const CACHING_SHA2_FULL_AUTH: u8 = 0x04;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_STMT_PREPARE: u8 = 0x16;

/// ER_CONNECTION_KILLED
pub const ER_CONNECTION_KILLED: u16 = 1927;
