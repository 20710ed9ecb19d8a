//! PostgreSQL protocol constants
//!
//! Wire protocol version 3.0.
//! Reference: <https://www.postgresql.org/docs/current/protocol.html>

// ============================================================================
// Startup phase
// ============================================================================

/// (3 << 16) | 0
pub const PROTOCOL_VERSION_3_0: u32 = 196608;

/// Sent instead of a StartupMessage to ask for TLS
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Sent on a fresh connection to cancel a running query
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Answer to an SSLRequest when TLS is not offered
pub const SSL_NOT_SUPPORTED: u8 = b'N';

/// Largest startup packet accepted, same bound as the server uses
pub const MAX_STARTUP_PACKET_LENGTH: u32 = 10_000;

/// Largest typed message accepted (100 MB)
pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;

// ============================================================================
// Frontend tags (client -> server)
// ============================================================================

pub const MSG_QUERY: u8 = b'Q';
pub const MSG_PARSE: u8 = b'P';
pub const MSG_SYNC: u8 = b'S';
pub const MSG_FLUSH: u8 = b'H';
pub const MSG_TERMINATE: u8 = b'X';
/// PasswordMessage, SASLInitialResponse and SASLResponse all share this tag
pub const MSG_PASSWORD: u8 = b'p';
pub const MSG_COPY_DONE: u8 = b'c';
pub const MSG_COPY_FAIL: u8 = b'f';
pub const MSG_FUNCTION_CALL: u8 = b'F';

// ============================================================================
// Backend tags (server -> client)
// ============================================================================

pub const MSG_AUTHENTICATION: u8 = b'R';
pub const MSG_BACKEND_KEY_DATA: u8 = b'K';
pub const MSG_PARAMETER_STATUS: u8 = b'S';
pub const MSG_READY_FOR_QUERY: u8 = b'Z';
pub const MSG_ERROR_RESPONSE: u8 = b'E';
pub const MSG_NOTICE_RESPONSE: u8 = b'N';
pub const MSG_NOTIFICATION: u8 = b'A';
pub const MSG_COPY_IN_RESPONSE: u8 = b'G';
pub const MSG_COPY_OUT_RESPONSE: u8 = b'H';
pub const MSG_COPY_BOTH_RESPONSE: u8 = b'W';

// ============================================================================
// Authentication request codes (payload of 'R')
// ============================================================================

pub const AUTH_OK: u32 = 0;
pub const AUTH_CLEARTEXT_PASSWORD: u32 = 3;
pub const AUTH_MD5_PASSWORD: u32 = 5;
pub const AUTH_SASL: u32 = 10;
pub const AUTH_SASL_CONTINUE: u32 = 11;
pub const AUTH_SASL_FINAL: u32 = 12;

pub const SASL_MECHANISM_SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Highest SCRAM iteration count accepted from a backend or configured for clients
pub const MAX_SCRAM_ITERATIONS: u32 = 1_000_000;

// ============================================================================
// Error and notice fields
// ============================================================================

pub const ERROR_FIELD_SEVERITY: u8 = b'S';
/// Non-localized severity (protocol 3.0, PostgreSQL 9.6+)
pub const ERROR_FIELD_SEVERITY_V: u8 = b'V';
pub const ERROR_FIELD_CODE: u8 = b'C';
pub const ERROR_FIELD_MESSAGE: u8 = b'M';

pub const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
pub const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";
pub const SQLSTATE_SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION: &str = "08001";
pub const SQLSTATE_ADMIN_SHUTDOWN: &str = "57P01";

// ============================================================================
// Transaction status (payload of 'Z')
// ============================================================================

pub const TXN_STATUS_IDLE: u8 = b'I';
pub const TXN_STATUS_IN_TRANSACTION: u8 = b'T';
pub const TXN_STATUS_FAILED: u8 = b'E';

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_codes() {
        assert_eq!(PROTOCOL_VERSION_3_0, 3 << 16);
        assert_eq!(SSL_REQUEST_CODE, 0x04D2_162F);
        assert_eq!(CANCEL_REQUEST_CODE, 0x04D2_162E);
    }
}
