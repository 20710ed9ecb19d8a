//! PostgreSQL message types
//!
//! A [`Frame`] is the raw unit the relay moves around. The typed enums are
//! views decoded from a borrowed frame; decoding never consumes it, so the
//! original bytes are what gets forwarded.

use super::constants::*;
use crate::error::{ProxyError, Result};

/// One tagged message (tag byte + payload, length implied)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: u8, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Wire encoding: tag, big-endian length including itself, payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.push(self.tag);
        buf.extend_from_slice(&((self.payload.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode as a frontend message.
    ///
    /// The 'p' tag is ambiguous outside of its authentication context and is
    /// reported as `Password`; use [`Frame::sasl_initial_response`] or
    /// [`Frame::sasl_response`] when the exchange says which one it is.
    pub fn frontend(&self) -> Result<FrontendMessage> {
        let p = &self.payload;
        Ok(match self.tag {
            MSG_QUERY => {
                let (sql, _) = read_cstring(p, 0, "Query")?;
                FrontendMessage::Query(sql)
            }
            MSG_PARSE => {
                let (statement, used) = read_cstring(p, 0, "Parse statement")?;
                let (query, _) = read_cstring(p, used, "Parse query")?;
                FrontendMessage::Parse { statement, query }
            }
            MSG_SYNC => FrontendMessage::Sync,
            MSG_TERMINATE => FrontendMessage::Terminate,
            MSG_FLUSH => FrontendMessage::Flush,
            MSG_PASSWORD => FrontendMessage::Password(p.clone()),
            other => FrontendMessage::Other(other),
        })
    }

    pub fn sasl_initial_response(&self) -> Result<FrontendMessage> {
        self.expect_tag(MSG_PASSWORD, "SASLInitialResponse")?;
        let p = &self.payload;
        let (mechanism, mut pos) = read_cstring(p, 0, "SASLInitialResponse mechanism")?;
        let len = read_i32(p, pos, "SASLInitialResponse length")?;
        pos += 4;
        let data = if len < 0 {
            Vec::new()
        } else {
            let end = pos + len as usize;
            if end > p.len() {
                return Err(ProxyError::Protocol("SASLInitialResponse truncated".into()));
            }
            p[pos..end].to_vec()
        };
        Ok(FrontendMessage::SaslInitialResponse { mechanism, data })
    }

    pub fn sasl_response(&self) -> Result<FrontendMessage> {
        self.expect_tag(MSG_PASSWORD, "SASLResponse")?;
        Ok(FrontendMessage::SaslResponse(self.payload.clone()))
    }

    /// Decode as a backend message
    pub fn backend(&self) -> Result<BackendMessage> {
        let p = &self.payload;
        Ok(match self.tag {
            MSG_AUTHENTICATION => BackendMessage::Authentication(AuthenticationMessage::decode(p)?),
            MSG_ERROR_RESPONSE => BackendMessage::ErrorResponse(ErrorNoticeResponse::decode(p)?),
            MSG_NOTICE_RESPONSE => BackendMessage::NoticeResponse(ErrorNoticeResponse::decode(p)?),
            MSG_READY_FOR_QUERY => {
                let byte = *p
                    .first()
                    .ok_or_else(|| ProxyError::Protocol("ReadyForQuery truncated".into()))?;
                let status = TransactionStatus::from_byte(byte).ok_or_else(|| {
                    ProxyError::Protocol(format!("Unknown transaction status 0x{:02X}", byte))
                })?;
                BackendMessage::ReadyForQuery(status)
            }
            MSG_PARAMETER_STATUS => {
                let (name, used) = read_cstring(p, 0, "ParameterStatus name")?;
                let (value, _) = read_cstring(p, used, "ParameterStatus value")?;
                BackendMessage::ParameterStatus { name, value }
            }
            MSG_BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
                process_id: read_i32(p, 0, "BackendKeyData")? as u32,
                secret_key: read_i32(p, 4, "BackendKeyData")? as u32,
            },
            other => BackendMessage::Other(other),
        })
    }

    fn expect_tag(&self, tag: u8, what: &str) -> Result<()> {
        if self.tag != tag {
            return Err(ProxyError::Protocol(format!(
                "Expected {} ('{}'), got '{}'",
                what, tag as char, self.tag as char
            )));
        }
        Ok(())
    }
}

/// Frontend (client -> server) message view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query(String),
    Parse { statement: String, query: String },
    Sync,
    Terminate,
    Flush,
    SaslInitialResponse { mechanism: String, data: Vec<u8> },
    SaslResponse(Vec<u8>),
    Password(Vec<u8>),
    Other(u8),
}

/// Backend (server -> client) message view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthenticationMessage),
    ErrorResponse(ErrorNoticeResponse),
    NoticeResponse(ErrorNoticeResponse),
    ReadyForQuery(TransactionStatus),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: u32, secret_key: u32 },
    Other(u8),
}

/// Authentication request variants ('R' payloads)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Vec<u8> },
    SaslFinal { data: Vec<u8> },
}

impl AuthenticationMessage {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let code = read_i32(payload, 0, "Authentication")? as u32;
        let rest = &payload[4..];
        match code {
            AUTH_OK => Ok(AuthenticationMessage::Ok),
            AUTH_CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
            AUTH_MD5_PASSWORD => {
                if rest.len() < 4 {
                    return Err(ProxyError::Protocol("MD5 request missing salt".into()));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&rest[..4]);
                Ok(AuthenticationMessage::Md5Password { salt })
            }
            AUTH_SASL => {
                let mut mechanisms = Vec::new();
                let mut pos = 0;
                while pos < rest.len() {
                    let (name, used) = read_cstring(rest, pos, "SASL mechanism")?;
                    pos += used;
                    if name.is_empty() {
                        break;
                    }
                    mechanisms.push(name);
                }
                Ok(AuthenticationMessage::Sasl { mechanisms })
            }
            AUTH_SASL_CONTINUE => Ok(AuthenticationMessage::SaslContinue {
                data: rest.to_vec(),
            }),
            AUTH_SASL_FINAL => Ok(AuthenticationMessage::SaslFinal {
                data: rest.to_vec(),
            }),
            other => Err(ProxyError::Protocol(format!(
                "Unsupported authentication request {}",
                other
            ))),
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::with_capacity(32);
        match self {
            AuthenticationMessage::Ok => payload.extend_from_slice(&AUTH_OK.to_be_bytes()),
            AuthenticationMessage::CleartextPassword => {
                payload.extend_from_slice(&AUTH_CLEARTEXT_PASSWORD.to_be_bytes())
            }
            AuthenticationMessage::Md5Password { salt } => {
                payload.extend_from_slice(&AUTH_MD5_PASSWORD.to_be_bytes());
                payload.extend_from_slice(salt);
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                payload.extend_from_slice(&AUTH_SASL.to_be_bytes());
                for m in mechanisms {
                    payload.extend_from_slice(m.as_bytes());
                    payload.push(0);
                }
                payload.push(0);
            }
            AuthenticationMessage::SaslContinue { data } => {
                payload.extend_from_slice(&AUTH_SASL_CONTINUE.to_be_bytes());
                payload.extend_from_slice(data);
            }
            AuthenticationMessage::SaslFinal { data } => {
                payload.extend_from_slice(&AUTH_SASL_FINAL.to_be_bytes());
                payload.extend_from_slice(data);
            }
        }
        Frame::new(MSG_AUTHENTICATION, payload)
    }
}

/// Transaction status carried by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            TXN_STATUS_IDLE => Some(TransactionStatus::Idle),
            TXN_STATUS_IN_TRANSACTION => Some(TransactionStatus::InTransaction),
            TXN_STATUS_FAILED => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => TXN_STATUS_IDLE,
            TransactionStatus::InTransaction => TXN_STATUS_IN_TRANSACTION,
            TransactionStatus::Failed => TXN_STATUS_FAILED,
        }
    }
}

/// ErrorResponse / NoticeResponse body, fields kept in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorNoticeResponse {
    pub fields: Vec<(u8, String)>,
}

impl ErrorNoticeResponse {
    /// A FATAL error with both severity fields, SQLSTATE and message
    pub fn fatal(code: &str, message: &str) -> Self {
        Self {
            fields: vec![
                (ERROR_FIELD_SEVERITY, "FATAL".to_string()),
                (ERROR_FIELD_SEVERITY_V, "FATAL".to_string()),
                (ERROR_FIELD_CODE, code.to_string()),
                (ERROR_FIELD_MESSAGE, message.to_string()),
            ],
        }
    }

    /// 28P01, sent for every token or credential failure
    pub fn authentication_failed(user: &str) -> Self {
        Self::fatal(
            SQLSTATE_INVALID_PASSWORD,
            &format!("password authentication failed for user \"{}\"", user),
        )
    }

    /// 57P01, sent when an administrator ends the session
    pub fn admin_shutdown() -> Self {
        Self::fatal(
            SQLSTATE_ADMIN_SHUTDOWN,
            "terminating connection due to administrator command",
        )
    }

    /// 08001, sent when the backend cannot be reached
    pub fn backend_unreachable() -> Self {
        Self::fatal(
            SQLSTATE_SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION,
            "could not connect to the database server",
        )
    }

    pub fn field(&self, field_type: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == field_type)
            .map(|(_, v)| v.as_str())
    }

    pub fn severity(&self) -> Option<&str> {
        self.field(ERROR_FIELD_SEVERITY)
    }

    pub fn localized_severity(&self) -> Option<&str> {
        self.field(ERROR_FIELD_SEVERITY_V)
    }

    pub fn code(&self) -> Option<&str> {
        self.field(ERROR_FIELD_CODE)
    }

    pub fn message(&self) -> Option<&str> {
        self.field(ERROR_FIELD_MESSAGE)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut fields = Vec::new();
        let mut pos = 0;
        while pos < payload.len() {
            let field_type = payload[pos];
            pos += 1;
            if field_type == 0 {
                break;
            }
            let (value, used) = read_cstring(payload, pos, "error field")?;
            pos += used;
            fields.push((field_type, value));
        }
        Ok(Self { fields })
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::with_capacity(64);
        for (t, v) in &self.fields {
            payload.push(*t);
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        Frame::new(MSG_ERROR_RESPONSE, payload)
    }
}

/// StartupMessage with parameters in the order the client sent them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    pub protocol_version: u32,
    pub parameters: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn new(parameters: Vec<(String, String)>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_3_0,
            parameters,
        }
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn user(&self) -> Option<&str> {
        self.parameter("user")
    }

    /// Requested database; the server defaults it to the user name
    pub fn database(&self) -> Option<&str> {
        self.parameter("database").or_else(|| self.user())
    }

    /// Replace a parameter in place, or append it if absent
    pub fn set_parameter(&mut self, key: &str, value: &str) {
        match self.parameters.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.parameters.push((key.to_string(), value.to_string())),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64);
        body.extend_from_slice(&self.protocol_version.to_be_bytes());
        for (k, v) in &self.parameters {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut buf = Vec::with_capacity(body.len() + 4);
        buf.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }
}

/// CancelRequest sent on a fresh connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub process_id: u32,
    pub secret_key: u32,
}

/// What a new connection opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    Startup(StartupMessage),
    SslRequest,
    CancelRequest(CancelRequest),
}

// ============================================================================
// Helpers
// ============================================================================

/// Read a NUL-terminated string at `pos`; returns the string and bytes used
pub(crate) fn read_cstring(data: &[u8], pos: usize, what: &str) -> Result<(String, usize)> {
    let rest = data
        .get(pos..)
        .ok_or_else(|| ProxyError::Protocol(format!("{} truncated", what)))?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Protocol(format!("{} missing NUL terminator", what)))?;
    Ok((String::from_utf8_lossy(&rest[..nul]).into_owned(), nul + 1))
}

fn read_i32(data: &[u8], pos: usize, what: &str) -> Result<i32> {
    data.get(pos..pos + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ProxyError::Protocol(format!("{} truncated", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode() {
        let frame = Frame::new(MSG_QUERY, b"SELECT 1\0".to_vec());
        let bytes = frame.encode();
        assert_eq!(bytes[0], b'Q');
        assert_eq!(&bytes[1..5], &13u32.to_be_bytes());
        assert_eq!(&bytes[5..], b"SELECT 1\0");
    }

    #[test]
    fn test_frontend_query_and_parse() {
        let q = Frame::new(MSG_QUERY, b"SELECT 1\0".to_vec());
        assert_eq!(q.frontend().unwrap(), FrontendMessage::Query("SELECT 1".into()));

        let mut payload = b"stmt1\0SELECT $1\0".to_vec();
        payload.extend_from_slice(&0u16.to_be_bytes());
        let p = Frame::new(MSG_PARSE, payload);
        assert_eq!(
            p.frontend().unwrap(),
            FrontendMessage::Parse {
                statement: "stmt1".into(),
                query: "SELECT $1".into()
            }
        );
    }

    #[test]
    fn test_frontend_decode_is_a_view() {
        let frame = Frame::new(MSG_QUERY, b"SELECT 1\0".to_vec());
        let before = frame.encode();
        let _ = frame.frontend().unwrap();
        assert_eq!(frame.encode(), before);
    }

    #[test]
    fn test_frontend_truncated_query() {
        let q = Frame::new(MSG_QUERY, b"SELECT 1".to_vec());
        assert!(matches!(q.frontend(), Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_sasl_initial_response() {
        let mut payload = b"SCRAM-SHA-256\0".to_vec();
        payload.extend_from_slice(&5i32.to_be_bytes());
        payload.extend_from_slice(b"n,,ab");
        let frame = Frame::new(MSG_PASSWORD, payload);
        assert_eq!(
            frame.sasl_initial_response().unwrap(),
            FrontendMessage::SaslInitialResponse {
                mechanism: SASL_MECHANISM_SCRAM_SHA_256.into(),
                data: b"n,,ab".to_vec()
            }
        );

        let mut short = b"SCRAM-SHA-256\0".to_vec();
        short.extend_from_slice(&50i32.to_be_bytes());
        assert!(Frame::new(MSG_PASSWORD, short).sasl_initial_response().is_err());
        assert!(Frame::new(MSG_QUERY, vec![]).sasl_response().is_err());
    }

    #[test]
    fn test_authentication_frames() {
        let cases = vec![
            AuthenticationMessage::Ok,
            AuthenticationMessage::CleartextPassword,
            AuthenticationMessage::Md5Password { salt: [1, 2, 3, 4] },
            AuthenticationMessage::Sasl {
                mechanisms: vec![SASL_MECHANISM_SCRAM_SHA_256.into()],
            },
            AuthenticationMessage::SaslContinue { data: b"r=abc".to_vec() },
            AuthenticationMessage::SaslFinal { data: b"v=xyz".to_vec() },
        ];
        for msg in cases {
            let frame = msg.to_frame();
            assert_eq!(frame.backend().unwrap(), BackendMessage::Authentication(msg));
        }
    }

    #[test]
    fn test_unsupported_authentication() {
        // GSS
        let frame = Frame::new(MSG_AUTHENTICATION, 7u32.to_be_bytes().to_vec());
        assert!(frame.backend().is_err());
    }

    #[test]
    fn test_error_response_fields() {
        let err = ErrorNoticeResponse::authentication_failed("tok");
        let decoded = match err.to_frame().backend().unwrap() {
            BackendMessage::ErrorResponse(e) => e,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(decoded.severity(), Some("FATAL"));
        assert_eq!(decoded.localized_severity(), Some("FATAL"));
        assert_eq!(decoded.code(), Some("28P01"));
        assert!(decoded.message().unwrap().contains("password authentication failed"));
    }

    #[test]
    fn test_backend_status_messages() {
        let rfq = Frame::new(MSG_READY_FOR_QUERY, vec![b'T']);
        assert_eq!(
            rfq.backend().unwrap(),
            BackendMessage::ReadyForQuery(TransactionStatus::InTransaction)
        );
        assert!(Frame::new(MSG_READY_FOR_QUERY, vec![]).backend().is_err());

        let ps = Frame::new(MSG_PARAMETER_STATUS, b"server_version\x0016.2\0".to_vec());
        assert_eq!(
            ps.backend().unwrap(),
            BackendMessage::ParameterStatus {
                name: "server_version".into(),
                value: "16.2".into()
            }
        );

        let mut key = 42u32.to_be_bytes().to_vec();
        key.extend_from_slice(&7u32.to_be_bytes());
        assert_eq!(
            Frame::new(MSG_BACKEND_KEY_DATA, key).backend().unwrap(),
            BackendMessage::BackendKeyData {
                process_id: 42,
                secret_key: 7
            }
        );
    }

    #[test]
    fn test_startup_parameters_keep_order() {
        let mut msg = StartupMessage::new(vec![
            ("user".into(), "tok".into()),
            ("application_name".into(), "psql".into()),
            ("database".into(), "tok".into()),
        ]);
        msg.set_parameter("user", "alice");
        msg.set_parameter("database", "app");
        let keys: Vec<_> = msg.parameters.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["user", "application_name", "database"]);
        assert_eq!(msg.user(), Some("alice"));
        assert_eq!(msg.database(), Some("app"));
    }

    #[test]
    fn test_startup_database_defaults_to_user() {
        let msg = StartupMessage::new(vec![("user".into(), "bob".into())]);
        assert_eq!(msg.database(), Some("bob"));
    }
}
