//! MySQL protocol handler
//!
//! The client is authenticated against the gateway before any backend is
//! touched, because the token decides which backend that is:
//!
//! 1. Send a synthetic HandshakeV10 (our version, our salt, native password)
//! 2. Receive HandshakeResponse41; the username is the access token
//! 3. Resolve the token and verify the scramble against the token secret
//! 4. Dial the backend and log in with the real credentials
//! 5. Create the session, send OK to the client
//! 6. Relay traffic
//!
//! Failures before step 5 close the client connection without error text.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use super::super::bridge::{Bridge, BridgeState};
use super::super::gateway::Gateway;
use super::super::relay::{spawn_reader, MySqlFrameSource, MySqlRelayHandler};
use super::{abandon_session, bounded, dial_backend, run_session};
use crate::audit::AuditRecorder;
use crate::control_plane::{lifecycle_of, TokenGrant};
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::*;
use crate::protocol::DatabaseProtocol;
use crate::session::{Session, SessionTracker};

/// The client's login after the gateway accepted it
struct ClientLogin {
    response: HandshakeResponse41,
    /// Sequence id of the client's last authentication packet
    last_seq: u8,
}

/// MySQL protocol handler
pub struct MySqlHandler {
    gateway: Arc<Gateway>,
    client: TcpStream,
    client_addr: SocketAddr,
    connection_id: u64,
    bridge: Bridge,
}

impl MySqlHandler {
    pub fn new(
        gateway: Arc<Gateway>,
        client: TcpStream,
        client_addr: SocketAddr,
        connection_id: u64,
    ) -> Self {
        Self {
            gateway,
            client,
            client_addr,
            connection_id,
            bridge: Bridge::new(connection_id, DatabaseProtocol::MySql),
        }
    }

    /// Handle the MySQL connection
    pub async fn handle(mut self) -> Result<()> {
        let (backend, grant, login) = match self.bridge_credentials().await {
            Ok(bridged) => bridged,
            Err(e) => {
                self.bridge.abort(&e.to_string());
                if e.is_auth_failure() {
                    warn!(client = %self.client_addr, "MySQL login refused: {}", e);
                }
                return Err(e);
            }
        };
        self.bridge.advance(BridgeState::Ready)?;

        let session = Session::new(
            &grant,
            DatabaseProtocol::MySql,
            self.client_addr,
            &self.gateway.config().session,
        );
        let tracker = SessionTracker::new(session, lifecycle_of(self.gateway.control_plane().clone()));
        if let Err(e) = tracker.create().await {
            self.bridge.abort("session could not be created");
            return Err(e);
        }

        let ok = build_ok_packet(&OkPacket::default());
        if let Err(e) = write_packet(&mut self.client, login.last_seq.wrapping_add(1), &ok).await {
            abandon_session(&tracker, &e).await;
            return Err(e);
        }

        let recorder = Arc::new(AuditRecorder::start(
            tracker.session(),
            self.gateway.storage().clone(),
            &self.gateway.config().audit,
        ));

        let (client_r, client_w) = self.client.into_split();
        let (backend_r, backend_w) = backend.into_split();
        let mut handler = MySqlRelayHandler::new(client_w, backend_w, recorder.clone());

        run_session(
            &self.gateway,
            tracker,
            recorder,
            &mut handler,
            spawn_reader(MySqlFrameSource::new(client_r)),
            spawn_reader(MySqlFrameSource::new(backend_r)),
        )
        .await
    }

    /// Walk the bridge up to (not including) Ready.
    async fn bridge_credentials(&mut self) -> Result<(TcpStream, TokenGrant, ClientLogin)> {
        let salt = generate_salt();
        let login = self.authenticate_client(&salt).await?;

        self.bridge.advance(BridgeState::ResolvingToken)?;
        let grant = self.resolve_token(&salt, &login).await?;

        self.bridge.advance(BridgeState::BackendDialing)?;
        let config = self.gateway.config();
        let mut backend = dial_backend(&grant, config.server.connect_timeout()).await?;

        self.bridge.advance(BridgeState::BackendHandshaking)?;
        bounded(
            config.server.handshake_timeout(),
            "backend login",
            backend_login(&mut backend, &grant, &login.response),
        )
        .await?;

        info!(
            client = %self.client_addr,
            conn_id = self.connection_id,
            "Bridged MySQL login as '{}' to {}",
            grant.username,
            grant.backend_address()
        );
        Ok((backend, grant, login))
    }

    /// Send the synthetic handshake and read the client's answer.
    async fn authenticate_client(&mut self, salt: &[u8; 20]) -> Result<ClientLogin> {
        let config = self.gateway.config().clone();
        let handshake = HandshakeV10::synthetic(
            &config.mysql.server_version,
            self.connection_id as u32,
            salt,
        );
        write_packet(&mut self.client, 0, &build_handshake_v10(&handshake)).await?;
        debug!(
            "HandshakeV10 sent: version={}, capabilities=0x{:08X}",
            handshake.server_version,
            handshake.capability_flags()
        );

        let limit = config.server.handshake_timeout();
        let (header, payload) =
            bounded(limit, "client handshake response", read_packet(&mut self.client)).await?;

        if payload.len() >= 4 {
            let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if caps & CLIENT_SSL != 0 {
                return Err(ProxyError::Protocol(
                    "client requested TLS, which the gateway does not offer".into(),
                ));
            }
        }
        let mut response = parse_handshake_response41(&payload)?;
        let mut last_seq = header.sequence_id;
        debug!(
            "Client handshake response: seq={}, caps=0x{:08X}, plugin={:?}",
            header.sequence_id, response.capability_flags, response.auth_plugin_name
        );

        // A client that answered with another plugin is asked to switch
        let plugin = response.auth_plugin_name.as_deref().unwrap_or(NATIVE_PASSWORD_PLUGIN);
        if plugin != NATIVE_PASSWORD_PLUGIN {
            debug!("Client used {}, requesting {}", plugin, NATIVE_PASSWORD_PLUGIN);
            let switch = build_auth_switch_request(&AuthSwitchRequest {
                plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
                plugin_data: salt.to_vec(),
            });
            write_packet(&mut self.client, last_seq.wrapping_add(1), &switch).await?;
            let (header, auth_response) =
                bounded(limit, "client auth switch response", read_packet(&mut self.client))
                    .await?;
            response.auth_response = auth_response;
            response.auth_plugin_name = Some(NATIVE_PASSWORD_PLUGIN.to_string());
            last_seq = header.sequence_id;
        }

        Ok(ClientLogin { response, last_seq })
    }

    /// Resolve the token and check the client's proof and permission.
    async fn resolve_token(&self, salt: &[u8; 20], login: &ClientLogin) -> Result<TokenGrant> {
        let token = &login.response.username;
        let grant = self.gateway.control_plane().resolve_token(token).await?;

        if !verify_scramble(salt, grant.secret.as_bytes(), &login.response.auth_response) {
            return Err(ProxyError::Auth("token proof does not match".into()));
        }
        if !grant.permitted {
            return Err(ProxyError::Auth(format!(
                "user '{}' is not permitted to connect to {}",
                grant.user, grant.asset
            )));
        }
        Ok(grant)
    }
}

/// Capabilities to request from the backend on behalf of the client.
///
/// Only what the client, the backend and the gateway all support, minus
/// anything the relay cannot pass through unchanged.
fn backend_capabilities(client: u32, backend: u32, with_database: bool) -> u32 {
    let mut caps = client & backend & GATEWAY_SERVER_CAPABILITIES & !GATEWAY_FORBIDDEN_CAPABILITIES;
    caps |= CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION;
    if backend & CLIENT_PLUGIN_AUTH != 0 {
        caps |= CLIENT_PLUGIN_AUTH;
    }
    if with_database {
        caps |= CLIENT_CONNECT_WITH_DB;
    } else {
        caps &= !CLIENT_CONNECT_WITH_DB;
    }
    caps
}

/// Auth response for `plugin` over `salt`
fn compute_auth(plugin: &str, password: &str, salt: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD_PLUGIN => Ok(scramble(salt, password.as_bytes())),
        CACHING_SHA2_PLUGIN => Ok(caching_sha2_scramble(salt, password.as_bytes())),
        other => Err(ProxyError::Auth(format!("unsupported backend auth plugin '{}'", other))),
    }
}

/// Log in to the backend with the grant's credentials.
async fn backend_login(
    backend: &mut TcpStream,
    grant: &TokenGrant,
    client: &HandshakeResponse41,
) -> Result<()> {
    let (header, payload) = read_packet(backend).await?;
    if is_err_packet(&payload) {
        let err = parse_err_packet(&payload)?;
        return Err(ProxyError::BackendUnavailable(format!(
            "backend refused connection: {} - {}",
            err.error_code, err.error_message
        )));
    }
    let handshake = parse_handshake_v10(&payload)?;
    debug!(
        "Backend: {} (conn_id={}, auth_plugin={})",
        handshake.server_version, handshake.connection_id, handshake.auth_plugin_name
    );

    let plugin = if handshake.auth_plugin_name.is_empty() {
        NATIVE_PASSWORD_PLUGIN.to_string()
    } else {
        handshake.auth_plugin_name.clone()
    };
    let password: &str = &grant.password;
    let database = grant.database.clone().or_else(|| client.database.clone());
    let capability_flags = backend_capabilities(
        client.capability_flags,
        handshake.capability_flags(),
        database.is_some(),
    );

    let login = HandshakeResponse41 {
        capability_flags,
        max_packet_size: client.max_packet_size,
        character_set: client.character_set,
        username: grant.username.clone(),
        auth_response: compute_auth(&plugin, password, &handshake.scramble())?,
        database,
        auth_plugin_name: Some(plugin),
    };
    debug!(
        "Sending login to backend: user={}, caps=0x{:08X}, db={:?}",
        login.username, login.capability_flags, login.database
    );
    write_packet(
        backend,
        header.sequence_id.wrapping_add(1),
        &build_handshake_response41(&login),
    )
    .await?;

    loop {
        let (header, reply) = read_packet(backend).await?;
        match reply.first() {
            Some(&OK_HEADER) => {
                debug!("Backend login OK");
                return Ok(());
            }
            Some(&ERR_HEADER) => {
                let err = parse_err_packet(&reply)?;
                return Err(ProxyError::Auth(format!(
                    "backend rejected credentials: {} - {}",
                    err.error_code, err.error_message
                )));
            }
            Some(&AUTH_SWITCH_REQUEST) => {
                let switch = parse_auth_switch_request(&reply)?;
                debug!("Backend switched auth plugin to {}", switch.plugin_name);
                let response = compute_auth(&switch.plugin_name, password, &switch.plugin_data)?;
                write_packet(backend, header.sequence_id.wrapping_add(1), &response).await?;
            }
            Some(&AUTH_MORE_DATA) => match reply.get(1) {
                Some(&CACHING_SHA2_FAST_AUTH_OK) => debug!("Backend accepted fast auth"),
                Some(&CACHING_SHA2_FULL_AUTH) => {
                    return Err(ProxyError::Auth(
                        "backend requires full caching_sha2 authentication, which needs TLS".into(),
                    ));
                }
                _ => {
                    return Err(ProxyError::Protocol(
                        "unexpected auth-more-data from backend".into(),
                    ));
                }
            },
            _ => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected packet 0x{:02X} during backend login",
                    reply.first().copied().unwrap_or(0)
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn grant(port: u16) -> TokenGrant {
        TokenGrant {
            username: "app_rw".into(),
            password: "backend-pw".to_string().into(),
            host: "127.0.0.1".into(),
            port,
            database: Some("orders".into()),
            permitted: true,
            ..TokenGrant::default()
        }
    }

    fn client_response() -> HandshakeResponse41 {
        HandshakeResponse41 {
            capability_flags: GATEWAY_SERVER_CAPABILITIES,
            username: "tok-123".into(),
            ..HandshakeResponse41::default()
        }
    }

    /// Backend that advertises `plugin`, then plays `replies` in order
    async fn fake_backend(
        plugin: &'static str,
        replies: Vec<Vec<u8>>,
    ) -> (u16, JoinHandle<HandshakeResponse41>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hs = HandshakeV10::synthetic("8.0.36", 42, &[5u8; 20]);
            hs.auth_plugin_name = plugin.to_string();
            hs.set_capability_flags(GATEWAY_SERVER_CAPABILITIES | CLIENT_DEPRECATE_EOF);
            write_packet(&mut stream, 0, &build_handshake_v10(&hs)).await.unwrap();

            let (header, payload) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header.sequence_id, 1);
            let login = parse_handshake_response41(&payload).unwrap();
            let mut seq = header.sequence_id;
            for reply in replies {
                write_packet(&mut stream, seq + 1, &reply).await.unwrap();
                if reply.first() == Some(&AUTH_SWITCH_REQUEST) {
                    let (h, _) = read_packet(&mut stream).await.unwrap();
                    seq = h.sequence_id;
                } else {
                    seq += 1;
                }
            }
            login
        });
        (port, task)
    }

    #[test]
    fn test_backend_capabilities_are_intersected() {
        let client = GATEWAY_SERVER_CAPABILITIES;
        let backend = GATEWAY_SERVER_CAPABILITIES | CLIENT_DEPRECATE_EOF | CLIENT_SSL;
        let caps = backend_capabilities(client, backend, false);
        assert_eq!(caps & GATEWAY_FORBIDDEN_CAPABILITIES, 0);
        assert_eq!(caps & CLIENT_CONNECT_WITH_DB, 0);
        assert_ne!(caps & CLIENT_PLUGIN_AUTH, 0);
        assert_ne!(caps & CLIENT_PROTOCOL_41, 0);
    }

    #[test]
    fn test_backend_capabilities_with_database() {
        let caps = backend_capabilities(CLIENT_PROTOCOL_41, CLIENT_PROTOCOL_41, true);
        assert_ne!(caps & CLIENT_CONNECT_WITH_DB, 0);
        assert_eq!(caps & CLIENT_PLUGIN_AUTH, 0);
    }

    #[test]
    fn test_compute_auth_by_plugin() {
        let salt = [3u8; 20];
        assert_eq!(
            compute_auth(NATIVE_PASSWORD_PLUGIN, "pw", &salt).unwrap(),
            scramble(&salt, b"pw")
        );
        assert_eq!(compute_auth(CACHING_SHA2_PLUGIN, "pw", &salt).unwrap().len(), 32);
        assert!(compute_auth("sha256_password", "pw", &salt).is_err());
    }

    #[tokio::test]
    async fn test_backend_login_with_real_credentials() {
        let ok = build_ok_packet(&OkPacket::default());
        let (port, backend) = fake_backend(NATIVE_PASSWORD_PLUGIN, vec![ok]).await;
        let grant = grant(port);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        backend_login(&mut stream, &grant, &client_response()).await.unwrap();

        let login = backend.await.unwrap();
        assert_eq!(login.username, "app_rw");
        assert_eq!(login.database.as_deref(), Some("orders"));
        assert_eq!(login.auth_response, scramble(&[5u8; 20], b"backend-pw"));
        assert_eq!(login.capability_flags & CLIENT_DEPRECATE_EOF, 0);
    }

    #[tokio::test]
    async fn test_backend_login_follows_caching_sha2_fast_path() {
        let (port, backend) = fake_backend(
            CACHING_SHA2_PLUGIN,
            vec![
                vec![AUTH_MORE_DATA, CACHING_SHA2_FAST_AUTH_OK],
                build_ok_packet(&OkPacket::default()),
            ],
        )
        .await;
        let grant = grant(port);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        backend_login(&mut stream, &grant, &client_response()).await.unwrap();
        let login = backend.await.unwrap();
        assert_eq!(login.auth_response, caching_sha2_scramble(&[5u8; 20], b"backend-pw"));
    }

    #[tokio::test]
    async fn test_backend_login_full_auth_is_refused() {
        let (port, _backend) = fake_backend(
            CACHING_SHA2_PLUGIN,
            vec![vec![AUTH_MORE_DATA, CACHING_SHA2_FULL_AUTH]],
        )
        .await;
        let grant = grant(port);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        let err = backend_login(&mut stream, &grant, &client_response()).await.unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_backend_login_honours_auth_switch() {
        let mut switch = vec![AUTH_SWITCH_REQUEST];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&[8u8; 20]);
        switch.push(0);
        let (port, backend) = fake_backend(
            CACHING_SHA2_PLUGIN,
            vec![switch, build_ok_packet(&OkPacket::default())],
        )
        .await;
        let grant = grant(port);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        backend_login(&mut stream, &grant, &client_response()).await.unwrap();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_err_is_auth_failure() {
        let err = build_err_packet(&ErrPacket::new(1045, "Access denied for user 'app_rw'"));
        let (port, _backend) = fake_backend(NATIVE_PASSWORD_PLUGIN, vec![err]).await;
        let grant = grant(port);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        let err = backend_login(&mut stream, &grant, &client_response()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(ref m) if m.contains("1045")));
    }
}
