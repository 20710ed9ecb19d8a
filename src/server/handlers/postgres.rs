//! PostgreSQL protocol handler
//!
//! The client logs in with SCRAM-SHA-256 using its access token as the
//! user name and the token secret as the password. Only then is the
//! backend dialed and logged into with the real credentials:
//!
//! 1. Refuse SSLRequest, read the StartupMessage
//! 2. Resolve the token, run server-side SCRAM against its secret
//! 3. Dial the backend, send a rewritten StartupMessage
//! 4. Authenticate to the backend (SCRAM, MD5, cleartext or trust)
//! 5. Create the session, send AuthenticationOk to the client
//! 6. Relay; ParameterStatus, BackendKeyData and ReadyForQuery come
//!    straight from the backend
//!
//! Failures before step 5 are answered with a FATAL ErrorResponse.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use super::super::bridge::{Bridge, BridgeState};
use super::super::gateway::Gateway;
use super::super::relay::{spawn_reader, PostgresFrameSource, PostgresRelayHandler};
use super::{abandon_session, bounded, dial_backend, run_session};
use crate::audit::AuditRecorder;
use crate::control_plane::{lifecycle_of, TokenGrant};
use crate::error::{ProxyError, Result};
use crate::protocol::postgres::constants::*;
use crate::protocol::postgres::*;
use crate::protocol::DatabaseProtocol;
use crate::session::{Session, SessionTracker};

/// PostgreSQL protocol handler
pub struct PostgresHandler {
    gateway: Arc<Gateway>,
    client: TcpStream,
    client_addr: SocketAddr,
    connection_id: u64,
    bridge: Bridge,
    /// User name from the client's StartupMessage, once read
    token: Option<String>,
}

impl PostgresHandler {
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
            bridge: Bridge::new(connection_id, DatabaseProtocol::Postgres),
            token: None,
        }
    }

    /// Handle the PostgreSQL connection
    pub async fn handle(mut self) -> Result<()> {
        let (backend, grant) = match self.bridge_credentials().await {
            Ok(Some(bridged)) => bridged,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.bridge.abort(&e.to_string());
                if e.is_auth_failure() {
                    warn!(client = %self.client_addr, "PostgreSQL login refused: {}", e);
                }
                let user = self.token.as_deref().unwrap_or_default();
                if let Some(response) = client_error(&e, user) {
                    if let Err(send_err) = send_error(&mut self.client, &response).await {
                        debug!("Could not send ErrorResponse to client: {}", send_err);
                    }
                }
                return Err(e);
            }
        };
        self.bridge.advance(BridgeState::Ready)?;

        let session = Session::new(
            &grant,
            DatabaseProtocol::Postgres,
            self.client_addr,
            &self.gateway.config().session,
        );
        let tracker = SessionTracker::new(session, lifecycle_of(self.gateway.control_plane().clone()));
        if let Err(e) = tracker.create().await {
            self.bridge.abort("session could not be created");
            let _ = send_error(
                &mut self.client,
                &ErrorNoticeResponse::backend_unreachable(),
            )
            .await;
            return Err(e);
        }

        if let Err(e) = send_frame(&mut self.client, &AuthenticationMessage::Ok.to_frame()).await {
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
        let mut handler = PostgresRelayHandler::new(client_w, backend_w, recorder.clone());

        run_session(
            &self.gateway,
            tracker,
            recorder,
            &mut handler,
            spawn_reader(PostgresFrameSource::new(client_r)),
            spawn_reader(PostgresFrameSource::new(backend_r)),
        )
        .await
    }

    /// Walk the bridge up to (not including) Ready.
    ///
    /// `Ok(None)` means the connection carried a CancelRequest and is done.
    async fn bridge_credentials(&mut self) -> Result<Option<(TcpStream, TokenGrant)>> {
        let config = self.gateway.config().clone();
        let limit = config.server.handshake_timeout();

        let Some(startup) = bounded(limit, "client startup", self.read_startup()).await? else {
            return Ok(None);
        };
        let token = startup.user().unwrap_or_default().to_string();
        self.token = Some(token.clone());
        debug!(
            "StartupMessage: database={:?}, {} parameters",
            startup.database(),
            startup.parameters.len()
        );

        self.bridge.advance(BridgeState::ResolvingToken)?;
        let grant = self.gateway.control_plane().resolve_token(&token).await?;
        if !grant.permitted {
            return Err(ProxyError::Auth(format!(
                "user '{}' is not permitted to connect to {}",
                grant.user, grant.asset
            )));
        }
        bounded(
            limit,
            "client SCRAM exchange",
            self.authenticate_client(&grant, config.postgres.scram_iterations),
        )
        .await?;

        self.bridge.advance(BridgeState::BackendDialing)?;
        let mut backend = dial_backend(&grant, config.server.connect_timeout()).await?;

        self.bridge.advance(BridgeState::BackendHandshaking)?;
        let rewritten = backend_startup(&startup, &token, &grant);
        bounded(limit, "backend login", backend_login(&mut backend, &rewritten, &grant))
            .await
            .map_err(|e| match e {
                ProxyError::Timeout(m) => ProxyError::BackendUnavailable(m),
                other => other,
            })?;

        info!(
            client = %self.client_addr,
            conn_id = self.connection_id,
            "Bridged PostgreSQL login as '{}' to {}",
            grant.username,
            grant.backend_address()
        );
        Ok(Some((backend, grant)))
    }

    /// Read until a StartupMessage, refusing one SSLRequest on the way.
    async fn read_startup(&mut self) -> Result<Option<StartupMessage>> {
        let mut ssl_refused = false;
        loop {
            match read_startup_message(&mut self.client).await? {
                StartupRequest::SslRequest if !ssl_refused => {
                    debug!("Refusing SSLRequest");
                    refuse_ssl(&mut self.client).await?;
                    ssl_refused = true;
                }
                StartupRequest::SslRequest => {
                    return Err(ProxyError::Protocol("repeated SSLRequest".into()));
                }
                StartupRequest::CancelRequest(cancel) => {
                    info!(
                        client = %self.client_addr,
                        "Ignoring CancelRequest for backend pid {}",
                        cancel.process_id
                    );
                    return Ok(None);
                }
                StartupRequest::Startup(startup) => return Ok(Some(startup)),
            }
        }
    }

    /// Server-side SCRAM-SHA-256 against the token secret.
    ///
    /// Ends with SASLFinal sent; AuthenticationOk waits for the backend.
    async fn authenticate_client(&mut self, grant: &TokenGrant, iterations: u32) -> Result<()> {
        send_frame(
            &mut self.client,
            &AuthenticationMessage::Sasl {
                mechanisms: vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()],
            }
            .to_frame(),
        )
        .await?;

        let frame = read_frame(&mut self.client).await?;
        let FrontendMessage::SaslInitialResponse { mechanism, data } = frame.sasl_initial_response()?
        else {
            return Err(ProxyError::Protocol("expected SASLInitialResponse".into()));
        };
        if mechanism != SASL_MECHANISM_SCRAM_SHA_256 {
            return Err(ProxyError::Auth(format!("unsupported SASL mechanism '{}'", mechanism)));
        }

        let scram = ScramConversation::new(ScramRole::server(&grant.secret, iterations));
        let (scram, ScramStep::Continue(server_first)) = scram.step_blocking(Some(data)).await? else {
            return Err(ProxyError::Auth("SCRAM: exchange ended early".into()));
        };
        send_frame(
            &mut self.client,
            &AuthenticationMessage::SaslContinue { data: server_first }.to_frame(),
        )
        .await?;

        let frame = read_frame(&mut self.client).await?;
        let FrontendMessage::SaslResponse(client_final) = frame.sasl_response()? else {
            return Err(ProxyError::Protocol("expected SASLResponse".into()));
        };
        let (_, ScramStep::Complete(Some(server_final))) = scram.step_blocking(Some(client_final)).await? else {
            return Err(ProxyError::Auth("SCRAM: exchange did not complete".into()));
        };
        send_frame(
            &mut self.client,
            &AuthenticationMessage::SaslFinal { data: server_final }.to_frame(),
        )
        .await?;
        debug!("Client proved knowledge of the token secret");
        Ok(())
    }
}

/// The ErrorResponse a failed bridge owes the client, if any.
fn client_error(error: &ProxyError, user: &str) -> Option<ErrorNoticeResponse> {
    match error {
        e if e.is_auth_failure() => Some(ErrorNoticeResponse::authentication_failed(user)),
        ProxyError::BackendUnavailable(_) => Some(ErrorNoticeResponse::backend_unreachable()),
        ProxyError::Protocol(message) => Some(ErrorNoticeResponse::fatal(
            SQLSTATE_PROTOCOL_VIOLATION,
            message,
        )),
        _ => None,
    }
}

/// The client's StartupMessage with the grant's account and database.
///
/// Other parameters keep their order. A database named after the token
/// (the client default) becomes the backend user's default.
fn backend_startup(client: &StartupMessage, token: &str, grant: &TokenGrant) -> StartupMessage {
    let mut startup = client.clone();
    startup.set_parameter("user", &grant.username);
    match &grant.database {
        Some(database) => startup.set_parameter("database", database),
        None => {
            if client.parameter("database") == Some(token) {
                startup.set_parameter("database", &grant.username);
            }
        }
    }
    startup
}

/// Log in to the backend with the grant's credentials.
async fn backend_login(
    backend: &mut TcpStream,
    startup: &StartupMessage,
    grant: &TokenGrant,
) -> Result<()> {
    write_startup_message(backend, startup).await?;

    let mut scram: Option<ScramConversation> = None;
    loop {
        let frame = read_frame(backend).await?;
        match frame.backend()? {
            BackendMessage::Authentication(AuthenticationMessage::Ok) => {
                debug!("Backend login OK");
                return Ok(());
            }
            BackendMessage::Authentication(AuthenticationMessage::Sasl { mechanisms }) => {
                if !mechanisms.iter().any(|m| m == SASL_MECHANISM_SCRAM_SHA_256) {
                    return Err(ProxyError::Auth(format!(
                        "backend offers no supported SASL mechanism: {:?}",
                        mechanisms
                    )));
                }
                let mut conversation =
                    ScramConversation::new(ScramRole::client(&grant.username, &grant.password));
                let ScramStep::Continue(client_first) = conversation.step(None)? else {
                    return Err(ProxyError::Auth("SCRAM: exchange ended early".into()));
                };
                scram = Some(conversation);
                send_frame(
                    backend,
                    &build_sasl_initial_response(SASL_MECHANISM_SCRAM_SHA_256, &client_first),
                )
                .await?;
            }
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue { data }) => {
                let conversation = scram
                    .take()
                    .ok_or_else(|| ProxyError::Protocol("SASLContinue before SASL".into()))?;
                let (conversation, ScramStep::Continue(client_final)) =
                    conversation.step_blocking(Some(data)).await?
                else {
                    return Err(ProxyError::Auth("SCRAM: exchange ended early".into()));
                };
                scram = Some(conversation);
                send_frame(backend, &build_sasl_response(&client_final)).await?;
            }
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal { data }) => {
                let conversation = scram
                    .as_mut()
                    .ok_or_else(|| ProxyError::Protocol("SASLFinal before SASL".into()))?;
                conversation.step(Some(&data))?;
                debug!("Backend server signature verified");
            }
            BackendMessage::Authentication(AuthenticationMessage::CleartextPassword) => {
                send_frame(backend, &build_password_message(&grant.password)).await?;
            }
            BackendMessage::Authentication(AuthenticationMessage::Md5Password { salt }) => {
                let hashed = md5_password(&grant.username, &grant.password, &salt);
                send_frame(backend, &build_password_message(&hashed)).await?;
            }
            BackendMessage::ErrorResponse(err) => {
                return Err(ProxyError::Auth(format!(
                    "backend rejected credentials: {} {}",
                    err.code().unwrap_or("?????"),
                    err.message().unwrap_or_default()
                )));
            }
            BackendMessage::NoticeResponse(notice) => {
                debug!("Backend notice during login: {:?}", notice.message());
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected {:?} during backend login",
                    other
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

    fn grant(port: u16, database: Option<&str>) -> TokenGrant {
        TokenGrant {
            username: "app".into(),
            password: "s3cr3t".to_string().into(),
            host: "127.0.0.1".into(),
            port,
            database: database.map(String::from),
            permitted: true,
            ..TokenGrant::default()
        }
    }

    fn client_startup(database: &str) -> StartupMessage {
        StartupMessage::new(vec![
            ("user".into(), "tok-9".into()),
            ("application_name".into(), "psql".into()),
            ("database".into(), database.into()),
        ])
    }

    async fn read_client_startup(stream: &mut TcpStream) -> StartupMessage {
        match read_startup_message(stream).await.unwrap() {
            StartupRequest::Startup(s) => s,
            other => panic!("expected startup, got {:?}", other),
        }
    }

    /// Backend that demands MD5, then accepts or rejects
    async fn md5_backend(accept: bool) -> (u16, JoinHandle<(StartupMessage, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let startup = read_client_startup(&mut stream).await;
            let md5 = AuthenticationMessage::Md5Password { salt: [1, 2, 3, 4] };
            send_frame(&mut stream, &md5.to_frame()).await.unwrap();
            let password = read_frame(&mut stream).await.unwrap();
            let reply = if accept {
                AuthenticationMessage::Ok.to_frame()
            } else {
                ErrorNoticeResponse::authentication_failed("app").to_frame()
            };
            send_frame(&mut stream, &reply).await.unwrap();
            (startup, password.payload)
        });
        (port, task)
    }

    #[test]
    fn test_backend_startup_uses_grant_database() {
        let out = backend_startup(&client_startup("tok-9"), "tok-9", &grant(1, Some("orders")));
        assert_eq!(
            out.parameters,
            vec![
                ("user".to_string(), "app".to_string()),
                ("application_name".to_string(), "psql".to_string()),
                ("database".to_string(), "orders".to_string()),
            ]
        );
    }

    #[test]
    fn test_backend_startup_token_database_becomes_username() {
        let out = backend_startup(&client_startup("tok-9"), "tok-9", &grant(1, None));
        assert_eq!(out.parameter("database"), Some("app"));

        let out = backend_startup(&client_startup("reports"), "tok-9", &grant(1, None));
        assert_eq!(out.parameter("database"), Some("reports"));
    }

    #[test]
    fn test_client_error_codes() {
        let auth = client_error(&ProxyError::Auth("bad".into()), "tok").unwrap();
        assert_eq!(auth.code(), Some(SQLSTATE_INVALID_PASSWORD));
        let plane = client_error(&ProxyError::ControlPlane("down".into()), "tok").unwrap();
        assert_eq!(plane.code(), Some(SQLSTATE_INVALID_PASSWORD));
        let dial = client_error(&ProxyError::BackendUnavailable("refused".into()), "tok").unwrap();
        assert_eq!(dial.code(), Some(SQLSTATE_SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION));
        assert!(client_error(&ProxyError::Timeout("slow".into()), "tok").is_none());
    }

    #[tokio::test]
    async fn test_backend_login_md5() {
        let (port, backend) = md5_backend(true).await;
        let grant = grant(port, Some("orders"));
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        let startup = backend_startup(&client_startup("tok-9"), "tok-9", &grant);
        backend_login(&mut stream, &startup, &grant).await.unwrap();

        let (seen, password) = backend.await.unwrap();
        assert_eq!(seen.user(), Some("app"));
        let expected = md5_password("app", "s3cr3t", &[1, 2, 3, 4]);
        assert_eq!(password, format!("{}\0", expected).into_bytes());
    }

    #[tokio::test]
    async fn test_backend_rejection_is_auth_failure() {
        let (port, _backend) = md5_backend(false).await;
        let grant = grant(port, None);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        let startup = backend_startup(&client_startup("tok-9"), "tok-9", &grant);
        let err = backend_login(&mut stream, &startup, &grant).await.unwrap_err();
        assert!(matches!(err, ProxyError::Auth(ref m) if m.contains("28P01")));
    }

    #[tokio::test]
    async fn test_backend_login_scram() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_client_startup(&mut stream).await;
            let offer = AuthenticationMessage::Sasl {
                mechanisms: vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()],
            };
            send_frame(&mut stream, &offer.to_frame()).await.unwrap();

            let mut server = ScramConversation::new(ScramRole::server("s3cr3t", 4096));
            let FrontendMessage::SaslInitialResponse { data, .. } =
                read_frame(&mut stream).await.unwrap().sasl_initial_response().unwrap()
            else {
                panic!("expected SASLInitialResponse");
            };
            let ScramStep::Continue(first) = server.step(Some(&data)).unwrap() else {
                panic!("expected server-first");
            };
            let cont = AuthenticationMessage::SaslContinue { data: first };
            send_frame(&mut stream, &cont.to_frame()).await.unwrap();

            let FrontendMessage::SaslResponse(data) =
                read_frame(&mut stream).await.unwrap().sasl_response().unwrap()
            else {
                panic!("expected SASLResponse");
            };
            let ScramStep::Complete(Some(last)) = server.step(Some(&data)).unwrap() else {
                panic!("expected server-final");
            };
            let fin = AuthenticationMessage::SaslFinal { data: last };
            send_frame(&mut stream, &fin.to_frame()).await.unwrap();
            send_frame(&mut stream, &AuthenticationMessage::Ok.to_frame()).await.unwrap();
        });

        let grant = grant(port, None);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        let startup = backend_startup(&client_startup("tok-9"), "tok-9", &grant);
        backend_login(&mut stream, &startup, &grant).await.unwrap();
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_huge_iteration_count_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_client_startup(&mut stream).await;
            let offer = AuthenticationMessage::Sasl {
                mechanisms: vec![SASL_MECHANISM_SCRAM_SHA_256.to_string()],
            };
            send_frame(&mut stream, &offer.to_frame()).await.unwrap();

            let FrontendMessage::SaslInitialResponse { data, .. } =
                read_frame(&mut stream).await.unwrap().sasl_initial_response().unwrap()
            else {
                panic!("expected SASLInitialResponse");
            };
            let client_first = String::from_utf8(data).unwrap();
            let nonce = client_first.rsplit_once("r=").unwrap().1;
            let first = format!("r={}srv,s=c2FsdA==,i=4294967295", nonce);
            let cont = AuthenticationMessage::SaslContinue { data: first.into_bytes() };
            send_frame(&mut stream, &cont.to_frame()).await.unwrap();
            // Hold the socket until the gateway gives up
            let _ = read_frame(&mut stream).await;
        });

        let grant = grant(port, None);
        let mut stream = dial_backend(&grant, Duration::from_secs(5)).await.unwrap();
        let startup = backend_startup(&client_startup("tok-9"), "tok-9", &grant);
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            backend_login(&mut stream, &startup, &grant),
        )
        .await
        .expect("login must be refused without deriving keys")
        .unwrap_err();
        assert!(matches!(err, ProxyError::Auth(ref m) if m.contains("iteration count")));
        drop(stream);
        backend.await.unwrap();
    }
}
