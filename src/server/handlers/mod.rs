//! Database protocol handlers
//!
//! Each handler walks one client connection through the credential bridge
//! for its protocol, then hands the two sockets to the relay. Everything
//! after Ready is shared and lives here.

pub mod mysql;
pub mod postgres;

pub use mysql::MySqlHandler;
pub use postgres::PostgresHandler;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::gateway::Gateway;
use super::relay::{run_relay, DirectionPump, RelayHandler};
use crate::audit::AuditRecorder;
use crate::control_plane::TokenGrant;
use crate::error::{ProxyError, Result};
use crate::session::{ActivityClock, CancellationSignal, IdleWatchdog, SessionTracker};

/// Run `fut` with a deadline, failing with `ProxyError::Timeout(what)`.
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| ProxyError::Timeout(format!("{} after {:?}", what, limit)))?
}

/// Open the TCP connection to the database named by `grant`.
pub(crate) async fn dial_backend(grant: &TokenGrant, connect_timeout: Duration) -> Result<TcpStream> {
    let addr = grant.backend_address();
    debug!("Connecting to backend at {}", addr);

    let stream = timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ProxyError::BackendUnavailable(format!("Connecting to {} timed out", addr)))?
        .map_err(|e| ProxyError::BackendUnavailable(format!("Failed to connect to {}: {}", addr, e)))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY towards {}: {}", addr, e);
    }
    debug!("Connected to backend at {}", addr);
    Ok(stream)
}

/// Relay an established session to completion and tear it down.
///
/// The session must already be created. This registers it for remote
/// cancellation, arms the idle watchdog, reports it connected, relays, and
/// finally runs the teardown exactly once whatever the relay returned.
pub(crate) async fn run_session<H: RelayHandler>(
    gateway: &Gateway,
    tracker: SessionTracker,
    recorder: Arc<AuditRecorder>,
    handler: &mut H,
    client: DirectionPump<H::ClientFrame>,
    backend: DirectionPump<H::BackendFrame>,
) -> Result<()> {
    let session_id = tracker.id();
    let signal = CancellationSignal::new();
    gateway.registry().register(session_id, signal.clone());

    let policy = &gateway.config().session;
    let clock = ActivityClock::new();
    let watchdog = policy
        .max_idle()
        .map(|max_idle| IdleWatchdog::spawn(clock.clone(), max_idle, policy.keep_alive(), signal.clone()));

    let _ = tracker.connected().await;
    info!(
        session_id = %session_id,
        user = %tracker.session().user,
        asset = %tracker.session().asset,
        "Session started"
    );

    let result = run_relay(handler, client, backend, &signal, Some(&clock)).await;
    match &result {
        Ok(outcome) => info!(session_id = %session_id, "Session ended: {:?}", outcome),
        // An active session only ever ends Disconnected; the cause stays in the log
        Err(e) => warn!(session_id = %session_id, "Session relay ended by error: {}", e),
    }

    teardown(gateway, &tracker, &recorder, watchdog).await;
    result.map(|_| ())
}

/// Stop recording, report the disconnect, and forget the session.
async fn teardown(
    gateway: &Gateway,
    tracker: &SessionTracker,
    recorder: &AuditRecorder,
    watchdog: Option<JoinHandle<()>>,
) {
    recorder.end_and_wait().await;
    let _ = tracker.disconnected().await;
    gateway.registry().unregister(&tracker.id());
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    let dropped = recorder.commands().dropped() + recorder.replay().dropped();
    if dropped > 0 {
        warn!(session_id = %tracker.id(), "{} audit records were dropped", dropped);
    }
}

/// Report a created session that never reached the relay.
pub(crate) async fn abandon_session(tracker: &SessionTracker, error: &ProxyError) {
    let _ = tracker.failed(error).await;
    let _ = tracker.disconnected().await;
}
