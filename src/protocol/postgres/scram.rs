//! SCRAM-SHA-256 (RFC 5802 / RFC 7677)
//!
//! One conversation type drives both ends of the exchange. The gateway plays
//! the server towards the client (proving the token secret) and the client
//! towards the backend (proving the real password).
//!
//! Channel binding is not offered: TLS is never terminated by the gateway.
//! SASLprep is not applied; ASCII credentials behave as in libpq.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::constants::MAX_SCRAM_ITERATIONS;
use crate::error::{ProxyError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Which side of the exchange this conversation plays
pub enum ScramRole {
    /// Prove `password` to a server
    Client {
        username: String,
        password: Zeroizing<String>,
    },
    /// Verify that a client knows `secret`
    Server {
        secret: Zeroizing<String>,
        salt: Vec<u8>,
        iterations: u32,
    },
}

impl ScramRole {
    pub fn client(username: &str, password: &str) -> Self {
        ScramRole::Client {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        }
    }

    /// Server role with a fresh random salt
    pub fn server(secret: &str, iterations: u32) -> Self {
        let salt: [u8; 16] = rand::thread_rng().gen();
        ScramRole::Server {
            secret: Zeroizing::new(secret.to_string()),
            salt: salt.to_vec(),
            iterations,
        }
    }
}

/// Outcome of one [`ScramConversation::step`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramStep {
    /// Send this message and wait for the peer
    Continue(Vec<u8>),
    /// Exchange finished successfully; the server role returns its final message
    Complete(Option<Vec<u8>>),
}

enum State {
    Initial,
    ClientSentFirst {
        client_first_bare: String,
    },
    ClientSentFinal {
        server_signature: Zeroizing<[u8; 32]>,
    },
    ServerSentFirst {
        client_first_bare: String,
        server_first: String,
        gs2_header: String,
        combined_nonce: String,
    },
    Complete,
    Failed,
}

/// SCRAM-SHA-256 state machine
pub struct ScramConversation {
    role: ScramRole,
    nonce: Zeroizing<String>,
    state: State,
}

impl ScramConversation {
    pub fn new(role: ScramRole) -> Self {
        Self {
            role,
            nonce: Zeroizing::new(generate_nonce()),
            state: State::Initial,
        }
    }

    #[cfg(test)]
    fn with_nonce(role: ScramRole, nonce: &str) -> Self {
        Self {
            role,
            nonce: Zeroizing::new(nonce.to_string()),
            state: State::Initial,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// Advance the exchange with the peer's last message.
    ///
    /// The client role starts with `step(None)`; every other call carries
    /// the peer's message. Any failure leaves the conversation `Failed`.
    pub fn step(&mut self, input: Option<&[u8]>) -> Result<ScramStep> {
        let state = std::mem::replace(&mut self.state, State::Failed);
        let result = match (&self.role, state, input) {
            (ScramRole::Client { username, .. }, State::Initial, None) => {
                let client_first_bare = format!("n={},r={}", escape_username(username), &*self.nonce);
                let msg = format!("n,,{}", client_first_bare);
                Ok((
                    State::ClientSentFirst { client_first_bare },
                    ScramStep::Continue(msg.into_bytes()),
                ))
            }
            (ScramRole::Client { password, .. }, State::ClientSentFirst { client_first_bare }, Some(input)) => {
                client_final(password, &self.nonce, &client_first_bare, input)
            }
            (ScramRole::Client { .. }, State::ClientSentFinal { server_signature }, Some(input)) => {
                verify_server_final(&server_signature, input)
                    .map(|()| (State::Complete, ScramStep::Complete(None)))
            }
            (ScramRole::Server { salt, iterations, .. }, State::Initial, Some(input)) => {
                server_first(&self.nonce, salt, *iterations, input)
            }
            (
                ScramRole::Server { secret, salt, iterations },
                State::ServerSentFirst {
                    client_first_bare,
                    server_first,
                    gs2_header,
                    combined_nonce,
                },
                Some(input),
            ) => verify_client_final(
                secret,
                salt,
                *iterations,
                &client_first_bare,
                &server_first,
                &gs2_header,
                &combined_nonce,
                input,
            )
            .map(|final_msg| (State::Complete, ScramStep::Complete(Some(final_msg)))),
            _ => Err(ProxyError::Auth("SCRAM: message out of sequence".into())),
        };

        match result {
            Ok((next, step)) => {
                self.state = next;
                Ok(step)
            }
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    /// [`step`](Self::step) on the blocking pool.
    ///
    /// The proof steps run PBKDF2, which must not stall an async worker.
    /// The conversation is handed back for the next step.
    pub async fn step_blocking(mut self, input: Option<Vec<u8>>) -> Result<(Self, ScramStep)> {
        tokio::task::spawn_blocking(move || {
            let step = self.step(input.as_deref())?;
            Ok((self, step))
        })
        .await
        .map_err(|e| ProxyError::Auth(format!("SCRAM: key derivation task failed: {}", e)))?
    }
}

// ============================================================================
// Client side
// ============================================================================

fn client_final(
    password: &str,
    client_nonce: &str,
    client_first_bare: &str,
    server_first: &[u8],
) -> Result<(State, ScramStep)> {
    let server_first = utf8(server_first, "server-first")?;
    let (nonce, salt, iterations) = parse_server_first(server_first)?;

    if !nonce.starts_with(client_nonce) || nonce.len() <= client_nonce.len() {
        return Err(ProxyError::Auth("SCRAM: server nonce mismatch".into()));
    }

    let salted = salted_password(password, &salt, iterations);
    let without_proof = format!("c={},r={}", BASE64.encode(b"n,,"), nonce);
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);

    let client_key = hmac(&*salted, b"Client Key");
    let stored_key = sha256(&client_key);
    let client_signature = hmac(&stored_key, auth_message.as_bytes());
    let proof = xor(&client_key, &client_signature);

    let server_key = hmac(&*salted, b"Server Key");
    let server_signature = Zeroizing::new(hmac(&server_key, auth_message.as_bytes()));

    let msg = format!("{},p={}", without_proof, BASE64.encode(proof));
    Ok((
        State::ClientSentFinal { server_signature },
        ScramStep::Continue(msg.into_bytes()),
    ))
}

fn verify_server_final(expected: &[u8; 32], input: &[u8]) -> Result<()> {
    let text = utf8(input, "server-final")?;
    if let Some(err) = text.strip_prefix("e=") {
        return Err(ProxyError::Auth(format!("SCRAM: server error: {}", err)));
    }
    let encoded = attribute(text, 'v')
        .ok_or_else(|| ProxyError::Auth("SCRAM: server-final has no signature".into()))?;
    let received = BASE64
        .decode(encoded)
        .map_err(|_| ProxyError::Auth("SCRAM: invalid base64 in server signature".into()))?;
    if received.len() == expected.len() && bool::from(received.as_slice().ct_eq(expected.as_slice())) {
        Ok(())
    } else {
        Err(ProxyError::Auth("SCRAM: server signature mismatch".into()))
    }
}

fn parse_server_first(text: &str) -> Result<(String, Vec<u8>, u32)> {
    let nonce = attribute(text, 'r')
        .ok_or_else(|| ProxyError::Auth("SCRAM: server-first missing nonce".into()))?;
    let salt = attribute(text, 's')
        .ok_or_else(|| ProxyError::Auth("SCRAM: server-first missing salt".into()))?;
    let iterations = attribute(text, 'i')
        .ok_or_else(|| ProxyError::Auth("SCRAM: server-first missing iteration count".into()))?;

    let salt = BASE64
        .decode(salt)
        .map_err(|_| ProxyError::Auth("SCRAM: invalid base64 salt".into()))?;
    let iterations: u32 = iterations
        .parse()
        .map_err(|_| ProxyError::Auth("SCRAM: invalid iteration count".into()))?;
    if iterations == 0 {
        return Err(ProxyError::Auth("SCRAM: zero iteration count".into()));
    }
    if iterations > MAX_SCRAM_ITERATIONS {
        return Err(ProxyError::Auth(format!(
            "SCRAM: iteration count {} exceeds {}",
            iterations, MAX_SCRAM_ITERATIONS
        )));
    }
    Ok((nonce.to_string(), salt, iterations))
}

// ============================================================================
// Server side
// ============================================================================

fn server_first(
    server_nonce: &str,
    salt: &[u8],
    iterations: u32,
    input: &[u8],
) -> Result<(State, ScramStep)> {
    let text = utf8(input, "client-first")?;
    let (gs2_header, client_first_bare) = split_gs2_header(text)?;

    let client_nonce = attribute(client_first_bare, 'r')
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProxyError::Auth("SCRAM: client-first missing nonce".into()))?;

    let combined_nonce = format!("{}{}", client_nonce, server_nonce);
    let server_first = format!(
        "r={},s={},i={}",
        combined_nonce,
        BASE64.encode(salt),
        iterations
    );

    Ok((
        State::ServerSentFirst {
            client_first_bare: client_first_bare.to_string(),
            server_first: server_first.clone(),
            gs2_header: gs2_header.to_string(),
            combined_nonce,
        },
        ScramStep::Continue(server_first.into_bytes()),
    ))
}

/// Split "gs2-header,client-first-bare"; channel binding is refused
fn split_gs2_header(text: &str) -> Result<(&str, &str)> {
    match text.as_bytes().first() {
        Some(b'n') | Some(b'y') => {}
        Some(b'p') => {
            return Err(ProxyError::Auth(
                "SCRAM: channel binding requested but not supported".into(),
            ))
        }
        _ => return Err(ProxyError::Auth("SCRAM: malformed GS2 header".into())),
    }
    // cbind-flag "," [authzid] ","
    let first_comma = text
        .find(',')
        .ok_or_else(|| ProxyError::Auth("SCRAM: malformed GS2 header".into()))?;
    if first_comma != 1 {
        return Err(ProxyError::Auth("SCRAM: malformed GS2 header".into()));
    }
    let second_comma = text[2..]
        .find(',')
        .map(|i| i + 2)
        .ok_or_else(|| ProxyError::Auth("SCRAM: malformed GS2 header".into()))?;
    Ok((&text[..=second_comma], &text[second_comma + 1..]))
}

#[allow(clippy::too_many_arguments)]
fn verify_client_final(
    secret: &str,
    salt: &[u8],
    iterations: u32,
    client_first_bare: &str,
    server_first: &str,
    gs2_header: &str,
    combined_nonce: &str,
    input: &[u8],
) -> Result<Vec<u8>> {
    let text = utf8(input, "client-final")?;
    let (without_proof, proof_b64) = text
        .rsplit_once(",p=")
        .ok_or_else(|| ProxyError::Auth("SCRAM: client-final missing proof".into()))?;

    let binding = attribute(without_proof, 'c')
        .ok_or_else(|| ProxyError::Auth("SCRAM: client-final missing channel binding".into()))?;
    if binding != BASE64.encode(gs2_header.as_bytes()) {
        return Err(ProxyError::Auth("SCRAM: channel binding mismatch".into()));
    }
    if attribute(without_proof, 'r') != Some(combined_nonce) {
        return Err(ProxyError::Auth("SCRAM: nonce mismatch".into()));
    }

    let proof = BASE64
        .decode(proof_b64)
        .map_err(|_| ProxyError::Auth("SCRAM: invalid base64 in proof".into()))?;
    if proof.len() != 32 {
        return Err(ProxyError::Auth("SCRAM: proof has wrong length".into()));
    }

    let salted = salted_password(secret, salt, iterations);
    let client_key = hmac(&*salted, b"Client Key");
    let stored_key = sha256(&client_key);

    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let client_signature = hmac(&stored_key, auth_message.as_bytes());
    let recovered_key = xor(&proof, &client_signature);

    if !bool::from(sha256(&recovered_key).as_slice().ct_eq(stored_key.as_slice())) {
        return Err(ProxyError::Auth("SCRAM: proof verification failed".into()));
    }

    let server_key = hmac(&*salted, b"Server Key");
    let server_signature = hmac(&server_key, auth_message.as_bytes());
    Ok(format!("v={}", BASE64.encode(server_signature)).into_bytes())
}

// ============================================================================
// Helpers
// ============================================================================

fn generate_nonce() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    BASE64.encode(bytes)
}

fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut out = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut *out);
    out
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Value of a `k=value` attribute in a comma-separated SCRAM message
fn attribute(text: &str, key: char) -> Option<&str> {
    text.split(',').find_map(|part| {
        let mut chars = part.chars();
        (chars.next() == Some(key) && chars.next() == Some('=')).then(|| &part[2..])
    })
}

/// RFC 5802: ',' and '=' in usernames are escaped
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn utf8<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str> {
    std::str::from_utf8(bytes)
        .map_err(|_| ProxyError::Auth(format!("SCRAM: invalid UTF-8 in {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_NONCE: &str = "%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0";
    const SALT_B64: &str = "W22ZaJ0SNY7soEsUEjb6gQ==";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    fn rfc_server() -> ScramConversation {
        ScramConversation::with_nonce(
            ScramRole::Server {
                secret: Zeroizing::new("pencil".into()),
                salt: BASE64.decode(SALT_B64).unwrap(),
                iterations: 4096,
            },
            SERVER_NONCE,
        )
    }

    fn continue_bytes(step: ScramStep) -> Vec<u8> {
        match step {
            ScramStep::Continue(b) => b,
            other => panic!("expected Continue, got {:?}", other),
        }
    }

    #[test]
    fn test_client_matches_rfc7677() {
        let mut client = ScramConversation::with_nonce(ScramRole::client("user", "pencil"), CLIENT_NONCE);
        let first = continue_bytes(client.step(None).unwrap());
        assert_eq!(first, b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let final_msg = continue_bytes(client.step(Some(SERVER_FIRST.as_bytes())).unwrap());
        assert_eq!(String::from_utf8(final_msg).unwrap(), CLIENT_FINAL);

        assert_eq!(
            client.step(Some(SERVER_FINAL.as_bytes())).unwrap(),
            ScramStep::Complete(None)
        );
        assert!(client.is_complete());
    }

    #[test]
    fn test_server_matches_rfc7677() {
        let mut server = rfc_server();
        let first = continue_bytes(server.step(Some(b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO")).unwrap());
        assert_eq!(String::from_utf8(first).unwrap(), SERVER_FIRST);

        match server.step(Some(CLIENT_FINAL.as_bytes())).unwrap() {
            ScramStep::Complete(Some(final_msg)) => {
                assert_eq!(String::from_utf8(final_msg).unwrap(), SERVER_FINAL)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(server.is_complete());
    }

    fn run_exchange(client_password: &str, server_secret: &str) -> Result<()> {
        let mut client = ScramConversation::new(ScramRole::client("", client_password));
        let mut server = ScramConversation::new(ScramRole::server(server_secret, 4096));

        let c1 = continue_bytes(client.step(None)?);
        let s1 = continue_bytes(server.step(Some(&c1))?);
        let c2 = continue_bytes(client.step(Some(&s1))?);
        let s2 = match server.step(Some(&c2))? {
            ScramStep::Complete(Some(m)) => m,
            other => panic!("unexpected {:?}", other),
        };
        client.step(Some(&s2))?;
        assert!(client.is_complete() && server.is_complete());
        Ok(())
    }

    #[test]
    fn test_roles_interoperate() {
        run_exchange("s3cr3t", "s3cr3t").unwrap();
    }

    #[test]
    fn test_wrong_secret_fails() {
        let err = run_exchange("guess", "s3cr3t").unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[test]
    fn test_single_bit_proof_corruption_fails() {
        let mut server = rfc_server();
        server.step(Some(b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO")).unwrap();

        let (without_proof, proof_b64) = CLIENT_FINAL.rsplit_once(",p=").unwrap();
        let mut proof = BASE64.decode(proof_b64).unwrap();
        proof[17] ^= 0x04;
        let corrupted = format!("{},p={}", without_proof, BASE64.encode(proof));

        assert!(server.step(Some(corrupted.as_bytes())).is_err());
        assert!(server.is_failed());
        // A failed conversation stays failed
        assert!(server.step(Some(CLIENT_FINAL.as_bytes())).is_err());
    }

    #[test]
    fn test_server_rejects_channel_binding() {
        let mut server = rfc_server();
        let err = server
            .step(Some(b"p=tls-server-end-point,,n=user,r=abc"))
            .unwrap_err();
        assert!(err.to_string().contains("channel binding"));
        assert!(server.is_failed());
    }

    #[test]
    fn test_server_accepts_y_header() {
        let mut server = rfc_server();
        assert!(server.step(Some(b"y,,n=,r=abc")).is_ok());
    }

    #[test]
    fn test_server_rejects_nonce_swap() {
        let mut server = rfc_server();
        server.step(Some(b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO")).unwrap();
        let tampered = CLIENT_FINAL.replace("k0,p=", "k1,p=");
        assert!(server.step(Some(tampered.as_bytes())).is_err());
    }

    #[test]
    fn test_client_rejects_foreign_nonce() {
        let mut client = ScramConversation::with_nonce(ScramRole::client("user", "pencil"), CLIENT_NONCE);
        client.step(None).unwrap();
        let err = client
            .step(Some(b"r=someoneelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096"))
            .unwrap_err();
        assert!(err.to_string().contains("nonce"));
    }

    #[test]
    fn test_client_rejects_bad_server_signature() {
        let mut client = ScramConversation::with_nonce(ScramRole::client("user", "pencil"), CLIENT_NONCE);
        client.step(None).unwrap();
        client.step(Some(SERVER_FIRST.as_bytes())).unwrap();
        assert!(client
            .step(Some(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="))
            .is_err());
    }

    #[test]
    fn test_client_reports_server_error() {
        let mut client = ScramConversation::with_nonce(ScramRole::client("user", "pencil"), CLIENT_NONCE);
        client.step(None).unwrap();
        client.step(Some(SERVER_FIRST.as_bytes())).unwrap();
        let err = client.step(Some(b"e=invalid-proof")).unwrap_err();
        assert!(err.to_string().contains("invalid-proof"));
    }

    #[test]
    fn test_out_of_sequence() {
        let mut client = ScramConversation::new(ScramRole::client("u", "p"));
        assert!(client.step(Some(b"r=x")).is_err());
        let mut server = ScramConversation::new(ScramRole::server("p", 4096));
        assert!(server.step(None).is_err());
    }

    #[test]
    fn test_nonce_and_salt_are_random() {
        let a = ScramConversation::new(ScramRole::client("u", "p"));
        let b = ScramConversation::new(ScramRole::client("u", "p"));
        assert_ne!(*a.nonce, *b.nonce);
        assert_eq!(BASE64.decode(&*a.nonce).unwrap().len(), 24);

        match (ScramRole::server("p", 4096), ScramRole::server("p", 4096)) {
            (ScramRole::Server { salt: s1, .. }, ScramRole::Server { salt: s2, .. }) => {
                assert_eq!(s1.len(), 16);
                assert_ne!(s1, s2);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_client_rejects_excessive_iteration_count() {
        let mut client = ScramConversation::with_nonce(ScramRole::client("user", "pencil"), CLIENT_NONCE);
        client.step(None).unwrap();
        let server_first = format!(
            "r={}{},s={},i={}",
            CLIENT_NONCE,
            SERVER_NONCE,
            SALT_B64,
            MAX_SCRAM_ITERATIONS + 1
        );
        let err = client.step(Some(server_first.as_bytes())).unwrap_err();
        assert!(matches!(err, ProxyError::Auth(ref m) if m.contains("iteration count")));
        assert!(client.is_failed());
    }

    #[tokio::test]
    async fn test_step_blocking_rejects_huge_iteration_count_promptly() {
        let mut client = ScramConversation::with_nonce(ScramRole::client("user", "pencil"), CLIENT_NONCE);
        client.step(None).unwrap();
        let server_first = format!("r={}{},s={},i=4294967295", CLIENT_NONCE, SERVER_NONCE, SALT_B64);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.step_blocking(Some(server_first.into_bytes())),
        )
        .await
        .expect("rejection must not run the key derivation");
        assert!(matches!(result, Err(ProxyError::Auth(_))));
    }

    #[tokio::test]
    async fn test_step_blocking_completes_exchange() {
        let client = ScramConversation::with_nonce(ScramRole::client("user", "pencil"), CLIENT_NONCE);
        let (client, _) = client.step_blocking(None).await.unwrap();
        let (client, step) = client
            .step_blocking(Some(SERVER_FIRST.as_bytes().to_vec()))
            .await
            .unwrap();
        assert_eq!(step, ScramStep::Continue(CLIENT_FINAL.as_bytes().to_vec()));
        let (client, step) = client
            .step_blocking(Some(SERVER_FINAL.as_bytes().to_vec()))
            .await
            .unwrap();
        assert_eq!(step, ScramStep::Complete(None));
        assert!(client.is_complete());
    }

    #[test]
    fn test_username_escaping() {
        assert_eq!(escape_username("a,b=c"), "a=2Cb=3Dc");
    }
}
