//! MySQL authentication
//!
//! - `mysql_native_password`, used on both sides of the gateway
//! - `caching_sha2_password` fast path, used only when a backend switches to it
//!
//! References:
//! - Native: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_authentication_methods_native_password_authentication.html>
//! - Caching SHA2: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_caching_sha2_authentication_exchanges.html>

use rand::Rng;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};
use subtle::ConstantTimeEq;

/// Generate a random 20-byte salt for a synthetic handshake.
///
/// Bytes are drawn from the thread-local CSPRNG, skipping NUL and 0xFF which
/// some clients treat as terminators.
pub fn generate_salt() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 20];
    for byte in salt.iter_mut() {
        *byte = loop {
            let b: u8 = rng.gen();
            if b != 0 && b != 0xFF {
                break b;
            }
        };
    }
    salt
}

/// `mysql_native_password` response:
///
/// ```text
/// SHA1(password) XOR SHA1(salt || SHA1(SHA1(password)))
/// ```
///
/// An empty password yields an empty response.
pub fn scramble(salt: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    Sha1Digest::update(&mut hasher, salt);
    Sha1Digest::update(&mut hasher, stage2);
    let mask = hasher.finalize();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// Check a client's response against the expected scramble in constant time
pub fn verify_scramble(salt: &[u8], password: &[u8], response: &[u8]) -> bool {
    let expected = scramble(salt, password);
    if expected.len() != response.len() {
        return false;
    }
    expected.ct_eq(response).into()
}

/// `caching_sha2_password` fast-auth response:
///
/// ```text
/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) || nonce)
/// ```
pub fn caching_sha2_scramble(nonce: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    Sha2Digest::update(&mut hasher, stage2);
    Sha2Digest::update(&mut hasher, nonce);
    let mask = hasher.finalize();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}
