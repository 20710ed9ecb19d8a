//! PostgreSQL password authentication (cleartext and MD5)
//!
//! Used only towards backends that do not offer SCRAM.

use md5::{Digest, Md5};

/// `"md5" + md5(md5(password + user) + salt)`
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex(&hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
