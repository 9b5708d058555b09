//! Public-key authentication decisions.
//!
//! The transport calls an [`AuthenticationVerifier`] during the handshake,
//! before any channel exists. The engine itself never sees unauthenticated
//! connections.

pub mod authorized_keys;

pub use authorized_keys::AuthorizedKeysVerifier;

use ssh_key::{HashAlg, PublicKey};
use tracing::info;

pub trait AuthenticationVerifier: Send + Sync {
    /// Whether `user` may log in with `key`.
    fn verify(&self, user: &str, key: &PublicKey) -> bool;
}

/// SHA-256 fingerprint in OpenSSH notation (`SHA256:...`).
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Logs the presented key and accepts it.
pub struct AcceptAnyKey;

impl AuthenticationVerifier for AcceptAnyKey {
    fn verify(&self, user: &str, key: &PublicKey) -> bool {
        info!(user = %user, algorithm = %key.algorithm(), fingerprint = %fingerprint(key), "accepting public key");
        true
    }
}
