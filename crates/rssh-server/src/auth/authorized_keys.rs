//! Verifier backed by an OpenSSH `authorized_keys` file.

use super::{fingerprint, AuthenticationVerifier};
use rssh_core::RsshResult;
use ssh_key::{AuthorizedKeys, PublicKey};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Accepts keys whose SHA-256 fingerprint appears in the loaded file.
/// Key options are ignored.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeysVerifier {
    fingerprints: HashSet<String>,
}

impl AuthorizedKeysVerifier {
    pub fn from_file(path: &Path) -> RsshResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let verifier = Self::parse(&content);
        if verifier.is_empty() {
            warn!(path = %path.display(), "no usable keys in authorized_keys; every login will fail");
        } else {
            info!(path = %path.display(), count = verifier.len(), "loaded authorized keys");
        }
        Ok(verifier)
    }

    /// Parse file content, skipping lines that are not valid key entries.
    pub fn parse(content: &str) -> Self {
        let mut fingerprints = HashSet::new();
        for entry in AuthorizedKeys::new(content) {
            match entry {
                Ok(entry) => {
                    fingerprints.insert(fingerprint(entry.public_key()));
                }
                Err(e) => warn!(error = %e, "skipping unparsable authorized_keys line"),
            }
        }
        Self { fingerprints }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl AuthenticationVerifier for AuthorizedKeysVerifier {
    fn verify(&self, user: &str, key: &PublicKey) -> bool {
        let fp = fingerprint(key);
        let allowed = self.fingerprints.contains(&fp);
        if allowed {
            info!(user = %user, fingerprint = %fp, "public key accepted");
        } else {
            warn!(user = %user, fingerprint = %fp, "public key not authorized");
        }
        allowed
    }
}
