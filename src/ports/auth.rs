//! Authentication port.
//!
//! Every inbound request carries an opaque auth blob; the plugin maps it to
//! a (uid, gid) identity or rejects it. The default implementation is a
//! keyed token: `uid:gid:hex(hmac(key, "uid:gid"))`. Real deployments slot
//! a stronger backend in here.

use sha2::{Digest, Sha256};

use crate::error::{Result, SchedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthIdentity {
    pub uid: u32,
    pub gid: u32,
}

pub trait AuthPlugin: Send + Sync {
    /// Verifies the credential blob and extracts the caller identity.
    fn verify(&self, credential: &[u8]) -> Result<AuthIdentity>;

    /// Human-readable diagnosis of a failed credential, for logs.
    fn error_string(&self, credential: &[u8]) -> String {
        let _ = credential;
        "credential rejected".to_string()
    }
}

/// Shared-secret token auth.
pub struct TokenAuth {
    key: Vec<u8>,
}

impl TokenAuth {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    fn tag(&self, uid: u32, gid: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(format!("{uid}:{gid}").as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Builds a token for `uid`/`gid`; used by clients and tests.
    pub fn make_token(&self, uid: u32, gid: u32) -> Vec<u8> {
        format!("{uid}:{gid}:{}", self.tag(uid, gid)).into_bytes()
    }
}

impl AuthPlugin for TokenAuth {
    fn verify(&self, credential: &[u8]) -> Result<AuthIdentity> {
        let text = std::str::from_utf8(credential).map_err(|_| SchedError::CredentialInvalid)?;
        let mut parts = text.splitn(3, ':');
        let uid: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(SchedError::CredentialInvalid)?;
        let gid: u32 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(SchedError::CredentialInvalid)?;
        let tag = parts.next().ok_or(SchedError::CredentialInvalid)?;
        if tag != self.tag(uid, gid) {
            return Err(SchedError::CredentialInvalid);
        }
        Ok(AuthIdentity { uid, gid })
    }

    fn error_string(&self, credential: &[u8]) -> String {
        match std::str::from_utf8(credential) {
            Ok(_) => "token signature mismatch".to_string(),
            Err(_) => "credential is not valid utf-8".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let auth = TokenAuth::new("k");
        let token = auth.make_token(100, 200);
        let id = auth.verify(&token).unwrap();
        assert_eq!(id, AuthIdentity { uid: 100, gid: 200 });
    }

    #[test]
    fn forged_token_rejected() {
        let auth = TokenAuth::new("k");
        let other = TokenAuth::new("wrong");
        let token = other.make_token(100, 200);
        assert!(auth.verify(&token).is_err());
        assert!(auth.verify(b"0:0:junk").is_err());
        assert!(auth.verify(b"garbage").is_err());
    }
}
