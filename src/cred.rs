//! Credential minting and verification.
//!
//! A credential is the node daemon's sole authority to run a step: a
//! canonical serialization of the step's resource binding, signed with the
//! controller's private key (HMAC over SHA-256). The key can be rotated at
//! runtime; rotation is atomic with respect to new mints, and credentials
//! minted under a retired key fail verification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SchedError};

const HMAC_BLOCK: usize = 64;

/// The resource binding a credential attests to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialArg {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub node_list: Vec<String>,
    /// Per-node core bitmaps, words of 64 cores, parallel to `node_list`.
    pub core_bitmaps: Vec<Vec<u64>>,
    pub job_core_spec: u16,
    pub mem_limit_mb: u64,
    pub cores_per_socket: Vec<u16>,
    pub sockets_per_node: Vec<u16>,
    pub sock_core_rep_count: Vec<u32>,
    pub gres: Vec<String>,
    pub expiration: DateTime<Utc>,
}

/// Wire form: the canonical payload plus its signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCredential {
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl SignedCredential {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("credential serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|_| SchedError::CredentialInvalid)
    }
}

/// HMAC-SHA256 with the standard ipad/opad construction.
fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut key_block = [0u8; HMAC_BLOCK];
    if key.len() > HMAC_BLOCK {
        key_block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    let ipad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    let opad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);
    outer.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Signs and verifies credentials with a rotatable key.
#[derive(Debug)]
pub struct CredentialSigner {
    key: std::sync::RwLock<Vec<u8>>,
}

impl CredentialSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: std::sync::RwLock::new(key.into()),
        }
    }

    /// Swaps the signing key. Mints already in flight complete under the
    /// key they read.
    pub fn rotate_key(&self, key: impl Into<Vec<u8>>) {
        let mut guard = self.key.write().expect("cred key lock poisoned");
        *guard = key.into();
        tracing::info!("credential signing key rotated");
    }

    pub fn mint(&self, arg: &CredentialArg) -> SignedCredential {
        let payload = serde_json::to_vec(arg).expect("credential arg serializes");
        let key = self.key.read().expect("cred key lock poisoned");
        let signature = hmac_sha256(&key, &payload).to_vec();
        SignedCredential { payload, signature }
    }

    /// Recomputes the signature over the payload and, on match, decodes and
    /// returns the bound argument. Expired credentials are rejected.
    pub fn verify(&self, cred: &SignedCredential, now: DateTime<Utc>) -> Result<CredentialArg> {
        let key = self.key.read().expect("cred key lock poisoned");
        let expect = hmac_sha256(&key, &cred.payload);
        drop(key);
        if !constant_time_eq(&expect, &cred.signature) {
            return Err(SchedError::CredentialInvalid);
        }
        let arg: CredentialArg =
            serde_json::from_slice(&cred.payload).map_err(|_| SchedError::CredentialInvalid)?;
        if arg.expiration <= now {
            return Err(SchedError::CredentialRevoked);
        }
        Ok(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn arg(expires_in_minutes: i64) -> CredentialArg {
        CredentialArg {
            job_id: 1000,
            step_id: 0,
            uid: 100,
            node_list: vec!["n1".into(), "n2".into()],
            core_bitmaps: vec![vec![0xff], vec![0x0f]],
            job_core_spec: 0,
            mem_limit_mb: 2048,
            cores_per_socket: vec![4, 4],
            sockets_per_node: vec![2, 2],
            sock_core_rep_count: vec![2],
            gres: vec![],
            expiration: Utc::now() + Duration::minutes(expires_in_minutes),
        }
    }

    #[test]
    fn mint_verify_roundtrip() {
        let signer = CredentialSigner::new("secret");
        let a = arg(10);
        let cred = signer.mint(&a);
        let back = signer.verify(&cred, Utc::now()).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn any_byte_flip_is_rejected() {
        let signer = CredentialSigner::new("secret");
        let cred = signer.mint(&arg(10));
        let bytes = cred.to_bytes();
        for i in 0..bytes.len() {
            let mut mutated = bytes.clone();
            mutated[i] ^= 0x01;
            match SignedCredential::from_bytes(&mutated) {
                Ok(parsed) => {
                    assert!(
                        signer.verify(&parsed, Utc::now()).is_err(),
                        "byte {i} flip accepted"
                    );
                }
                Err(_) => {} // no longer parses at all
            }
        }
    }

    #[test]
    fn expired_credential_rejected() {
        let signer = CredentialSigner::new("secret");
        let cred = signer.mint(&arg(-1));
        assert!(matches!(
            signer.verify(&cred, Utc::now()),
            Err(SchedError::CredentialRevoked)
        ));
    }

    #[test]
    fn rotation_invalidates_old_credentials() {
        let signer = CredentialSigner::new("old");
        let cred = signer.mint(&arg(10));
        signer.rotate_key("new");
        assert!(signer.verify(&cred, Utc::now()).is_err());
        let fresh = signer.mint(&arg(10));
        assert!(signer.verify(&fresh, Utc::now()).is_ok());
    }
}
