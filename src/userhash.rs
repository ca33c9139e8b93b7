//! One-way, room-scoped user obfuscation.
//!
//! A [`UserHasher`] derives its key from a master secret with HKDF, then
//! hashes `(room, user)` pairs with HMAC-SHA256. The same user hashes
//! differently in different rooms, and nobody without the secret can map a
//! hash back to a user.

use std::fmt;
use std::path::Path;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::core::errors::BrainError;

const DOMAIN: &[u8] = b"userhash";

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserHash([u8; 32]);

impl UserHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for UserHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for UserHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserHash({})", self)
    }
}

#[derive(Clone)]
pub struct UserHasher {
    mac: Hmac<Sha256>,
}

impl UserHasher {
    pub fn new(secret: &[u8]) -> Result<Self, BrainError> {
        if secret.is_empty() {
            return Err(BrainError::Secret("secret is empty".to_string()));
        }
        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, secret)
            .expand(DOMAIN, &mut key)
            .map_err(|err| BrainError::Secret(err.to_string()))?;
        let mac = Hmac::<Sha256>::new_from_slice(&key)
            .map_err(|err| BrainError::Secret(err.to_string()))?;
        Ok(Self { mac })
    }

    pub fn from_file(path: &Path) -> Result<Self, BrainError> {
        let secret = std::fs::read(path).map_err(|err| {
            BrainError::Secret(format!("couldn't read {}: {}", path.display(), err))
        })?;
        Self::new(&secret)
    }

    pub fn hash(&self, room: &str, user: &str) -> UserHash {
        let mut mac = self.mac.clone();
        mac.update(&(room.len() as u64).to_be_bytes());
        mac.update(room.as_bytes());
        mac.update(user.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        UserHash(out)
    }
}

impl fmt::Debug for UserHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserHasher(..)")
    }
}
