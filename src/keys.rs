// src/keys.rs
use std::fmt;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;

/// WireGuard identity. Only the public half ever leaves this module.
pub struct KeyPair {
    secret: StaticSecret,
}

impl KeyPair {
    pub fn generate() -> Self {
        KeyPair {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.secret))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", B64.encode(self.0.as_bytes()))
    }
}
