//! WireGuard key material

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::VpnResult;
use crate::validation;

/// A base64 encoded X25519 key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }

    /// Rebuild the pair from a stored private key
    pub fn from_private(private_key: &str) -> VpnResult<Self> {
        Ok(Self {
            private_key: private_key.trim().to_string(),
            public_key: public_key_from_private(private_key)?,
        })
    }
}

/// Derive the public key for a base64 private key
pub fn public_key_from_private(private_key: &str) -> VpnResult<String> {
    let bytes = validation::validate_wg_key(private_key)?;
    let secret = StaticSecret::from(bytes);
    Ok(BASE64.encode(PublicKey::from(&secret).as_bytes()))
}

/// 32 random bytes, base64 encoded, as used by `wg genpsk`
pub fn generate_preshared_key() -> String {
    let mut psk = [0u8; 32];
    OsRng.fill_bytes(&mut psk);
    BASE64.encode(psk)
}

/// Random alphanumeric secret for IPsec pre-shared keys
pub fn generate_secret(len: usize) -> String {
    OsRng
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
