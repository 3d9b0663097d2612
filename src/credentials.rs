//! Password hashing for VPN user accounts
//!
//! Hashes are bcrypt in the usual `$2b$<cost>$<salt+hash>` form. The cost
//! travels with the hash, so raising [`DEFAULT_COST`] later does not
//! invalidate stored passwords.

use crate::error::{VpnError, VpnResult};

pub use bcrypt::DEFAULT_COST;

/// Shortest password accepted for a new account or a password change
pub const MIN_PASSWORD_LEN: usize = 8;

/// bcrypt ignores everything past this many bytes
const MAX_PASSWORD_BYTES: usize = 72;

pub fn validate_password(password: &str) -> VpnResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VpnError::InvalidParameter(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(VpnError::InvalidParameter(format!(
            "Password must be at most {} bytes",
            MAX_PASSWORD_BYTES
        )));
    }
    Ok(())
}

/// Hash `password` with a fresh random salt
pub fn hash_password(password: &str, cost: u32) -> VpnResult<String> {
    bcrypt::hash(password, cost).map_err(|e| VpnError::InvalidParameter(format!("Cannot hash password: {}", e)))
}

/// Check `password` against a stored hash. A malformed hash is an error,
/// a wrong password is `Ok(false)`.
pub fn verify_password(password: &str, hash: &str) -> VpnResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| VpnError::Parse(format!("Unusable password hash: {}", e)))
}
