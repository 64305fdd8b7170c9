//! Password credential hashing and verification (§3 "Password Credential").
//! The persisted hash is self-describing — it carries its own KDF family and
//! parameters — so verification dispatches on the hash's prefix rather than
//! on any separately stored "which KDF" flag. New hashes are always argon2id;
//! bcrypt is accepted on verify only so a hash produced by an older or
//! differently configured instance still authenticates.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use argon2::Argon2;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("password hashing failed: {0}")]
    HashFailed(String),
    #[error("stored password hash is not a recognized format")]
    UnrecognizedHash,
}

/// Hash `password` with argon2id, producing a self-describing hash string
/// suitable for `HostConfig::password_hash`.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::HashFailed(e.to_string()))
}

/// Verify `password` against a previously persisted self-describing hash.
/// Returns `Ok(false)` for a plain mismatch, `Err` only when the stored hash
/// itself can't be parsed (corrupt config, not an auth failure).
pub fn verify_password(password: &str, stored_hash: &str) -> Result<bool, AuthError> {
    if stored_hash.starts_with("$argon2") {
        let parsed = PasswordHash::new(stored_hash).map_err(|_| AuthError::UnrecognizedHash)?;
        Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
    } else if stored_hash.starts_with("$2a$") || stored_hash.starts_with("$2b$") || stored_hash.starts_with("$2y$") {
        Ok(bcrypt::verify(password, stored_hash).unwrap_or(false))
    } else {
        Err(AuthError::UnrecognizedHash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trips_through_verify() {
        let hash = hash_password("secret").unwrap();
        assert!(verify_password("secret", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn hash_is_argon2id_by_default() {
        let hash = hash_password("secret").unwrap();
        assert!(hash.starts_with("$argon2id$"));
    }

    #[test]
    fn bcrypt_hashes_still_verify() {
        let hash = bcrypt::hash("secret", bcrypt::DEFAULT_COST).unwrap();
        assert!(verify_password("secret", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn unrecognized_hash_format_is_an_error() {
        assert!(verify_password("secret", "not-a-hash").is_err());
    }

    #[test]
    fn two_hashes_of_the_same_password_differ_by_salt() {
        let a = hash_password("secret").unwrap();
        let b = hash_password("secret").unwrap();
        assert_ne!(a, b);
    }
}
