use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::error::{AppError, Result};

/// Opaque hash/verify capability for stored credentials.
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String>;
    fn verify(&self, password: &str, hash: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct Argon2Hasher {
    params: Option<Params>,
}

impl Argon2Hasher {
    /// Argon2id with explicit cost parameters (memory KiB, iterations, lanes).
    pub fn with_cost(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self> {
        let params = Params::new(m_cost, t_cost, p_cost, None)
            .map_err(|e| AppError::ValidationFailed(format!("Invalid argon2 parameters: {}", e)))?;
        Ok(Self { params: Some(params) })
    }

    fn argon2(&self) -> Argon2<'static> {
        match &self.params {
            Some(params) => Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone()),
            None => Argon2::default(),
        }
    }
}

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> Result<String> {
        // Generate a random salt
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?
            .to_string();

        Ok(password_hash)
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| AppError::Internal(format!("Invalid password hash format: {}", e)))?;

        // Parameters are read from the PHC string, so any cost verifies.
        Ok(self.argon2().verify_password(password.as_bytes(), &parsed_hash).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> Argon2Hasher {
        Argon2Hasher::with_cost(8, 1, 1).unwrap()
    }

    #[test]
    fn verifies_matching_password() {
        let hasher = cheap();
        let hash = hasher.hash("hunter2").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("hunter2", &hash).unwrap());
        assert!(!hasher.verify("hunter3", &hash).unwrap());
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = cheap();
        assert_ne!(hasher.hash("same").unwrap(), hasher.hash("same").unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(matches!(cheap().verify("pw", "not-a-phc-string"), Err(AppError::Internal(_))));
    }

    #[test]
    fn rejects_impossible_cost() {
        assert!(Argon2Hasher::with_cost(1, 1, 1).is_err());
    }
}
