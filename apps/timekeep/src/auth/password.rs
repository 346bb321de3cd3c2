use rand::RngCore;
use sha2::{Digest, Sha256};

const SALT_LEN: usize = 16;

/// Hash a password with a fresh random salt. Output is `salt$digest`, both hex.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = hex::encode(salt);
    format!("{}${}", salt, digest(&salt, password))
}

/// Verify a password against a digest produced by [`hash_password`].
pub fn verify_password(password: &str, stored: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, expected)) => {
            constant_time_eq(digest(salt, password).as_bytes(), expected.as_bytes())
        }
        None => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn test_password_hashing_is_salted() {
        let hash1 = hash_password("test_password");
        let hash2 = hash_password("test_password");

        assert_ne!(hash1, hash2);
        assert!(!hash1.contains("test_password"));
    }

    #[test_timeout::timeout]
    fn test_password_verification() {
        let hash = hash_password("correct_pass");

        assert!(verify_password("correct_pass", &hash));
        assert!(!verify_password("wrong_pass", &hash));
    }

    #[test_timeout::timeout]
    fn test_malformed_digest_never_verifies() {
        assert!(!verify_password("anything", "no-separator"));
        assert!(!verify_password("anything", ""));
    }
}
