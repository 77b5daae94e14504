//! AES-256-GCM field encryption

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Nonce length prepended to every ciphertext
pub const NONCE_LEN: usize = 12;

/// Session key length
pub const SESSION_KEY_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AesError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Ciphertext too short")]
    CiphertextTooShort,
}

/// AES-256-GCM cipher wrapper
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Create a cipher keyed by a one-time code
    pub fn from_code(code: &str) -> Self {
        Self::new(&derive_code_key(code))
    }

    /// Encrypt data with a random nonce
    /// Returns: nonce (12 bytes) || ciphertext
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, AesError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| AesError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Decrypt data (expects nonce || ciphertext)
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, AesError> {
        if data.len() < NONCE_LEN {
            return Err(AesError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AesError::DecryptionFailed)
    }
}

/// Derive an AES key from a TOTP code using SHA256
pub fn derive_code_key(code: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"TOTPGATE-CODE-KEY-DERIVE");
    hasher.update(code.as_bytes());
    hasher.finalize().into()
}

/// Generate a fresh session key from the OS random source
pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [0u8; 32];
        let cipher = Aes256GcmCipher::new(&key);

        let plaintext = b"Hello, totpgate!";
        let encrypted = cipher.encrypt(plaintext).unwrap();
        let decrypted = cipher.decrypt(&encrypted).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let cipher1 = Aes256GcmCipher::new(&[0u8; 32]);
        let cipher2 = Aes256GcmCipher::new(&[1u8; 32]);

        let encrypted = cipher1.encrypt(b"secret").unwrap();
        assert_eq!(cipher2.decrypt(&encrypted), Err(AesError::DecryptionFailed));
    }

    #[test]
    fn test_code_keyed_cipher() {
        let sealed = Aes256GcmCipher::from_code("368067").encrypt(b"nonce123").unwrap();

        assert_eq!(
            Aes256GcmCipher::from_code("368067").decrypt(&sealed).unwrap(),
            b"nonce123"
        );
        assert!(Aes256GcmCipher::from_code("368068").decrypt(&sealed).is_err());
    }

    #[test]
    fn test_short_ciphertext() {
        let cipher = Aes256GcmCipher::new(&[7u8; 32]);
        assert_eq!(cipher.decrypt(&[0u8; 5]), Err(AesError::CiphertextTooShort));
    }

    #[test]
    fn test_key_derivation() {
        assert_eq!(derive_code_key("123456"), derive_code_key("123456"));
        assert_ne!(derive_code_key("123456"), derive_code_key("123457"));
    }

    #[test]
    fn test_session_keys_differ() {
        assert_ne!(generate_session_key(), generate_session_key());
    }
}
