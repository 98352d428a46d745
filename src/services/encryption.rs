use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64ct::{Base64, Encoding};

use crate::config::AppConfig;
use crate::error::{AppError, Result};

const NONCE_LEN: usize = 12;

/// AES-256-GCM with a random nonce prepended to the ciphertext, base64 encoded
pub struct AesGcmEncryptionService {
    key: Key<Aes256Gcm>,
}

impl AesGcmEncryptionService {
    pub fn new(key_base64: &str) -> Result<Self> {
        let key_bytes = Base64::decode_vec(key_base64)
            .map_err(|e| AppError::EncryptionError(format!("Invalid key format: {}", e)))?;

        if key_bytes.len() != 32 {
            return Err(AppError::EncryptionError(
                "Key must be 32 bytes (256 bits) long".to_string(),
            ));
        }

        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&key_bytes),
        })
    }

    /// Build the service from `ENCRYPTION_KEY`, if configured
    pub fn from_config(config: &AppConfig) -> Result<Option<Self>> {
        config.encryption_key.as_deref().map(Self::new).transpose()
    }

    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        Base64::encode_string(key.as_slice())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AppError::EncryptionError(format!("Encryption failed: {}", e)))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(Base64::encode_string(&combined))
    }

    pub fn decrypt(&self, ciphertext_base64: &str) -> Result<String> {
        let combined = Base64::decode_vec(ciphertext_base64)
            .map_err(|e| AppError::EncryptionError(format!("Invalid ciphertext format: {}", e)))?;

        if combined.len() < NONCE_LEN {
            return Err(AppError::EncryptionError("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext_bytes)
            .map_err(|e| AppError::EncryptionError(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext).map_err(|e| {
            AppError::EncryptionError(format!("Invalid UTF-8 in decrypted data: {}", e))
        })
    }
}
