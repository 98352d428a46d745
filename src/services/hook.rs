use std::fmt;

use super::encryption::AesGcmEncryptionService;
use crate::error::Result;

const HOOK_PAYLOAD: &str = "hook";

/// Shared secret presented by workflow hooks, derived once per process
#[derive(Clone)]
pub struct HookSecret(String);

impl HookSecret {
    pub fn new(encryption: &AesGcmEncryptionService) -> Result<Self> {
        Ok(Self(encryption.encrypt(HOOK_PAYLOAD)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `candidate` was issued with the same key
    pub fn verify(&self, encryption: &AesGcmEncryptionService, candidate: &str) -> bool {
        matches!(encryption.decrypt(candidate), Ok(payload) if payload == HOOK_PAYLOAD)
    }
}

impl fmt::Debug for HookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HookSecret(***)")
    }
}
