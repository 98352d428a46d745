pub mod encryption;
pub mod hook;

pub use encryption::AesGcmEncryptionService;
pub use hook::HookSecret;
