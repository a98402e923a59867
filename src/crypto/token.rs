use base64::{Engine as _, engine::general_purpose};

use crate::crypto::aes::{self, SecureKey};
use crate::error::{AppError, Result};
use crate::models::token::Token;

/// Seals and opens attendance tokens with a pre-shared AES-256-GCM key.
///
/// The transport form is `base64(nonce || ciphertext || tag)` using the
/// standard alphabet. Every failure is closed: a caller either gets a fully
/// populated `Token` or an error.
#[derive(Debug)]
pub struct TokenCodec {
    key: SecureKey,
}

impl TokenCodec {
    /// Creates a new `TokenCodec`.
    ///
    /// # Arguments
    ///
    /// * `key` - The 32-byte pre-shared key.
    pub fn new(key: SecureKey) -> Self {
        Self { key }
    }

    /// Creates a codec from raw key bytes, e.g. the configured `TOKEN_KEY`.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        Ok(Self::new(SecureKey::from_slice(key)?))
    }

    /// Encrypts a token.
    ///
    /// # Arguments
    ///
    /// * `token` - The token to seal.
    ///
    /// # Returns
    ///
    /// The base64 ciphertext.
    pub fn encrypt(&self, token: &Token) -> Result<String> {
        let plaintext = sonic_rs::to_vec(token)
            .map_err(|e| AppError::Encryption(format!("Token serialization failed: {}", e)))?;

        let sealed = aes::seal(&self.key, &plaintext)?;
        Ok(general_purpose::STANDARD.encode(sealed))
    }

    /// Decrypts and authenticates a token.
    ///
    /// # Arguments
    ///
    /// * `ciphertext` - The base64 ciphertext produced by [`TokenCodec::encrypt`].
    ///
    /// # Returns
    ///
    /// The token, `Decryption` when authentication fails, or
    /// `MalformedInput` when the input is not a token at all.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Token> {
        let sealed = general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| AppError::MalformedInput(format!("invalid base64: {}", e)))?;

        let plaintext = aes::open(&self.key, &sealed)?;

        sonic_rs::from_slice::<Token>(&plaintext)
            .map_err(|e| AppError::MalformedInput(format!("invalid token payload: {}", e)))
    }
}
