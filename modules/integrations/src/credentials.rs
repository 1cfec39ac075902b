//! At-rest sealing of connection credentials.
//!
//! External-system access tokens live in `integrations_connections.credentials`
//! as AES-256-GCM blobs: base64(nonce || ciphertext). The key comes from the
//! deployment environment and is handed to the vault at construction.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::StoreError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Build a vault from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_b64: &str) -> Result<Self, StoreError> {
        let key_bytes = BASE64
            .decode(key_b64)
            .map_err(|e| StoreError::Credential(format!("key is not valid base64: {e}")))?;
        if key_bytes.len() != 32 {
            return Err(StoreError::Credential(format!(
                "key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Seal a credential document for storage.
    pub fn seal(&self, credentials: &serde_json::Value) -> Result<String, StoreError> {
        let plaintext = serde_json::to_vec(credentials)
            .map_err(|e| StoreError::Credential(e.to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| StoreError::Credential("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Open a stored credential blob.
    pub fn open(&self, sealed: &str) -> Result<serde_json::Value, StoreError> {
        let blob = BASE64
            .decode(sealed)
            .map_err(|e| StoreError::Credential(format!("blob is not valid base64: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::Credential("blob too short".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Credential("decryption failed".to_string()))?;

        serde_json::from_slice(&plaintext).map_err(|e| StoreError::Credential(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_vault() -> CredentialVault {
        CredentialVault::from_base64_key(&BASE64.encode([7u8; 32])).unwrap()
    }

    #[test]
    fn test_seal_open_round_trip() {
        let vault = test_vault();
        let creds = json!({"access_token": "tok_123", "realm_id": "realm-9"});

        let sealed = vault.seal(&creds).unwrap();
        assert_ne!(sealed, creds.to_string());
        assert_eq!(vault.open(&sealed).unwrap(), creds);
    }

    #[test]
    fn test_tampered_blob_is_rejected() {
        let vault = test_vault();
        let sealed = vault.seal(&json!({"access_token": "tok"})).unwrap();

        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;

        assert!(vault.open(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn test_wrong_key_length_is_rejected() {
        assert!(CredentialVault::from_base64_key(&BASE64.encode([1u8; 16])).is_err());
    }
}
