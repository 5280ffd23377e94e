use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use uuid::Uuid;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for generated assets at rest.
///
/// The asset id is bound as associated data, so a blob copied under another
/// asset's key fails to open.
pub struct AssetCipher {
    cipher: Aes256Gcm,
}

impl AssetCipher {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, CipherError> {
        use base64::Engine;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|_| CipherError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(CipherError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CipherError::InvalidKey)?;

        Ok(Self { cipher })
    }

    /// Output layout: nonce (12 bytes) followed by ciphertext.
    pub fn seal(&self, asset_id: Uuid, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let payload = Payload {
            msg: plaintext,
            aad: asset_id.as_bytes(),
        };
        let ciphertext = self
            .cipher
            .encrypt(&nonce, payload)
            .map_err(|_| CipherError::SealFailed)?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend(ciphertext);
        Ok(output)
    }

    pub fn open(&self, asset_id: Uuid, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN {
            return Err(CipherError::OpenFailed);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let payload = Payload {
            msg: ciphertext,
            aad: asset_id.as_bytes(),
        };

        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| CipherError::OpenFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Sealing asset failed")]
    SealFailed,

    #[error("Opening asset failed")]
    OpenFailed,
}
