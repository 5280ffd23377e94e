//! Asset Store Gateway.
//!
//! Owns every generated asset: seals the bytes, writes them to the object
//! store and hands out signed URLs. A signed URL is an HS256 token carrying
//! the asset id, an expiry and a random nonce, resolved by
//! `GET /api/assets/{token}`. Signing never touches the stored bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::asset::{SignedUrl, StoredAsset};
use crate::services::encryption::{AssetCipher, CipherError};
use crate::services::storage::{ObjectStore, StorageError};

#[derive(Debug, Clone)]
struct AssetRecord {
    mime: String,
    size: u64,
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UrlClaims {
    sub: String,
    exp: i64,
    iat: i64,
    jti: String,
}

/// Issues and verifies signed asset URLs.
pub struct UrlSigner {
    base_url: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl UrlSigner {
    pub fn new(public_base_url: &str, secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            base_url: public_base_url.trim_end_matches('/').to_string(),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn sign(&self, asset_id: Uuid, ttl: Duration) -> Result<SignedUrl, AssetError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AssetError::Signing(e.to_string()))?;
        self.sign_until(asset_id, Utc::now() + ttl)
    }

    fn sign_until(&self, asset_id: Uuid, expires_at: DateTime<Utc>) -> Result<SignedUrl, AssetError> {
        let claims = UrlClaims {
            sub: asset_id.to_string(),
            exp: expires_at.timestamp(),
            iat: Utc::now().timestamp(),
            jti: Uuid::new_v4().simple().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AssetError::Signing(e.to_string()))?;

        Ok(SignedUrl {
            url: format!("{}/api/assets/{}", self.base_url, token),
            expires_at,
        })
    }

    /// Check a token and return the asset it grants access to.
    pub fn verify(&self, token: &str) -> Result<Uuid, AssetError> {
        let data = decode::<UrlClaims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AssetError::Expired,
                _ => AssetError::InvalidSignature,
            }
        })?;
        Uuid::parse_str(&data.claims.sub).map_err(|_| AssetError::InvalidSignature)
    }
}

/// Gateway over the object store. Asset metadata lives here, never in jobs.
pub struct AssetStoreGateway {
    store: Arc<dyn ObjectStore>,
    cipher: AssetCipher,
    signer: UrlSigner,
    default_ttl: Duration,
    assets: RwLock<HashMap<Uuid, AssetRecord>>,
}

impl AssetStoreGateway {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cipher: AssetCipher,
        signer: UrlSigner,
        default_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cipher,
            signer,
            default_ttl,
            assets: RwLock::new(HashMap::new()),
        }
    }

    /// Persist generated bytes and return the asset with a first signed URL.
    pub async fn store(&self, bytes: Vec<u8>, mime: &str) -> Result<StoredAsset, AssetError> {
        let id = Uuid::new_v4();
        let key = format!("generated/{id}");
        let size = bytes.len() as u64;

        let sealed = self.cipher.seal(id, &bytes)?;
        self.store
            .put(&key, &sealed, "application/octet-stream")
            .await?;

        self.assets.write().await.insert(
            id,
            AssetRecord {
                mime: mime.to_string(),
                size,
                key,
            },
        );

        let signed = self.signer.sign(id, self.default_ttl)?;
        tracing::info!(asset_id = %id, mime = %mime, size, "Stored generated asset");

        Ok(StoredAsset {
            id,
            mime: mime.to_string(),
            size,
            url: signed.url,
            expires_at: signed.expires_at,
        })
    }

    /// Issue a fresh URL for an existing asset. Bytes are not re-uploaded.
    pub async fn sign_url(&self, asset_id: Uuid, ttl: Duration) -> Result<SignedUrl, AssetError> {
        if !self.assets.read().await.contains_key(&asset_id) {
            return Err(AssetError::NotFound(asset_id));
        }
        self.signer.sign(asset_id, ttl)
    }

    /// Asset metadata with a freshly signed URL.
    pub async fn describe(&self, asset_id: Uuid, ttl: Duration) -> Result<StoredAsset, AssetError> {
        let record = self
            .assets
            .read()
            .await
            .get(&asset_id)
            .cloned()
            .ok_or(AssetError::NotFound(asset_id))?;
        let signed = self.signer.sign(asset_id, ttl)?;

        Ok(StoredAsset {
            id: asset_id,
            mime: record.mime,
            size: record.size,
            url: signed.url,
            expires_at: signed.expires_at,
        })
    }

    /// Remove an asset and its bytes. Unknown ids are a no-op.
    pub async fn delete(&self, asset_id: Uuid) -> Result<(), AssetError> {
        let removed = self.assets.write().await.remove(&asset_id);
        if let Some(record) = removed {
            self.store.delete(&record.key).await?;
            tracing::info!(asset_id = %asset_id, "Deleted asset");
        }
        Ok(())
    }

    /// Resolve a signed URL token to the asset's mime type and bytes.
    pub async fn open(&self, token: &str) -> Result<(String, Vec<u8>), AssetError> {
        let asset_id = self.signer.verify(token)?;
        let record = self
            .assets
            .read()
            .await
            .get(&asset_id)
            .cloned()
            .ok_or(AssetError::NotFound(asset_id))?;

        let sealed = self.store.get(&record.key).await?;
        let bytes = self.cipher.open(asset_id, &sealed)?;
        Ok((record.mime, bytes))
    }

    pub async fn asset_count(&self) -> usize {
        self.assets.read().await.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Asset not found: {0}")]
    NotFound(Uuid),

    #[error("Signed URL has expired")]
    Expired,

    #[error("Signed URL is invalid")]
    InvalidSignature,

    #[error("Failed to sign URL: {0}")]
    Signing(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}
