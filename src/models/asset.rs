use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A generated asset as handed out by the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct StoredAsset {
    pub id: Uuid,
    pub mime: String,
    pub size: u64,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// A time-limited capability link to an asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}
