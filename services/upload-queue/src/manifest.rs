//! Manifest document published before a session is finalized.
//!
//! The manifest is a pure function of a fully uploaded [`UploadSession`]. A retry
//! rebuilds it from the current session, which no longer changes once every
//! asset is uploaded.

use crate::error::{QueueError, QueueResult};
use crate::model::{AssetKind, UploadSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

pub const MANIFEST_CONTENT_TYPE: &str = "application/json";

/// Session manifest stored at `events/{eventId}/sessions/{sessionId}/manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version: u32,
    pub event_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub gallery_url: String,
    pub assets: Vec<ManifestAsset>,
}

/// Descriptor for one uploaded asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestAsset {
    pub id: String,
    pub kind: AssetKind,
    pub strip_index: u32,
    pub sequence_index: u32,
    pub content_type: String,
    pub path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_path: Option<String>,
}

impl Manifest {
    /// Build the manifest for a session whose assets are all uploaded
    pub fn build(session: &UploadSession) -> QueueResult<Self> {
        if !session.all_assets_uploaded() {
            let (uploaded, total) = session.progress();
            return Err(QueueError::Manifest(format!(
                "session {} has {}/{} assets uploaded",
                session.session_id, uploaded, total
            )));
        }

        let assets = session
            .assets
            .iter()
            .map(|a| ManifestAsset {
                id: a.id.clone(),
                kind: a.kind,
                strip_index: a.strip_index,
                sequence_index: a.sequence_index,
                content_type: a.content_type.clone(),
                path: a.remote_path.clone(),
                size_bytes: a.size_bytes,
                duration_seconds: a.duration_seconds,
                poster_path: a.poster_path.clone(),
            })
            .collect();

        Ok(Self {
            version: MANIFEST_VERSION,
            event_id: session.event_id.clone(),
            session_id: session.session_id.clone(),
            created_at: session.created_at,
            gallery_url: session.gallery_url.clone(),
            assets,
        })
    }

    pub fn to_json_bytes(&self) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::Manifest(e.to_string()))
    }
}
