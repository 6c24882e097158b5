use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Progress of a single uploadable unit (asset, manifest or completion call)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl UploadState {
    /// Whether the engine may move a field from `self` to `to`.
    ///
    /// `Uploading -> Pending` only happens in the resume pass, for fields left
    /// in flight by a process that died mid-transfer.
    pub fn can_transition_to(self, to: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, to),
            (Pending, Uploading)
                | (Pending, Failed)
                | (Uploading, Uploaded)
                | (Uploading, Failed)
                | (Uploading, Pending)
                | (Failed, Pending)
        )
    }

    /// Apply a transition, rejecting anything outside the table
    pub fn transition(&mut self, to: UploadState) -> QueueResult<()> {
        if !self.can_transition_to(to) {
            return Err(QueueError::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }

    /// Explicit external override. The engine never calls this.
    pub fn force_reset(&mut self) {
        *self = UploadState::Pending;
    }

    /// Resume-pass rule: failed or interrupted work goes back to pending.
    /// Returns true if the state changed.
    pub fn resume(&mut self) -> bool {
        match self {
            UploadState::Failed | UploadState::Uploading => {
                *self = UploadState::Pending;
                true
            }
            _ => false,
        }
    }

    pub fn is_uploaded(self) -> bool {
        self == UploadState::Uploaded
    }

}

/// Kind of captured media
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Photo,
    Video,
}

/// One uploadable file belonging to a capture strip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadAsset {
    /// Unique asset ID
    pub id: String,
    pub kind: AssetKind,
    /// Capture group ordinal
    pub strip_index: u32,
    /// Ordering within the strip
    pub sequence_index: u32,
    /// Staged copy under the queue root
    pub local_path: PathBuf,
    /// Remote object key
    pub remote_path: String,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Remote key of the representative photo (videos only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_path: Option<String>,
    #[serde(default)]
    pub state: UploadState,
}

/// A guest's full capture, tracked from enqueue to remote finalization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSession {
    pub session_id: String,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    /// Public gallery URL, embedded in the manifest
    pub gallery_url: String,
    pub assets: Vec<UploadAsset>,
    #[serde(default)]
    pub manifest_state: UploadState,
    #[serde(default)]
    pub complete_state: UploadState,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        event_id: impl Into<String>,
        session_id: impl Into<String>,
        gallery_url: impl Into<String>,
        assets: Vec<UploadAsset>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            event_id: event_id.into(),
            created_at: now,
            gallery_url: gallery_url.into(),
            assets,
            manifest_state: UploadState::Pending,
            complete_state: UploadState::Pending,
            updated_at: now,
        }
    }

    /// Checked fresh on every call; never cached.
    pub fn all_assets_uploaded(&self) -> bool {
        self.assets.iter().all(|a| a.state.is_uploaded())
    }

    /// Indices of assets that still need a transfer, in list order
    pub fn pending_assets(&self) -> Vec<usize> {
        self.assets
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.state.is_uploaded())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn manifest_path(&self) -> String {
        format!("{}/manifest.json", session_prefix(&self.event_id, &self.session_id))
    }

    pub fn is_complete(&self) -> bool {
        self.complete_state.is_uploaded()
    }

    /// (uploaded, total) asset counts
    pub fn progress(&self) -> (usize, usize) {
        let uploaded = self.assets.iter().filter(|a| a.state.is_uploaded()).count();
        (uploaded, self.assets.len())
    }

    /// Resume pass over every field. Returns true if anything changed.
    pub fn resume(&mut self) -> bool {
        let mut changed = false;
        for asset in &mut self.assets {
            changed |= asset.state.resume();
        }
        changed |= self.manifest_state.resume();
        changed |= self.complete_state.resume();
        changed
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Remote key prefix for a session: `events/{eventId}/sessions/{sessionId}`.
///
/// IDs are used verbatim; [`is_safe_id`] is checked before a session is staged.
pub fn session_prefix(event_id: &str, session_id: &str) -> String {
    format!("events/{}/sessions/{}", event_id, session_id)
}

/// Whether an ID can be used unchanged as one path segment, both in remote
/// keys and as a staging directory name
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}
