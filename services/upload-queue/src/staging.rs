//! Durable local staging of captured media.
//!
//! Every session gets its own directory under the queue root. Captured files are
//! copied there before the session is persisted, so the queue never depends on
//! files owned by the capture pipeline.

use crate::error::StagingError;
use crate::model::{is_safe_id, session_prefix, AssetKind, UploadAsset, UploadSession, UploadState};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Identity of a capture session, handed over by the capture subsystem
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub gallery_url: String,
}

/// One video + photo capture unit
#[derive(Debug, Clone)]
pub struct CapturedStrip {
    /// Stable ordinal of the strip within the session
    pub strip_index: u32,
    /// Recorded video file
    pub video_path: PathBuf,
    /// Encoded photo
    pub photo_bytes: Vec<u8>,
    /// Accepted for completeness; thumbnails are not uploaded
    pub thumbnail_bytes: Option<Vec<u8>>,
    pub video_duration_seconds: Option<f64>,
}

/// Session-scoped staging area under a queue root
#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Staging directory of a session, named by the exact session id
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Copy every strip into the session directory and describe the resulting assets.
    ///
    /// IDs must be usable verbatim as path segments and strip indices must be
    /// unique; both are checked before anything is written. On any later failure
    /// the partially written directory is removed before the error is returned.
    #[instrument(skip(self, identity, strips), fields(session_id = %identity.session_id, strips = strips.len()))]
    pub async fn stage(
        &self,
        event_id: &str,
        identity: &SessionIdentity,
        strips: &[CapturedStrip],
    ) -> Result<Vec<UploadAsset>, StagingError> {
        if strips.is_empty() {
            return Err(StagingError::Empty(identity.session_id.clone()));
        }

        validate_id("event_id", event_id)?;
        validate_id("session_id", &identity.session_id)?;

        let mut seen = HashSet::with_capacity(strips.len());
        if let Some(strip) = strips.iter().find(|s| !seen.insert(s.strip_index)) {
            return Err(StagingError::DuplicateStrip {
                session_id: identity.session_id.clone(),
                strip_index: strip.strip_index,
            });
        }

        let dir = self.session_dir(&identity.session_id);

        match self.stage_into(&dir, event_id, identity, strips).await {
            Ok(assets) => {
                info!(
                    dir = %dir.display(),
                    assets = assets.len(),
                    "Session staged"
                );
                Ok(assets)
            }
            Err(e) => {
                if let Err(cleanup_err) = fs::remove_dir_all(&dir).await {
                    if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            dir = %dir.display(),
                            error = %cleanup_err,
                            "Failed to remove partially staged session"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn stage_into(
        &self,
        dir: &Path,
        event_id: &str,
        identity: &SessionIdentity,
        strips: &[CapturedStrip],
    ) -> Result<Vec<UploadAsset>, StagingError> {
        fs::create_dir_all(dir).await.map_err(|source| StagingError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let prefix = session_prefix(event_id, &identity.session_id);
        let mut assets = Vec::with_capacity(strips.len() * 2);

        for strip in strips {
            let extension = video_extension(&strip.video_path);
            let video_name = format!("strip_{}_video.{}", strip.strip_index, extension);
            let photo_name = format!("strip_{}_photo.jpg", strip.strip_index);

            let video_local = dir.join(&video_name);
            let video_size = fs::copy(&strip.video_path, &video_local)
                .await
                .map_err(|source| StagingError::Io {
                    path: strip.video_path.clone(),
                    source,
                })?;

            let photo_local = dir.join(&photo_name);
            fs::write(&photo_local, &strip.photo_bytes)
                .await
                .map_err(|source| StagingError::Io {
                    path: photo_local.clone(),
                    source,
                })?;

            let photo_remote = format!("{}/{}", prefix, photo_name);

            debug!(
                strip_index = strip.strip_index,
                video_size,
                photo_size = strip.photo_bytes.len(),
                "Strip staged"
            );

            assets.push(UploadAsset {
                id: Uuid::new_v4().to_string(),
                kind: AssetKind::Video,
                strip_index: strip.strip_index,
                sequence_index: 0,
                local_path: video_local,
                remote_path: format!("{}/{}", prefix, video_name),
                content_type: video_content_type(&extension).to_string(),
                size_bytes: video_size,
                duration_seconds: strip.video_duration_seconds,
                poster_path: Some(photo_remote.clone()),
                state: UploadState::Pending,
            });

            assets.push(UploadAsset {
                id: Uuid::new_v4().to_string(),
                kind: AssetKind::Photo,
                strip_index: strip.strip_index,
                sequence_index: 1,
                local_path: photo_local,
                remote_path: photo_remote,
                content_type: "image/jpeg".to_string(),
                size_bytes: strip.photo_bytes.len() as u64,
                duration_seconds: None,
                poster_path: None,
                state: UploadState::Pending,
            });
        }

        Ok(assets)
    }

    /// Delete every staged file of a session and its directory.
    ///
    /// Already-missing files are not an error, so cleanup can be repeated.
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    pub async fn cleanup(&self, session: &UploadSession) -> Result<(), StagingError> {
        for asset in &session.assets {
            remove_if_present(&asset.local_path, fs::remove_file(&asset.local_path).await)?;
        }

        let dir = self.session_dir(&session.session_id);
        remove_if_present(&dir, fs::remove_dir_all(&dir).await)?;

        debug!(dir = %dir.display(), "Staged files removed");
        Ok(())
    }
}

fn remove_if_present(path: &Path, result: std::io::Result<()>) -> Result<(), StagingError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StagingError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<(), StagingError> {
    if is_safe_id(value) {
        Ok(())
    } else {
        Err(StagingError::InvalidId {
            field,
            value: value.to_string(),
        })
    }
}

fn video_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "mov".to_string())
}

/// Get content type for a video container extension
fn video_content_type(extension: &str) -> &'static str {
    match extension {
        "mov" => "video/quicktime",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        _ => "application/octet-stream",
    }
}
