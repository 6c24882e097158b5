//! Upload queue engine.
//!
//! Drains the session store one session at a time. Each session moves through
//! asset upload, manifest publication, finalization and local cleanup. Every
//! state change is persisted before the next network call, so the store is always
//! a valid resume point.

use crate::error::{QueueError, QueueResult, StoreError};
use crate::manifest::{Manifest, MANIFEST_CONTENT_TYPE};
use crate::model::{UploadAsset, UploadSession, UploadState};
use crate::remote::{CompleteRequest, PresignFile, PresignRequest, RemoteClient, UploadTarget};
use crate::staging::{CapturedStrip, SessionIdentity, Staging};
use crate::store::SessionStore;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Result of a `start_processing` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain was active; this call did nothing
    AlreadyRunning,
    /// A full pass over the store ran
    Finished(DrainSummary),
}

/// Counters for one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Sessions found in the store at the start of the pass
    pub sessions: usize,
    /// Sessions finalized and removed during the pass
    pub completed: usize,
    /// Sessions left in the store for a later pass
    pub pending: usize,
}

/// Releases the single-flight flag when the drain ends, including on panic
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Upload queue engine. Construct once per process and share behind an `Arc`.
pub struct UploadQueue {
    store: Arc<dyn SessionStore>,
    remote: Arc<dyn RemoteClient>,
    staging: Staging,
    draining: AtomicBool,
}

impl UploadQueue {
    pub fn new(store: Arc<dyn SessionStore>, remote: Arc<dyn RemoteClient>, staging: Staging) -> Self {
        Self {
            store,
            remote,
            staging,
            draining: AtomicBool::new(false),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    /// Sessions currently waiting in the store, in drain order
    pub async fn queued_sessions(&self) -> Result<Vec<UploadSession>, StoreError> {
        self.store.list().await
    }

    /// Stage a captured session and persist it with every field pending.
    ///
    /// Staging errors are fatal for this session and nothing is persisted.
    #[instrument(skip(self, identity, strips), fields(session_id = %identity.session_id))]
    pub async fn enqueue_session(
        &self,
        event_id: &str,
        identity: SessionIdentity,
        strips: &[CapturedStrip],
    ) -> QueueResult<UploadSession> {
        if self.store.get(&identity.session_id).await?.is_some() {
            warn!("Session already queued, ignoring duplicate enqueue");
            return Err(QueueError::AlreadyQueued(identity.session_id));
        }

        let assets = self.staging.stage(event_id, &identity, strips).await?;
        let session = UploadSession::new(
            event_id,
            identity.session_id,
            identity.gallery_url,
            assets,
        );

        match self.store.add(&session).await {
            Ok(()) => {}
            // Lost a race with an identical enqueue; its record owns the staged files
            Err(StoreError::Duplicate(id)) => return Err(QueueError::AlreadyQueued(id)),
            Err(e) => {
                if let Err(cleanup_err) = self.staging.cleanup(&session).await {
                    warn!(error = %cleanup_err, "Failed to remove staged files after store error");
                }
                return Err(e.into());
            }
        }

        metrics::counter!("upload_queue.sessions.enqueued").increment(1);

        info!(
            event_id = %session.event_id,
            assets = session.assets.len(),
            "Session enqueued"
        );

        Ok(session)
    }

    /// Enqueue a session, then start a drain
    pub async fn enqueue_and_start<P, E>(
        &self,
        event_id: &str,
        identity: SessionIdentity,
        strips: &[CapturedStrip],
        on_progress: P,
        on_error: E,
    ) -> QueueResult<DrainOutcome>
    where
        P: Fn(&str) + Send + Sync,
        E: Fn(&str, &QueueError) + Send + Sync,
    {
        self.enqueue_session(event_id, identity, strips).await?;
        Ok(self.start_processing(on_progress, on_error).await)
    }

    /// Run one drain pass over every queued session.
    ///
    /// Single-flight: while a drain is active, further calls return
    /// [`DrainOutcome::AlreadyRunning`] immediately. Sessions are processed
    /// sequentially in store order, and a failure in one session never stops
    /// the others.
    pub async fn start_processing<P, E>(&self, on_progress: P, on_error: E) -> DrainOutcome
    where
        P: Fn(&str) + Send + Sync,
        E: Fn(&str, &QueueError) + Send + Sync,
    {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("Drain already in progress, skipping");
            metrics::counter!("upload_queue.drains.skipped").increment(1);
            return DrainOutcome::AlreadyRunning;
        };

        let sessions = match self.store.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "Failed to enumerate queued sessions");
                return DrainOutcome::Finished(DrainSummary::default());
            }
        };

        let mut summary = DrainSummary {
            sessions: sessions.len(),
            ..Default::default()
        };

        if !sessions.is_empty() {
            info!(sessions = sessions.len(), "Starting drain");
        }

        for session in sessions {
            let session_id = session.session_id.clone();

            match self.process(session, &on_progress).await {
                Ok(()) => summary.completed += 1,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Session processing halted");
                    metrics::counter!("upload_queue.sessions.failed").increment(1);
                    summary.pending += 1;
                    on_error(&session_id, &e);
                }
            }
        }

        if summary.sessions > 0 {
            info!(
                completed = summary.completed,
                pending = summary.pending,
                "Drain finished"
            );
        }

        DrainOutcome::Finished(summary)
    }

    /// Advance one session as far as it will go in this pass
    #[instrument(skip(self, session, on_progress), fields(session_id = %session.session_id))]
    async fn process<P>(&self, mut session: UploadSession, on_progress: &P) -> QueueResult<()>
    where
        P: Fn(&str) + Send + Sync,
    {
        if session.resume() {
            debug!("Reset failed or interrupted fields to pending");
            self.persist(&mut session).await?;
        }

        if !session.manifest_state.is_uploaded() {
            self.upload_assets(&mut session, on_progress).await?;
            // Manifest::build re-checks that every asset is uploaded
            self.upload_manifest(&mut session).await?;
        }

        if !session.is_complete() {
            self.complete_session(&mut session).await?;
        }

        self.cleanup_session(&session).await
    }

    /// Asset stage: presign every unfinished asset in one batch, then transfer in list order
    async fn upload_assets<P>(&self, session: &mut UploadSession, on_progress: &P) -> QueueResult<()>
    where
        P: Fn(&str) + Send + Sync,
    {
        let pending = session.pending_assets();
        if pending.is_empty() {
            return Ok(());
        }

        let request = PresignRequest {
            files: pending
                .iter()
                .map(|&i| presign_file(&session.assets[i]))
                .collect(),
        };

        let presigned = self
            .remote
            .presign(request)
            .await
            .map_err(QueueError::Presign)?;

        let missing: Vec<usize> = pending
            .iter()
            .copied()
            .filter(|&i| presigned.target_for(&session.assets[i].remote_path).is_none())
            .collect();

        if let Some(&first) = missing.first() {
            for &i in &missing {
                session.assets[i].state.transition(UploadState::Failed)?;
            }
            self.persist(session).await?;

            metrics::counter!("upload_queue.assets.failed").increment(missing.len() as u64);
            warn!(
                missing = missing.len(),
                requested = pending.len(),
                "Presign response is missing upload targets"
            );

            return Err(QueueError::MissingTarget {
                path: session.assets[first].remote_path.clone(),
            });
        }

        for i in pending {
            let target = presigned
                .target_for(&session.assets[i].remote_path)
                .cloned()
                .ok_or_else(|| QueueError::MissingTarget {
                    path: session.assets[i].remote_path.clone(),
                })?;

            session.assets[i].state.transition(UploadState::Uploading)?;
            self.persist(session).await?;

            let started = Instant::now();
            match self.transfer_asset(&session.assets[i], &target).await {
                Ok(()) => {
                    session.assets[i].state.transition(UploadState::Uploaded)?;
                    self.persist(session).await?;

                    metrics::histogram!("upload_queue.asset.upload_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    metrics::counter!("upload_queue.assets.uploaded").increment(1);
                    metrics::counter!("upload_queue.bytes.uploaded")
                        .increment(session.assets[i].size_bytes);

                    debug!(
                        path = %session.assets[i].remote_path,
                        size_bytes = session.assets[i].size_bytes,
                        "Asset uploaded"
                    );
                    on_progress(&session.session_id);
                }
                Err(e) => {
                    session.assets[i].state.transition(UploadState::Failed)?;
                    self.persist(session).await?;
                    metrics::counter!("upload_queue.assets.failed").increment(1);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn transfer_asset(&self, asset: &UploadAsset, target: &UploadTarget) -> QueueResult<()> {
        let bytes = tokio::fs::read(&asset.local_path)
            .await
            .map_err(|source| QueueError::LocalRead {
                path: asset.local_path.clone(),
                source,
            })?;

        self.remote
            .upload_bytes(target, &asset.content_type, Bytes::from(bytes))
            .await
            .map_err(|source| QueueError::Transfer {
                path: asset.remote_path.clone(),
                source,
            })
    }

    /// Manifest stage: build, presign and upload the session manifest
    async fn upload_manifest(&self, session: &mut UploadSession) -> QueueResult<()> {
        let manifest = Manifest::build(session)?;
        let body = manifest.to_json_bytes()?;
        let path = session.manifest_path();

        let request = PresignRequest {
            files: vec![PresignFile {
                path: path.clone(),
                content_type: MANIFEST_CONTENT_TYPE.to_string(),
                size_bytes: body.len() as u64,
            }],
        };

        let target = match self.remote.presign(request).await {
            Ok(response) => response.target_for(&path).cloned(),
            Err(e) => {
                session.manifest_state.transition(UploadState::Failed)?;
                self.persist(session).await?;
                return Err(QueueError::Presign(e));
            }
        };

        let Some(target) = target else {
            session.manifest_state.transition(UploadState::Failed)?;
            self.persist(session).await?;
            return Err(QueueError::MissingTarget { path });
        };

        session.manifest_state.transition(UploadState::Uploading)?;
        self.persist(session).await?;

        match self
            .remote
            .upload_bytes(&target, MANIFEST_CONTENT_TYPE, Bytes::from(body))
            .await
        {
            Ok(()) => {
                session.manifest_state.transition(UploadState::Uploaded)?;
                self.persist(session).await?;
                metrics::counter!("upload_queue.manifests.uploaded").increment(1);
                info!(path = %path, assets = manifest.assets.len(), "Manifest uploaded");
                Ok(())
            }
            Err(source) => {
                session.manifest_state.transition(UploadState::Failed)?;
                self.persist(session).await?;
                Err(QueueError::Transfer { path, source })
            }
        }
    }

    /// Completion stage: finalize the session server-side
    async fn complete_session(&self, session: &mut UploadSession) -> QueueResult<()> {
        session.complete_state.transition(UploadState::Uploading)?;
        self.persist(session).await?;

        let request = CompleteRequest {
            event_id: session.event_id.clone(),
            session_id: session.session_id.clone(),
            manifest_path: session.manifest_path(),
        };

        match self.remote.complete(request).await {
            Ok(response) => {
                // Persisted before cleanup: a crash after this point keeps the files
                // and the next pass only re-runs cleanup.
                session.complete_state.transition(UploadState::Uploaded)?;
                self.persist(session).await?;
                info!(status = %response.status, "Session finalized");
                Ok(())
            }
            Err(e) => {
                session.complete_state.transition(UploadState::Failed)?;
                self.persist(session).await?;
                Err(QueueError::Finalize(e))
            }
        }
    }

    /// Terminal step: drop staged files, then the record
    async fn cleanup_session(&self, session: &UploadSession) -> QueueResult<()> {
        self.staging
            .cleanup(session)
            .await
            .map_err(QueueError::Cleanup)?;
        self.store.remove(&session.session_id).await?;

        metrics::counter!("upload_queue.sessions.completed").increment(1);
        info!(session_id = %session.session_id, "Session completed and removed from queue");
        Ok(())
    }

    async fn persist(&self, session: &mut UploadSession) -> QueueResult<()> {
        session.touch();
        self.store.update(session).await?;
        Ok(())
    }
}

fn presign_file(asset: &UploadAsset) -> PresignFile {
    PresignFile {
        path: asset.remote_path.clone(),
        content_type: asset.content_type.clone(),
        size_bytes: asset.size_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RemoteError, StagingError};
    use crate::remote::{CompleteResponse, MockRemoteClient, PresignResponse};
    use crate::store::MemorySessionStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeState {
        omit: HashSet<String>,
        fail_uploads: HashSet<String>,
        fail_complete: bool,
        presign_calls: Vec<Vec<String>>,
        transfers: Vec<String>,
        completes: Vec<CompleteRequest>,
        manifests: Vec<Vec<u8>>,
        states_during_transfer: Vec<Option<UploadState>>,
    }

    /// Remote double that records every call and fails on demand
    #[derive(Default)]
    struct FakeRemote {
        state: Mutex<FakeState>,
        store: Option<Arc<MemorySessionStore>>,
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl FakeRemote {
        fn with_store(store: Arc<MemorySessionStore>) -> Self {
            Self {
                store: Some(store),
                ..Default::default()
            }
        }

        fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.state.lock().unwrap()
        }
    }

    #[async_trait]
    impl RemoteClient for FakeRemote {
        async fn presign(&self, request: PresignRequest) -> Result<PresignResponse, RemoteError> {
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }

            let mut state = self.state();
            state
                .presign_calls
                .push(request.files.iter().map(|f| f.path.clone()).collect());

            let uploads = request
                .files
                .iter()
                .filter(|f| !state.omit.contains(&f.path))
                .map(|f| UploadTarget {
                    path: f.path.clone(),
                    method: "PUT".to_string(),
                    url: format!("https://bucket.test/{}", f.path),
                })
                .collect();

            Ok(PresignResponse {
                uploads,
                expires_in_seconds: 900,
            })
        }

        async fn upload_bytes(
            &self,
            target: &UploadTarget,
            _content_type: &str,
            body: Bytes,
        ) -> Result<(), RemoteError> {
            let observed = match &self.store {
                Some(store) => {
                    let sessions = store.list().await.unwrap();
                    sessions
                        .iter()
                        .flat_map(|s| s.assets.iter())
                        .find(|a| a.remote_path == target.path)
                        .map(|a| a.state)
                }
                None => None,
            };

            let mut state = self.state();
            state.transfers.push(target.path.clone());
            if target.path.ends_with("manifest.json") {
                state.manifests.push(body.to_vec());
            } else {
                state.states_during_transfer.push(observed);
            }

            if state.fail_uploads.contains(&target.path) {
                return Err(RemoteError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(())
        }

        async fn complete(&self, request: CompleteRequest) -> Result<CompleteResponse, RemoteError> {
            let mut state = self.state();
            state.completes.push(request);
            if state.fail_complete {
                return Err(RemoteError::Status {
                    status: 500,
                    body: "finalize failed".to_string(),
                });
            }
            Ok(CompleteResponse {
                status: "published".to_string(),
            })
        }
    }

    struct Harness {
        queue: Arc<UploadQueue>,
        store: Arc<MemorySessionStore>,
        remote: Arc<FakeRemote>,
        capture: TempDir,
        _queue_dir: TempDir,
    }

    fn harness_with(remote: FakeRemote, store: Arc<MemorySessionStore>) -> Harness {
        let capture = TempDir::new().unwrap();
        let queue_dir = TempDir::new().unwrap();
        let remote = Arc::new(remote);
        let queue = Arc::new(UploadQueue::new(
            store.clone(),
            remote.clone(),
            Staging::new(queue_dir.path()),
        ));

        Harness {
            queue,
            store,
            remote,
            capture,
            _queue_dir: queue_dir,
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        harness_with(FakeRemote::with_store(store.clone()), store)
    }

    fn identity(session_id: &str) -> SessionIdentity {
        SessionIdentity {
            session_id: session_id.to_string(),
            gallery_url: format!("https://gallery.test/{}", session_id),
        }
    }

    async fn strips(dir: &TempDir, count: u32) -> Vec<CapturedStrip> {
        let mut strips = Vec::new();
        for i in 0..count {
            let video_path = dir.path().join(format!("capture_{}.mov", i));
            tokio::fs::write(&video_path, format!("video-{}", i))
                .await
                .unwrap();
            strips.push(CapturedStrip {
                strip_index: i,
                video_path,
                photo_bytes: format!("photo-{}", i).into_bytes(),
                thumbnail_bytes: None,
                video_duration_seconds: Some(3.0),
            });
        }
        strips
    }

    async fn enqueue(h: &Harness, session_id: &str, count: u32) -> UploadSession {
        let strips = strips(&h.capture, count).await;
        h.queue
            .enqueue_session("evt", identity(session_id), &strips)
            .await
            .unwrap()
    }

    struct DrainResult {
        outcome: DrainOutcome,
        progress: Vec<String>,
        errors: Vec<(String, String)>,
    }

    async fn drain(queue: &UploadQueue) -> DrainResult {
        let progress = Mutex::new(Vec::new());
        let errors = Mutex::new(Vec::new());

        let outcome = queue
            .start_processing(
                |id| progress.lock().unwrap().push(id.to_string()),
                |id, e| errors.lock().unwrap().push((id.to_string(), e.to_string())),
            )
            .await;

        DrainResult {
            outcome,
            progress: progress.into_inner().unwrap(),
            errors: errors.into_inner().unwrap(),
        }
    }

    async fn stored(h: &Harness, session_id: &str) -> UploadSession {
        h.store.get(session_id).await.unwrap().unwrap()
    }

    fn asset_states(session: &UploadSession) -> Vec<UploadState> {
        session.assets.iter().map(|a| a.state).collect()
    }

    #[tokio::test]
    async fn test_full_success_finalizes_once_and_cleans_up() {
        let h = harness();
        let session = enqueue(&h, "s1", 3).await;
        assert_eq!(session.assets.len(), 6);

        let result = drain(&h.queue).await;

        assert_eq!(
            result.outcome,
            DrainOutcome::Finished(DrainSummary {
                sessions: 1,
                completed: 1,
                pending: 0,
            })
        );
        assert!(result.errors.is_empty());
        assert_eq!(result.progress, vec!["s1".to_string(); 6]);
        assert!(h.store.is_empty().await);

        let state = h.remote.state();
        assert_eq!(state.completes.len(), 1);
        assert_eq!(
            state.completes[0].manifest_path,
            "events/evt/sessions/s1/manifest.json"
        );
        assert_eq!(state.transfers.len(), 7);
        assert_eq!(state.transfers[6], "events/evt/sessions/s1/manifest.json");

        // Each transfer started only after `uploading` was persisted
        assert!(state
            .states_during_transfer
            .iter()
            .all(|s| *s == Some(UploadState::Uploading)));

        let manifest: Manifest = serde_json::from_slice(&state.manifests[0]).unwrap();
        assert_eq!(manifest.assets.len(), 6);
        assert_eq!(manifest.gallery_url, "https://gallery.test/s1");
        assert_eq!(manifest.assets[0].path, session.assets[0].remote_path);

        assert!(session.assets.iter().all(|a| !a.local_path.exists()));
        assert!(!h.queue.staging().session_dir("s1").exists());
    }

    #[tokio::test]
    async fn test_completed_session_is_gone_from_later_drains() {
        let h = harness();
        enqueue(&h, "s1", 1).await;
        drain(&h.queue).await;

        let result = drain(&h.queue).await;
        assert_eq!(result.outcome, DrainOutcome::Finished(DrainSummary::default()));
        assert_eq!(h.remote.state().completes.len(), 1);
        assert!(h.queue.queued_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_presign_target_fails_only_that_asset() {
        let h = harness();
        let session = enqueue(&h, "s1", 3).await;
        h.remote
            .state()
            .omit
            .insert(session.assets[3].remote_path.clone());

        let result = drain(&h.queue).await;

        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].0, "s1");
        assert!(result.progress.is_empty());

        let after = stored(&h, "s1").await;
        let mut expected = vec![UploadState::Pending; 6];
        expected[3] = UploadState::Failed;
        assert_eq!(asset_states(&after), expected);
        assert_eq!(after.manifest_state, UploadState::Pending);

        let state = h.remote.state();
        assert!(state.transfers.is_empty());
        assert!(state.completes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_presign_target_transfers_nothing_with_mock() {
        let store = Arc::new(MemorySessionStore::new());
        let queue_dir = TempDir::new().unwrap();
        let capture = TempDir::new().unwrap();

        let mut remote = MockRemoteClient::new();
        remote.expect_presign().times(1).returning(|request| {
            Ok(PresignResponse {
                uploads: request
                    .files
                    .iter()
                    .skip(1)
                    .map(|f| UploadTarget {
                        path: f.path.clone(),
                        method: "PUT".to_string(),
                        url: format!("https://bucket.test/{}", f.path),
                    })
                    .collect(),
                expires_in_seconds: 900,
            })
        });
        remote.expect_upload_bytes().times(0);
        remote.expect_complete().times(0);

        let queue = UploadQueue::new(store.clone(), Arc::new(remote), Staging::new(queue_dir.path()));
        let strips = strips(&capture, 3).await;
        queue
            .enqueue_session("evt", identity("s1"), &strips)
            .await
            .unwrap();

        let result = drain(&queue).await;
        assert_eq!(result.errors.len(), 1);

        let after = store.get("s1").await.unwrap().unwrap();
        assert_eq!(after.assets[0].state, UploadState::Failed);
        assert!(after.assets[1..]
            .iter()
            .all(|a| a.state == UploadState::Pending));
    }

    #[tokio::test]
    async fn test_mid_transfer_failure_resumes_without_double_upload() {
        let h = harness();
        let session = enqueue(&h, "s1", 3).await;
        let second = session.assets[1].remote_path.clone();
        h.remote.state().fail_uploads.insert(second.clone());

        let result = drain(&h.queue).await;
        assert_eq!(result.progress.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].1.contains(&second));

        let after = stored(&h, "s1").await;
        assert_eq!(
            asset_states(&after),
            vec![
                UploadState::Uploaded,
                UploadState::Failed,
                UploadState::Pending,
                UploadState::Pending,
                UploadState::Pending,
                UploadState::Pending,
            ]
        );
        assert_eq!(h.remote.state().transfers.len(), 2);

        h.remote.state().fail_uploads.clear();
        let result = drain(&h.queue).await;
        assert!(result.errors.is_empty());
        assert!(h.store.is_empty().await);

        let state = h.remote.state();
        // Second pass presigned only the five unfinished assets
        assert_eq!(state.presign_calls[1].len(), 5);
        assert!(!state.presign_calls[1].contains(&session.assets[0].remote_path));
        let first_count = state
            .transfers
            .iter()
            .filter(|p| **p == session.assets[0].remote_path)
            .count();
        assert_eq!(first_count, 1);
        assert_eq!(state.transfers[2], second);
    }

    #[tokio::test]
    async fn test_manifest_failure_retries_manifest_only() {
        let h = harness();
        enqueue(&h, "s1", 3).await;
        let manifest_path = "events/evt/sessions/s1/manifest.json".to_string();
        h.remote.state().fail_uploads.insert(manifest_path.clone());

        let result = drain(&h.queue).await;
        assert_eq!(result.progress.len(), 6);
        assert_eq!(result.errors.len(), 1);

        let after = stored(&h, "s1").await;
        assert!(after.all_assets_uploaded());
        assert_eq!(after.manifest_state, UploadState::Failed);
        assert_eq!(after.complete_state, UploadState::Pending);
        assert!(h.remote.state().completes.is_empty());

        h.remote.state().fail_uploads.clear();
        let transfers_before = h.remote.state().transfers.len();
        let result = drain(&h.queue).await;

        assert!(result.errors.is_empty());
        assert!(result.progress.is_empty());
        assert!(h.store.is_empty().await);

        let state = h.remote.state();
        assert_eq!(state.presign_calls.last().unwrap(), &vec![manifest_path.clone()]);
        assert_eq!(&state.transfers[transfers_before..], &[manifest_path]);
        assert_eq!(state.completes.len(), 1);
        assert_eq!(state.manifests.len(), 2);
    }

    #[tokio::test]
    async fn test_finalize_failure_retains_files_and_retries_complete_only() {
        let h = harness();
        let session = enqueue(&h, "s1", 3).await;
        h.remote.state().fail_complete = true;

        let result = drain(&h.queue).await;
        assert_eq!(result.errors.len(), 1);

        let after = stored(&h, "s1").await;
        assert_eq!(after.manifest_state, UploadState::Uploaded);
        assert_eq!(after.complete_state, UploadState::Failed);
        assert!(session.assets.iter().all(|a| a.local_path.exists()));

        let (presigns, transfers) = {
            let mut state = h.remote.state();
            state.fail_complete = false;
            (state.presign_calls.len(), state.transfers.len())
        };

        let result = drain(&h.queue).await;
        assert!(result.errors.is_empty());
        assert!(h.store.is_empty().await);

        let state = h.remote.state();
        assert_eq!(state.presign_calls.len(), presigns);
        assert_eq!(state.transfers.len(), transfers);
        assert_eq!(state.completes.len(), 2);
        assert!(session.assets.iter().all(|a| !a.local_path.exists()));
    }

    #[tokio::test]
    async fn test_uploaded_manifest_never_reenters_asset_stage() {
        let h = harness();
        let mut session = enqueue(&h, "s1", 1).await;
        for asset in &mut session.assets {
            asset.state = UploadState::Uploaded;
        }
        session.manifest_state = UploadState::Uploaded;
        // External override on one asset after the manifest went out
        session.assets[0].state.force_reset();
        h.store.update(&session).await.unwrap();

        let result = drain(&h.queue).await;
        assert!(result.errors.is_empty());

        let state = h.remote.state();
        assert!(state.presign_calls.is_empty());
        assert!(state.transfers.is_empty());
        assert_eq!(state.completes.len(), 1);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_interrupted_transfer_is_resumed() {
        let h = harness();
        let mut session = enqueue(&h, "s1", 1).await;
        // A process that died mid-transfer leaves `uploading` behind
        session.assets[0].state = UploadState::Uploading;
        h.store.update(&session).await.unwrap();

        let result = drain(&h.queue).await;
        assert!(result.errors.is_empty());
        assert_eq!(result.progress.len(), 2);
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_one_failing_session_does_not_stop_the_drain() {
        let h = harness();
        let first = enqueue(&h, "s1", 1).await;
        enqueue(&h, "s2", 1).await;
        h.remote.state().omit.insert(first.assets[0].remote_path.clone());

        let result = drain(&h.queue).await;

        assert_eq!(
            result.outcome,
            DrainOutcome::Finished(DrainSummary {
                sessions: 2,
                completed: 1,
                pending: 1,
            })
        );
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].0, "s1");
        let remaining: Vec<_> = h
            .queue
            .queued_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(remaining, vec!["s1"]);
    }

    #[tokio::test]
    async fn test_concurrent_start_is_single_flight() {
        let store = Arc::new(MemorySessionStore::new());
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = FakeRemote {
            gate: Some((entered.clone(), release.clone())),
            ..Default::default()
        };
        let h = harness_with(remote, store);
        enqueue(&h, "s1", 1).await;

        let queue = h.queue.clone();
        let first = tokio::spawn(async move { queue.start_processing(|_| {}, |_, _| {}).await });

        entered.notified().await;
        assert!(h.queue.is_draining());

        let second = drain(&h.queue).await;
        assert_eq!(second.outcome, DrainOutcome::AlreadyRunning);
        assert!(second.progress.is_empty());
        assert_eq!(h.remote.state().presign_calls.len(), 0);

        release.notify_one();
        // The manifest presign passes through the gate too
        entered.notified().await;
        release.notify_one();

        let outcome = first.await.unwrap();
        assert_eq!(
            outcome,
            DrainOutcome::Finished(DrainSummary {
                sessions: 1,
                completed: 1,
                pending: 0,
            })
        );
        assert!(!h.queue.is_draining());
    }

    #[tokio::test]
    async fn test_similar_session_ids_do_not_share_keys_or_files() {
        let h = harness();
        let dotted = enqueue(&h, "guest.1", 1).await;
        let underscored = enqueue(&h, "guest_1", 1).await;

        assert_ne!(dotted.assets[0].local_path, underscored.assets[0].local_path);
        assert_eq!(
            dotted.assets[1].remote_path,
            "events/evt/sessions/guest.1/strip_0_photo.jpg"
        );

        let result = drain(&h.queue).await;

        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(
            result.outcome,
            DrainOutcome::Finished(DrainSummary {
                sessions: 2,
                completed: 2,
                pending: 0,
            })
        );
        assert!(h.store.is_empty().await);

        let state = h.remote.state();
        let manifest_paths: Vec<_> = state
            .completes
            .iter()
            .map(|c| (c.session_id.as_str(), c.manifest_path.as_str()))
            .collect();
        assert_eq!(
            manifest_paths,
            vec![
                ("guest.1", "events/evt/sessions/guest.1/manifest.json"),
                ("guest_1", "events/evt/sessions/guest_1/manifest.json"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unsafe_session_id_is_rejected_at_enqueue() {
        let h = harness();
        let strips = strips(&h.capture, 1).await;

        let err = h
            .queue
            .enqueue_session("evt", identity("../escape"), &strips)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueueError::Staging(StagingError::InvalidId { field: "session_id", .. })
        ));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_rejected() {
        let h = harness();
        enqueue(&h, "s1", 2).await;

        let strips = strips(&h.capture, 2).await;
        let err = h
            .queue
            .enqueue_session("evt", identity("s1"), &strips)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::AlreadyQueued(ref id) if id == "s1"));
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_staging_failure_persists_nothing() {
        let h = harness();
        let strips = vec![CapturedStrip {
            strip_index: 0,
            video_path: h.capture.path().join("does-not-exist.mov"),
            photo_bytes: b"photo".to_vec(),
            thumbnail_bytes: None,
            video_duration_seconds: None,
        }];

        let err = h
            .queue
            .enqueue_session("evt", identity("s1"), &strips)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Staging(_)));
        assert!(h.store.is_empty().await);
        assert!(!h.queue.staging().session_dir("s1").exists());
    }

    #[tokio::test]
    async fn test_enqueue_and_start() {
        let h = harness();
        let strips = strips(&h.capture, 2).await;

        let outcome = h
            .queue
            .enqueue_and_start("evt", identity("s1"), &strips, |_| {}, |_, _| {})
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DrainOutcome::Finished(DrainSummary {
                sessions: 1,
                completed: 1,
                pending: 0,
            })
        );
        assert!(h.store.is_empty().await);
    }
}
