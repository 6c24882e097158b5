//! FotoX Upload Queue
//!
//! Durable upload queue for photobooth capture sessions. A finished session is
//! copied into a local staging area and persisted. The queue then drains it to
//! remote storage through presigned write targets, publishes a JSON manifest,
//! finalizes the session server-side and deletes the local copy.
//!
//! ## Features
//!
//! - **Crash-safe progress**: every per-asset, manifest and completion state
//!   change is persisted before the next network call
//! - **Resumable drains**: failed or interrupted work returns to pending on the
//!   next pass, and finished work is never repeated
//! - **Single-flight processing**: concurrent drain triggers collapse into one
//! - **Status API**: health, readiness, queue listing and a manual drain trigger
//!
//! ## Architecture
//!
//! ```text
//! Capture                Staging dir               Remote API / Storage
//! ┌──────────────┐      ┌──────────────┐          ┌──────────────┐
//! │ enqueue      │─────▶│ {root}/      │          │ presign      │
//! │ _session     │      │  {session}/  │          │ PUT targets  │
//! └──────────────┘      └──────────────┘          │ complete     │
//!        │                     │                  └──────────────┘
//!        ▼                     ▼                         ▲
//! ┌──────────────┐      ┌──────────────┐                 │
//! │ Session      │◀────▶│ Upload       │─────────────────┘
//! │ Store        │      │ Queue        │
//! │ (SQLite)     │      │ (drain)      │
//! └──────────────┘      └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod manifest;
pub mod model;
pub mod queue;
pub mod remote;
pub mod staging;
pub mod store;

pub use api::{AppState, SessionSummary};
pub use config::Config;
pub use error::{QueueError, QueueResult, RemoteError, StagingError, StoreError};
pub use manifest::{Manifest, ManifestAsset};
pub use model::{AssetKind, UploadAsset, UploadSession, UploadState};
pub use queue::{DrainOutcome, DrainSummary, UploadQueue};
pub use remote::{HttpRemoteClient, RemoteClient};
pub use staging::{CapturedStrip, SessionIdentity, Staging};
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
