//! Local media ownership
//!
//! The [`MediaGuard`] opens the capture device for a call and hands back a
//! [`MediaHandle`] that owns the tracks. There is no process-wide registry:
//! the handle is the only thing keeping the device open, and it stops every
//! track exactly once, either through an explicit release or when it is
//! dropped on an abnormal exit path.

use crate::types::{CallFailure, LocalTrackInfo, MediaConstraints, MediaType};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// No camera or microphone
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// User refused capture permission
    #[error("Permission denied")]
    PermissionDenied,

    /// Device is held by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),
}

impl From<MediaError> for CallFailure {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::DeviceUnavailable(_) => CallFailure::DeviceUnavailable,
            MediaError::PermissionDenied => CallFailure::PermissionDenied,
            MediaError::DeviceBusy(_) => CallFailure::DeviceBusy,
        }
    }
}

/// A track opened by the capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTrack {
    /// Track identifier
    pub id: String,
    /// Media kind
    pub kind: MediaType,
}

/// OS-level capture device (camera + microphone)
///
/// `open` may suspend for a long time (e.g. while the user answers a
/// permission prompt). `stop` must not fail.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open capture tracks matching the constraints
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<CaptureTrack>, MediaError>;

    /// Stop a previously opened track
    fn stop(&self, track: &CaptureTrack);

    /// Pause or resume sending on a track without closing it
    fn set_enabled(&self, _track: &CaptureTrack, _enabled: bool) {}
}

struct LocalTrack {
    track: CaptureTrack,
    enabled: bool,
}

/// Exclusive ownership of the local capture tracks of one call
///
/// Dropping the handle releases it.
pub struct MediaHandle {
    device: Arc<dyn CaptureDevice>,
    tracks: Vec<LocalTrack>,
    released: bool,
}

impl MediaHandle {
    fn new(device: Arc<dyn CaptureDevice>, tracks: Vec<CaptureTrack>) -> Self {
        Self {
            device,
            tracks: tracks
                .into_iter()
                .map(|track| LocalTrack {
                    track,
                    enabled: true,
                })
                .collect(),
            released: false,
        }
    }

    /// Snapshot of the local tracks
    #[must_use]
    pub fn tracks(&self) -> Vec<LocalTrackInfo> {
        if self.released {
            return Vec::new();
        }
        self.tracks
            .iter()
            .map(|t| LocalTrackInfo {
                id: t.track.id.clone(),
                kind: t.track.kind,
                enabled: t.enabled,
            })
            .collect()
    }

    fn set_enabled(&mut self, kind: MediaType, enabled: bool) -> bool {
        if self.released {
            return false;
        }
        let mut changed = false;
        for local in self.tracks.iter_mut().filter(|t| t.track.kind == kind) {
            if local.enabled != enabled {
                self.device.set_enabled(&local.track, enabled);
                local.enabled = enabled;
                changed = true;
            }
        }
        changed
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for local in &self.tracks {
            self.device.stop(&local.track);
        }
        tracing::debug!(tracks = self.tracks.len(), "Local media released");
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("tracks", &self.tracks())
            .field("released", &self.released)
            .finish()
    }
}

/// Media resource guard
///
/// Acquires and releases local capture for a call session.
#[derive(Clone)]
pub struct MediaGuard {
    device: Arc<dyn CaptureDevice>,
}

impl MediaGuard {
    /// Create a guard over a capture device
    #[must_use]
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self { device }
    }

    /// Open the capture device
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable`, `PermissionDenied` or `DeviceBusy`
    #[tracing::instrument(
        skip(self, constraints),
        fields(audio = constraints.has_audio(), video = constraints.has_video())
    )]
    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, MediaError> {
        let tracks = self.device.open(constraints).await.map_err(|e| {
            tracing::warn!(error = %e, "Local media acquisition failed");
            e
        })?;
        if constraints.has_video() {
            tracing::debug!(
                tracks = tracks.len(),
                width = constraints.resolution.width(),
                height = constraints.resolution.height(),
                "Local media acquired"
            );
        } else {
            tracing::debug!(tracks = tracks.len(), "Local media acquired");
        }
        Ok(MediaHandle::new(self.device.clone(), tracks))
    }

    /// Stop every track of the handle; further calls do nothing
    pub fn release(&self, handle: &mut MediaHandle) {
        handle.release();
    }

    /// Mute or unmute all tracks of a kind without renegotiation
    ///
    /// Returns `true` if any track changed.
    pub fn toggle_track(&self, handle: &mut MediaHandle, kind: MediaType, enabled: bool) -> bool {
        let changed = handle.set_enabled(kind, enabled);
        if changed {
            tracing::debug!(kind = ?kind, enabled, "Local track toggled");
        }
        changed
    }
}
