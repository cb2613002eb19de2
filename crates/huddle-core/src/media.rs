use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::DeviceError;
use crate::settings::Settings;
use crate::types::{LocalStream, LocalTrack, MediaFlags, TrackSource};

/// Host capture devices (camera, microphone, screen).
///
/// Denial is an expected outcome and comes back as a `DeviceError`.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn acquire(&self, source: TrackSource) -> Result<LocalTrack, DeviceError>;

    /// Pause or resume capture on a held track without releasing it.
    async fn set_enabled(&self, track: &LocalTrack, enabled: bool) -> Result<(), DeviceError>;

    fn release(&self, track: &LocalTrack);
}

/// Which tracks to request on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl From<&Settings> for MediaConstraints {
    fn from(settings: &Settings) -> Self {
        Self {
            audio: settings.mic_enabled_on_join,
            video: settings.camera_enabled_on_join,
        }
    }
}

/// A device the session is running without, for the status banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNotice {
    pub source: TrackSource,
    pub error: DeviceError,
}

impl DeviceNotice {
    pub fn message(&self) -> String {
        let label = self.source.label();
        let mut chars = label.chars();
        let capitalized: String = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
        format!("{capitalized} unavailable")
    }
}

/// Holds one acquired track; releasing it through the backend on drop.
struct TrackLease {
    track: LocalTrack,
    backend: Arc<dyn MediaBackend>,
}

impl Drop for TrackLease {
    fn drop(&mut self) {
        tracing::debug!(track = %self.track.id, "releasing {}", self.track.source.label());
        self.backend.release(&self.track);
    }
}

/// Owns the local capture tracks.
///
/// Peers and renderers only ever get `LocalTrack` clones; the hardware stays
/// held until the lease here is dropped, which happens on every teardown path.
pub struct MediaDeviceController {
    backend: Arc<dyn MediaBackend>,
    microphone: Option<TrackLease>,
    camera: Option<TrackLease>,
    screen: Option<TrackLease>,
    flags: MediaFlags,
    notices: Vec<DeviceNotice>,
    reports: Vec<DeviceError>,
    tracks_changed: bool,
}

impl MediaDeviceController {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            microphone: None,
            camera: None,
            screen: None,
            flags: MediaFlags {
                audio_muted: true,
                camera_off: true,
                ..Default::default()
            },
            notices: Vec::new(),
            reports: Vec::new(),
            tracks_changed: false,
        }
    }

    /// Acquire microphone and camera as requested.
    ///
    /// Each track is acquired independently. A track that is not requested or
    /// cannot be acquired is absent and its flag is forced off. Fails only when
    /// every requested track failed.
    pub async fn acquire_local_media(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, DeviceError> {
        let mut requested = 0;
        let mut first_error = None;

        if constraints.audio {
            requested += 1;
            if let Err(e) = self.acquire(TrackSource::Microphone).await {
                first_error.get_or_insert(e);
            }
        }
        if constraints.video {
            requested += 1;
            if let Err(e) = self.acquire(TrackSource::Camera).await {
                first_error.get_or_insert(e);
            }
        }

        self.flags.audio_muted = self.microphone.is_none();
        self.flags.camera_off = self.camera.is_none();

        let acquired = usize::from(self.microphone.is_some()) + usize::from(self.camera.is_some());
        tracing::info!("acquired {acquired} of {requested} local track(s)");
        match first_error {
            Some(e) if acquired == 0 => Err(e),
            _ => Ok(self.local_stream()),
        }
    }

    /// Returns whether the state changed. Repeating the current state is a
    /// no-op that never reaches the backend.
    pub async fn set_audio_muted(&mut self, muted: bool) -> Result<bool, DeviceError> {
        if self.flags.audio_muted == muted {
            return Ok(false);
        }
        self.set_capture(TrackSource::Microphone, !muted).await?;
        self.flags.audio_muted = muted;
        tracing::info!("microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(true)
    }

    pub async fn set_camera_off(&mut self, off: bool) -> Result<bool, DeviceError> {
        if self.flags.camera_off == off {
            return Ok(false);
        }
        self.set_capture(TrackSource::Camera, !off).await?;
        self.flags.camera_off = off;
        tracing::info!("camera {}", if off { "off" } else { "on" });
        Ok(true)
    }

    /// Start capturing the screen. Returns the existing track when already sharing.
    pub async fn start_screen_share(&mut self) -> Result<LocalTrack, DeviceError> {
        if let Some(lease) = &self.screen {
            return Ok(lease.track.clone());
        }
        self.acquire(TrackSource::ScreenShare).await?;
        self.flags.screen_sharing = true;
        let track = self
            .screen
            .as_ref()
            .map(|lease| lease.track.clone())
            .ok_or_else(|| DeviceError::Backend("screen track missing after acquire".into()))?;
        Ok(track)
    }

    /// Returns false when no screen share was running.
    pub fn stop_screen_share(&mut self) -> bool {
        let Some(lease) = self.screen.take() else {
            return false;
        };
        drop(lease);
        self.flags.screen_sharing = false;
        self.tracks_changed = true;
        tracing::info!("screen share stopped");
        true
    }

    /// Release every held device. Safe to call any number of times; returns
    /// how many tracks this call released.
    pub fn release_all(&mut self) -> usize {
        let leases = [self.microphone.take(), self.camera.take(), self.screen.take()];
        let released = leases.into_iter().flatten().count();
        if released > 0 {
            self.tracks_changed = true;
            tracing::info!("released {released} local track(s)");
        }
        self.flags.audio_muted = true;
        self.flags.camera_off = true;
        self.flags.screen_sharing = false;
        released
    }

    pub fn local_stream(&self) -> LocalStream {
        LocalStream {
            audio: self.microphone.as_ref().map(|l| l.track.clone()),
            video: self.camera.as_ref().map(|l| l.track.clone()),
            screen: self.screen.as_ref().map(|l| l.track.clone()),
        }
    }

    /// Device flags. `hand_raised` is not a device concern and is always false.
    pub fn flags(&self) -> MediaFlags {
        self.flags
    }

    /// Devices currently unavailable.
    pub fn notices(&self) -> &[DeviceNotice] {
        &self.notices
    }

    /// Errors not yet surfaced to the user.
    pub fn take_reports(&mut self) -> Vec<DeviceError> {
        std::mem::take(&mut self.reports)
    }

    /// Whether the set of held tracks changed since the last call.
    pub fn take_tracks_changed(&mut self) -> bool {
        std::mem::take(&mut self.tracks_changed)
    }

    async fn set_capture(&mut self, source: TrackSource, enabled: bool) -> Result<(), DeviceError> {
        let held = self.slot(source).as_ref().map(|lease| lease.track.clone());
        match held {
            Some(track) => self.backend.set_enabled(&track, enabled).await,
            // Nothing to pause; turning on without a track acquires one.
            None if enabled => self.acquire(source).await,
            None => Ok(()),
        }
    }

    async fn acquire(&mut self, source: TrackSource) -> Result<(), DeviceError> {
        if self.slot(source).is_some() {
            return Ok(());
        }
        match self.backend.acquire(source).await {
            Ok(track) => {
                tracing::info!(track = %track.id, "acquired {}", source.label());
                *self.slot(source) = Some(TrackLease {
                    track,
                    backend: self.backend.clone(),
                });
                self.notices.retain(|n| n.source != source);
                self.tracks_changed = true;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{} unavailable: {e}", source.label());
                self.notices.retain(|n| n.source != source);
                self.notices.push(DeviceNotice {
                    source,
                    error: e.clone(),
                });
                self.reports.push(e.clone());
                Err(e)
            }
        }
    }

    fn slot(&mut self, source: TrackSource) -> &mut Option<TrackLease> {
        match source {
            TrackSource::Microphone => &mut self.microphone,
            TrackSource::Camera => &mut self.camera,
            TrackSource::ScreenShare => &mut self.screen,
        }
    }
}
