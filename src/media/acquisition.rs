use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{LocalMediaStream, MediaConstraints, MediaDevices};
use crate::error::Result;
use crate::utils::random_id;

/// Media Acquisition Unit
///
/// Owns the current local stream. Acquiring never releases what was there
/// before: callers release explicitly or the capture leaks.
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
    current: Mutex<Option<LocalMediaStream>>,
}

impl MediaAcquisition {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            current: Mutex::new(None),
        }
    }

    /// Camera and/or microphone capture
    pub async fn acquire_camera(&self, video: bool, audio: bool) -> Result<LocalMediaStream> {
        let stream_id = random_id();
        let tracks = self
            .devices
            .capture_user_media(MediaConstraints::new(video, audio), &stream_id)
            .await
            .map_err(|e| {
                error!("Error getting local stream: {}", e);
                e
            })?;
        debug!(
            "Acquired camera stream {} ({} tracks, video={}, audio={})",
            stream_id,
            tracks.len(),
            video,
            audio
        );
        Ok(LocalMediaStream::new(stream_id, tracks))
    }

    /// Screen or window capture, optionally with system audio
    pub async fn acquire_screen(&self, with_audio: bool) -> Result<LocalMediaStream> {
        let stream_id = random_id();
        let tracks = self
            .devices
            .capture_display_media(with_audio, &stream_id)
            .await
            .map_err(|e| {
                error!("Error getting screen stream: {}", e);
                e
            })?;
        debug!("Acquired screen stream {} ({} tracks)", stream_id, tracks.len());
        Ok(LocalMediaStream::new(stream_id, tracks))
    }

    /// Stop every track of `stream`; safe to call repeatedly
    pub fn release(&self, stream: &LocalMediaStream) -> usize {
        let stopped = stream.stop_all();
        if stopped > 0 {
            info!("Released stream {} ({} tracks stopped)", stream.id(), stopped);
        }
        stopped
    }

    /// Make `stream` the one attached to new connections.
    /// The previous stream is returned, not released.
    pub fn install(&self, stream: LocalMediaStream) -> Option<LocalMediaStream> {
        self.current.lock().replace(stream)
    }

    pub fn current(&self) -> Option<LocalMediaStream> {
        self.current.lock().clone()
    }

    pub fn has_local_stream(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Release and forget the current stream
    pub fn release_current(&self) -> bool {
        let stream = self.current.lock().take();
        match stream {
            Some(stream) => {
                self.release(&stream);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::testing::FakeDevices;

    #[tokio::test]
    async fn test_acquire_does_not_install() {
        let media = MediaAcquisition::new(Arc::new(FakeDevices::default()));
        let stream = media.acquire_camera(true, true).await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert!(!media.has_local_stream());
    }

    #[tokio::test]
    async fn test_install_keeps_previous_alive() {
        let media = MediaAcquisition::new(Arc::new(FakeDevices::default()));
        let first = media.acquire_camera(true, true).await.unwrap();
        let second = media.acquire_camera(true, false).await.unwrap();
        media.install(first.clone());
        let previous = media.install(second).unwrap();
        assert_eq!(previous.id(), first.id());
        assert!(!first.video_track().unwrap().is_stopped());
        assert_eq!(media.release(&previous), 2);
    }

    #[tokio::test]
    async fn test_release_current_stops_tracks() {
        let media = MediaAcquisition::new(Arc::new(FakeDevices::default()));
        let stream = media.acquire_camera(true, true).await.unwrap();
        media.install(stream.clone());
        assert!(media.release_current());
        assert!(!media.release_current());
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| t.is_stopped()));
        assert!(!media.has_local_stream());
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let devices = Arc::new(FakeDevices::default());
        devices.deny(true);
        let media = MediaAcquisition::new(devices);
        assert!(media.acquire_camera(true, true).await.is_err());
        assert!(media.acquire_screen(false).await.is_err());
    }
}
