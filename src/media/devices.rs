use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{LocalTrack, MediaConstraints, TrackKind};
use crate::config::MediaConfig;
use crate::error::{CallError, Result};

/// Capture devices: camera, microphone and screen
///
/// `capture_*` opens the devices and returns live tracks; capture stops when
/// the returned tracks are stopped.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn capture_user_media(
        &self,
        constraints: MediaConstraints,
        stream_id: &str,
    ) -> Result<Vec<Arc<LocalTrack>>>;

    async fn capture_display_media(
        &self,
        with_audio: bool,
        stream_id: &str,
    ) -> Result<Vec<Arc<LocalTrack>>>;
}

/// Devices backed by sample-fed webrtc tracks
///
/// The capture pipeline pushes encoded frames through
/// [`LocalTrack::write_sample`]; this type only decides which devices exist.
#[derive(Debug, Clone)]
pub struct StaticSampleDevices {
    camera: bool,
    microphone: bool,
    screen: bool,
}

impl StaticSampleDevices {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            camera: config.camera_available,
            microphone: config.microphone_available,
            screen: config.screen_available,
        }
    }

    fn open(&self, kind: TrackKind, label: &str, stream_id: &str) -> Result<Arc<LocalTrack>> {
        let available = match label {
            "camera" => self.camera,
            "microphone" => self.microphone,
            _ => self.screen,
        };
        if !available {
            warn!("No {} device available", label);
            return Err(CallError::MediaAccess(format!("no {label} device")));
        }
        let track = LocalTrack::new(kind, label, stream_id);
        debug!("Opened {} track {}", label, track.id());
        Ok(track)
    }
}

#[async_trait]
impl MediaDevices for StaticSampleDevices {
    async fn capture_user_media(
        &self,
        constraints: MediaConstraints,
        stream_id: &str,
    ) -> Result<Vec<Arc<LocalTrack>>> {
        if !constraints.video && !constraints.audio {
            return Err(CallError::MediaAccess(
                "at least one of audio or video must be requested".into(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.open(TrackKind::Audio, "microphone", stream_id)?);
        }
        if constraints.video {
            match self.open(TrackKind::Video, "camera", stream_id) {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    // всё уже открытое закрываем
                    tracks.iter().for_each(|t| {
                        t.stop();
                    });
                    return Err(e);
                }
            }
        }
        Ok(tracks)
    }

    async fn capture_display_media(
        &self,
        with_audio: bool,
        stream_id: &str,
    ) -> Result<Vec<Arc<LocalTrack>>> {
        let video = self.open(TrackKind::Video, "screen", stream_id)?;
        let mut tracks = vec![video];
        if with_audio {
            tracks.push(self.open(TrackKind::Audio, "system-audio", stream_id)?);
        }
        Ok(tracks)
    }
}
