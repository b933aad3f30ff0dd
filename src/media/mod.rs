//! Local media: tracks, streams and the acquisition unit
//!
//! A [`LocalTrack`] wraps a webrtc `TrackLocalStaticSample` together with the
//! `enabled` flag the UI toggles and an "ended" signal raised either by
//! [`LocalTrack::stop`] or by the capture device when the OS stops capture.

pub mod acquisition;
pub mod devices;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::Result;
use crate::utils::random_id;

pub use acquisition::MediaAcquisition;
pub use devices::{MediaDevices, StaticSampleDevices};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

/// Track selection for a capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub fn new(video: bool, audio: bool) -> Self {
        Self { video, audio }
    }
}

/// A single captured audio or video track
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>, stream_id: &str) -> Arc<Self> {
        let id = random_id();
        let rtc = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            stream_id.to_string(),
        ));
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id,
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended,
            rtc,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Device label, e.g. "camera" or "screen"
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Stop capture. Returns `false` if the track was already stopped.
    pub fn stop(&self) -> bool {
        !self.ended.send_replace(true)
    }

    pub fn is_stopped(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the track has been stopped, by us or by the device
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Forward a captured sample to every connection sending this track.
    /// Disabled tracks swallow samples; returns whether the sample was sent.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc.write_sample(sample).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The set of local tracks currently offered to peers
#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn video_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Stop every track; returns how many were still live
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let track = LocalTrack::new(TrackKind::Audio, "microphone", "s1");
        assert!(track.stop());
        assert!(!track.stop());
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = LocalTrack::new(TrackKind::Video, "screen", "s1");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        tokio::task::yield_now().await;
        track.stop();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_track_drops_samples() {
        let track = LocalTrack::new(TrackKind::Video, "camera", "s1");
        track.set_enabled(false);
        let sent = track.write_sample(&Sample::default()).await.unwrap();
        assert!(!sent);
    }

    #[test]
    fn test_stream_lookup_by_kind() {
        let stream = LocalMediaStream::new(
            "s1",
            vec![
                LocalTrack::new(TrackKind::Audio, "microphone", "s1"),
                LocalTrack::new(TrackKind::Video, "camera", "s1"),
            ],
        );
        assert_eq!(stream.video_track().unwrap().label(), "camera");
        assert_eq!(stream.audio_track().unwrap().label(), "microphone");
        assert_eq!(stream.stop_all(), 2);
        assert_eq!(stream.stop_all(), 0);
    }
}
