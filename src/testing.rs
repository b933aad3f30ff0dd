//! In-memory devices, connections and signaling transport for tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::{CallError, Result};
use crate::media::{LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use crate::peer::link::{PeerEventSink, PeerFactory, PeerLink, RtcSettings};
use crate::peer::types::{IceCandidate, ParticipantId, SessionDescription};
use crate::signaling::{RawSignal, SignalingTransport};

/// Closed gate that suspended calls wait on until it is released
#[derive(Default)]
struct Gate(Mutex<Option<Arc<Semaphore>>>);

impl Gate {
    fn hold(&self) {
        *self.0.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    fn release(&self) {
        if let Some(gate) = self.0.lock().take() {
            gate.close();
        }
    }

    async fn pass(&self) {
        let gate = self.0.lock().clone();
        if let Some(gate) = gate {
            // закрытый семафор отпускает всех ожидающих
            let _ = gate.acquire().await;
        }
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Capture devices that always exist unless told otherwise
#[derive(Default)]
pub struct FakeDevices {
    denied: AtomicBool,
    screen_denied: AtomicBool,
    gate: Gate,
    captured: Mutex<Vec<Arc<LocalTrack>>>,
}

impl FakeDevices {
    /// Deny every capture request, as a refused permission prompt would
    pub fn deny(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn deny_screen(&self, denied: bool) {
        self.screen_denied.store(denied, Ordering::SeqCst);
    }

    /// Suspend captures until [`FakeDevices::release`]
    pub fn hold(&self) {
        self.gate.hold();
    }

    pub fn release(&self) {
        self.gate.release();
    }

    /// Every track ever handed out
    pub fn captured(&self) -> Vec<Arc<LocalTrack>> {
        self.captured.lock().clone()
    }

    /// Tracks still capturing
    pub fn live_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.captured.lock().iter().filter(|t| !t.is_stopped()).cloned().collect()
    }

    fn open(&self, kind: TrackKind, label: &str, stream_id: &str) -> Arc<LocalTrack> {
        let track = LocalTrack::new(kind, label, stream_id);
        self.captured.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn capture_user_media(
        &self,
        constraints: MediaConstraints,
        stream_id: &str,
    ) -> Result<Vec<Arc<LocalTrack>>> {
        self.gate.pass().await;
        if self.denied.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccess("NotAllowedError: Permission denied".into()));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.open(TrackKind::Audio, "microphone", stream_id));
        }
        if constraints.video {
            tracks.push(self.open(TrackKind::Video, "camera", stream_id));
        }
        Ok(tracks)
    }

    async fn capture_display_media(
        &self,
        with_audio: bool,
        stream_id: &str,
    ) -> Result<Vec<Arc<LocalTrack>>> {
        self.gate.pass().await;
        if self.denied.load(Ordering::SeqCst) || self.screen_denied.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccess("NotAllowedError: screen capture denied".into()));
        }
        let mut tracks = vec![self.open(TrackKind::Video, "screen", stream_id)];
        if with_audio {
            tracks.push(self.open(TrackKind::Audio, "system-audio", stream_id));
        }
        Ok(tracks)
    }
}

// =============================================================================
// Connections
// =============================================================================

#[derive(Default)]
struct LinkState {
    tracks: Vec<(String, TrackKind)>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_sets: usize,
    candidates: Vec<IceCandidate>,
    video_track: Option<String>,
    closed: bool,
}

/// Connection that records what the registry asked of it
pub struct FakeLink {
    label: String,
    reject_remote: bool,
    offer_gate: Arc<Gate>,
    remote_gate: Arc<Gate>,
    offers_in_flight: AtomicUsize,
    max_offers_in_flight: AtomicUsize,
    state: Mutex<LinkState>,
}

impl FakeLink {
    fn new(label: String, reject_remote: bool, offer_gate: Arc<Gate>, remote_gate: Arc<Gate>) -> Self {
        Self {
            label,
            reject_remote,
            offer_gate,
            remote_gate,
            offers_in_flight: AtomicUsize::new(0),
            max_offers_in_flight: AtomicUsize::new(0),
            state: Mutex::new(LinkState::default()),
        }
    }

    /// Most `create_offer` calls that were running at once on this link
    pub fn max_offers_in_flight(&self) -> usize {
        self.max_offers_in_flight.load(Ordering::SeqCst)
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.state.lock().tracks.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Id of the track the video sender currently carries
    pub fn video_track_id(&self) -> Option<String> {
        self.state.lock().video_track.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn remote_sets(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(CallError::InvalidMessage(format!("{} is closed", self.label)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        if track.kind() == TrackKind::Video && state.video_track.is_none() {
            state.video_track = Some(track.id().to_string());
        }
        state.tracks.push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        let running = self.offers_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_offers_in_flight.fetch_max(running, Ordering::SeqCst);
        self.offer_gate.pass().await;
        self.offers_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.check_open()?;
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        if self.state.lock().remote.is_none() {
            return Err(CallError::InvalidMessage("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        self.state.lock().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        self.remote_gate.pass().await;
        self.check_open()?;
        if self.reject_remote {
            return Err(CallError::InvalidMessage("malformed session description".into()));
        }
        let mut state = self.state.lock();
        state.remote = Some(desc);
        state.remote_sets += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        // как и настоящий стек: без remote description кандидат не принимается
        if state.remote.is_none() {
            return Err(CallError::InvalidMessage("remote description is not set".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &Arc<LocalTrack>) -> Result<bool> {
        self.check_open()?;
        let mut state = self.state.lock();
        if state.video_track.is_none() {
            return Ok(false);
        }
        state.video_track = Some(track.id().to_string());
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

struct CreatedLink {
    participant: ParticipantId,
    link: Arc<FakeLink>,
    sink: PeerEventSink,
}

/// Factory that keeps every link and event sink it hands out
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<CreatedLink>>,
    reject_remote: Mutex<HashSet<ParticipantId>>,
    gate: Gate,
    offer_gate: Arc<Gate>,
    remote_gate: Arc<Gate>,
}

impl FakePeerFactory {
    /// Links created for `participant` from now on refuse remote descriptions
    pub fn reject_remote_descriptions_from(&self, participant: &ParticipantId) {
        self.reject_remote.lock().insert(participant.clone());
    }

    /// Suspend `create` until [`FakePeerFactory::release`]
    pub fn hold(&self) {
        self.gate.hold();
    }

    pub fn release(&self) {
        self.gate.release();
    }

    /// Suspend `create_offer` on every link until [`FakePeerFactory::release_offers`]
    pub fn hold_offers(&self) {
        self.offer_gate.hold();
    }

    pub fn release_offers(&self) {
        self.offer_gate.release();
    }

    /// Suspend `set_remote_description` on every link until released
    pub fn hold_remote_descriptions(&self) {
        self.remote_gate.hold();
    }

    pub fn release_remote_descriptions(&self) {
        self.remote_gate.release();
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn links_for(&self, participant: &ParticipantId) -> Vec<Arc<FakeLink>> {
        self.created
            .lock()
            .iter()
            .filter(|c| &c.participant == participant)
            .map(|c| c.link.clone())
            .collect()
    }

    pub fn last_link(&self, participant: &ParticipantId) -> Option<Arc<FakeLink>> {
        self.links_for(participant).pop()
    }

    /// Event sink of the newest link, to raise connection callbacks by hand
    pub fn last_sink(&self, participant: &ParticipantId) -> Option<PeerEventSink> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|c| &c.participant == participant)
            .map(|c| c.sink.clone())
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, _settings: &RtcSettings, events: PeerEventSink) -> Result<Arc<dyn PeerLink>> {
        self.gate.pass().await;
        let participant = events.participant().clone();
        let reject = self.reject_remote.lock().contains(&participant);
        let link = Arc::new(FakeLink::new(
            format!("{}#{}", participant, events.generation()),
            reject,
            self.offer_gate.clone(),
            self.remote_gate.clone(),
        ));
        self.created.lock().push(CreatedLink {
            participant,
            link: link.clone(),
            sink: events,
        });
        Ok(link)
    }
}

// =============================================================================
// Signaling
// =============================================================================

/// Transport that keeps everything it is asked to emit
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<RawSignal>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<RawSignal> {
        self.sent.lock().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.event.clone()).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.sent.lock().iter().filter(|s| s.event == event).count()
    }

    pub fn last(&self, event: &str) -> Option<Value> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|s| s.event == event)
            .map(|s| s.payload.clone())
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CallError::SignalingDelivery("socket is disconnected".into()));
        }
        self.sent.lock().push(RawSignal::new(event, payload));
        Ok(())
    }
}
