//! Peer Connection Registry
//!
//! One connection per remote participant, keyed by participant id. The
//! registry creates connections with the fixed ICE configuration, attaches the
//! current local tracks, routes remote tracks and candidates, and tears
//! connections down.
//!
//! # Ordering
//!
//! Every connection carries a `generation`. Work that suspends (creating the
//! connection, applying descriptions) re-checks the generation when it
//! resumes; if the entry was replaced or closed meanwhile the result is
//! discarded with [`CallError::Superseded`]. Callback events carry the same
//! generation, so a closed connection can never mutate its successor.
//!
//! Remote candidates that arrive before the remote description is applied are
//! queued on the entry and flushed right after it is. Candidates that arrive
//! before the entry even exists are parked per participant and moved onto the
//! entry when it opens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::ice::CandidateQueue;
use super::link::{PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerLink, RtcSettings};
use super::state::{NegotiationState, PeerEntry, PeerInfo};
use super::types::{IceCandidate, ParticipantId, PeerState, RemoteMediaStream, SdpKind, SessionDescription};
use crate::config::Config;
use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::media::{LocalTrack, MediaAcquisition};

/// Handle to a freshly opened connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub participant: ParticipantId,
    pub generation: u64,
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    /// The connection refused it; logged and dropped
    Rejected,
}

/// Registry outcome the session controller has to act on
#[derive(Debug, Clone)]
pub enum RegistryNotice {
    /// Must be sent to the participant
    LocalCandidate {
        participant: ParticipantId,
        candidate: IceCandidate,
    },
    RemoteStream(RemoteMediaStream),
    Connected(ParticipantId),
    /// The registry dropped the connection on its own
    Closed {
        participant: ParticipantId,
        state: PeerState,
        had_remote_stream: bool,
    },
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ParticipantId, PeerEntry>,
    orphans: HashMap<ParticipantId, CandidateQueue>,
    next_generation: u64,
    /// Generations up to this one were opened before the last `close_all`
    cleared_through: u64,
}

enum StateAction {
    Nothing,
    Notify(RegistryNotice),
    Close(PeerState),
    StartGrace,
}

pub struct PeerRegistry {
    factory: Arc<dyn PeerFactory>,
    media: Arc<MediaAcquisition>,
    settings: RtcSettings,
    grace: Duration,
    queue_limit: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    /// Create the registry and the receiver its connection events arrive on
    pub fn new(
        config: &Config,
        factory: Arc<dyn PeerFactory>,
        media: Arc<MediaAcquisition>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            factory,
            media,
            settings: RtcSettings::from(config),
            grace: config.disconnect_grace(),
            queue_limit: config.max_pending_candidates,
            events,
            inner: Mutex::new(Inner::default()),
        };
        (registry, rx)
    }

    pub fn media(&self) -> &Arc<MediaAcquisition> {
        &self.media
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a connection for `participant`, closing any existing one first
    pub async fn open(&self, participant: &ParticipantId) -> Result<ConnectionHandle> {
        let (generation, previous) = {
            let mut inner = self.inner.lock();
            inner.next_generation += 1;
            (inner.next_generation, inner.entries.remove(participant))
        };
        if let Some(previous) = previous {
            info!(
                "Replacing connection to {} (generation {} -> {})",
                participant, previous.generation, generation
            );
            close_entry(previous).await;
        }

        let sink = PeerEventSink::new(participant.clone(), generation, self.events.clone());
        let link = self
            .factory
            .create(&self.settings, sink)
            .await
            .map_err(|e| CallError::negotiation(participant, e))?;

        if let Some(stream) = self.media.current() {
            for track in stream.tracks() {
                if let Err(e) = link.add_track(track).await {
                    warn!("Failed to attach track {} for {}: {}", track.id(), participant, e);
                }
            }
        }

        let (superseded, displaced) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let newer = inner
                .entries
                .get(participant)
                .map_or(false, |e| e.generation > generation);
            if newer || generation <= inner.cleared_through {
                (true, None)
            } else {
                let mut pending = CandidateQueue::new(self.queue_limit);
                if let Some(orphans) = inner.orphans.remove(participant) {
                    debug!(
                        "Moving {} early candidates onto connection {}",
                        orphans.len(),
                        participant
                    );
                    pending.absorb(participant, orphans);
                }
                let entry = PeerEntry::new(participant.clone(), generation, link.clone(), pending);
                (false, inner.entries.insert(participant.clone(), entry))
            }
        };

        if let Some(displaced) = displaced {
            close_entry(displaced).await;
        }
        if superseded {
            if let Err(e) = link.close().await {
                warn!("Error closing superseded connection to {}: {}", participant, e);
            }
            return Err(CallError::Superseded(participant.clone()));
        }

        info!("Opened connection to {} (generation {})", participant, generation);
        Ok(ConnectionHandle {
            participant: participant.clone(),
            generation,
        })
    }

    /// Close and forget the connection and its remote stream
    pub async fn close(&self, participant: &ParticipantId) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            inner.orphans.remove(participant);
            inner.entries.remove(participant)
        };
        match entry {
            Some(entry) => {
                close_entry(entry).await;
                true
            }
            None => false,
        }
    }

    /// Close every connection, then release local media
    pub async fn close_all(&self) -> usize {
        let entries: Vec<PeerEntry> = {
            let mut inner = self.inner.lock();
            inner.orphans.clear();
            inner.cleared_through = inner.next_generation;
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        let count = entries.len();
        for entry in entries {
            close_entry(entry).await;
        }
        self.media.release_current();
        info!("Closed all connections ({})", count);
        count
    }

    // =========================================================================
    // Negotiation
    // =========================================================================

    /// Local offer for `participant`; opens a connection unless a fresh one exists
    pub async fn create_offer(&self, participant: &ParticipantId) -> Result<SessionDescription> {
        let generation = match self.claim_fresh(participant) {
            Some(generation) => generation,
            None => {
                let generation = self.open(participant).await?.generation;
                self.update(participant, generation, |e| {
                    e.negotiation = NegotiationState::Offering;
                })?;
                generation
            }
        };
        let link = self.link_for(participant, generation)?;

        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(participant, generation, e).await),
        };
        if let Err(e) = link.set_local_description(offer.clone()).await {
            return Err(self.fail(participant, generation, e).await);
        }
        self.update(participant, generation, |e| {
            e.negotiation = NegotiationState::HaveLocalOffer;
        })?;
        debug!("Created offer for {}", participant);
        Ok(offer)
    }

    /// Apply a remote offer on a new connection and produce the answer
    pub async fn accept_offer(
        &self,
        participant: &ParticipantId,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            return Err(CallError::negotiation(participant, "expected an offer"));
        }
        let generation = self.open(participant).await?.generation;
        let link = self.link_for(participant, generation)?;

        if let Err(e) = link.set_remote_description(offer).await {
            return Err(self.fail(participant, generation, e).await);
        }
        let pending = self.mark_remote_set(participant, generation, NegotiationState::HaveRemoteOffer)?;
        self.apply_candidates(participant, &link, pending).await;

        let answer = match link.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(participant, generation, e).await),
        };
        if let Err(e) = link.set_local_description(answer.clone()).await {
            return Err(self.fail(participant, generation, e).await);
        }
        self.update(participant, generation, |e| {
            e.negotiation = NegotiationState::Stable;
        })?;
        debug!("Created answer for {}", participant);
        Ok(answer)
    }

    /// Apply the remote answer. `Ok(false)` when there is nothing waiting for
    /// it (the call was torn down, or the answer is a duplicate).
    pub async fn apply_answer(
        &self,
        participant: &ParticipantId,
        answer: SessionDescription,
    ) -> Result<bool> {
        if answer.kind != SdpKind::Answer {
            return Err(CallError::negotiation(participant, "expected an answer"));
        }
        let (link, generation) = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(participant) {
                None => {
                    info!("Ignoring answer from {}: no connection", participant);
                    return Ok(false);
                }
                Some(entry) if entry.negotiation != NegotiationState::HaveLocalOffer => {
                    warn!(
                        "Ignoring answer from {}: negotiation is {:?}",
                        participant, entry.negotiation
                    );
                    return Ok(false);
                }
                Some(entry) => {
                    // слот занимается сразу: дубликат answer сюда уже не попадёт
                    entry.negotiation = NegotiationState::Stable;
                    (entry.link.clone(), entry.generation)
                }
            }
        };

        if let Err(e) = link.set_remote_description(answer).await {
            return Err(self.fail(participant, generation, e).await);
        }
        let pending = self.mark_remote_set(participant, generation, NegotiationState::Stable)?;
        self.apply_candidates(participant, &link, pending).await;
        debug!("Applied answer from {}", participant);
        Ok(true)
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub async fn queue_or_apply_candidate(
        &self,
        participant: &ParticipantId,
        candidate: IceCandidate,
    ) -> CandidateDisposition {
        let link = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.entries.get_mut(participant) {
                None => {
                    debug!("No connection for {} yet, parking candidate", participant);
                    let limit = self.queue_limit;
                    inner
                        .orphans
                        .entry(participant.clone())
                        .or_insert_with(|| CandidateQueue::new(limit))
                        .push(participant, candidate);
                    return CandidateDisposition::Queued;
                }
                Some(entry) if !entry.remote_description_set => {
                    debug!("Remote description not set yet, queuing candidate");
                    entry.pending.push(participant, candidate);
                    return CandidateDisposition::Queued;
                }
                Some(entry) => entry.link.clone(),
            }
        };

        dump_candidate("REMOTE", participant, &candidate);
        match link.add_ice_candidate(candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(e) => {
                warn!("Failed to add ICE candidate from {}: {}", participant, e);
                CandidateDisposition::Rejected
            }
        }
    }

    /// Swap the outgoing video on every connection; returns how many switched
    pub async fn replace_outgoing_video_track(&self, track: &Arc<LocalTrack>) -> usize {
        let links: Vec<(ParticipantId, Arc<dyn PeerLink>)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .map(|e| (e.participant.clone(), e.link.clone()))
                .collect()
        };

        let mut replaced = 0;
        for (participant, link) in links {
            match link.replace_video_track(track).await {
                Ok(true) => replaced += 1,
                Ok(false) => debug!("Connection to {} has no video sender", participant),
                Err(e) => warn!("Failed to replace video track for {}: {}", participant, e),
            }
        }
        info!("Replaced outgoing video track on {} connections", replaced);
        replaced
    }

    // =========================================================================
    // Connection events
    // =========================================================================

    /// Apply one connection callback event
    pub async fn handle_event(&self, event: PeerEvent) -> Option<RegistryNotice> {
        let PeerEvent {
            participant,
            generation,
            kind,
        } = event;

        let action = {
            let mut inner = self.inner.lock();
            let entry = match inner.entries.get_mut(&participant) {
                Some(entry) if entry.generation == generation => entry,
                _ => {
                    debug!("Dropping stale event for {} (generation {})", participant, generation);
                    return None;
                }
            };

            match kind {
                PeerEventKind::LocalCandidate(candidate) => {
                    dump_candidate("LOCAL", &participant, &candidate);
                    entry.local_candidates.record(&candidate);
                    StateAction::Notify(RegistryNotice::LocalCandidate {
                        participant: participant.clone(),
                        candidate,
                    })
                }
                PeerEventKind::GatheringComplete => {
                    let stats = entry.local_candidates;
                    info!(
                        "ICE gathering for {} complete: {} host, {} srflx, {} relay",
                        participant, stats.host, stats.srflx, stats.relay
                    );
                    StateAction::Nothing
                }
                PeerEventKind::RemoteTrack(track) => {
                    info!(
                        "Remote {:?} track {} from {}",
                        track.kind, track.id, participant
                    );
                    let stream = entry.remote_stream.get_or_insert_with(|| RemoteMediaStream {
                        participant_id: participant.clone(),
                        stream_id: track.stream_id.clone(),
                        tracks: Vec::new(),
                    });
                    if !stream.tracks.iter().any(|t| t.id == track.id) {
                        stream.tracks.push(track);
                    }
                    StateAction::Notify(RegistryNotice::RemoteStream(stream.clone()))
                }
                PeerEventKind::StateChanged(state) => {
                    info!("Peer connection state for {}: {:?}", participant, state);
                    entry.connection = state;
                    match state {
                        PeerState::Connected => {
                            let stats = entry.local_candidates;
                            if stats.lacks_nat_traversal() {
                                warn!(
                                    "Connected to {} without srflx/relay candidates ({} host)",
                                    participant, stats.host
                                );
                            }
                            StateAction::Notify(RegistryNotice::Connected(participant.clone()))
                        }
                        PeerState::Failed | PeerState::Closed => StateAction::Close(state),
                        PeerState::Disconnected if self.grace.is_zero() => StateAction::Close(state),
                        PeerState::Disconnected => StateAction::StartGrace,
                        _ => StateAction::Nothing,
                    }
                }
                PeerEventKind::GraceExpired => {
                    if entry.connection == PeerState::Connected {
                        info!("Connection to {} recovered during grace period", participant);
                        StateAction::Nothing
                    } else {
                        StateAction::Close(entry.connection)
                    }
                }
            }
        };

        match action {
            StateAction::Nothing => None,
            StateAction::Notify(notice) => Some(notice),
            StateAction::StartGrace => {
                info!(
                    "Connection to {} disconnected, waiting {} ms",
                    participant,
                    self.grace.as_millis()
                );
                let sink = PeerEventSink::new(participant, generation, self.events.clone());
                let grace = self.grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    sink.grace_expired();
                });
                None
            }
            StateAction::Close(state) => {
                warn!("Dropping connection to {} ({:?})", participant, state);
                self.close_generation(&participant, generation)
                    .await
                    .map(|had_remote_stream| RegistryNotice::Closed {
                        participant,
                        state,
                        had_remote_stream,
                    })
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.inner.lock().entries.contains_key(participant)
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.inner.lock().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn peer_info(&self, participant: &ParticipantId) -> Option<PeerInfo> {
        self.inner.lock().entries.get(participant).map(PeerEntry::info)
    }

    pub fn connection_state(&self, participant: &ParticipantId) -> Option<PeerState> {
        self.inner.lock().entries.get(participant).map(|e| e.connection)
    }

    pub fn remote_stream(&self, participant: &ParticipantId) -> Option<RemoteMediaStream> {
        self.inner
            .lock()
            .entries
            .get(participant)
            .and_then(|e| e.remote_stream.clone())
    }

    pub fn remote_streams(&self) -> Vec<RemoteMediaStream> {
        self.inner
            .lock()
            .entries
            .values()
            .filter_map(|e| e.remote_stream.clone())
            .collect()
    }

    /// Candidates waiting for `participant`, whether or not a connection exists
    pub fn pending_candidates(&self, participant: &ParticipantId) -> usize {
        let inner = self.inner.lock();
        match inner.entries.get(participant) {
            Some(entry) => entry.pending.len(),
            None => inner.orphans.get(participant).map_or(0, |q| q.len()),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Take an unused connection for an offer. The state flips under the
    /// lock, so a concurrent offer opens a new connection instead.
    fn claim_fresh(&self, participant: &ParticipantId) -> Option<u64> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(participant)
            .filter(|e| e.negotiation == NegotiationState::New)?;
        entry.negotiation = NegotiationState::Offering;
        Some(entry.generation)
    }

    fn link_for(&self, participant: &ParticipantId, generation: u64) -> Result<Arc<dyn PeerLink>> {
        self.inner
            .lock()
            .entries
            .get(participant)
            .filter(|e| e.generation == generation)
            .map(|e| e.link.clone())
            .ok_or_else(|| CallError::Superseded(participant.clone()))
    }

    fn update(
        &self,
        participant: &ParticipantId,
        generation: u64,
        f: impl FnOnce(&mut PeerEntry),
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(participant) {
            Some(entry) if entry.generation == generation => {
                f(entry);
                Ok(())
            }
            _ => Err(CallError::Superseded(participant.clone())),
        }
    }

    /// Record the remote description and take the queued candidates
    fn mark_remote_set(
        &self,
        participant: &ParticipantId,
        generation: u64,
        negotiation: NegotiationState,
    ) -> Result<Vec<IceCandidate>> {
        let mut pending = Vec::new();
        self.update(participant, generation, |e| {
            e.remote_description_set = true;
            e.negotiation = negotiation;
            pending = e.pending.drain();
        })?;
        Ok(pending)
    }

    async fn apply_candidates(
        &self,
        participant: &ParticipantId,
        link: &Arc<dyn PeerLink>,
        candidates: Vec<IceCandidate>,
    ) {
        if candidates.is_empty() {
            return;
        }
        info!("Applying {} pending candidates for {}", candidates.len(), participant);
        for candidate in candidates {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!("Failed to apply pending candidate for {}: {}", participant, e);
            }
        }
    }

    /// Close the entry if it is still `generation`; `Some(had_remote_stream)` when closed
    async fn close_generation(&self, participant: &ParticipantId, generation: u64) -> Option<bool> {
        let entry = {
            let mut inner = self.inner.lock();
            match inner.entries.get(participant) {
                Some(e) if e.generation == generation => inner.entries.remove(participant),
                _ => None,
            }
        };
        let entry = entry?;
        let had_remote_stream = entry.remote_stream.is_some();
        close_entry(entry).await;
        Some(had_remote_stream)
    }

    /// Close the failed connection and turn the cause into a negotiation error
    async fn fail(&self, participant: &ParticipantId, generation: u64, cause: CallError) -> CallError {
        match cause {
            CallError::Superseded(_) => cause,
            other => match self.close_generation(participant, generation).await {
                Some(_) => {
                    warn!("Negotiation with {} failed: {}", participant, other);
                    CallError::negotiation(participant, other)
                }
                // соединение уже заменено: ошибка относится к старому
                None => {
                    debug!("Stale negotiation error for {}: {}", participant, other);
                    CallError::Superseded(participant.clone())
                }
            },
        }
    }
}

async fn close_entry(entry: PeerEntry) {
    if let Err(e) = entry.link.close().await {
        warn!("Error closing connection to {}: {}", entry.participant, e);
    }
    if entry.remote_stream.is_some() {
        debug!("Dropped remote stream of {}", entry.participant);
    }
    info!(
        "Closed connection to {} (generation {}, open for {:?})",
        entry.participant,
        entry.generation,
        entry.created_at.elapsed()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::peer::types::RemoteTrack;
    use crate::testing::{FakeDevices, FakePeerFactory};

    struct Fixture {
        registry: PeerRegistry,
        factory: Arc<FakePeerFactory>,
        media: Arc<MediaAcquisition>,
        rx: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn fixture_with(config: Config) -> Fixture {
        let factory = Arc::new(FakePeerFactory::default());
        let media = Arc::new(MediaAcquisition::new(Arc::new(FakeDevices::default())));
        let (registry, rx) = PeerRegistry::new(&config, factory.clone(), media.clone());
        Fixture {
            registry,
            factory,
            media,
            rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::default())
    }

    fn p(id: &str) -> ParticipantId {
        ParticipantId::new(id)
    }

    async fn drain(f: &mut Fixture) -> Vec<RegistryNotice> {
        let mut notices = Vec::new();
        while let Ok(event) = f.rx.try_recv() {
            if let Some(notice) = f.registry.handle_event(event).await {
                notices.push(notice);
            }
        }
        notices
    }

    #[tokio::test]
    async fn test_open_twice_keeps_single_entry() {
        let f = fixture();
        let first = f.registry.open(&p("b")).await.unwrap();
        let second = f.registry.open(&p("b")).await.unwrap();

        assert_eq!(f.registry.len(), 1);
        assert!(second.generation > first.generation);
        let links = f.factory.links_for(&p("b"));
        assert_eq!(links.len(), 2);
        assert!(links[0].is_closed());
        assert!(!links[1].is_closed());
    }

    #[tokio::test]
    async fn test_open_attaches_current_tracks() {
        let f = fixture();
        let stream = f.media.acquire_camera(true, true).await.unwrap();
        f.media.install(stream);
        f.registry.open(&p("b")).await.unwrap();
        assert_eq!(f.factory.last_link(&p("b")).unwrap().track_count(), 2);
    }

    #[tokio::test]
    async fn test_close_all_clears_everything() {
        let mut f = fixture();
        let stream = f.media.acquire_camera(true, true).await.unwrap();
        f.media.install(stream.clone());
        for id in ["b", "c", "d"] {
            f.registry.open(&p(id)).await.unwrap();
            f.factory.last_sink(&p(id)).unwrap().remote_track(RemoteTrack {
                id: format!("{id}-audio"),
                kind: TrackKind::Audio,
                stream_id: format!("{id}-stream"),
                source: None,
            });
        }
        drain(&mut f).await;
        assert_eq!(f.registry.remote_streams().len(), 3);

        assert_eq!(f.registry.close_all().await, 3);
        assert!(f.registry.is_empty());
        assert!(f.registry.remote_streams().is_empty());
        assert!(!f.media.has_local_stream());
        assert!(stream.tracks().iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_close_all_during_open_supersedes_it() {
        let f = fixture();
        f.factory.hold();
        let (opened, _) = tokio::join!(f.registry.open(&p("b")), async {
            f.registry.close_all().await;
            f.factory.release();
        });
        assert!(matches!(opened, Err(CallError::Superseded(_))));
        assert!(f.registry.is_empty());
        assert!(f.factory.last_link(&p("b")).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_overlapping_opens_leave_one_entry() {
        let f = fixture();
        f.factory.hold();
        let (first, second, _) = tokio::join!(f.registry.open(&p("b")), f.registry.open(&p("b")), async {
            f.factory.release();
        });

        assert_eq!(f.registry.len(), 1);
        let handles: Vec<_> = [first, second].into_iter().filter_map(|r| r.ok()).collect();
        assert!(!handles.is_empty());
        let live = f.registry.peer_info(&p("b")).unwrap().generation;
        assert_eq!(live, handles.iter().map(|h| h.generation).max().unwrap());

        let links = f.factory.links_for(&p("b"));
        assert_eq!(links.len(), 2);
        assert_eq!(links.iter().filter(|l| !l.is_closed()).count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_offers_never_share_a_connection() {
        let f = fixture();
        f.registry.open(&p("b")).await.unwrap();
        f.factory.hold_offers();
        let (first, second, _) = tokio::join!(
            f.registry.create_offer(&p("b")),
            f.registry.create_offer(&p("b")),
            async {
                f.factory.release_offers();
            }
        );

        assert!(matches!(first, Err(CallError::Superseded(_))));
        assert_eq!(second.unwrap().kind, SdpKind::Offer);
        assert_eq!(f.registry.len(), 1);

        let links = f.factory.links_for(&p("b"));
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.max_offers_in_flight() <= 1));
        assert!(links[0].is_closed() && links[0].local_description().is_none());
        assert!(!links[1].is_closed() && links[1].local_description().is_some());
        let info = f.registry.peer_info(&p("b")).unwrap();
        assert_eq!(info.negotiation, NegotiationState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let caller = fixture();
        let callee = fixture();

        let offer = caller.registry.create_offer(&p("b")).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        let answer = callee.registry.accept_offer(&p("a"), offer).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert!(caller.registry.apply_answer(&p("b"), answer).await.unwrap());

        let info = caller.registry.peer_info(&p("b")).unwrap();
        assert_eq!(info.negotiation, NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_create_offer_reuses_fresh_connection() {
        let f = fixture();
        let handle = f.registry.open(&p("b")).await.unwrap();
        f.registry.create_offer(&p("b")).await.unwrap();
        assert_eq!(f.registry.peer_info(&p("b")).unwrap().generation, handle.generation);

        // повторный offer пересоздаёт соединение
        f.registry.create_offer(&p("b")).await.unwrap();
        assert!(f.registry.peer_info(&p("b")).unwrap().generation > handle.generation);
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_connection_is_noop() {
        let f = fixture();
        let applied = f
            .registry
            .apply_answer(&p("b"), SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_ignored() {
        let f = fixture();
        f.registry.create_offer(&p("b")).await.unwrap();
        let answer = SessionDescription::answer("v=0 fake-answer");
        assert!(f.registry.apply_answer(&p("b"), answer.clone()).await.unwrap());
        assert!(!f.registry.apply_answer(&p("b"), answer).await.unwrap());
        assert_eq!(f.factory.last_link(&p("b")).unwrap().remote_sets(), 1);
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_flushed() {
        let f = fixture();
        f.registry.create_offer(&p("b")).await.unwrap();
        for i in 0..3 {
            let disposition = f
                .registry
                .queue_or_apply_candidate(&p("b"), IceCandidate::new(format!("cand-{i}")))
                .await;
            assert_eq!(disposition, CandidateDisposition::Queued);
        }
        let link = f.factory.last_link(&p("b")).unwrap();
        assert!(link.candidates().is_empty());
        assert_eq!(f.registry.pending_candidates(&p("b")), 3);

        f.registry
            .apply_answer(&p("b"), SessionDescription::answer("v=0 fake-answer"))
            .await
            .unwrap();
        assert_eq!(link.candidates().len(), 3);
        assert_eq!(f.registry.pending_candidates(&p("b")), 0);

        let disposition = f
            .registry
            .queue_or_apply_candidate(&p("b"), IceCandidate::new("cand-late"))
            .await;
        assert_eq!(disposition, CandidateDisposition::Applied);
        assert_eq!(link.candidates().len(), 4);
    }

    #[tokio::test]
    async fn test_candidates_before_connection_are_parked() {
        let f = fixture();
        for i in 0..3 {
            f.registry
                .queue_or_apply_candidate(&p("a"), IceCandidate::new(format!("early-{i}")))
                .await;
        }
        assert_eq!(f.registry.pending_candidates(&p("a")), 3);
        assert!(f.registry.is_empty());

        f.registry
            .accept_offer(&p("a"), SessionDescription::offer("v=0 fake-offer"))
            .await
            .unwrap();
        let applied: Vec<_> = f
            .factory
            .last_link(&p("a"))
            .unwrap()
            .candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["early-0", "early-1", "early-2"]);
    }

    #[tokio::test]
    async fn test_rejected_offer_closes_only_that_peer() {
        let f = fixture();
        f.registry.create_offer(&p("c")).await.unwrap();
        f.factory.reject_remote_descriptions_from(&p("b"));

        let err = f
            .registry
            .accept_offer(&p("b"), SessionDescription::offer("v=0 broken"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Negotiation { .. }));
        assert!(!f.registry.contains(&p("b")));
        assert!(f.registry.contains(&p("c")));
    }

    #[tokio::test]
    async fn test_failed_state_closes_single_connection() {
        let mut f = fixture();
        f.registry.open(&p("b")).await.unwrap();
        f.registry.open(&p("c")).await.unwrap();
        f.factory.last_sink(&p("b")).unwrap().state_changed(PeerState::Failed);

        let notices = drain(&mut f).await;
        assert!(matches!(
            notices.as_slice(),
            [RegistryNotice::Closed { state: PeerState::Failed, .. }]
        ));
        assert_eq!(f.registry.participants(), vec![p("c")]);
        assert!(f.factory.last_link(&p("b")).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_stale_generation_events_are_ignored() {
        let mut f = fixture();
        f.registry.open(&p("b")).await.unwrap();
        let old_sink = f.factory.last_sink(&p("b")).unwrap();
        f.registry.open(&p("b")).await.unwrap();

        old_sink.state_changed(PeerState::Failed);
        old_sink.local_candidate(IceCandidate::new("stale"));
        assert!(drain(&mut f).await.is_empty());
        assert!(f.registry.contains(&p("b")));
    }

    #[tokio::test]
    async fn test_disconnect_with_grace_recovers() {
        let mut config = Config::default();
        config.disconnect_grace_ms = 60_000;
        let mut f = fixture_with(config);
        f.registry.open(&p("b")).await.unwrap();
        let sink = f.factory.last_sink(&p("b")).unwrap();

        sink.state_changed(PeerState::Disconnected);
        assert!(drain(&mut f).await.is_empty());
        assert!(f.registry.contains(&p("b")));

        sink.state_changed(PeerState::Connected);
        sink.grace_expired();
        drain(&mut f).await;
        assert!(f.registry.contains(&p("b")));

        sink.state_changed(PeerState::Disconnected);
        sink.grace_expired();
        drain(&mut f).await;
        assert!(!f.registry.contains(&p("b")));
    }

    #[tokio::test]
    async fn test_remote_stream_removed_with_connection() {
        let mut f = fixture();
        f.registry.open(&p("b")).await.unwrap();
        let sink = f.factory.last_sink(&p("b")).unwrap();
        for (id, kind) in [("v", TrackKind::Video), ("a", TrackKind::Audio)] {
            sink.remote_track(RemoteTrack {
                id: id.into(),
                kind,
                stream_id: "remote".into(),
                source: None,
            });
        }
        drain(&mut f).await;
        let stream = f.registry.remote_stream(&p("b")).unwrap();
        assert!(stream.has_kind(TrackKind::Video) && stream.has_kind(TrackKind::Audio));

        assert!(f.registry.close(&p("b")).await);
        assert!(f.registry.remote_stream(&p("b")).is_none());
        assert!(!f.registry.close(&p("b")).await);
    }

    #[tokio::test]
    async fn test_local_candidates_are_forwarded() {
        let mut f = fixture();
        f.registry.open(&p("b")).await.unwrap();
        f.factory
            .last_sink(&p("b"))
            .unwrap()
            .local_candidate(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
        let notices = drain(&mut f).await;
        match notices.as_slice() {
            [RegistryNotice::LocalCandidate { participant, .. }] => assert_eq!(participant, &p("b")),
            other => panic!("unexpected notices: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replace_video_track_on_every_connection() {
        let f = fixture();
        let camera = f.media.acquire_camera(true, true).await.unwrap();
        f.media.install(camera);
        f.registry.open(&p("b")).await.unwrap();
        f.registry.open(&p("c")).await.unwrap();

        let screen = f.media.acquire_screen(false).await.unwrap();
        let track = screen.video_track().unwrap().clone();
        assert_eq!(f.registry.replace_outgoing_video_track(&track).await, 2);
        for id in ["b", "c"] {
            let link = f.factory.last_link(&p(id)).unwrap();
            assert_eq!(link.video_track_id().as_deref(), Some(track.id()));
        }
    }
}
