//! Call Session Controller
//!
//! Top-level call state machine:
//!
//! ```text
//! Idle --start_call--> Initiating --media + offers--> Active
//! Idle --offer-------> Answering  --media + answer--> Active
//! Initiating | Answering | Active --end / call_end--> Ending --> Idle
//! ```
//!
//! Every call gets an epoch. Work that suspends (capture, negotiation,
//! screen-share swap) checks the epoch when it resumes; if the call ended in
//! the meantime the result is released and the operation returns
//! [`CallError::Cancelled`]. Nothing is cancelled forcibly.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EndReason};
use crate::media::{LocalMediaStream, LocalTrack, MediaAcquisition, TrackKind};
use crate::peer::link::PeerEvent;
use crate::peer::registry::{PeerRegistry, RegistryNotice};
use crate::peer::types::{ChatId, IceCandidate, ParticipantId, PeerState, SessionDescription};
use crate::session::{CallSession, CallSnapshot, CallState, LocalMediaEnabled};
use crate::signaling::{InboundSignal, RawSignal, SignalingAdapter};

const EVENT_CAPACITY: usize = 64;

/// Controller-internal events raised outside the signaling channel
#[derive(Debug)]
enum Control {
    /// The OS (not us) stopped the screen capture
    ScreenCaptureEnded { epoch: u64, track_id: String },
}

pub struct CallController {
    session: Mutex<CallSession>,
    media: Arc<MediaAcquisition>,
    registry: Arc<PeerRegistry>,
    signaling: SignalingAdapter,
    events: broadcast::Sender<CallEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
    peer_rx: AsyncMutex<mpsc::UnboundedReceiver<PeerEvent>>,
    control_rx: AsyncMutex<mpsc::UnboundedReceiver<Control>>,
}

impl CallController {
    pub fn new(
        config: &Config,
        registry: Arc<PeerRegistry>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        signaling: SignalingAdapter,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            session: Mutex::new(CallSession::new(LocalMediaEnabled::from(&config.media))),
            media: Arc::clone(registry.media()),
            registry,
            signaling,
            events,
            control_tx,
            peer_rx: AsyncMutex::new(peer_events),
            control_rx: AsyncMutex::new(control_rx),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.session.lock().state
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let participants = self.registry.participants();
        self.session.lock().snapshot(participants)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn media(&self) -> &Arc<MediaAcquisition> {
        &self.media
    }

    // =========================================================================
    // Call lifecycle
    // =========================================================================

    /// Call `participants` in `chat_id`: one offer per participant
    pub async fn start_call(&self, chat_id: ChatId, participants: Vec<ParticipantId>) -> Result<()> {
        let local = self.signaling.local_id();
        let mut targets: Vec<ParticipantId> = Vec::new();
        for participant in participants {
            if Some(&participant) != local.as_ref() && !targets.contains(&participant) {
                targets.push(participant);
            }
        }
        if targets.is_empty() {
            return Err(CallError::NoParticipants);
        }

        let (epoch, prefs) = {
            let mut session = self.session.lock();
            if session.state != CallState::Idle {
                return Err(CallError::InvalidState {
                    expected: "Idle",
                    actual: session.state,
                });
            }
            (session.begin(CallState::Initiating, chat_id.clone(), true), session.local_media)
        };
        self.emit_state(CallState::Idle, CallState::Initiating);
        info!("Starting call in chat {} with {} participants", chat_id, targets.len());

        self.acquire_local_media(epoch, prefs).await?;

        let mut reached = 0;
        let mut last_error = None;
        for target in &targets {
            match self.offer_to(epoch, &chat_id, target).await {
                Ok(()) => reached += 1,
                Err(CallError::Cancelled) => return Err(CallError::Cancelled),
                Err(e) => {
                    warn!("Could not call {}: {}", target, e);
                    last_error = Some(e);
                }
            }
        }

        if !self.is_current(epoch) {
            return Err(CallError::Cancelled);
        }
        if reached == 0 {
            self.teardown(EndReason::Failed).await;
            return Err(last_error.unwrap_or(CallError::NoParticipants));
        }
        self.activate(epoch);
        Ok(())
    }

    /// Answer an offer while idle
    pub async fn answer_call(
        &self,
        chat_id: ChatId,
        caller_id: ParticipantId,
        offer: SessionDescription,
    ) -> Result<()> {
        let (epoch, prefs) = {
            let mut session = self.session.lock();
            if session.state != CallState::Idle {
                return Err(CallError::InvalidState {
                    expected: "Idle",
                    actual: session.state,
                });
            }
            (session.begin(CallState::Answering, chat_id.clone(), false), session.local_media)
        };
        self.emit_state(CallState::Idle, CallState::Answering);
        info!("Answering call from {} in chat {}", caller_id, chat_id);

        self.acquire_local_media(epoch, prefs).await?;

        let answer = match self.registry.accept_offer(&caller_id, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if !self.is_current(epoch) {
                    return Err(CallError::Cancelled);
                }
                self.teardown(EndReason::Failed).await;
                return Err(e);
            }
        };
        if !self.is_current(epoch) {
            return Err(CallError::Cancelled);
        }
        if let Err(e) = self.signaling.send_answer(&chat_id, &caller_id, answer).await {
            self.teardown(EndReason::Failed).await;
            return Err(e);
        }
        self.announce(epoch, &caller_id).await;
        self.activate(epoch);
        Ok(())
    }

    /// End the call; a no-op when idle
    pub async fn end_call(&self) -> Result<()> {
        if !self.teardown(EndReason::Local).await {
            debug!("No call to end");
        }
        Ok(())
    }

    // =========================================================================
    // Media toggles
    // =========================================================================

    /// Flip the outgoing video; returns the new enabled flag
    pub fn toggle_video(&self) -> Result<bool> {
        self.toggle(TrackKind::Video)
    }

    /// Flip the microphone; returns the new enabled flag
    pub fn toggle_audio(&self) -> Result<bool> {
        self.toggle(TrackKind::Audio)
    }

    fn toggle(&self, kind: TrackKind) -> Result<bool> {
        let mut session = self.session.lock();
        if session.state != CallState::Active {
            return Err(CallError::InvalidState {
                expected: "Active",
                actual: session.state,
            });
        }
        let stream = self.media.current().ok_or(CallError::InvalidState {
            expected: "Active with local media",
            actual: session.state,
        })?;
        let tracks: Vec<&Arc<LocalTrack>> = stream.tracks_of(kind).collect();
        let flag = match kind {
            TrackKind::Video => &mut session.local_media.video,
            TrackKind::Audio => &mut session.local_media.audio,
        };
        let enabled = match tracks.first() {
            Some(track) => !track.is_enabled(),
            None => !*flag,
        };
        // треки общие для всех соединений
        for track in tracks {
            track.set_enabled(enabled);
        }
        *flag = enabled;
        info!("{:?} {}", kind, if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Swap camera and screen capture; returns whether the screen is now shared
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        let (epoch, sharing) = {
            let mut session = self.session.lock();
            if session.state != CallState::Active {
                return Err(CallError::InvalidState {
                    expected: "Active",
                    actual: session.state,
                });
            }
            if session.swap_in_flight {
                return Err(CallError::InvalidState {
                    expected: "no screen-share switch in progress",
                    actual: session.state,
                });
            }
            session.swap_in_flight = true;
            (session.epoch, session.screen_sharing)
        };

        let result = if sharing {
            self.stop_screen_share(epoch).await
        } else {
            self.start_screen_share(epoch).await
        };

        let mut session = self.session.lock();
        if session.epoch == epoch {
            session.swap_in_flight = false;
        }
        result.map(|()| !sharing)
    }

    async fn start_screen_share(&self, epoch: u64) -> Result<()> {
        let screen = self.media.acquire_screen(false).await?;
        if !self.is_current(epoch) {
            self.media.release(&screen);
            return Err(CallError::Cancelled);
        }
        let Some(video) = screen.video_track().cloned() else {
            self.media.release(&screen);
            return Err(CallError::MediaAccess("screen capture has no video track".into()));
        };

        self.swap_video(epoch, screen.id(), &video, true).await?;

        let track = Arc::clone(&video);
        let tx = self.control_tx.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = tx.send(Control::ScreenCaptureEnded {
                epoch,
                track_id: track.id().to_string(),
            });
        });
        info!("Screen sharing started");
        Ok(())
    }

    async fn stop_screen_share(&self, epoch: u64) -> Result<()> {
        let video_enabled = self.session.lock().local_media.video;
        let camera = match self.media.acquire_camera(true, false).await {
            Ok(camera) => camera,
            Err(e) => {
                self.drop_ended_screen(epoch);
                return Err(e);
            }
        };
        if !self.is_current(epoch) {
            self.media.release(&camera);
            return Err(CallError::Cancelled);
        }
        let Some(video) = camera.video_track().cloned() else {
            self.media.release(&camera);
            return Err(CallError::MediaAccess("camera capture has no video track".into()));
        };
        video.set_enabled(video_enabled);

        self.swap_video(epoch, camera.id(), &video, false).await?;
        info!("Screen sharing stopped, camera restored");
        Ok(())
    }

    /// Make `video` the outgoing video track, keeping the current audio
    async fn swap_video(&self, epoch: u64, stream_id: &str, video: &Arc<LocalTrack>, sharing: bool) -> Result<()> {
        let previous = self.media.current();
        let mut tracks = vec![Arc::clone(video)];
        if let Some(previous) = &previous {
            tracks.extend(previous.tracks_of(TrackKind::Audio).cloned());
        }
        self.media.install(LocalMediaStream::new(stream_id, tracks));
        self.session.lock().screen_sharing = sharing;

        let replaced = self.registry.replace_outgoing_video_track(video).await;
        debug!("Video track {} now sent on {} connections", video.id(), replaced);

        if let Some(previous) = previous {
            for track in previous.tracks_of(TrackKind::Video) {
                track.stop();
            }
        }
        if !self.is_current(epoch) {
            // звонок завершился во время замены: close_all уже всё освободил
            video.stop();
            return Err(CallError::Cancelled);
        }
        self.emit(CallEvent::ScreenShareChanged { sharing });
        Ok(())
    }

    /// Camera is unavailable after the OS ended the screen capture
    fn drop_ended_screen(&self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        let Some(current) = self.media.current() else {
            return;
        };
        if !current.video_track().map_or(false, |t| t.is_stopped()) {
            return;
        }
        let audio: Vec<_> = current.tracks_of(TrackKind::Audio).cloned().collect();
        self.media.install(LocalMediaStream::new(current.id(), audio));
        self.session.lock().screen_sharing = false;
        warn!("Screen capture ended and the camera is unavailable, sending audio only");
        self.emit(CallEvent::ScreenShareChanged { sharing: false });
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    /// Validate and apply one raw signaling event
    pub async fn handle_raw(&self, raw: RawSignal) -> Result<()> {
        let signal = self.signaling.decode(&raw)?;
        self.handle_signal(signal).await
    }

    pub async fn handle_signal(&self, signal: InboundSignal) -> Result<()> {
        match signal {
            InboundSignal::Offer {
                chat_id,
                caller_id,
                offer,
            } => {
                let (state, same_chat) = {
                    let session = self.session.lock();
                    (session.state, session.chat_id.as_ref() == Some(&chat_id))
                };
                match state {
                    CallState::Idle => self.answer_call(chat_id, caller_id, offer).await,
                    CallState::Active if same_chat => self.join_call(&chat_id, &caller_id, offer).await,
                    _ => {
                        info!(
                            "Busy ({:?}), ignoring offer from {} in chat {}",
                            state, caller_id, chat_id
                        );
                        Ok(())
                    }
                }
            }
            InboundSignal::Answer {
                chat_id,
                answerer_id,
                answer,
            } => {
                if !self.session.lock().in_chat(&chat_id) {
                    info!("Ignoring answer from {} for chat {}: no such call", answerer_id, chat_id);
                    return Ok(());
                }
                match self.registry.apply_answer(&answerer_id, answer).await {
                    Ok(_) => Ok(()),
                    Err(CallError::Superseded(p)) => Err(CallError::Superseded(p)),
                    Err(e) => {
                        self.peer_lost(&answerer_id, PeerState::Failed);
                        Err(e)
                    }
                }
            }
            InboundSignal::Candidate {
                chat_id,
                sender_id,
                candidate,
            } => {
                if !self.session.lock().in_chat(&chat_id) {
                    debug!("Ignoring candidate from {} for chat {}: no such call", sender_id, chat_id);
                    return Ok(());
                }
                self.registry.queue_or_apply_candidate(&sender_id, candidate).await;
                Ok(())
            }
            InboundSignal::CallEnd { chat_id, ended_by } => {
                if !self.session.lock().in_chat(&chat_id) {
                    info!("Ignoring call_end for chat {}: no such call", chat_id);
                    return Ok(());
                }
                info!(
                    "Call in chat {} ended by {}",
                    chat_id,
                    ended_by.as_ref().map_or("server".to_string(), |p| p.to_string())
                );
                self.teardown(EndReason::Remote(ended_by)).await;
                Ok(())
            }
            InboundSignal::ServerError { message } => {
                warn!("Server rejected a call event: {}", message);
                Ok(())
            }
        }
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let Some(notice) = self.registry.handle_event(event).await else {
            return;
        };
        match notice {
            RegistryNotice::LocalCandidate {
                participant,
                candidate,
            } => self.forward_candidate(participant, candidate).await,
            RegistryNotice::RemoteStream(stream) => {
                self.emit(CallEvent::RemoteStreamAdded {
                    participant: stream.participant_id.clone(),
                    stream,
                });
            }
            RegistryNotice::Connected(participant) => {
                self.emit(CallEvent::PeerConnected { participant });
            }
            RegistryNotice::Closed {
                participant,
                state,
                had_remote_stream,
            } => {
                if had_remote_stream {
                    self.emit(CallEvent::RemoteStreamRemoved {
                        participant: participant.clone(),
                    });
                }
                self.peer_lost(&participant, state);
            }
        }
    }

    async fn handle_control(&self, control: Control) {
        match control {
            Control::ScreenCaptureEnded { epoch, track_id } => {
                let sharing = {
                    let session = self.session.lock();
                    session.epoch == epoch
                        && session.state == CallState::Active
                        && session.screen_sharing
                        && !session.swap_in_flight
                };
                let is_current_track = self
                    .media
                    .current()
                    .and_then(|s| s.video_track().map(|t| t.id() == track_id))
                    .unwrap_or(false);
                if !sharing || !is_current_track {
                    debug!("Ignoring end of screen track {}", track_id);
                    return;
                }
                info!("Screen capture ended by the system, switching back to camera");
                if let Err(e) = self.toggle_screen_share().await {
                    warn!("Could not restore camera after screen capture ended: {}", e);
                }
            }
        }
    }

    /// Drive the controller until the signaling channel closes
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<RawSignal>) {
        let mut peer_rx = self.peer_rx.lock().await;
        let mut control_rx = self.control_rx.lock().await;
        loop {
            tokio::select! {
                raw = inbound.recv() => match raw {
                    Some(raw) => {
                        let event = raw.event.clone();
                        if let Err(e) = self.handle_raw(raw).await {
                            warn!("Failed to handle {}: {}", event, e);
                        }
                    }
                    None => {
                        info!("Signaling channel closed");
                        break;
                    }
                },
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                Some(control) = control_rx.recv() => self.handle_control(control).await,
            }
        }
        self.teardown(EndReason::Failed).await;
    }

    /// Apply every queued connection and control event without waiting for
    /// new ones. Returns how many were handled; does nothing while `run` owns
    /// the queues.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        loop {
            // даём отработать порождённым задачам (наблюдатель экрана, таймеры)
            tokio::task::yield_now().await;
            let mut progressed = false;
            loop {
                let event = match self.peer_rx.try_lock() {
                    Ok(mut rx) => rx.try_recv().ok(),
                    Err(_) => return handled,
                };
                let Some(event) = event else { break };
                self.handle_peer_event(event).await;
                handled += 1;
                progressed = true;
            }
            loop {
                let control = match self.control_rx.try_lock() {
                    Ok(mut rx) => rx.try_recv().ok(),
                    Err(_) => return handled,
                };
                let Some(control) = control else { break };
                self.handle_control(control).await;
                handled += 1;
                progressed = true;
            }
            if !progressed {
                return handled;
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn emit(&self, event: CallEvent) {
        // нет подписчиков: не ошибка
        let _ = self.events.send(event);
    }

    fn emit_state(&self, from: CallState, to: CallState) {
        debug!("Call state {:?} -> {:?}", from, to);
        self.emit(CallEvent::StateChanged { from, to });
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session.lock().is_current(epoch)
    }

    fn activate(&self, epoch: u64) {
        let from = {
            let mut session = self.session.lock();
            if !session.is_current(epoch) || session.state == CallState::Active {
                return;
            }
            let from = session.state;
            session.activate();
            from
        };
        self.emit_state(from, CallState::Active);
        info!("Call is active");
    }

    fn peer_lost(&self, participant: &ParticipantId, state: PeerState) {
        warn!("Lost connection to {} ({:?})", participant, state);
        self.emit(CallEvent::PeerLost {
            participant: participant.clone(),
            state,
        });
    }

    /// Capture and install the call's local stream, or fall back to `Idle`
    async fn acquire_local_media(&self, epoch: u64, prefs: LocalMediaEnabled) -> Result<()> {
        let stream = match self.media.acquire_camera(prefs.video, prefs.audio).await {
            Ok(stream) => stream,
            Err(e) => {
                self.abort(epoch).await;
                return Err(e);
            }
        };
        if !self.is_current(epoch) {
            info!("Call ended during media acquisition, releasing stream");
            self.media.release(&stream);
            return Err(CallError::Cancelled);
        }
        if let Some(previous) = self.media.install(stream) {
            self.media.release(&previous);
        }
        Ok(())
    }

    /// Back to `Idle` after a failed start; nothing was sent yet
    async fn abort(&self, epoch: u64) {
        let from = {
            let session = self.session.lock();
            if !session.is_current(epoch) {
                return;
            }
            session.state
        };
        // кандидаты-сироты, накопленные пока шёл захват
        self.registry.close_all().await;
        {
            let mut session = self.session.lock();
            if session.epoch != epoch {
                return;
            }
            session.reset();
        }
        self.emit_state(from, CallState::Idle);
    }

    async fn offer_to(&self, epoch: u64, chat_id: &ChatId, target: &ParticipantId) -> Result<()> {
        if !self.is_current(epoch) {
            return Err(CallError::Cancelled);
        }
        let offer = match self.registry.create_offer(target).await {
            Ok(offer) => offer,
            Err(_) if !self.is_current(epoch) => return Err(CallError::Cancelled),
            Err(e) => return Err(e),
        };
        if !self.is_current(epoch) {
            return Err(CallError::Cancelled);
        }
        if let Err(e) = self.signaling.send_offer(chat_id, Some(target), offer).await {
            self.registry.close(target).await;
            return Err(e);
        }
        self.announce(epoch, target).await;
        Ok(())
    }

    /// Offer from another member while the call in its chat is running
    async fn join_call(&self, chat_id: &ChatId, caller_id: &ParticipantId, offer: SessionDescription) -> Result<()> {
        let epoch = self.session.lock().epoch;
        info!("{} joins the call in chat {}", caller_id, chat_id);
        let answer = match self.registry.accept_offer(caller_id, offer).await {
            Ok(answer) => answer,
            Err(CallError::Superseded(p)) => return Err(CallError::Superseded(p)),
            Err(e) => {
                self.peer_lost(caller_id, PeerState::Failed);
                return Err(e);
            }
        };
        if !self.is_current(epoch) {
            return Err(CallError::Cancelled);
        }
        if let Err(e) = self.signaling.send_answer(chat_id, caller_id, answer).await {
            self.registry.close(caller_id).await;
            return Err(e);
        }
        self.announce(epoch, caller_id).await;
        Ok(())
    }

    /// Our description reached `participant`; candidates may follow now
    async fn announce(&self, epoch: u64, participant: &ParticipantId) {
        let (chat_id, held) = {
            let mut session = self.session.lock();
            if !session.is_current(epoch) {
                return;
            }
            session.announced.insert(participant.clone());
            let held = session.held_candidates.remove(participant).unwrap_or_default();
            match session.chat_id.clone() {
                Some(chat_id) => (chat_id, held),
                None => return,
            }
        };
        for candidate in held {
            if let Err(e) = self.signaling.send_candidate(&chat_id, participant, candidate).await {
                debug!("Candidate for {} not sent: {}", participant, e);
            }
        }
    }

    async fn forward_candidate(&self, participant: ParticipantId, candidate: IceCandidate) {
        let chat_id = {
            let mut session = self.session.lock();
            if !session.state.is_live() {
                return;
            }
            if !session.announced.contains(&participant) {
                session
                    .held_candidates
                    .entry(participant)
                    .or_default()
                    .push(candidate);
                return;
            }
            match session.chat_id.clone() {
                Some(chat_id) => chat_id,
                None => return,
            }
        };
        if let Err(e) = self.signaling.send_candidate(&chat_id, &participant, candidate).await {
            debug!("Candidate for {} not sent: {}", participant, e);
        }
    }

    /// Close everything and return to `Idle`. Returns `false` if there was
    /// no call (or another teardown is already running).
    async fn teardown(&self, reason: EndReason) -> bool {
        let (from, chat_id) = {
            let mut session = self.session.lock();
            if !session.state.is_live() {
                return false;
            }
            let from = session.state;
            session.state = CallState::Ending;
            (from, session.chat_id.clone())
        };
        self.emit_state(from, CallState::Ending);

        let streams: Vec<ParticipantId> = self
            .registry
            .remote_streams()
            .into_iter()
            .map(|s| s.participant_id)
            .collect();
        let closed = self.registry.close_all().await;
        for participant in streams {
            self.emit(CallEvent::RemoteStreamRemoved { participant });
        }

        if reason == EndReason::Local {
            if let Some(chat_id) = &chat_id {
                if let Err(e) = self.signaling.send_call_end(chat_id).await {
                    warn!("call_end not delivered: {}", e);
                }
            }
        }

        self.session.lock().reset();
        self.emit_state(CallState::Ending, CallState::Idle);
        info!("Call ended ({:?}), {} connections closed", reason, closed);
        if let Some(chat_id) = chat_id {
            self.emit(CallEvent::CallEnded { chat_id, reason });
        }
        true
    }
}
