//! Connection seam between the registry and the WebRTC stack
//!
//! The registry only talks to [`PeerLink`]s made by a [`PeerFactory`].
//! Connection callbacks never touch registry state directly: they push a
//! [`PeerEvent`] into one channel, and the owner of the receiver applies it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{IceCandidate, ParticipantId, PeerState, RemoteTrack, ServerConfig, SessionDescription};
use crate::config::Config;
use crate::error::Result;
use crate::media::LocalTrack;

/// Settings every new connection is created with
#[derive(Debug, Clone)]
pub struct RtcSettings {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
}

impl From<&Config> for RtcSettings {
    fn from(config: &Config) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }
}

/// One peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swap the outgoing video track without renegotiation.
    /// Returns `false` if the connection has no video sender.
    async fn replace_video_track(&self, track: &Arc<LocalTrack>) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// Creates connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, settings: &RtcSettings, events: PeerEventSink) -> Result<Arc<dyn PeerLink>>;
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    RemoteTrack(RemoteTrack),
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(PeerState),
    /// Disconnect grace period elapsed
    GraceExpired,
}

/// Event raised by a connection callback
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub participant: ParticipantId,
    /// Connection this event came from; stale generations are ignored
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Sender half handed to one connection's callbacks
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    participant: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub(crate) fn new(
        participant: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            participant,
            generation,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&self, kind: PeerEventKind) {
        // получатель закрыт только при остановке клиента
        let _ = self.tx.send(PeerEvent {
            participant: self.participant.clone(),
            generation: self.generation,
            kind,
        });
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.send(PeerEventKind::RemoteTrack(track));
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.send(PeerEventKind::LocalCandidate(candidate));
    }

    pub fn gathering_complete(&self) {
        self.send(PeerEventKind::GatheringComplete);
    }

    pub fn state_changed(&self, state: PeerState) {
        self.send(PeerEventKind::StateChanged(state));
    }

    pub fn grace_expired(&self) {
        self.send(PeerEventKind::GraceExpired);
    }
}
