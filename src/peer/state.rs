use std::sync::Arc;
use std::time::Instant;

use super::ice::{CandidateQueue, CandidateStats};
use super::link::PeerLink;
use super::types::{ParticipantId, PeerState, RemoteMediaStream};

/// Стадия обмена offer/answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Соединение создано, описаний ещё нет
    New,
    /// Offer создаётся; второй offer на этом соединении уже не начнётся
    Offering,
    /// Мы отправили offer и ждём answer
    HaveLocalOffer,
    /// Применён чужой offer, answer ещё не готов
    HaveRemoteOffer,
    /// Обмен завершён
    Stable,
}

/// Запись реестра: одно соединение на участника
pub struct PeerEntry {
    pub participant: ParticipantId,
    pub generation: u64,
    pub link: Arc<dyn PeerLink>,
    pub negotiation: NegotiationState,
    pub connection: PeerState,
    /// Remote description применён; до этого кандидаты копятся в `pending`
    pub remote_description_set: bool,
    pub pending: CandidateQueue,
    pub remote_stream: Option<RemoteMediaStream>,
    pub local_candidates: CandidateStats,
    pub created_at: Instant,
}

impl PeerEntry {
    pub(super) fn new(
        participant: ParticipantId,
        generation: u64,
        link: Arc<dyn PeerLink>,
        pending: CandidateQueue,
    ) -> Self {
        Self {
            participant,
            generation,
            link,
            negotiation: NegotiationState::New,
            connection: PeerState::New,
            remote_description_set: false,
            pending,
            remote_stream: None,
            local_candidates: CandidateStats::default(),
            created_at: Instant::now(),
        }
    }

    /// Snapshot for callers outside the registry
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            participant: self.participant.clone(),
            generation: self.generation,
            negotiation: self.negotiation,
            connection: self.connection,
            pending_candidates: self.pending.len(),
            has_remote_stream: self.remote_stream.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub participant: ParticipantId,
    pub generation: u64,
    pub negotiation: NegotiationState,
    pub connection: PeerState,
    pub pending_candidates: usize,
    pub has_remote_stream: bool,
}
