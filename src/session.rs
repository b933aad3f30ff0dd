use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::MediaConfig;
use crate::peer::types::{ChatId, IceCandidate, ParticipantId};

/// Состояние звонка
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Захват медиа, мы звоним
    Initiating,
    /// Захват медиа, мы отвечаем
    Answering,
    Active,
    /// Идёт завершение, дальше только Idle
    Ending,
}

impl CallState {
    /// Call work is allowed to complete in this state
    pub fn is_live(&self) -> bool {
        matches!(self, CallState::Initiating | CallState::Answering | CallState::Active)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMediaEnabled {
    pub video: bool,
    pub audio: bool,
}

impl From<&MediaConfig> for LocalMediaEnabled {
    fn from(config: &MediaConfig) -> Self {
        Self {
            video: config.video,
            audio: config.audio,
        }
    }
}

/// Единственная сессия звонка на клиент
#[derive(Debug)]
pub struct CallSession {
    pub state: CallState,
    pub chat_id: Option<ChatId>,
    pub initiator: bool,
    pub local_media: LocalMediaEnabled,
    pub screen_sharing: bool,
    pub started_at: Option<DateTime<Local>>,
    /// Bumped on every start and every teardown; suspended work compares it
    pub epoch: u64,
    pub swap_in_flight: bool,
    /// Participants that already got our offer or answer
    pub announced: HashSet<ParticipantId>,
    /// Local candidates waiting for the offer/answer to go out first
    pub held_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
    defaults: LocalMediaEnabled,
}

impl CallSession {
    pub fn new(defaults: LocalMediaEnabled) -> Self {
        Self {
            state: CallState::Idle,
            chat_id: None,
            initiator: false,
            local_media: defaults,
            screen_sharing: false,
            started_at: None,
            epoch: 0,
            swap_in_flight: false,
            announced: HashSet::new(),
            held_candidates: HashMap::new(),
            defaults,
        }
    }

    /// Leave `Idle` for `state`; returns the epoch of the new call
    pub fn begin(&mut self, state: CallState, chat_id: ChatId, initiator: bool) -> u64 {
        self.epoch += 1;
        self.state = state;
        self.chat_id = Some(chat_id);
        self.initiator = initiator;
        self.epoch
    }

    pub fn activate(&mut self) {
        self.state = CallState::Active;
        self.started_at = Some(Local::now());
    }

    /// The call started at `epoch` is still running
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state.is_live()
    }

    pub fn in_chat(&self, chat_id: &ChatId) -> bool {
        self.state.is_live() && self.chat_id.as_ref() == Some(chat_id)
    }

    /// All fields back to defaults at once
    pub fn reset(&mut self) {
        let epoch = self.epoch + 1;
        *self = Self::new(self.defaults);
        self.epoch = epoch;
    }

    pub fn snapshot(&self, participants: Vec<ParticipantId>) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            chat_id: self.chat_id.clone(),
            initiator: self.initiator,
            local_media: self.local_media,
            screen_sharing: self.screen_sharing,
            started_at: self.started_at,
            participants,
        }
    }
}

/// Copy of the session for display
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub chat_id: Option<ChatId>,
    pub initiator: bool,
    pub local_media: LocalMediaEnabled,
    pub screen_sharing: bool,
    pub started_at: Option<DateTime<Local>>,
    pub participants: Vec<ParticipantId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(LocalMediaEnabled {
            video: true,
            audio: true,
        })
    }

    #[test]
    fn test_reset_clears_everything_and_bumps_epoch() {
        let mut s = session();
        let epoch = s.begin(CallState::Initiating, ChatId::new("c1"), true);
        s.activate();
        s.screen_sharing = true;
        s.local_media.audio = false;
        s.announced.insert(ParticipantId::new("b"));
        s.held_candidates
            .entry(ParticipantId::new("c"))
            .or_default()
            .push(IceCandidate::new("candidate:1"));

        s.reset();
        assert_eq!(s.state, CallState::Idle);
        assert!(s.chat_id.is_none() && s.started_at.is_none());
        assert!(!s.screen_sharing && !s.initiator);
        assert!(s.local_media.audio);
        assert!(s.announced.is_empty() && s.held_candidates.is_empty());
        assert!(!s.is_current(epoch));
        assert!(s.epoch > epoch);
    }

    #[test]
    fn test_current_only_while_live() {
        let mut s = session();
        let epoch = s.begin(CallState::Answering, ChatId::new("c1"), false);
        assert!(s.is_current(epoch));
        assert!(s.in_chat(&ChatId::new("c1")));
        assert!(!s.in_chat(&ChatId::new("c2")));
        s.state = CallState::Ending;
        assert!(!s.is_current(epoch));
    }
}
