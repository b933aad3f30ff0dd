use crate::peer::types::{ChatId, ParticipantId, PeerState, RemoteMediaStream};
use crate::session::CallState;

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// `end_call` on this client
    Local,
    /// call_end from the server
    Remote(Option<ParticipantId>),
    /// Could not reach any participant
    Failed,
}

/// Presentation events, fanned out to every subscriber
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged { from: CallState, to: CallState },
    RemoteStreamAdded { participant: ParticipantId, stream: RemoteMediaStream },
    RemoteStreamRemoved { participant: ParticipantId },
    PeerConnected { participant: ParticipantId },
    /// The connection failed and was dropped; the call goes on
    PeerLost { participant: ParticipantId, state: PeerState },
    ScreenShareChanged { sharing: bool },
    CallEnded { chat_id: ChatId, reason: EndReason },
}
