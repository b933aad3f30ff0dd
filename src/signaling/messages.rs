//! Signaling messages
//!
//! Closed set of call events exchanged with the chat server. Outbound
//! messages are what this client emits (`token` is attached on the way out);
//! inbound messages are what the server relays to us after resolving the
//! sender from the token. Inbound payloads are validated here, before any of
//! them reaches the registry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::auth::BearerToken;
use super::channel::RawSignal;
use crate::error::{CallError, Result};
use crate::peer::types::{ChatId, IceCandidate, ParticipantId, SdpKind, SessionDescription};

pub const CALL_OFFER: &str = "call_offer";
pub const CALL_ANSWER: &str = "call_answer";
pub const ICE_CANDIDATE: &str = "ice_candidate";
pub const CALL_END: &str = "call_end";
pub const SERVER_ERROR: &str = "error";

// =============================================================================
// Client -> server
// =============================================================================

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OfferRequest {
    pub token: String,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ParticipantId>,
    pub offer: SessionDescription,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AnswerRequest {
    pub token: String,
    pub chat_id: ChatId,
    pub caller_id: ParticipantId,
    pub answer: SessionDescription,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CandidateRequest {
    pub token: String,
    pub chat_id: ChatId,
    pub target_id: ParticipantId,
    pub candidate: IceCandidate,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EndRequest {
    pub token: String,
    pub chat_id: ChatId,
}

/// Event this client sends
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    Offer {
        chat_id: ChatId,
        /// `None` lets the server fan the offer out to every chat member
        target_id: Option<ParticipantId>,
        offer: SessionDescription,
    },
    Answer {
        chat_id: ChatId,
        caller_id: ParticipantId,
        answer: SessionDescription,
    },
    Candidate {
        chat_id: ChatId,
        target_id: ParticipantId,
        candidate: IceCandidate,
    },
    CallEnd {
        chat_id: ChatId,
    },
}

impl OutboundSignal {
    pub fn event(&self) -> &'static str {
        match self {
            OutboundSignal::Offer { .. } => CALL_OFFER,
            OutboundSignal::Answer { .. } => CALL_ANSWER,
            OutboundSignal::Candidate { .. } => ICE_CANDIDATE,
            OutboundSignal::CallEnd { .. } => CALL_END,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        match self {
            OutboundSignal::Offer { chat_id, .. }
            | OutboundSignal::Answer { chat_id, .. }
            | OutboundSignal::Candidate { chat_id, .. }
            | OutboundSignal::CallEnd { chat_id } => chat_id,
        }
    }

    pub fn to_payload(&self, token: &BearerToken) -> Result<Value> {
        let token = token.as_str().to_string();
        let payload = match self.clone() {
            OutboundSignal::Offer {
                chat_id,
                target_id,
                offer,
            } => serde_json::to_value(OfferRequest {
                token,
                chat_id,
                target_id,
                offer,
            })?,
            OutboundSignal::Answer {
                chat_id,
                caller_id,
                answer,
            } => serde_json::to_value(AnswerRequest {
                token,
                chat_id,
                caller_id,
                answer,
            })?,
            OutboundSignal::Candidate {
                chat_id,
                target_id,
                candidate,
            } => serde_json::to_value(CandidateRequest {
                token,
                chat_id,
                target_id,
                candidate,
            })?,
            OutboundSignal::CallEnd { chat_id } => serde_json::to_value(EndRequest { token, chat_id })?,
        };
        Ok(payload)
    }
}

// =============================================================================
// Server -> client
// =============================================================================

#[derive(Deserialize)]
struct OfferNotice {
    chat_id: ChatId,
    caller_id: ParticipantId,
    offer: SessionDescription,
}

#[derive(Deserialize)]
struct AnswerNotice {
    chat_id: ChatId,
    answerer_id: ParticipantId,
    answer: SessionDescription,
}

#[derive(Deserialize)]
struct CandidateNotice {
    chat_id: ChatId,
    sender_id: ParticipantId,
    candidate: IceCandidate,
}

#[derive(Deserialize)]
struct EndNotice {
    chat_id: ChatId,
    #[serde(default)]
    ended_by: Option<ParticipantId>,
}

#[derive(Deserialize)]
struct ErrorNotice {
    #[serde(default)]
    message: String,
}

/// Event the server delivers to this client
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    Offer {
        chat_id: ChatId,
        caller_id: ParticipantId,
        offer: SessionDescription,
    },
    Answer {
        chat_id: ChatId,
        answerer_id: ParticipantId,
        answer: SessionDescription,
    },
    Candidate {
        chat_id: ChatId,
        sender_id: ParticipantId,
        candidate: IceCandidate,
    },
    CallEnd {
        chat_id: ChatId,
        ended_by: Option<ParticipantId>,
    },
    /// Server rejected one of our events
    ServerError { message: String },
}

impl InboundSignal {
    /// Parse and validate one inbound event
    pub fn parse(event: &str, payload: &Value) -> Result<Self> {
        let signal = match event {
            CALL_OFFER => {
                let n: OfferNotice = decode(event, payload)?;
                check_description(&n.offer, SdpKind::Offer)?;
                InboundSignal::Offer {
                    chat_id: n.chat_id,
                    caller_id: n.caller_id,
                    offer: n.offer,
                }
            }
            CALL_ANSWER => {
                let n: AnswerNotice = decode(event, payload)?;
                check_description(&n.answer, SdpKind::Answer)?;
                InboundSignal::Answer {
                    chat_id: n.chat_id,
                    answerer_id: n.answerer_id,
                    answer: n.answer,
                }
            }
            ICE_CANDIDATE => {
                let n: CandidateNotice = decode(event, payload)?;
                if n.candidate.candidate.trim().is_empty() {
                    return Err(CallError::InvalidMessage("empty ICE candidate".into()));
                }
                InboundSignal::Candidate {
                    chat_id: n.chat_id,
                    sender_id: n.sender_id,
                    candidate: n.candidate,
                }
            }
            CALL_END => {
                let n: EndNotice = decode(event, payload)?;
                InboundSignal::CallEnd {
                    chat_id: n.chat_id,
                    ended_by: n.ended_by,
                }
            }
            SERVER_ERROR => {
                let n: ErrorNotice = decode(event, payload)?;
                InboundSignal::ServerError { message: n.message }
            }
            other => {
                return Err(CallError::InvalidMessage(format!("unknown event '{other}'")));
            }
        };
        Ok(signal)
    }

    pub fn event(&self) -> &'static str {
        match self {
            InboundSignal::Offer { .. } => CALL_OFFER,
            InboundSignal::Answer { .. } => CALL_ANSWER,
            InboundSignal::Candidate { .. } => ICE_CANDIDATE,
            InboundSignal::CallEnd { .. } => CALL_END,
            InboundSignal::ServerError { .. } => SERVER_ERROR,
        }
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            InboundSignal::Offer { chat_id, .. }
            | InboundSignal::Answer { chat_id, .. }
            | InboundSignal::Candidate { chat_id, .. }
            | InboundSignal::CallEnd { chat_id, .. } => Some(chat_id),
            InboundSignal::ServerError { .. } => None,
        }
    }

    /// Wire form, as the server would deliver it
    pub fn to_raw(&self) -> RawSignal {
        let payload = match self {
            InboundSignal::Offer {
                chat_id,
                caller_id,
                offer,
            } => serde_json::json!({ "chat_id": chat_id, "caller_id": caller_id, "offer": offer }),
            InboundSignal::Answer {
                chat_id,
                answerer_id,
                answer,
            } => serde_json::json!({ "chat_id": chat_id, "answerer_id": answerer_id, "answer": answer }),
            InboundSignal::Candidate {
                chat_id,
                sender_id,
                candidate,
            } => serde_json::json!({ "chat_id": chat_id, "sender_id": sender_id, "candidate": candidate }),
            InboundSignal::CallEnd { chat_id, ended_by } => {
                serde_json::json!({ "chat_id": chat_id, "ended_by": ended_by })
            }
            InboundSignal::ServerError { message } => serde_json::json!({ "message": message }),
        };
        RawSignal::new(self.event(), payload)
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &str, payload: &Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| CallError::InvalidMessage(format!("{event}: {e}")))
}

fn check_description(desc: &SessionDescription, expected: SdpKind) -> Result<()> {
    if desc.kind != expected {
        return Err(CallError::InvalidMessage(format!(
            "expected {:?} description, got {:?}",
            expected, desc.kind
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(CallError::InvalidMessage("empty SDP".into()));
    }
    Ok(())
}
