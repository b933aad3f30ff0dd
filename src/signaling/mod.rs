//! Signaling Adapter
//!
//! Turns controller intents into outbound events and inbound events into
//! validated [`InboundSignal`]s. Nothing is retried; delivery is the
//! channel's business.

pub mod auth;
pub mod channel;
pub mod messages;
pub mod relay;

use std::sync::Arc;

use tracing::{debug, error, warn};

pub use auth::BearerToken;
pub use channel::{ChannelTransport, RawSignal, SignalingTransport};
pub use messages::{InboundSignal, OutboundSignal};
pub use relay::MemoryRelay;

use crate::error::{CallError, Result};
use crate::peer::types::{ChatId, IceCandidate, ParticipantId, SessionDescription};

pub struct SignalingAdapter {
    transport: Arc<dyn SignalingTransport>,
    token: BearerToken,
}

impl SignalingAdapter {
    pub fn new(transport: Arc<dyn SignalingTransport>, token: BearerToken) -> Self {
        Self { transport, token }
    }

    /// Our participant id, as the server will resolve it from the token
    pub fn local_id(&self) -> Option<ParticipantId> {
        self.token.subject().ok()
    }

    pub async fn send(&self, signal: OutboundSignal) -> Result<()> {
        let event = signal.event();
        let payload = signal.to_payload(&self.token)?;
        match self.transport.emit(event, payload).await {
            Ok(()) => {
                debug!("Sent {} for chat {}", event, signal.chat_id());
                Ok(())
            }
            Err(e) => {
                error!("Failed to send {}: {}", event, e);
                Err(match e {
                    CallError::SignalingDelivery(_) => e,
                    other => CallError::SignalingDelivery(other.to_string()),
                })
            }
        }
    }

    pub async fn send_offer(
        &self,
        chat_id: &ChatId,
        target_id: Option<&ParticipantId>,
        offer: SessionDescription,
    ) -> Result<()> {
        self.send(OutboundSignal::Offer {
            chat_id: chat_id.clone(),
            target_id: target_id.cloned(),
            offer,
        })
        .await
    }

    pub async fn send_answer(
        &self,
        chat_id: &ChatId,
        caller_id: &ParticipantId,
        answer: SessionDescription,
    ) -> Result<()> {
        self.send(OutboundSignal::Answer {
            chat_id: chat_id.clone(),
            caller_id: caller_id.clone(),
            answer,
        })
        .await
    }

    pub async fn send_candidate(
        &self,
        chat_id: &ChatId,
        target_id: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.send(OutboundSignal::Candidate {
            chat_id: chat_id.clone(),
            target_id: target_id.clone(),
            candidate,
        })
        .await
    }

    pub async fn send_call_end(&self, chat_id: &ChatId) -> Result<()> {
        self.send(OutboundSignal::CallEnd {
            chat_id: chat_id.clone(),
        })
        .await
    }

    /// Validate an inbound event at the boundary
    pub fn decode(&self, raw: &RawSignal) -> Result<InboundSignal> {
        InboundSignal::parse(&raw.event, &raw.payload).map_err(|e| {
            warn!("Dropping malformed {} event: {}", raw.event, e);
            e
        })
    }
}
