//! In-process signaling relay
//!
//! Routes call events between connected clients with the chat server's rules:
//! offers go to `target_id` or to every other chat member, answers go back to
//! the caller, candidates go to their target and call-end reaches every other
//! member. The sender is always taken from the event's token.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::auth::BearerToken;
use super::channel::{RawSignal, SignalingTransport};
use super::messages::{
    AnswerRequest, CandidateRequest, EndRequest, InboundSignal, OfferRequest, CALL_ANSWER, CALL_END, CALL_OFFER,
    ICE_CANDIDATE,
};
use crate::error::{CallError, Result};
use crate::peer::types::{ChatId, ParticipantId};

#[derive(Default)]
struct RelayState {
    members: HashMap<ChatId, Vec<ParticipantId>>,
    clients: HashMap<ParticipantId, mpsc::UnboundedSender<RawSignal>>,
}

#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_member(&self, chat_id: &ChatId, participant: &ParticipantId) {
        let mut state = self.state.lock();
        let members = state.members.entry(chat_id.clone()).or_default();
        if !members.contains(participant) {
            members.push(participant.clone());
        }
    }

    pub fn members(&self, chat_id: &ChatId) -> Vec<ParticipantId> {
        self.state.lock().members.get(chat_id).cloned().unwrap_or_default()
    }

    /// Register a client; the token decides who it is
    pub fn connect(
        self: &Arc<Self>,
        token: &BearerToken,
    ) -> Result<(RelayTransport, mpsc::UnboundedReceiver<RawSignal>)> {
        let participant = token.subject()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().clients.insert(participant.clone(), tx);
        info!("User {} connected to relay", participant);
        let transport = RelayTransport {
            relay: Arc::clone(self),
            connection: participant,
        };
        Ok((transport, rx))
    }

    pub fn disconnect(&self, participant: &ParticipantId) {
        if self.state.lock().clients.remove(participant).is_some() {
            info!("User {} disconnected from relay", participant);
        }
    }

    pub fn is_connected(&self, participant: &ParticipantId) -> bool {
        self.state.lock().clients.contains_key(participant)
    }

    fn deliver(&self, to: &ParticipantId, signal: InboundSignal) {
        let state = self.state.lock();
        match state.clients.get(to) {
            Some(tx) => {
                let _ = tx.send(signal.to_raw());
            }
            None => debug!("User {} is offline, dropping {}", to, signal.event()),
        }
    }

    fn reject(&self, connection: &ParticipantId, message: impl Into<String>) {
        let message = message.into();
        warn!("Rejecting event from {}: {}", connection, message);
        self.deliver(connection, InboundSignal::ServerError { message });
    }

    fn dispatch(&self, connection: &ParticipantId, event: &str, payload: Value) -> Result<()> {
        if !self.is_connected(connection) {
            return Err(CallError::SignalingDelivery(format!("{connection} is not connected")));
        }
        let sender = match payload.get("token").and_then(Value::as_str) {
            Some(token) => match BearerToken::new(token).subject() {
                Ok(sender) => sender,
                Err(e) => {
                    self.reject(connection, e.to_string());
                    return Ok(());
                }
            },
            None => {
                self.reject(connection, "Authentication required");
                return Ok(());
            }
        };

        match event {
            CALL_OFFER => {
                let Some(req) = self.parse::<OfferRequest>(connection, payload) else {
                    return Ok(());
                };
                let members = self.members(&req.chat_id);
                if !members.contains(&sender) {
                    self.reject(connection, "Access denied");
                    return Ok(());
                }
                let targets: Vec<_> = match &req.target_id {
                    Some(target) => members.into_iter().filter(|m| m == target).collect(),
                    None => members.into_iter().filter(|m| m != &sender).collect(),
                };
                for target in targets {
                    self.deliver(
                        &target,
                        InboundSignal::Offer {
                            chat_id: req.chat_id.clone(),
                            caller_id: sender.clone(),
                            offer: req.offer.clone(),
                        },
                    );
                }
                info!("Call offer from user {} in chat {}", sender, req.chat_id);
            }
            CALL_ANSWER => {
                let Some(req) = self.parse::<AnswerRequest>(connection, payload) else {
                    return Ok(());
                };
                self.deliver(
                    &req.caller_id,
                    InboundSignal::Answer {
                        chat_id: req.chat_id,
                        answerer_id: sender.clone(),
                        answer: req.answer,
                    },
                );
                info!("Call answer from user {} to caller {}", sender, req.caller_id);
            }
            ICE_CANDIDATE => {
                let Some(req) = self.parse::<CandidateRequest>(connection, payload) else {
                    return Ok(());
                };
                self.deliver(
                    &req.target_id,
                    InboundSignal::Candidate {
                        chat_id: req.chat_id,
                        sender_id: sender,
                        candidate: req.candidate,
                    },
                );
            }
            CALL_END => {
                let Some(req) = self.parse::<EndRequest>(connection, payload) else {
                    return Ok(());
                };
                for member in self.members(&req.chat_id) {
                    if member != sender {
                        self.deliver(
                            &member,
                            InboundSignal::CallEnd {
                                chat_id: req.chat_id.clone(),
                                ended_by: Some(sender.clone()),
                            },
                        );
                    }
                }
                info!("Call ended by user {} in chat {}", sender, req.chat_id);
            }
            other => {
                self.deliver(
                    connection,
                    InboundSignal::ServerError {
                        message: format!("unsupported event {other}"),
                    },
                );
                return Ok(());
            }
        }
        Ok(())
    }

    fn parse<T: DeserializeOwned>(&self, connection: &ParticipantId, payload: Value) -> Option<T> {
        match serde_json::from_value(payload) {
            Ok(req) => Some(req),
            Err(e) => {
                self.reject(connection, e.to_string());
                None
            }
        }
    }
}

/// One client's connection to a [`MemoryRelay`]
pub struct RelayTransport {
    relay: Arc<MemoryRelay>,
    connection: ParticipantId,
}

impl RelayTransport {
    pub fn participant(&self) -> &ParticipantId {
        &self.connection
    }
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.relay.dispatch(&self.connection, event, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::peer::types::{IceCandidate, SessionDescription};
    use crate::signaling::OutboundSignal;

    struct Client {
        id: ParticipantId,
        token: BearerToken,
        transport: RelayTransport,
        rx: mpsc::UnboundedReceiver<RawSignal>,
    }

    impl Client {
        async fn send(&self, signal: OutboundSignal) {
            let payload = signal.to_payload(&self.token).unwrap();
            self.transport.emit(signal.event(), payload).await.unwrap();
        }

        fn next(&mut self) -> Option<InboundSignal> {
            self.rx
                .try_recv()
                .ok()
                .map(|raw| InboundSignal::parse(&raw.event, &raw.payload).unwrap())
        }
    }

    fn setup(ids: &[&str]) -> (Arc<MemoryRelay>, ChatId, Vec<Client>) {
        let relay = MemoryRelay::new();
        let chat = ChatId::new("c1");
        let clients = ids
            .iter()
            .map(|id| {
                let id = ParticipantId::new(*id);
                relay.add_member(&chat, &id);
                let token = BearerToken::unsigned_for(&id);
                let (transport, rx) = relay.connect(&token).unwrap();
                Client {
                    id,
                    token,
                    transport,
                    rx,
                }
            })
            .collect();
        (relay, chat, clients)
    }

    #[tokio::test]
    async fn test_untargeted_offer_fans_out() {
        let (_relay, chat, mut clients) = setup(&["a", "b", "c"]);
        clients[0]
            .send(OutboundSignal::Offer {
                chat_id: chat.clone(),
                target_id: None,
                offer: SessionDescription::offer("v=0"),
            })
            .await;
        assert!(clients[0].next().is_none());
        for client in &mut clients[1..] {
            match client.next() {
                Some(InboundSignal::Offer { caller_id, .. }) => assert_eq!(caller_id.as_str(), "a"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_targeted_offer_and_candidate() {
        let (_relay, chat, mut clients) = setup(&["a", "b", "c"]);
        let b = clients[1].id.clone();
        clients[0]
            .send(OutboundSignal::Offer {
                chat_id: chat.clone(),
                target_id: Some(b.clone()),
                offer: SessionDescription::offer("v=0"),
            })
            .await;
        clients[0]
            .send(OutboundSignal::Candidate {
                chat_id: chat.clone(),
                target_id: b,
                candidate: IceCandidate::new("candidate:1"),
            })
            .await;
        assert!(matches!(clients[1].next(), Some(InboundSignal::Offer { .. })));
        assert!(matches!(clients[1].next(), Some(InboundSignal::Candidate { .. })));
        assert!(clients[2].next().is_none());
    }

    #[tokio::test]
    async fn test_call_end_reaches_others_with_ended_by() {
        let (_relay, chat, mut clients) = setup(&["a", "b"]);
        clients[1].send(OutboundSignal::CallEnd { chat_id: chat }).await;
        match clients[0].next() {
            Some(InboundSignal::CallEnd { ended_by, .. }) => assert_eq!(ended_by.unwrap().as_str(), "b"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(clients[1].next().is_none());
    }

    #[tokio::test]
    async fn test_non_member_offer_is_denied() {
        let (relay, _chat, mut clients) = setup(&["a", "b"]);
        relay.add_member(&ChatId::new("other"), &clients[1].id);
        clients[0]
            .send(OutboundSignal::Offer {
                chat_id: ChatId::new("other"),
                target_id: None,
                offer: SessionDescription::offer("v=0"),
            })
            .await;
        assert_eq!(
            clients[0].next(),
            Some(InboundSignal::ServerError {
                message: "Access denied".into()
            })
        );
        assert!(clients[1].next().is_none());
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let (_relay, _chat, mut clients) = setup(&["a"]);
        clients[0]
            .transport
            .emit("call_end", json!({"chat_id": "c1"}))
            .await
            .unwrap();
        let raw = clients[0].rx.try_recv().unwrap();
        assert_eq!(raw.event, "error");
        assert_eq!(raw.payload["message"], "Authentication required");
    }

    #[tokio::test]
    async fn test_disconnected_client_cannot_emit() {
        let (relay, chat, clients) = setup(&["a", "b"]);
        relay.disconnect(&clients[0].id);
        let signal = OutboundSignal::CallEnd { chat_id: chat };
        let payload = signal.to_payload(&clients[0].token).unwrap();
        let err = clients[0].transport.emit("call_end", payload).await.unwrap_err();
        assert!(matches!(err, CallError::SignalingDelivery(_)));
    }
}
