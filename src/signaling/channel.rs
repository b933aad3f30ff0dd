use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{CallError, Result};

/// One event as it travels over the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    pub event: String,
    pub payload: Value,
}

impl RawSignal {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Outbound half of the signaling channel (`emit(event, payload)`).
///
/// Inbound events are delivered as [`RawSignal`]s on an mpsc receiver owned
/// by whoever drives the call controller.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn emit(&self, event: &str, payload: Value) -> Result<()>;
}

/// Transport that hands events to a socket writer task over a channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<RawSignal>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RawSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SignalingTransport for ChannelTransport {
    async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        self.tx
            .send(RawSignal::new(event, payload))
            .map_err(|_| CallError::SignalingDelivery("socket writer is gone".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_transport_forwards_events() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.emit("call_end", json!({"chat_id": 1})).await.unwrap();
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.event, "call_end");
        assert_eq!(signal.payload["chat_id"], 1);
    }

    #[tokio::test]
    async fn test_closed_writer_is_delivery_error() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        let err = transport.emit("call_end", json!({})).await.unwrap_err();
        assert!(matches!(err, CallError::SignalingDelivery(_)));
    }
}
