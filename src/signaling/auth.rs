use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};

use crate::error::{CallError, Result};
use crate::peer::types::ParticipantId;

/// Bearer token attached to every outbound signaling event
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `sub` claim of the JWT: the participant id the server sees.
    /// The signature is not checked here; that is the server's job.
    pub fn subject(&self) -> Result<ParticipantId> {
        let claims = self
            .0
            .split('.')
            .nth(1)
            .ok_or_else(|| CallError::InvalidMessage("token is not a JWT".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(claims.trim_end_matches('='))
            .map_err(|e| CallError::InvalidMessage(format!("token claims: {e}")))?;
        let claims: Value = serde_json::from_slice(&bytes)?;
        match claims.get("sub") {
            Some(Value::String(s)) if !s.is_empty() => Ok(ParticipantId::new(s.as_str())),
            Some(Value::Number(n)) => Ok(ParticipantId::new(n.to_string())),
            _ => Err(CallError::InvalidMessage("token has no subject".into())),
        }
    }

    /// Unsigned token for in-process relays and tests
    pub fn unsigned_for(subject: &ParticipantId) -> Self {
        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "none", "typ": "JWT"}).to_string());
        let claims = URL_SAFE_NO_PAD.encode(json!({ "sub": subject }).to_string());
        Self(format!("{header}.{claims}."))
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(***)")
    }
}
