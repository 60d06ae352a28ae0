//! Wire format for call signaling messages.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::media::{IceCandidate, SessionDescription};

const SIGNAL_NS: &str = "pika.call";
const SIGNAL_PROTOCOL_VERSION: u8 = 1;

pub const HANGUP_REASON_USER: &str = "user_hangup";
pub const HANGUP_REASON_BUSY: &str = "busy";
pub const HANGUP_REASON_DECLINED: &str = "declined";
pub const HANGUP_REASON_NO_ANSWER: &str = "no_answer";
pub const HANGUP_REASON_TIMEOUT: &str = "timeout";

/// Session-scoped tag carried by every signal of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Hangup,
    /// Sent by a Responder once its subscription is live.
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Hangup { reason: String },
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    /// `None` only for messages sent before the sender learned the id.
    pub session_id: Option<CallId>,
    pub from: String,
    pub to: String,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignalEnvelope {
    v: u8,
    ns: String,
    #[serde(default)]
    session_id: Option<CallId>,
    ts_ms: i64,
    from: String,
    to: String,
    kind: SignalKind,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HangupBody {
    reason: String,
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl SignalingMessage {
    pub fn new(
        session_id: Option<CallId>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            session_id,
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self.payload {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::Candidate(_) => SignalKind::Candidate,
            SignalPayload::Hangup { .. } => SignalKind::Hangup,
            SignalPayload::Ready => SignalKind::Ready,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let payload = match &self.payload {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                serde_json::to_value(desc)?
            }
            SignalPayload::Candidate(candidate) => serde_json::to_value(candidate)?,
            SignalPayload::Hangup { reason } => serde_json::to_value(HangupBody {
                reason: reason.clone(),
            })?,
            SignalPayload::Ready => serde_json::Value::Null,
        };
        let env = SignalEnvelope {
            v: SIGNAL_PROTOCOL_VERSION,
            ns: SIGNAL_NS.to_string(),
            session_id: self.session_id.clone(),
            ts_ms: now_millis(),
            from: self.from.clone(),
            to: self.to.clone(),
            kind: self.kind(),
            payload,
        };
        serde_json::to_string(&env)
    }

    /// Parses a relay message. Anything that is not a well-formed call signal
    /// of the supported version yields `None`.
    pub fn decode(content: &str) -> Option<Self> {
        let env: SignalEnvelope = serde_json::from_str(content).ok()?;
        if env.v != SIGNAL_PROTOCOL_VERSION || env.ns != SIGNAL_NS {
            return None;
        }
        let payload = match env.kind {
            SignalKind::Offer => {
                let desc: SessionDescription = serde_json::from_value(env.payload).ok()?;
                if desc.sdp_type != crate::media::SdpType::Offer {
                    return None;
                }
                SignalPayload::Offer(desc)
            }
            SignalKind::Answer => {
                let desc: SessionDescription = serde_json::from_value(env.payload).ok()?;
                if desc.sdp_type != crate::media::SdpType::Answer {
                    return None;
                }
                SignalPayload::Answer(desc)
            }
            SignalKind::Candidate => SignalPayload::Candidate(
                serde_json::from_value(env.payload).ok()?,
            ),
            SignalKind::Hangup => {
                let body: HangupBody = serde_json::from_value(env.payload).ok()?;
                SignalPayload::Hangup {
                    reason: body.reason,
                }
            }
            SignalKind::Ready => SignalPayload::Ready,
        };
        Some(Self {
            session_id: env.session_id,
            from: env.from,
            to: env.to,
            payload,
        })
    }
}
