//! Peer-to-peer call signaling and negotiation.
//!
//! A [`CallController`] turns "call this chat" into a [`session`] actor that
//! acquires media through a [`MediaEndpoint`], exchanges Offer/Answer and
//! candidates over a [`SignalingTransport`] topic, and tears everything down
//! exactly once when the call ends.

pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod media;
pub mod relay;
pub mod session;
pub mod signal;

pub use config::{load_call_config, CallConfig};
pub use controller::{
    CallController, CallNotifier, CallStatusEvent, CallStatusView, ChatDirectory, IncomingCall,
    IncomingCallWatcher,
};
pub use error::{CallError, MediaError, RelayError};
pub use logging::init_logging;
pub use media::{CallKind, MediaEndpoint, MediaEndpointFactory};
pub use relay::{InMemoryRelay, SignalingTransport};
pub use session::{CallPhase, CallRole, CallSession, CallSessionHandle, CallSnapshot};
pub use signal::{CallId, SignalingMessage};
