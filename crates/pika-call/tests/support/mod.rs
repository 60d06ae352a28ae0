#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pika_call::media::synthetic::{
    SyntheticEndpoint, SyntheticMediaFactory, SyntheticOptions, SyntheticProbe,
};
use pika_call::media::{IceCandidate, SessionDescription};
use pika_call::relay::SignalSubscription;
use pika_call::session::{spawn_session, SessionDeps};
use pika_call::signal::{SignalKind, SignalPayload};
use pika_call::{
    CallConfig, CallController, CallId, CallKind, CallNotifier, CallPhase, CallSession,
    CallSessionHandle, CallSnapshot, CallStatusEvent, ChatDirectory, InMemoryRelay,
    SignalingMessage, SignalingTransport,
};

pub const CHAT: &str = "chat-1";
pub const TOPIC: &str = "call-chat-1";

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, CallStatusEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<CallStatusEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl CallNotifier for RecordingNotifier {
    fn notify(&self, chat_id: &str, event: CallStatusEvent) {
        self.events
            .lock()
            .unwrap()
            .push((chat_id.to_string(), event));
    }
}

/// Two-member chats keyed by chat id.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    chats: HashMap<String, (String, String)>,
}

impl StaticDirectory {
    pub fn with_chat(mut self, chat_id: &str, a: &str, b: &str) -> Self {
        self.chats
            .insert(chat_id.to_string(), (a.to_string(), b.to_string()));
        self
    }
}

impl ChatDirectory for StaticDirectory {
    fn remote_participant(&self, chat_id: &str, local_participant_id: &str) -> Option<String> {
        let (a, b) = self.chats.get(chat_id)?;
        if a == local_participant_id {
            Some(b.clone())
        } else if b == local_participant_id {
            Some(a.clone())
        } else {
            None
        }
    }
}

pub struct Peer {
    pub controller: CallController,
    pub media: Arc<SyntheticMediaFactory>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn fast_config() -> CallConfig {
    CallConfig {
        settle_delay_ms: 100,
        offer_retry_delay_ms: 200,
        ..CallConfig::default()
    }
}

pub fn peer(relay: &InMemoryRelay, id: &str, options: SyntheticOptions) -> Peer {
    let media = Arc::new(SyntheticMediaFactory::new(options));
    let notifier = Arc::new(RecordingNotifier::default());
    let directory = StaticDirectory::default().with_chat(CHAT, "alice", "bob");
    let controller = CallController::new(
        id,
        Arc::new(relay.clone()),
        media.clone(),
        Arc::new(directory),
        notifier.clone(),
        fast_config(),
    );
    Peer {
        controller,
        media,
        notifier,
    }
}

/// Subscribes a passive observer to the call topic.
pub async fn tap(relay: &InMemoryRelay) -> SignalSubscription {
    relay.subscribe(TOPIC, "observer").await.expect("tap")
}

/// Drains every message the tap has seen so far.
pub fn drain(tap: &mut SignalSubscription) -> Vec<SignalingMessage> {
    let mut out = Vec::new();
    while let Ok(raw) = tap.try_recv() {
        if let Some(msg) = SignalingMessage::decode(&raw) {
            out.push(msg);
        }
    }
    out
}

pub fn count_kind(msgs: &[SignalingMessage], from: &str, kind: SignalKind) -> usize {
    msgs.iter()
        .filter(|m| m.from == from && m.kind() == kind)
        .count()
}

pub fn hangup_reasons(msgs: &[SignalingMessage]) -> Vec<String> {
    msgs.iter()
        .filter_map(|m| match &m.payload {
            SignalPayload::Hangup { reason } => Some(reason.clone()),
            _ => None,
        })
        .collect()
}

/// Lets spawned tasks and paused timers make progress.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Fails the test instead of hanging when a phase is never reached.
pub async fn wait_phase(handle: &CallSessionHandle, phase: CallPhase) -> CallSnapshot {
    tokio::time::timeout(
        Duration::from_secs(30),
        handle.wait_for_phase(|p| p == phase || p.is_terminal()),
    )
    .await
    .unwrap_or_else(|_| panic!("phase {phase:?} not reached, at {:?}", handle.phase()))
}

pub struct SessionUnderTest {
    pub handle: CallSessionHandle,
    pub probe: SyntheticProbe,
}

pub fn spawn(
    relay: &InMemoryRelay,
    session: CallSession,
    options: SyntheticOptions,
) -> SessionUnderTest {
    let endpoint = SyntheticEndpoint::new(options);
    let probe = endpoint.probe();
    let deps = SessionDeps {
        transport: Arc::new(relay.clone()),
        media: Arc::new(endpoint),
        config: fast_config(),
    };
    let handle = spawn_session(session, deps, Vec::new()).expect("spawn session");
    handle.start();
    SessionUnderTest { handle, probe }
}

pub fn initiator(id: &CallId, kind: CallKind) -> CallSession {
    CallSession::initiator(id.clone(), CHAT, "alice", "bob", kind)
}

pub fn responder(id: Option<&CallId>, kind: CallKind) -> CallSession {
    CallSession::responder(id.cloned(), CHAT, "bob", "alice", kind)
}

/// Starts bob first so alice's first Offer finds a listener, then waits
/// until both sides are connected.
pub async fn connected_pair(relay: &InMemoryRelay) -> (SessionUnderTest, SessionUnderTest) {
    let id = CallId::generate();
    let bob = spawn(relay, responder(Some(&id), CallKind::Audio), SyntheticOptions::default());
    wait_phase(&bob.handle, CallPhase::AwaitingOffer).await;
    let alice = spawn(relay, initiator(&id, CallKind::Audio), SyntheticOptions::default());
    assert_eq!(wait_phase(&alice.handle, CallPhase::Connected).await.phase, CallPhase::Connected);
    assert_eq!(wait_phase(&bob.handle, CallPhase::Connected).await.phase, CallPhase::Connected);
    (alice, bob)
}

/// Publishes a signal on the call topic as if sent by `from`.
pub async fn inject(
    relay: &InMemoryRelay,
    session_id: Option<&CallId>,
    from: &str,
    to: &str,
    payload: SignalPayload,
) {
    let msg = SignalingMessage::new(session_id.cloned(), from, to, payload);
    relay
        .publish(TOPIC, from, msg.encode().expect("encode"))
        .await
        .expect("publish");
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

pub fn remote_offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\ns=offer\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n")
}
