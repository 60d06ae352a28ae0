//! User-facing call control.
//!
//! Maps place/accept/decline/mute/hang-up intents onto call sessions, keeps at
//! most one live call, and forwards status changes to a [`CallNotifier`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::{CallKind, MediaEndpointFactory};
use crate::relay::{topic_key, SignalSubscription, SignalingTransport, SubscriptionId};
use crate::session::{
    spawn_session, CallPhase, CallSession, CallSessionHandle, CallSnapshot, SessionDeps,
};
use crate::signal::{
    CallId, SignalPayload, SignalingMessage, HANGUP_REASON_BUSY, HANGUP_REASON_DECLINED,
    HANGUP_REASON_USER,
};

/// Resolves the other member of a 1:1 chat.
pub trait ChatDirectory: Send + Sync {
    fn remote_participant(&self, chat_id: &str, local_participant_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatusEvent {
    Connecting,
    Connected,
    Ended { reason: String },
    Error { message: String, retryable: bool },
}

pub trait CallNotifier: Send + Sync {
    fn notify(&self, chat_id: &str, event: CallStatusEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatusView {
    pub chat_id: String,
    pub phase: CallPhase,
    pub muted: bool,
    pub duration: Option<Duration>,
    /// Short user-facing text, never raw transport output.
    pub last_error: Option<String>,
}

impl From<&CallSnapshot> for CallStatusView {
    fn from(snapshot: &CallSnapshot) -> Self {
        Self {
            chat_id: snapshot.chat_id.clone(),
            phase: snapshot.phase,
            muted: snapshot.muted,
            duration: if snapshot.phase == CallPhase::Connected {
                snapshot.duration()
            } else {
                None
            },
            last_error: snapshot
                .last_error
                .as_ref()
                .map(|err| err.user_message().to_string()),
        }
    }
}

/// Session ids the caller has already hung up, shared between a watcher
/// and the calls it handed out.
type EndedCalls = Arc<Mutex<HashSet<CallId>>>;

fn lock_ended(ended: &EndedCalls) -> MutexGuard<'_, HashSet<CallId>> {
    ended.lock().expect("ended call set poisoned")
}

/// An Offer addressed to the local participant, not yet accepted.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub chat_id: String,
    pub session_id: CallId,
    pub from: String,
    pub kind: CallKind,
    signals: Vec<String>,
    ended: EndedCalls,
}

impl IncomingCall {
    /// True once the caller hung up. Updated while the watcher that yielded
    /// this call is alive.
    pub fn is_cancelled(&self) -> bool {
        lock_ended(&self.ended).contains(&self.session_id)
    }
}

struct ActiveCall {
    handle: CallSessionHandle,
    muted: bool,
}

pub struct CallController {
    local_participant_id: String,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<dyn MediaEndpointFactory>,
    directory: Arc<dyn ChatDirectory>,
    notifier: Arc<dyn CallNotifier>,
    config: CallConfig,
    active: Mutex<Option<ActiveCall>>,
}

impl CallController {
    pub fn new(
        local_participant_id: impl Into<String>,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<dyn MediaEndpointFactory>,
        directory: Arc<dyn ChatDirectory>,
        notifier: Arc<dyn CallNotifier>,
        config: CallConfig,
    ) -> Self {
        Self {
            local_participant_id: local_participant_id.into(),
            transport,
            media,
            directory,
            notifier,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn local_participant_id(&self) -> &str {
        &self.local_participant_id
    }

    pub fn has_live_call(&self) -> bool {
        self.lock_active()
            .as_ref()
            .map(|c| !c.handle.phase().is_terminal())
            .unwrap_or(false)
    }

    pub fn current_call(&self) -> Option<CallSessionHandle> {
        self.lock_active().as_ref().map(|c| c.handle.clone())
    }

    /// Calls the other member of `chat_id`.
    pub fn place_call(&self, chat_id: &str, kind: CallKind) -> Result<CallSessionHandle, CallError> {
        let remote = self
            .directory
            .remote_participant(chat_id, &self.local_participant_id)
            .ok_or_else(|| CallError::PeerNotFound(chat_id.to_string()))?;
        self.place_call_to(chat_id, &remote, kind)
    }

    pub fn place_call_to(
        &self,
        chat_id: &str,
        remote_participant_id: &str,
        kind: CallKind,
    ) -> Result<CallSessionHandle, CallError> {
        let session = CallSession::initiator(
            CallId::generate(),
            chat_id,
            self.local_participant_id.clone(),
            remote_participant_id,
            kind,
        );
        tracing::info!(chat_id, to = remote_participant_id, ?kind, "placing call");
        self.launch(session, Vec::new())
    }

    /// Listens on `chat_id` for Offers addressed to the local participant.
    pub async fn watch_incoming(&self, chat_id: &str) -> Result<IncomingCallWatcher, CallError> {
        let topic = topic_key(&self.config.topic_prefix, chat_id)?;
        let mut subscription = self
            .transport
            .subscribe(&topic, &self.local_participant_id)
            .await?;
        if let Err(err) = subscription
            .wait_ready(self.config.subscribe_timeout())
            .await
        {
            self.transport.unsubscribe(subscription.id());
            return Err(err.into());
        }
        let subscription_id = subscription.id();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let ended = EndedCalls::default();
        let reader = tokio::spawn(read_incoming(
            subscription,
            self.local_participant_id.clone(),
            Arc::clone(&ended),
            inbox_tx,
        ));
        Ok(IncomingCallWatcher {
            chat_id: chat_id.to_string(),
            local_participant_id: self.local_participant_id.clone(),
            transport: Arc::clone(&self.transport),
            subscription_id,
            inbox,
            backlog: VecDeque::new(),
            announced: HashSet::new(),
            ended,
            reader,
        })
    }

    /// Answers an incoming call. While another call is live the caller gets a
    /// `busy` Hangup and `AlreadyActive` is returned. A call the caller already
    /// hung up yields `StaleSignal`.
    pub async fn accept_incoming(
        &self,
        incoming: IncomingCall,
    ) -> Result<CallSessionHandle, CallError> {
        if incoming.is_cancelled() {
            tracing::info!(chat_id = %incoming.chat_id, session_id = %incoming.session_id, "incoming call already ended by caller");
            return Err(CallError::StaleSignal);
        }
        let session = CallSession::responder(
            Some(incoming.session_id.clone()),
            incoming.chat_id.clone(),
            self.local_participant_id.clone(),
            incoming.from.clone(),
            incoming.kind,
        );
        match self.launch(session, incoming.signals.clone()) {
            Err(err @ CallError::AlreadyActive(_)) => {
                tracing::info!(chat_id = %incoming.chat_id, from = %incoming.from, "busy, rejecting incoming call");
                if let Err(send_err) = self.reject(&incoming, HANGUP_REASON_BUSY).await {
                    tracing::warn!(err = %send_err, "busy reply failed");
                }
                Err(err)
            }
            other => other,
        }
    }

    pub async fn decline_incoming(&self, incoming: IncomingCall) -> Result<(), CallError> {
        if incoming.is_cancelled() {
            return Ok(());
        }
        tracing::info!(chat_id = %incoming.chat_id, from = %incoming.from, "declining incoming call");
        self.reject(&incoming, HANGUP_REASON_DECLINED).await
    }

    /// Flips local mute on the live call. Returns the new state.
    pub fn toggle_mute(&self) -> Option<bool> {
        let mut active = self.lock_active();
        let call = active.as_mut()?;
        if call.handle.phase().is_terminal() {
            return None;
        }
        call.muted = !call.muted;
        call.handle.set_muted(call.muted);
        Some(call.muted)
    }

    /// Ends the current call, if any, and waits until it is terminal.
    pub async fn hang_up(&self) -> Option<CallSnapshot> {
        let handle = self.current_call()?;
        Some(handle.hang_up_with_reason(HANGUP_REASON_USER).await)
    }

    pub fn status(&self) -> Option<CallStatusView> {
        self.lock_active()
            .as_ref()
            .map(|c| CallStatusView::from(&c.handle.snapshot()))
    }

    fn launch(
        &self,
        session: CallSession,
        initial_signals: Vec<String>,
    ) -> Result<CallSessionHandle, CallError> {
        let mut active = self.lock_active();
        if let Some(current) = active.as_ref() {
            if !current.handle.phase().is_terminal() {
                return Err(CallError::AlreadyActive(
                    current.handle.snapshot().chat_id,
                ));
            }
        }

        let chat_id = session.chat_id().to_string();
        let deps = SessionDeps {
            transport: Arc::clone(&self.transport),
            media: self.media.create_endpoint(),
            config: self.config.clone(),
        };
        let handle = spawn_session(session, deps, initial_signals)?;
        tokio::spawn(forward_status(
            chat_id,
            handle.subscribe_snapshots(),
            Arc::clone(&self.notifier),
        ));
        handle.start();
        *active = Some(ActiveCall {
            handle: handle.clone(),
            muted: false,
        });
        Ok(handle)
    }

    async fn reject(&self, incoming: &IncomingCall, reason: &str) -> Result<(), CallError> {
        let topic = topic_key(&self.config.topic_prefix, &incoming.chat_id)?;
        let msg = SignalingMessage::new(
            Some(incoming.session_id.clone()),
            self.local_participant_id.clone(),
            incoming.from.clone(),
            SignalPayload::Hangup {
                reason: reason.to_string(),
            },
        );
        let encoded = msg
            .encode()
            .map_err(|err| CallError::SignalingSendFailed(err.to_string()))?;
        self.transport
            .publish(&topic, &self.local_participant_id, encoded)
            .await?;
        Ok(())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveCall>> {
        self.active.lock().expect("active call lock poisoned")
    }
}

fn status_event(snapshot: &CallSnapshot) -> Option<CallStatusEvent> {
    match snapshot.phase {
        CallPhase::Idle | CallPhase::Ending => None,
        CallPhase::AcquiringMedia
        | CallPhase::AwaitingAnswer
        | CallPhase::AwaitingOffer
        | CallPhase::Negotiating => Some(CallStatusEvent::Connecting),
        CallPhase::Connected => Some(CallStatusEvent::Connected),
        CallPhase::Ended => Some(CallStatusEvent::Ended {
            reason: snapshot
                .end_reason
                .clone()
                .unwrap_or_else(|| HANGUP_REASON_USER.to_string()),
        }),
        CallPhase::Failed => {
            let err = snapshot
                .last_error
                .clone()
                .unwrap_or(CallError::ConnectivityLost);
            Some(CallStatusEvent::Error {
                message: err.user_message().to_string(),
                retryable: err.is_retryable(),
            })
        }
    }
}

async fn forward_status(
    chat_id: String,
    mut rx: watch::Receiver<CallSnapshot>,
    notifier: Arc<dyn CallNotifier>,
) {
    let mut last: Option<CallStatusEvent> = None;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(event) = status_event(&snapshot) {
            if last.as_ref() != Some(&event) {
                notifier.notify(&chat_id, event.clone());
                last = Some(event);
            }
        }
        if snapshot.phase.is_terminal() {
            return;
        }
        if rx.changed().await.is_err() {
            let snapshot = rx.borrow().clone();
            if let Some(event) = status_event(&snapshot) {
                if snapshot.phase.is_terminal() && last.as_ref() != Some(&event) {
                    notifier.notify(&chat_id, event);
                }
            }
            return;
        }
    }
}

/// Forwards relay messages to the watcher. Hangups addressed to `local` are
/// recorded on arrival so calls already handed out observe the cancellation.
async fn read_incoming(
    mut subscription: SignalSubscription,
    local: String,
    ended: EndedCalls,
    inbox: mpsc::UnboundedSender<String>,
) {
    while let Some(raw) = subscription.recv().await {
        if let Some(msg) = SignalingMessage::decode(&raw) {
            if let (Some(id), SignalPayload::Hangup { reason }) = (&msg.session_id, &msg.payload) {
                if msg.to == local {
                    tracing::debug!(session_id = %id, %reason, "caller hung up");
                    lock_ended(&ended).insert(id.clone());
                }
            }
        }
        if inbox.send(raw).is_err() {
            return;
        }
    }
}

/// Yields incoming calls for one chat. Unsubscribes on drop.
pub struct IncomingCallWatcher {
    chat_id: String,
    local_participant_id: String,
    transport: Arc<dyn SignalingTransport>,
    subscription_id: SubscriptionId,
    inbox: mpsc::UnboundedReceiver<String>,
    /// Messages read ahead while collecting a call's trailing signals.
    backlog: VecDeque<String>,
    announced: HashSet<CallId>,
    ended: EndedCalls,
    reader: JoinHandle<()>,
}

impl IncomingCallWatcher {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Waits for the next Offer addressed to the local participant. Repeated
    /// Offers for an already announced session, and Offers the caller has
    /// since hung up, are skipped. `None` once the subscription closes.
    pub async fn next(&mut self) -> Option<IncomingCall> {
        loop {
            let raw = match self.backlog.pop_front() {
                Some(raw) => raw,
                None => self.inbox.recv().await?,
            };
            let Some(msg) = SignalingMessage::decode(&raw) else {
                continue;
            };
            if msg.to != self.local_participant_id {
                continue;
            }
            let (Some(session_id), SignalPayload::Offer(offer)) = (&msg.session_id, &msg.payload)
            else {
                continue;
            };
            if !self.announced.insert(session_id.clone()) {
                continue;
            }
            if lock_ended(&self.ended).contains(session_id) {
                tracing::debug!(session_id = %session_id, "skipping offer the caller already hung up");
                continue;
            }

            while let Ok(raw) = self.inbox.try_recv() {
                self.backlog.push_back(raw);
            }
            let local = &self.local_participant_id;
            let (trailing, rest): (VecDeque<String>, VecDeque<String>) =
                std::mem::take(&mut self.backlog)
                    .into_iter()
                    .partition(|raw| {
                        SignalingMessage::decode(raw).is_some_and(|m| {
                            m.session_id.as_ref() == Some(session_id) && &m.to == local
                        })
                    });
            self.backlog = rest;
            let mut signals = vec![raw];
            signals.extend(trailing);

            let kind = if offer.has_video() {
                CallKind::Video
            } else {
                CallKind::Audio
            };
            tracing::info!(chat_id = %self.chat_id, from = %msg.from, session_id = %session_id, ?kind, "incoming call");
            return Some(IncomingCall {
                chat_id: self.chat_id.clone(),
                session_id: session_id.clone(),
                from: msg.from.clone(),
                kind,
                signals,
                ended: Arc::clone(&self.ended),
            });
        }
    }
}

impl Drop for IncomingCallWatcher {
    fn drop(&mut self) {
        self.reader.abort();
        self.transport.unsubscribe(self.subscription_id);
    }
}
