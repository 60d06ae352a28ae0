//! Serialized driver for one [`CallSession`].
//!
//! One tokio task owns the session, its media endpoint, connection and topic
//! subscription. User commands, relay deliveries, media events and timer
//! expiries all reach it through channels, so only one transition is ever in
//! flight. Callers interact through a cloneable [`CallSessionHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use super::{Admission, CallPhase, CallRole, CallSession, CallSnapshot, CandidateDisposition, PhaseEvent};
use crate::config::CallConfig;
use crate::error::{CallError, MediaError, RelayError};
use crate::media::{
    ConnectionHandle, IceCandidate, LocalTrack, MediaEndpoint, MediaEvent, SessionDescription,
    TrackKind,
};
use crate::relay::{topic_key, SignalSubscription, SignalingTransport};
use crate::signal::{
    SignalPayload, SignalingMessage, HANGUP_REASON_NO_ANSWER, HANGUP_REASON_TIMEOUT,
    HANGUP_REASON_USER,
};

/// Collaborators a session drives. The media endpoint is exclusive to the
/// session; the transport is shared.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaEndpoint>,
    pub config: CallConfig,
}

#[derive(Debug)]
enum SessionCommand {
    Start,
    HangUp { reason: String },
    SetMuted(bool),
}

/// Results of work the actor handed off to spawned tasks.
#[derive(Debug)]
enum Internal {
    MediaAcquired(Result<Vec<LocalTrack>, MediaError>),
    SubscriptionReady(Result<(), RelayError>),
    SendOffer { retry: bool },
    /// Deadline for reaching Connected, armed once media is granted.
    NegotiationTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferState {
    NotSent,
    AwaitingRetry,
    Delivered,
    /// Nobody was listening twice; resent when the peer announces Ready.
    Parked,
}

#[derive(Debug, Clone)]
pub struct CallSessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallSessionHandle {
    /// Requests local capture and begins negotiation. Ignored unless Idle.
    pub fn start(&self) {
        let _ = self.commands.send(SessionCommand::Start);
    }

    /// Ends the call and returns once the session is terminal. Safe to call
    /// repeatedly and after the session already finished.
    pub async fn hang_up(&self) -> CallSnapshot {
        self.hang_up_with_reason(HANGUP_REASON_USER).await
    }

    pub async fn hang_up_with_reason(&self, reason: &str) -> CallSnapshot {
        let _ = self.commands.send(SessionCommand::HangUp {
            reason: reason.to_string(),
        });
        self.wait_for_phase(CallPhase::is_terminal).await
    }

    /// Local only: toggles outbound audio, nothing is signaled.
    pub fn set_muted(&self, muted: bool) {
        let _ = self.commands.send(SessionCommand::SetMuted(muted));
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.snapshot.borrow().phase
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until the phase satisfies `pred`. If the session task is gone
    /// the last published snapshot is returned.
    pub async fn wait_for_phase(&self, mut pred: impl FnMut(CallPhase) -> bool) -> CallSnapshot {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|s| pred(s.phase)).await.map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        }
    }
}

/// Spawns the actor for `session` on the current tokio runtime.
///
/// `initial_signals` are raw relay messages that arrived before the session
/// existed (an incoming Offer and anything trailing it); they are processed
/// once the session is subscribed.
pub fn spawn_session(
    session: CallSession,
    deps: SessionDeps,
    initial_signals: Vec<String>,
) -> Result<CallSessionHandle, CallError> {
    let topic = topic_key(&deps.config.topic_prefix, session.chat_id())?;
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

    let span = tracing::info_span!(
        "call_session",
        session_id = session.session_id().map(|id| id.as_str()).unwrap_or("-"),
        chat_id = %session.chat_id(),
        role = session.role().as_str(),
        from = %session.local_participant_id(),
        to = %session.remote_participant_id(),
    );

    let actor = SessionActor {
        session,
        deps,
        topic,
        internal_tx,
        snapshot_tx,
        commands: Some(command_rx),
        signals: None,
        media_rx: None,
        tracks: Vec::new(),
        connection: None,
        acquiring: false,
        released: false,
        local_offer: None,
        offer_state: OfferState::NotSent,
        local_candidates: Vec::new(),
        initial_signals,
    };
    tokio::spawn(actor.run(internal_rx).instrument(span));

    Ok(CallSessionHandle {
        commands: command_tx,
        snapshot: snapshot_rx,
    })
}

struct SessionActor {
    session: CallSession,
    deps: SessionDeps,
    topic: String,
    internal_tx: mpsc::UnboundedSender<Internal>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    commands: Option<mpsc::UnboundedReceiver<SessionCommand>>,
    signals: Option<SignalSubscription>,
    media_rx: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    tracks: Vec<LocalTrack>,
    connection: Option<ConnectionHandle>,
    acquiring: bool,
    released: bool,
    local_offer: Option<SessionDescription>,
    offer_state: OfferState,
    local_candidates: Vec<IceCandidate>,
    initial_signals: Vec<String>,
}

async fn next_command(
    rx: &mut Option<mpsc::UnboundedReceiver<SessionCommand>>,
) -> Option<SessionCommand> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_signal(sub: &mut Option<SignalSubscription>) -> Option<String> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_media_event(rx: &mut Option<mpsc::UnboundedReceiver<MediaEvent>>) -> Option<MediaEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self, mut internal_rx: mpsc::UnboundedReceiver<Internal>) {
        loop {
            if self.session.phase().is_terminal() && !self.acquiring {
                break;
            }
            tokio::select! {
                cmd = next_command(&mut self.commands) => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.commands = None;
                        if !self.session.phase().is_terminal() {
                            tracing::debug!("all call handles dropped, hanging up");
                            self.hang_up_locally(HANGUP_REASON_USER.to_string()).await;
                        }
                    }
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
                raw = next_signal(&mut self.signals) => match raw {
                    Some(raw) => self.handle_raw_signal(&raw).await,
                    None => {
                        tracing::warn!(topic = %self.topic, "signaling subscription closed");
                        self.signals = None;
                    }
                },
                event = next_media_event(&mut self.media_rx) => match event {
                    Some(event) => self.handle_media_event(event).await,
                    None => self.media_rx = None,
                },
            }
            self.publish_snapshot();
        }
        self.release().await;
        self.publish_snapshot();
        tracing::debug!(phase = self.session.phase().as_str(), "call session task finished");
    }

    fn publish_snapshot(&self) {
        let next = self.session.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn transition(&mut self, event: PhaseEvent) -> bool {
        match self.session.apply(event) {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(%err, "ignored transition");
                false
            }
        }
    }

    fn schedule(&self, delay: Duration, event: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Start => self.start(),
            SessionCommand::HangUp { reason } => {
                if self.session.phase().is_terminal() {
                    tracing::debug!(err = %CallError::DoubleInvocation, "hang up ignored");
                    return;
                }
                self.hang_up_locally(reason).await;
            }
            SessionCommand::SetMuted(muted) => {
                self.session.set_muted(muted);
                self.apply_mute();
            }
        }
    }

    fn start(&mut self) {
        if !self.transition(PhaseEvent::Start) {
            return;
        }
        self.acquiring = true;
        let media = Arc::clone(&self.deps.media);
        let constraints = self.session.kind().constraints();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let res = media.acquire_local_media(constraints).await;
            let _ = tx.send(Internal::MediaAcquired(res));
        });
    }

    fn apply_mute(&self) {
        let enabled = !self.session.muted();
        for track in self.tracks.iter().filter(|t| t.kind == TrackKind::Audio) {
            self.deps.media.set_track_enabled(track, enabled);
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::MediaAcquired(res) => {
                self.acquiring = false;
                self.on_media_acquired(res).await;
            }
            Internal::SubscriptionReady(res) => self.on_subscription_ready(res).await,
            Internal::SendOffer { retry } => {
                if self.session.phase() != CallPhase::AwaitingAnswer {
                    return;
                }
                let expected = if retry {
                    OfferState::AwaitingRetry
                } else {
                    OfferState::NotSent
                };
                if self.offer_state == expected {
                    self.send_offer(retry).await;
                }
            }
            Internal::NegotiationTimeout => match (self.session.role(), self.session.phase()) {
                (CallRole::Initiator, CallPhase::AwaitingAnswer) => {
                    self.send_hangup(HANGUP_REASON_NO_ANSWER).await;
                    self.fail(CallError::NoAnswer).await;
                }
                (_, CallPhase::AwaitingOffer | CallPhase::Negotiating) => {
                    if self.session.session_id().is_some() {
                        self.send_hangup(HANGUP_REASON_TIMEOUT).await;
                    }
                    self.fail(CallError::NegotiationTimeout).await;
                }
                _ => {}
            },
        }
    }

    async fn on_media_acquired(&mut self, res: Result<Vec<LocalTrack>, MediaError>) {
        let tracks = match res {
            Ok(tracks) => tracks,
            Err(err) => {
                if !self.session.phase().is_terminal() {
                    self.fail(err.into()).await;
                }
                return;
            }
        };
        if self.session.phase() != CallPhase::AcquiringMedia {
            tracing::debug!(count = tracks.len(), "stopping tracks acquired after teardown");
            for track in &tracks {
                self.deps.media.stop_track(track);
            }
            return;
        }
        self.tracks = tracks;
        self.apply_mute();

        if let Err(err) = self.open_connection().await {
            self.fail(err).await;
            return;
        }
        self.transition(PhaseEvent::MediaGranted);

        let mut subscription = match self
            .deps
            .transport
            .subscribe(&self.topic, self.session.local_participant_id())
            .await
        {
            Ok(sub) => sub,
            Err(err) => {
                self.fail(err.into()).await;
                return;
            }
        };
        let ready = subscription.take_ready();
        let timeout = self.deps.config.subscribe_timeout();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let res = ready.wait(timeout).await;
            let _ = tx.send(Internal::SubscriptionReady(res));
        });
        self.signals = Some(subscription);

        self.schedule(
            self.deps.config.answer_timeout(),
            Internal::NegotiationTimeout,
        );
        for raw in std::mem::take(&mut self.initial_signals) {
            self.handle_raw_signal(&raw).await;
        }
    }

    async fn open_connection(&mut self) -> Result<(), CallError> {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let conn = self
            .deps
            .media
            .create_connection(&self.deps.config.ice_servers, media_tx)
            .await?;
        self.connection = Some(conn);
        self.media_rx = Some(media_rx);
        for track in &self.tracks {
            self.deps.media.add_local_track(conn, track).await?;
        }
        Ok(())
    }

    async fn on_subscription_ready(&mut self, res: Result<(), RelayError>) {
        if let Err(err) = res {
            if !self.session.phase().is_terminal() {
                self.fail(err.into()).await;
            }
            return;
        }
        tracing::debug!(topic = %self.topic, "signaling subscription ready");
        match (self.session.role(), self.session.phase()) {
            (CallRole::Initiator, CallPhase::AwaitingAnswer) => {
                self.schedule(
                    self.deps.config.settle_delay(),
                    Internal::SendOffer { retry: false },
                );
            }
            (CallRole::Responder, phase) if !phase.is_terminal() => {
                if let Err(err) = self.publish_signal(SignalPayload::Ready).await {
                    tracing::warn!(%err, "failed to announce readiness");
                }
            }
            _ => {}
        }
    }

    async fn local_offer(&mut self) -> Result<SessionDescription, CallError> {
        if let Some(offer) = &self.local_offer {
            return Ok(offer.clone());
        }
        let conn = self.connection.ok_or(MediaError::NoConnection)?;
        let offer = self.deps.media.create_offer(conn).await?;
        self.deps.media.set_local_description(conn, &offer).await?;
        self.local_offer = Some(offer.clone());
        Ok(offer)
    }

    async fn send_offer(&mut self, retry: bool) {
        let offer = match self.local_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.fail(err).await;
                return;
            }
        };
        match self.publish_signal(SignalPayload::Offer(offer)).await {
            Ok(0) if !retry => {
                tracing::warn!("offer reached no subscriber, retrying");
                self.offer_state = OfferState::AwaitingRetry;
                self.schedule(
                    self.deps.config.offer_retry_delay(),
                    Internal::SendOffer { retry: true },
                );
            }
            Ok(0) => {
                tracing::warn!("offer retry reached no subscriber, waiting for peer");
                self.offer_state = OfferState::Parked;
            }
            Ok(_) => self.offer_state = OfferState::Delivered,
            Err(err) if !retry => {
                tracing::warn!(%err, "offer send failed, retrying");
                self.offer_state = OfferState::AwaitingRetry;
                self.schedule(
                    self.deps.config.offer_retry_delay(),
                    Internal::SendOffer { retry: true },
                );
            }
            Err(err) => self.fail(err).await,
        }
    }

    /// The peer just subscribed: repeat the Offer and every local candidate
    /// gathered so far.
    async fn resend_offer(&mut self) {
        let offer = match self.local_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                self.fail(err).await;
                return;
            }
        };
        match self.publish_signal(SignalPayload::Offer(offer)).await {
            Ok(0) => tracing::warn!("resent offer reached no subscriber"),
            Ok(_) => self.offer_state = OfferState::Delivered,
            Err(err) => {
                tracing::warn!(%err, "offer resend failed");
                return;
            }
        }
        self.resend_local_candidates().await;
    }

    async fn resend_local_candidates(&self) {
        for candidate in &self.local_candidates {
            let payload = SignalPayload::Candidate(candidate.clone());
            if let Err(err) = self.publish_signal(payload).await {
                tracing::warn!(%err, "candidate resend failed");
            }
        }
    }

    /// Publishes a signal tagged with this session and addressed to the peer.
    /// Returns the delivered count.
    async fn publish_signal(&self, payload: SignalPayload) -> Result<usize, CallError> {
        let msg = SignalingMessage::new(
            self.session.session_id().cloned(),
            self.session.local_participant_id(),
            self.session.remote_participant_id(),
            payload,
        );
        let kind = msg.kind();
        let encoded = msg
            .encode()
            .map_err(|err| CallError::SignalingSendFailed(err.to_string()))?;
        let delivered = self
            .deps
            .transport
            .publish(&self.topic, self.session.local_participant_id(), encoded)
            .await
            .map_err(|err| {
                tracing::warn!(?kind, %err, "signal send failed");
                CallError::from(err)
            })?;
        if delivered == 0 {
            tracing::debug!(?kind, topic = %self.topic, "signal reached no subscriber");
        }
        Ok(delivered)
    }

    async fn handle_raw_signal(&mut self, raw: &str) {
        let Some(msg) = SignalingMessage::decode(raw) else {
            tracing::debug!("dropping malformed signal");
            return;
        };
        match self.session.admit(&msg) {
            Admission::Process => {}
            Admission::Held => {
                if let (Some(id), SignalPayload::Candidate(candidate)) = (msg.session_id, msg.payload) {
                    self.session.hold_candidate(id, candidate);
                }
                return;
            }
            other => {
                tracing::debug!(
                    kind = ?msg.kind(),
                    from = %msg.from,
                    to = %msg.to,
                    admission = ?other,
                    "dropping signal"
                );
                return;
            }
        }

        let phase = self.session.phase();
        let role = self.session.role();
        match msg.payload {
            SignalPayload::Offer(offer) => {
                if role == CallRole::Responder && phase == CallPhase::AwaitingOffer {
                    self.accept_offer(offer).await;
                } else {
                    tracing::debug!(phase = phase.as_str(), "ignoring offer");
                }
            }
            SignalPayload::Answer(answer) => {
                if role == CallRole::Initiator && phase == CallPhase::AwaitingAnswer {
                    self.accept_answer(answer).await;
                } else {
                    tracing::debug!(phase = phase.as_str(), "ignoring answer");
                }
            }
            SignalPayload::Candidate(candidate) => self.on_remote_candidate(candidate).await,
            SignalPayload::Hangup { reason } => {
                tracing::info!(%reason, "peer hung up");
                if self.transition(PhaseEvent::BeginEnding { reason }) {
                    self.release().await;
                    self.transition(PhaseEvent::FinishEnding);
                }
            }
            SignalPayload::Ready if role == CallRole::Initiator => match phase {
                CallPhase::AwaitingAnswer => {
                    tracing::debug!("peer ready, resending offer");
                    self.resend_offer().await;
                }
                CallPhase::Negotiating => self.resend_local_candidates().await,
                _ => {}
            },
            SignalPayload::Ready => tracing::debug!("ignoring ready from initiator"),
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription) {
        if !self.transition(PhaseEvent::OfferReceived) {
            return;
        }
        if let Err(err) = self.apply_remote_description(&offer).await {
            self.fail(err).await;
            return;
        }
        let answer = match self.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.fail(err).await;
                return;
            }
        };
        match self.publish_signal(SignalPayload::Answer(answer)).await {
            Ok(0) => tracing::warn!("answer reached no subscriber"),
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "answer send failed"),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let conn = self.connection.ok_or(MediaError::NoConnection)?;
        let answer = self.deps.media.create_answer(conn).await?;
        self.deps.media.set_local_description(conn, &answer).await?;
        Ok(answer)
    }

    async fn accept_answer(&mut self, answer: SessionDescription) {
        if !self.transition(PhaseEvent::AnswerReceived) {
            return;
        }
        self.offer_state = OfferState::Delivered;
        if let Err(err) = self.apply_remote_description(&answer).await {
            self.fail(err).await;
        }
    }

    async fn apply_remote_description(&mut self, desc: &SessionDescription) -> Result<(), CallError> {
        let conn = self.connection.ok_or(MediaError::NoConnection)?;
        self.deps.media.set_remote_description(conn, desc).await?;
        let pending = self.session.remote_description_applied();
        self.apply_candidates(conn, pending).await;
        Ok(())
    }

    async fn apply_candidates(&self, conn: ConnectionHandle, candidates: Vec<IceCandidate>) {
        if !candidates.is_empty() {
            tracing::debug!(count = candidates.len(), "applying buffered candidates");
        }
        for candidate in candidates {
            if let Err(err) = self.deps.media.add_remote_candidate(conn, &candidate).await {
                tracing::warn!(%err, "failed to apply remote candidate");
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let phase = self.session.phase();
        if !matches!(
            phase,
            CallPhase::AwaitingOffer
                | CallPhase::AwaitingAnswer
                | CallPhase::Negotiating
                | CallPhase::Connected
        ) {
            tracing::debug!(phase = phase.as_str(), "ignoring candidate");
            return;
        }
        match self.session.receive_candidate(candidate.clone()) {
            CandidateDisposition::Apply => {
                if let Some(conn) = self.connection {
                    self.apply_candidates(conn, vec![candidate]).await;
                }
            }
            CandidateDisposition::Buffered => {
                tracing::debug!(
                    pending = self.session.pending_remote_candidates().len(),
                    "buffered remote candidate"
                );
            }
            CandidateDisposition::Duplicate => tracing::debug!("duplicate remote candidate"),
        }
    }

    async fn handle_media_event(&mut self, event: MediaEvent) {
        if self.session.phase().is_terminal() {
            return;
        }
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                self.local_candidates.push(candidate.clone());
                if let Err(err) = self.publish_signal(SignalPayload::Candidate(candidate)).await {
                    tracing::warn!(%err, "candidate send failed");
                }
            }
            MediaEvent::ConnectivityChanged(state) => {
                tracing::debug!(?state, "connectivity changed");
                let phase = self.session.phase();
                if state == crate::media::ConnectivityState::Connected
                    && phase == CallPhase::Negotiating
                {
                    self.transition(PhaseEvent::ConnectivityConnected);
                    if let Some(conn) = self.connection {
                        let pending = self.session.remote_description_applied();
                        self.apply_candidates(conn, pending).await;
                    }
                } else if state.is_lost()
                    && matches!(phase, CallPhase::Negotiating | CallPhase::Connected)
                {
                    self.fail(CallError::ConnectivityLost).await;
                }
            }
            MediaEvent::RemoteTrack(track) => {
                tracing::debug!(track = %track.id, kind = ?track.kind, "remote track");
                self.session.record_remote_track();
            }
        }
    }

    async fn hang_up_locally(&mut self, reason: String) {
        // Nothing was offered or subscribed before start.
        let announce = self.session.phase() != CallPhase::Idle;
        if !self.transition(PhaseEvent::BeginEnding {
            reason: reason.clone(),
        }) {
            return;
        }
        if announce {
            self.send_hangup(&reason).await;
        }
        self.release().await;
        self.transition(PhaseEvent::FinishEnding);
    }

    async fn send_hangup(&self, reason: &str) {
        let payload = SignalPayload::Hangup {
            reason: reason.to_string(),
        };
        if let Err(err) = self.publish_signal(payload).await {
            tracing::warn!(%err, "hangup send failed");
        }
    }

    async fn fail(&mut self, err: CallError) {
        tracing::warn!(%err, "call failed");
        if self.transition(PhaseEvent::Fail(err)) {
            self.release().await;
        }
    }

    /// Stops capture, closes the connection and leaves the topic. Runs once.
    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for track in self.tracks.drain(..) {
            self.deps.media.stop_track(&track);
        }
        if let Some(conn) = self.connection.take() {
            self.deps.media.close_connection(conn).await;
        }
        if let Some(sub) = self.signals.take() {
            self.deps.transport.unsubscribe(sub.id());
        }
        self.media_rx = None;
        tracing::debug!("call resources released");
    }
}
