//! Call session state.
//!
//! [`CallSession`] is the pure state of one call: phase, role, candidate
//! buffer and timestamps. It performs no I/O. The [`actor`] module drives it
//! from a single task so every transition is serialized.

pub mod actor;

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::error::CallError;
use crate::media::{CallKind, IceCandidate};
use crate::signal::{CallId, SignalKind, SignalingMessage};

pub use actor::{spawn_session, CallSessionHandle, SessionDeps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    /// Placed the call; the only side that ever sends an Offer.
    Initiator,
    Responder,
}

impl CallRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Idle,
    AcquiringMedia,
    AwaitingAnswer,
    AwaitingOffer,
    Negotiating,
    Connected,
    Ending,
    Ended,
    Failed,
}

impl CallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Started and not yet finished.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AcquiringMedia => "acquiring_media",
            Self::AwaitingAnswer => "awaiting_answer",
            Self::AwaitingOffer => "awaiting_offer",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }
}

/// Inputs that move a session between phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    MediaGranted,
    OfferReceived,
    AnswerReceived,
    ConnectivityConnected,
    BeginEnding { reason: String },
    FinishEnding,
    Fail(CallError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from:?} on {event}")]
pub struct InvalidTransition {
    pub from: CallPhase,
    pub event: String,
}

/// How an inbound signal relates to this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Process,
    /// Addressed to someone else or sent by someone other than the peer.
    NotForUs,
    /// Tagged with another session id.
    Stale,
    /// Candidate for a session id not yet learned; kept until the Offer
    /// reveals whether it belongs to us.
    Held,
    /// Session already finished.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Remote description is in place; apply now.
    Apply,
    Buffered,
    Duplicate,
}

/// Point-in-time view of a session, published to handle holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub session_id: Option<CallId>,
    pub chat_id: String,
    pub local_participant_id: String,
    pub remote_participant_id: String,
    pub role: CallRole,
    pub kind: CallKind,
    pub phase: CallPhase,
    pub muted: bool,
    pub connected_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub pending_candidates: usize,
    pub remote_tracks: usize,
    pub last_error: Option<CallError>,
    pub end_reason: Option<String>,
}

impl CallSnapshot {
    /// Connected time so far, or the final connected time once finished.
    pub fn duration(&self) -> Option<Duration> {
        let connected_at = self.connected_at?;
        let until = self.ended_at.unwrap_or_else(Instant::now);
        Some(until.saturating_duration_since(connected_at))
    }
}

#[derive(Debug)]
pub struct CallSession {
    session_id: Option<CallId>,
    chat_id: String,
    local_participant_id: String,
    remote_participant_id: String,
    role: CallRole,
    kind: CallKind,
    phase: CallPhase,
    pending_remote_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
    unclaimed_candidates: Vec<(CallId, IceCandidate)>,
    remote_description_set: bool,
    muted: bool,
    started_at: Option<Instant>,
    connected_at: Option<Instant>,
    ended_at: Option<Instant>,
    remote_tracks: usize,
    last_error: Option<CallError>,
    end_reason: Option<String>,
}

impl CallSession {
    fn new(
        session_id: Option<CallId>,
        chat_id: String,
        local_participant_id: String,
        remote_participant_id: String,
        role: CallRole,
        kind: CallKind,
    ) -> Self {
        Self {
            session_id,
            chat_id,
            local_participant_id,
            remote_participant_id,
            role,
            kind,
            phase: CallPhase::Idle,
            pending_remote_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            unclaimed_candidates: Vec::new(),
            remote_description_set: false,
            muted: false,
            started_at: None,
            connected_at: None,
            ended_at: None,
            remote_tracks: 0,
            last_error: None,
            end_reason: None,
        }
    }

    pub fn initiator(
        session_id: CallId,
        chat_id: impl Into<String>,
        local: impl Into<String>,
        remote: impl Into<String>,
        kind: CallKind,
    ) -> Self {
        Self::new(
            Some(session_id),
            chat_id.into(),
            local.into(),
            remote.into(),
            CallRole::Initiator,
            kind,
        )
    }

    /// With `session_id == None` the id is adopted from the first Offer
    /// addressed to `local` by `remote`.
    pub fn responder(
        session_id: Option<CallId>,
        chat_id: impl Into<String>,
        local: impl Into<String>,
        remote: impl Into<String>,
        kind: CallKind,
    ) -> Self {
        Self::new(
            session_id,
            chat_id.into(),
            local.into(),
            remote.into(),
            CallRole::Responder,
            kind,
        )
    }

    pub fn session_id(&self) -> Option<&CallId> {
        self.session_id.as_ref()
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn local_participant_id(&self) -> &str {
        &self.local_participant_id
    }

    pub fn remote_participant_id(&self) -> &str {
        &self.remote_participant_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn last_error(&self) -> Option<&CallError> {
        self.last_error.as_ref()
    }

    pub fn end_reason(&self) -> Option<&str> {
        self.end_reason.as_deref()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn pending_remote_candidates(&self) -> &[IceCandidate] {
        &self.pending_remote_candidates
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn record_remote_track(&mut self) {
        self.remote_tracks += 1;
    }

    pub fn apply(&mut self, event: PhaseEvent) -> Result<CallPhase, InvalidTransition> {
        use CallPhase as P;

        let next = match (self.phase, &event) {
            (P::Idle, PhaseEvent::Start) => P::AcquiringMedia,
            (P::AcquiringMedia, PhaseEvent::MediaGranted) => match self.role {
                CallRole::Initiator => P::AwaitingAnswer,
                CallRole::Responder => P::AwaitingOffer,
            },
            (P::AwaitingOffer, PhaseEvent::OfferReceived) if self.role == CallRole::Responder => {
                P::Negotiating
            }
            (P::AwaitingAnswer, PhaseEvent::AnswerReceived)
                if self.role == CallRole::Initiator =>
            {
                P::Negotiating
            }
            (P::Negotiating, PhaseEvent::ConnectivityConnected) => P::Connected,
            (phase, PhaseEvent::BeginEnding { .. })
                if !phase.is_terminal() && phase != P::Ending =>
            {
                P::Ending
            }
            (P::Ending, PhaseEvent::FinishEnding) => P::Ended,
            (phase, PhaseEvent::Fail(_)) if !phase.is_terminal() => P::Failed,
            (from, event) => {
                return Err(InvalidTransition {
                    from,
                    event: format!("{event:?}"),
                });
            }
        };

        let now = Instant::now();
        match event {
            PhaseEvent::Start => self.started_at = Some(now),
            PhaseEvent::ConnectivityConnected => self.connected_at = Some(now),
            PhaseEvent::BeginEnding { reason } => self.end_reason = Some(reason),
            PhaseEvent::Fail(err) => self.last_error = Some(err),
            _ => {}
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }

        let prev = self.phase;
        self.phase = next;
        tracing::info!(
            session_id = self.session_id.as_ref().map(CallId::as_str).unwrap_or("-"),
            chat_id = %self.chat_id,
            role = self.role.as_str(),
            previous = prev.as_str(),
            phase = next.as_str(),
            "call phase transition"
        );
        Ok(next)
    }

    /// Decides whether an inbound signal should be processed. Adopts the
    /// session id from the first Offer when none is known yet.
    pub fn admit(&mut self, msg: &SignalingMessage) -> Admission {
        if msg.to != self.local_participant_id || msg.from != self.remote_participant_id {
            return Admission::NotForUs;
        }
        if self.phase.is_terminal() {
            return Admission::Finished;
        }

        let kind = msg.kind();
        let ours = self.session_id.clone();
        match (ours.as_ref(), msg.session_id.as_ref()) {
            (Some(ours), Some(theirs)) if ours == theirs => Admission::Process,
            (Some(_), Some(_)) => Admission::Stale,
            // A peer that has not learned the id yet can only announce itself.
            (Some(_), None) if kind == SignalKind::Ready => Admission::Process,
            (Some(_), None) => Admission::Stale,
            (None, Some(theirs)) => match kind {
                SignalKind::Offer => {
                    let adopted = theirs.clone();
                    tracing::debug!(session_id = %adopted, chat_id = %self.chat_id, "adopted session id from offer");
                    let (claimed, rest): (Vec<_>, Vec<_>) = std::mem::take(
                        &mut self.unclaimed_candidates,
                    )
                    .into_iter()
                    .partition(|(id, _)| *id == adopted);
                    self.unclaimed_candidates = rest;
                    self.session_id = Some(adopted);
                    for (_, candidate) in claimed {
                        self.receive_candidate(candidate);
                    }
                    Admission::Process
                }
                SignalKind::Candidate => Admission::Held,
                _ => Admission::Stale,
            },
            (None, None) => Admission::Stale,
        }
    }

    /// Keeps a candidate that arrived before its session id was known.
    pub fn hold_candidate(&mut self, session_id: CallId, candidate: IceCandidate) {
        self.unclaimed_candidates.push((session_id, candidate));
    }

    pub fn receive_candidate(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if !self.seen_candidates.insert(candidate.clone()) {
            return CandidateDisposition::Duplicate;
        }
        if self.remote_description_set {
            CandidateDisposition::Apply
        } else {
            self.pending_remote_candidates.push(candidate);
            CandidateDisposition::Buffered
        }
    }

    /// Marks the remote description as applied and returns the buffered
    /// candidates in arrival order. Only the first call returns anything.
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        if self.remote_description_set {
            return Vec::new();
        }
        self.remote_description_set = true;
        std::mem::take(&mut self.pending_remote_candidates)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: self.session_id.clone(),
            chat_id: self.chat_id.clone(),
            local_participant_id: self.local_participant_id.clone(),
            remote_participant_id: self.remote_participant_id.clone(),
            role: self.role,
            kind: self.kind,
            phase: self.phase,
            muted: self.muted,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
            pending_candidates: self.pending_remote_candidates.len(),
            remote_tracks: self.remote_tracks,
            last_error: self.last_error.clone(),
            end_reason: self.end_reason.clone(),
        }
    }
}
