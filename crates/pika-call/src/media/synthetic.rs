//! Deterministic in-process media endpoint.
//!
//! Produces fake descriptions and host candidates, and optionally reports the
//! connection as connected once both descriptions are in place. Used for
//! headless runs and tests; every call is recorded on a [`SyntheticProbe`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ConnectionHandle, ConnectivityState, IceCandidate, IceServer, LocalTrack, MediaConstraints,
    MediaEndpoint, MediaEndpointFactory, MediaEvent, MediaEventSender, RemoteTrack,
    SessionDescription, TrackKind,
};
use crate::error::MediaError;

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct SyntheticOptions {
    /// Refuse capture as if the user denied the permission prompt.
    pub deny_capture: bool,
    pub capture_delay: Option<Duration>,
    /// Report `Connected` once local and remote descriptions are both set.
    pub auto_connect: bool,
    /// Host candidates emitted after the local description is set.
    pub candidates_per_description: usize,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        Self {
            deny_capture: false,
            capture_delay: None,
            auto_connect: true,
            candidates_per_description: 2,
        }
    }
}

#[derive(Debug, Default)]
struct SyntheticState {
    captured: Vec<LocalTrack>,
    stopped: Vec<LocalTrack>,
    disabled: Vec<LocalTrack>,
    connection: Option<ConnectionHandle>,
    events: Option<MediaEventSender>,
    attached: Vec<LocalTrack>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    offers_created: usize,
    answers_created: usize,
    closed: usize,
    connected_reported: bool,
}

/// Read-only view of a synthetic endpoint plus a hook to inject events.
#[derive(Debug, Clone)]
pub struct SyntheticProbe {
    label: String,
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticProbe {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn captured_tracks(&self) -> Vec<LocalTrack> {
        self.lock().captured.clone()
    }

    pub fn stopped_tracks(&self) -> Vec<LocalTrack> {
        self.lock().stopped.clone()
    }

    pub fn disabled_tracks(&self) -> Vec<LocalTrack> {
        self.lock().disabled.clone()
    }

    pub fn attached_tracks(&self) -> Vec<LocalTrack> {
        self.lock().attached.clone()
    }

    pub fn has_connection(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub fn close_count(&self) -> usize {
        self.lock().closed
    }

    pub fn offers_created(&self) -> usize {
        self.lock().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.lock().answers_created
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote_description.clone()
    }

    pub fn applied_remote_candidates(&self) -> Vec<IceCandidate> {
        self.lock().remote_candidates.clone()
    }

    /// Pushes a media event as if the underlying connection reported it.
    /// Returns `false` when no connection is listening.
    pub fn emit(&self, event: MediaEvent) -> bool {
        let sender = self.lock().events.clone();
        sender.map(|tx| tx.send(event).is_ok()).unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyntheticState> {
        self.state.lock().expect("synthetic media state poisoned")
    }
}

#[derive(Debug)]
pub struct SyntheticEndpoint {
    options: SyntheticOptions,
    probe: SyntheticProbe,
    next_candidate: AtomicU64,
}

impl SyntheticEndpoint {
    pub fn new(options: SyntheticOptions) -> Self {
        let n = NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed);
        Self {
            options,
            probe: SyntheticProbe {
                label: format!("synthetic-{n}"),
                state: Arc::new(Mutex::new(SyntheticState::default())),
            },
            next_candidate: AtomicU64::new(0),
        }
    }

    pub fn probe(&self) -> SyntheticProbe {
        self.probe.clone()
    }

    fn ensure_connection(&self, conn: ConnectionHandle) -> Result<(), MediaError> {
        match self.probe.lock().connection {
            Some(current) if current == conn => Ok(()),
            Some(_) => Err(MediaError::Failed("unknown connection handle".to_string())),
            None => Err(MediaError::NoConnection),
        }
    }

    fn describe(&self, kind: &str) -> String {
        let state = self.probe.lock();
        let mut sdp = format!(
            "v=0\r\no={} 0 0 IN IP4 127.0.0.1\r\ns={kind}\r\nt=0 0\r\n",
            self.probe.label
        );
        for track in &state.attached {
            match track.kind {
                TrackKind::Audio => sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
                TrackKind::Video => sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"),
            }
        }
        sdp
    }

    fn host_candidate(&self) -> IceCandidate {
        let n = self.next_candidate.fetch_add(1, Ordering::Relaxed);
        IceCandidate {
            candidate: format!(
                "candidate:{n} 1 udp 2122260223 10.0.0.{} {} typ host",
                n % 250 + 1,
                40_000 + n
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn maybe_report_connected(&self) {
        if !self.options.auto_connect {
            return;
        }
        let (events, remote_kinds) = {
            let mut state = self.probe.lock();
            if state.connected_reported
                || state.local_description.is_none()
                || state.remote_description.is_none()
            {
                return;
            }
            state.connected_reported = true;
            let has_video = state
                .remote_description
                .as_ref()
                .map(|d| d.has_video())
                .unwrap_or(false);
            let mut kinds = vec![TrackKind::Audio];
            if has_video {
                kinds.push(TrackKind::Video);
            }
            (state.events.clone(), kinds)
        };
        let Some(events) = events else {
            return;
        };
        let _ = events.send(MediaEvent::ConnectivityChanged(ConnectivityState::Checking));
        for (i, kind) in remote_kinds.into_iter().enumerate() {
            let _ = events.send(MediaEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{i}"),
                kind,
            }));
        }
        let _ = events.send(MediaEvent::ConnectivityChanged(ConnectivityState::Connected));
    }
}

#[async_trait]
impl MediaEndpoint for SyntheticEndpoint {
    async fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        if let Some(delay) = self.options.capture_delay {
            tokio::time::sleep(delay).await;
        }
        if self.options.deny_capture {
            return Err(MediaError::PermissionDenied(
                "capture refused by user".to_string(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack {
                id: format!("{}-audio0", self.probe.label),
                kind: TrackKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                id: format!("{}-video0", self.probe.label),
                kind: TrackKind::Video,
            });
        }
        self.probe.lock().captured.extend(tracks.iter().cloned());
        Ok(tracks)
    }

    async fn create_connection(
        &self,
        _ice_servers: &[IceServer],
        events: MediaEventSender,
    ) -> Result<ConnectionHandle, MediaError> {
        let mut state = self.probe.lock();
        if state.connection.is_some() {
            return Err(MediaError::Failed("connection already created".to_string()));
        }
        let handle = ConnectionHandle(1);
        state.connection = Some(handle);
        state.events = Some(events);
        Ok(handle)
    }

    async fn add_local_track(
        &self,
        conn: ConnectionHandle,
        track: &LocalTrack,
    ) -> Result<(), MediaError> {
        self.ensure_connection(conn)?;
        self.probe.lock().attached.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self, conn: ConnectionHandle) -> Result<SessionDescription, MediaError> {
        self.ensure_connection(conn)?;
        let sdp = self.describe("offer");
        self.probe.lock().offers_created += 1;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(
        &self,
        conn: ConnectionHandle,
    ) -> Result<SessionDescription, MediaError> {
        self.ensure_connection(conn)?;
        if self.probe.lock().remote_description.is_none() {
            return Err(MediaError::Failed(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        let sdp = self.describe("answer");
        self.probe.lock().answers_created += 1;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(
        &self,
        conn: ConnectionHandle,
        desc: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.ensure_connection(conn)?;
        let events = {
            let mut state = self.probe.lock();
            state.local_description = Some(desc.clone());
            state.events.clone()
        };
        if let Some(events) = events {
            for _ in 0..self.options.candidates_per_description {
                let _ = events.send(MediaEvent::LocalCandidate(self.host_candidate()));
            }
        }
        self.maybe_report_connected();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        conn: ConnectionHandle,
        desc: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.ensure_connection(conn)?;
        self.probe.lock().remote_description = Some(desc.clone());
        self.maybe_report_connected();
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        conn: ConnectionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        self.ensure_connection(conn)?;
        let mut state = self.probe.lock();
        if state.remote_description.is_none() {
            return Err(MediaError::Failed(
                "remote candidate before remote description".to_string(),
            ));
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn set_track_enabled(&self, track: &LocalTrack, enabled: bool) {
        let mut state = self.probe.lock();
        state.disabled.retain(|t| t != track);
        if !enabled {
            state.disabled.push(track.clone());
        }
    }

    fn stop_track(&self, track: &LocalTrack) {
        let mut state = self.probe.lock();
        if !state.stopped.contains(track) {
            state.stopped.push(track.clone());
        }
    }

    async fn close_connection(&self, conn: ConnectionHandle) {
        let mut state = self.probe.lock();
        if state.connection == Some(conn) {
            state.connection = None;
            state.events = None;
            state.closed += 1;
        }
    }
}

/// Factory that remembers a probe for every endpoint it hands out.
#[derive(Debug, Default)]
pub struct SyntheticMediaFactory {
    options: SyntheticOptions,
    probes: Mutex<Vec<SyntheticProbe>>,
}

impl SyntheticMediaFactory {
    pub fn new(options: SyntheticOptions) -> Self {
        Self {
            options,
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn probes(&self) -> Vec<SyntheticProbe> {
        self.probes
            .lock()
            .expect("synthetic probe list poisoned")
            .clone()
    }

    pub fn last_probe(&self) -> Option<SyntheticProbe> {
        self.probes().pop()
    }
}

impl MediaEndpointFactory for SyntheticMediaFactory {
    fn create_endpoint(&self) -> Arc<dyn MediaEndpoint> {
        let endpoint = SyntheticEndpoint::new(self.options.clone());
        self.probes
            .lock()
            .expect("synthetic probe list poisoned")
            .push(endpoint.probe());
        Arc::new(endpoint)
    }
}
