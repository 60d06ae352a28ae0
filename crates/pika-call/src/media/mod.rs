//! Media endpoint capability consumed by the call session.
//!
//! The session never implements capture, codecs or connectivity itself. It
//! drives one [`MediaEndpoint`] per call through the surface below and reacts
//! to the [`MediaEvent`]s the endpoint reports.

pub mod synthetic;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn constraints(self) -> MediaConstraints {
        match self {
            Self::Audio => MediaConstraints {
                audio: true,
                video: false,
            },
            Self::Video => MediaConstraints {
                audio: true,
                video: true,
            },
        }
    }
}

/// Fixed capture constraint set for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description blob plus its role in the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Whether the description negotiates a video section.
    pub fn has_video(&self) -> bool {
        self.sdp.lines().any(|line| line.starts_with("m=video"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    ConnectivityChanged(ConnectivityState),
    RemoteTrack(RemoteTrack),
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;

/// Capture and peer-connection primitives for a single call.
///
/// An endpoint belongs to exactly one session and is never shared.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError>;

    /// Creates the negotiable connection. Local candidates, connectivity
    /// changes and remote tracks are reported on `events`.
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: MediaEventSender,
    ) -> Result<ConnectionHandle, MediaError>;

    async fn add_local_track(
        &self,
        conn: ConnectionHandle,
        track: &LocalTrack,
    ) -> Result<(), MediaError>;

    async fn create_offer(&self, conn: ConnectionHandle) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self, conn: ConnectionHandle)
        -> Result<SessionDescription, MediaError>;

    async fn set_local_description(
        &self,
        conn: ConnectionHandle,
        desc: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn set_remote_description(
        &self,
        conn: ConnectionHandle,
        desc: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_remote_candidate(
        &self,
        conn: ConnectionHandle,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    /// Enables or disables outbound media on a local track without
    /// renegotiation.
    fn set_track_enabled(&self, track: &LocalTrack, enabled: bool);

    fn stop_track(&self, track: &LocalTrack);

    async fn close_connection(&self, conn: ConnectionHandle);
}

/// Hands out a fresh endpoint for every new session.
pub trait MediaEndpointFactory: Send + Sync {
    fn create_endpoint(&self) -> Arc<dyn MediaEndpoint>;
}
