use crate::error::TransportError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpKind::Offer => "offer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Session description as stored in the session record: `{ type, sdp }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = TransportError;

    fn try_from(desc: RTCSessionDescription) -> Result<Self, Self::Error> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            RTCSdpType::Unspecified => {
                return Err(TransportError::UnsupportedSdpType("unspecified".into()))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp,
        })
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = TransportError;

    fn try_from(desc: SessionDescription) -> Result<Self, Self::Error> {
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpKind::Rollback => {
                return Err(TransportError::UnsupportedSdpType(desc.kind.to_string()))
            }
        };
        parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }
}

/// The shared document both peers use to exchange one offer and one answer.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStage {
    Empty,
    Offered,
    Answered,
}

impl SessionRecord {
    pub fn stage(&self) -> RecordStage {
        match (&self.offer, &self.answer) {
            (_, Some(_)) => RecordStage::Answered,
            (Some(_), None) => RecordStage::Offered,
            (None, None) => RecordStage::Empty,
        }
    }

    pub fn apply(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Offer(desc) => self.offer = Some(desc),
            SessionUpdate::Answer(desc) => self.answer = Some(desc),
        }
    }
}

/// Partial write merged into a session record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionUpdate {
    Offer(SessionDescription),
    Answer(SessionDescription),
}

impl SessionUpdate {
    pub fn field(&self) -> &'static str {
        match self {
            SessionUpdate::Offer(_) => "offer",
            SessionUpdate::Answer(_) => "answer",
        }
    }
}

/// One trickled ICE candidate, in the browser `toJSON()` shape plus the
/// parsed attributes when the producer has them.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foundation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl From<RTCPeerConnectionState> for ConnectionStatus {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Joiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => f.write_str("caller"),
            Role::Joiner => f.write_str("joiner"),
        }
    }
}

/// Lifecycle of one negotiation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    Created { has_local_description: bool },
    OfferSent,
    Answered,
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl NegotiationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationPhase::Closed | NegotiationPhase::Failed)
    }

    /// Phase reached when the transport reports `status`, if it moves at all.
    pub fn on_status(self, status: ConnectionStatus) -> Self {
        if self.is_terminal() {
            return self;
        }
        match status {
            ConnectionStatus::New => self,
            ConnectionStatus::Connecting => NegotiationPhase::Connecting,
            ConnectionStatus::Connected => NegotiationPhase::Connected,
            ConnectionStatus::Disconnected => NegotiationPhase::Disconnected,
            ConnectionStatus::Closed => NegotiationPhase::Closed,
            ConnectionStatus::Failed => NegotiationPhase::Failed,
        }
    }
}

/// Envelope of every application message sent over the data channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AppMessage {
    #[serde(rename_all = "camelCase")]
    TrackReplaced { kind: MediaKind, track_id: String },
    Presence { at: DateTime<Utc> },
    Chat { text: String },
    Custom { payload: serde_json::Value },
}

impl AppMessage {
    pub fn presence_now() -> Self {
        AppMessage::Presence { at: Utc::now() }
    }
}
