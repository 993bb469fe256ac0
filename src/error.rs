use thiserror::Error;

/// Failures reported by a signaling backend.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("record {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("signaling backend error: {0}")]
    Backend(String),
}

/// Failures reported by the peer transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("unsupported sdp type `{0}`")]
    UnsupportedSdpType(String),
    #[error("no remote description set")]
    NoRemoteDescription,
    #[error("transport events were already taken")]
    EventsTaken,
    #[error("transport closed")]
    Closed,
    #[error("cannot write samples into remote track {0}")]
    RemoteTrack(String),
}

/// Local media acquisition failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("media capture permission denied")]
    Denied,
    #[error("media device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ice server url cannot be empty")]
    EmptyUrl,
    #[error("turn server {0} requires username and credential")]
    MissingTurnCredentials(String),
    #[error("renegotiation bound must be at least 1")]
    InvalidBound,
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by the public session entry points.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session record {session_id} has no offer")]
    MissingOffer { session_id: String },
    #[error("session record {session_id} does not exist")]
    RecordNotFound { session_id: String },
    #[error("session already started as {0}")]
    AlreadyStarted(String),
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type SignalResult<T> = Result<T, SignalError>;
