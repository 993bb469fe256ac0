pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod media;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::RtcTransport;
pub use data_channel::{AppChannel, RtcDataChannel};
pub use media::{MediaConstraints, MediaSource, MediaStream, MediaTrack, PlaceholderMedia};
pub use state::{Action, ActionKind, ConnectionContext, ConnectionStore};
pub use transport::{
    DataChannelEvent, DataChannelTransport, PeerTransport, Subscription, TrackSender,
    TransportEvent,
};
pub use types::{
    AppMessage, CandidateRecord, ConnectionStatus, MediaKind, NegotiationPhase, Role, SdpKind,
    SessionDescription, SessionRecord, SessionUpdate,
};
