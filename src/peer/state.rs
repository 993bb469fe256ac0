//! Connection context of one session and the reducer that mutates it.

use crate::error::TransportError;
use crate::peer::media::MediaStream;
use crate::peer::transport::{DataChannelTransport, PeerTransport};
use crate::peer::types::ConnectionStatus;
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Invoked with the latest context once the transport carries the new tracks.
pub type CompletionCallback = Box<dyn FnOnce(ConnectionContext) + Send + 'static>;

#[derive(Clone)]
pub struct ConnectionContext {
    pub peer: Arc<dyn PeerTransport>,
    pub local_stream: Arc<MediaStream>,
    /// Created once with the context; only ever grown.
    pub remote_stream: Arc<MediaStream>,
    pub data_channel: Option<Arc<dyn DataChannelTransport>>,
    pub connection_state: ConnectionStatus,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("local_stream", &self.local_stream.id())
            .field("remote_stream", &self.remote_stream.id())
            .field("data_channel", &self.data_channel.as_ref().map(|dc| dc.label()))
            .field("connection_state", &self.connection_state)
            .finish()
    }
}

pub enum Action {
    SetPeerConnection(Option<Arc<dyn PeerTransport>>),
    SetLocalStream {
        stream: Option<Arc<MediaStream>>,
        on_completed: Option<CompletionCallback>,
    },
    SetRemoteStream(Option<Arc<MediaStream>>),
    SetConnectionState(Option<ConnectionStatus>),
    SetDataChannel(Option<Arc<dyn DataChannelTransport>>),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::SetPeerConnection(_) => ActionKind::SetPeerConnection,
            Action::SetLocalStream { .. } => ActionKind::SetLocalStream,
            Action::SetRemoteStream(_) => ActionKind::SetRemoteStream,
            Action::SetConnectionState(_) => ActionKind::SetConnectionState,
            Action::SetDataChannel(_) => ActionKind::SetDataChannel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    SetPeerConnection,
    SetLocalStream,
    SetRemoteStream,
    SetConnectionState,
    SetDataChannel,
}

impl ActionKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ActionKind::SetPeerConnection => "SET_PC",
            ActionKind::SetLocalStream => "SET_LOCALSTREAM",
            ActionKind::SetRemoteStream => "SET_REMOTESTREAM",
            ActionKind::SetConnectionState => "SET_CONNECTIONSTATE",
            ActionKind::SetDataChannel => "SET_DATACHANNEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action tag `{}`", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for ActionKind {
    type Err = UnknownAction;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        let kind = match tag {
            "SET_PC" => ActionKind::SetPeerConnection,
            "SET_LOCALSTREAM" => ActionKind::SetLocalStream,
            "SET_REMOTESTREAM" => ActionKind::SetRemoteStream,
            "SET_CONNECTIONSTATE" => ActionKind::SetConnectionState,
            "SET_DATACHANNEL" => ActionKind::SetDataChannel,
            other => {
                warn!(tag = other, "tried to dispatch an invalid action");
                return Err(UnknownAction(other.to_owned()));
            }
        };
        Ok(kind)
    }
}

struct ReplaceTracks {
    peer: Arc<dyn PeerTransport>,
    stream: Arc<MediaStream>,
    on_completed: Option<CompletionCallback>,
}

fn empty_payload(kind: ActionKind) {
    warn!(action = kind.tag(), "empty payload passed to reducer");
}

/// Pure transition. The only in-place mutation is growing the existing
/// remote stream, which keeps its identity.
fn reduce(state: &ConnectionContext, action: Action) -> (ConnectionContext, Option<ReplaceTracks>) {
    let kind = action.kind();
    let mut next = state.clone();
    match action {
        Action::SetPeerConnection(Some(peer)) => next.peer = peer,
        Action::SetLocalStream {
            stream: Some(stream),
            on_completed,
        } => {
            next.local_stream = stream.clone();
            let effect = ReplaceTracks {
                peer: next.peer.clone(),
                stream,
                on_completed,
            };
            return (next, Some(effect));
        }
        Action::SetRemoteStream(Some(stream)) => {
            if !Arc::ptr_eq(&stream, &state.remote_stream) {
                for track in stream.tracks() {
                    state.remote_stream.add_track(track);
                }
                debug!(
                    adopted_from = stream.id(),
                    remote_stream = state.remote_stream.id(),
                    "adopted tracks into the existing remote stream"
                );
            }
        }
        Action::SetConnectionState(Some(status)) => next.connection_state = status,
        Action::SetDataChannel(Some(dc)) => next.data_channel = Some(dc),
        _ => {
            empty_payload(kind);
            return (state.clone(), None);
        }
    }
    (next, None)
}

/// Serializes track replacement passes and skips superseded ones, so the
/// last dispatched local stream always wins.
#[derive(Default)]
struct TrackReplacer {
    epoch: AtomicU64,
    gate: tokio::sync::Mutex<()>,
}

impl TrackReplacer {
    async fn run(
        self: Arc<Self>,
        epoch: u64,
        job: ReplaceTracks,
        state: Arc<Mutex<ConnectionContext>>,
    ) {
        let _gate = self.gate.lock().await;
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(epoch, "track replacement superseded before start");
            return;
        }
        if let Err(failed) = replace_tracks(job.peer.as_ref(), &job.stream).await {
            warn!(failed, stream = job.stream.id(), "track replacement failed");
            return;
        }
        if self.epoch.load(Ordering::Acquire) != epoch {
            debug!(epoch, "track replacement superseded, skipping completion");
            return;
        }
        debug!(epoch, stream = job.stream.id(), "local tracks replaced");
        if let Some(on_completed) = job.on_completed {
            let snapshot = state.lock().clone();
            on_completed(snapshot);
        }
    }
}

/// Binds every sender to the stream's track of the same kind, or to nothing
/// when the stream has no such track. All senders are switched concurrently.
/// Returns the number of senders that failed.
pub async fn replace_tracks(peer: &dyn PeerTransport, stream: &MediaStream) -> Result<(), usize> {
    let senders = peer.senders().await;
    let results = join_all(senders.iter().map(|sender| {
        let track = stream.track_of_kind(sender.kind());
        async move {
            let kind = sender.kind();
            sender
                .replace_track(track)
                .await
                .map_err(|e: TransportError| warn!(%kind, error = %e, "replace_track failed"))
        }
    }))
    .await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        Err(failed)
    } else {
        Ok(())
    }
}

pub struct ConnectionStore {
    state: Arc<Mutex<ConnectionContext>>,
    status: watch::Sender<ConnectionStatus>,
    replacer: Arc<TrackReplacer>,
}

impl ConnectionStore {
    pub fn new(peer: Arc<dyn PeerTransport>) -> Self {
        Self::with_local_stream(peer, Arc::new(MediaStream::new()))
    }

    pub fn with_local_stream(peer: Arc<dyn PeerTransport>, local_stream: Arc<MediaStream>) -> Self {
        let context = ConnectionContext {
            peer,
            local_stream,
            remote_stream: Arc::new(MediaStream::new()),
            data_channel: None,
            connection_state: ConnectionStatus::New,
        };
        let (status, _) = watch::channel(context.connection_state);
        Self {
            state: Arc::new(Mutex::new(context)),
            status,
            replacer: Arc::new(TrackReplacer::default()),
        }
    }

    pub fn snapshot(&self) -> ConnectionContext {
        self.state.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionStatus {
        self.state.lock().connection_state
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Applies `action` and returns the resulting context. Never panics; a
    /// `None` payload leaves the state untouched.
    pub fn dispatch(&self, action: Action) -> ConnectionContext {
        let kind = action.kind();
        let (next, effect) = {
            let mut state = self.state.lock();
            let (next, effect) = reduce(&state, action);
            *state = next.clone();
            (next, effect)
        };
        debug!(action = kind.tag(), "dispatched");
        if kind == ActionKind::SetConnectionState {
            self.status.send_replace(next.connection_state);
        }
        if let Some(job) = effect {
            self.schedule_replacement(job);
        }
        next
    }

    fn schedule_replacement(&self, job: ReplaceTracks) {
        let epoch = self.replacer.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.replacer.clone().run(epoch, job, self.state.clone()));
            }
            Err(_) => warn!("no async runtime, local tracks not replaced on the transport"),
        }
    }
}
