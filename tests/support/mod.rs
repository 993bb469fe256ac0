//! In-process doubles shared by the integration tests: a loopback transport
//! pair and a signaling channel that records writes.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink::error::{ChannelError, TransportError};
use peerlink::peer::{
    CandidateRecord, ConnectionStatus, DataChannelEvent, DataChannelTransport, MediaKind,
    MediaTrack, PeerTransport, SdpKind, SessionDescription, SessionRecord, SessionUpdate,
    TrackSender, TransportEvent,
};
use peerlink::signaling::{AdditionStream, MemoryChannel, RecordStream, SignalingChannel};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Delay between committing a local description and emitting candidates.
pub const GATHERING_DELAY: Duration = Duration::from_millis(20);

pub async fn wait_for<F>(what: &str, mut ready: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_async<F, Fut>(what: &str, mut ready: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if ready().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub struct LoopbackNetwork;

impl LoopbackNetwork {
    /// Two transports wired to each other.
    pub fn pair() -> (Arc<LoopbackPeer>, Arc<LoopbackPeer>) {
        let a = LoopbackPeer::new("caller");
        let b = LoopbackPeer::new("joiner");
        *a.other.lock() = Arc::downgrade(&b);
        *b.other.lock() = Arc::downgrade(&a);
        (a, b)
    }
}

struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_sets: usize,
    remote_candidates: usize,
    answers_created: usize,
    status: ConnectionStatus,
    senders: Vec<Arc<LoopbackSender>>,
    channels: Vec<Arc<LoopbackChannel>>,
    pending_remote_channel: Option<Arc<LoopbackChannel>>,
    negotiation_armed: bool,
    closed: bool,
}

pub struct LoopbackPeer {
    name: &'static str,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    state: Mutex<PeerState>,
    other: Mutex<Weak<LoopbackPeer>>,
}

impl LoopbackPeer {
    fn new(name: &'static str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            state: Mutex::new(PeerState {
                local: None,
                remote: None,
                remote_sets: 0,
                remote_candidates: 0,
                answers_created: 0,
                status: ConnectionStatus::New,
                senders: Vec::new(),
                channels: Vec::new(),
                pending_remote_channel: None,
                negotiation_armed: true,
                closed: false,
            }),
            other: Mutex::new(Weak::new()),
        })
    }

    /// Emits an extra negotiation-needed event.
    pub fn fire_negotiation_needed(&self) {
        let _ = self.tx.send(TransportEvent::NegotiationNeeded);
    }

    pub fn remote_description_sets(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers_created
    }

    pub fn added_candidates(&self) -> usize {
        self.state.lock().remote_candidates
    }

    pub fn loopback_senders(&self) -> Vec<Arc<LoopbackSender>> {
        self.state.lock().senders.clone()
    }

    fn other(&self) -> Option<Arc<LoopbackPeer>> {
        self.other.lock().upgrade()
    }

    fn arm_negotiation(&self, st: &mut PeerState) {
        if std::mem::replace(&mut st.negotiation_armed, false) {
            let _ = self.tx.send(TransportEvent::NegotiationNeeded);
        }
    }

    fn set_status(&self, st: &mut PeerState, status: ConnectionStatus) {
        st.status = status;
        let _ = self.tx.send(TransportEvent::ConnectionStateChange(status));
    }

    fn progress(&self) {
        let mut st = self.state.lock();
        if st.closed || st.local.is_none() || st.remote.is_none() {
            return;
        }
        if st.status == ConnectionStatus::New {
            self.set_status(&mut st, ConnectionStatus::Connecting);
        }
        if st.status == ConnectionStatus::Connecting && st.remote_candidates > 0 {
            self.set_status(&mut st, ConnectionStatus::Connected);
            for channel in &st.channels {
                channel.open();
            }
        }
    }

    fn describe(&self, st: &PeerState) -> String {
        let mut sdp = format!("v=0\r\no={} 0 0 IN IP4 127.0.0.1\r\ns=-\r\n", self.name);
        for sender in &st.senders {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\n", sender.kind));
        }
        if !st.channels.is_empty() {
            sdp.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        }
        sdp
    }
}

#[async_trait]
impl PeerTransport for LoopbackPeer {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx.lock().take()
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<Arc<dyn TrackSender>, TransportError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(TransportError::Closed);
        }
        let sender = Arc::new(LoopbackSender {
            kind: track.kind(),
            track: Mutex::new(Some(track)),
        });
        st.senders.push(sender.clone());
        self.arm_negotiation(&mut st);
        Ok(sender)
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|s| s.clone() as Arc<dyn TrackSender>)
            .collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let st = self.state.lock();
        if st.closed {
            return Err(TransportError::Closed);
        }
        Ok(SessionDescription::offer(self.describe(&st)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(TransportError::Closed);
        }
        if st.remote.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        // a committed answer leaves the connection stable, where no answer can be made
        if st.local.as_ref().is_some_and(|d| d.kind == SdpKind::Answer) {
            return Err(TransportError::InvalidDescription(
                "answer requested in stable state".into(),
            ));
        }
        st.answers_created += 1;
        Ok(SessionDescription::answer(self.describe(&st)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::Closed);
            }
            st.local = Some(desc);
        }
        let tx = self.tx.clone();
        let name = self.name;
        tokio::spawn(async move {
            tokio::time::sleep(GATHERING_DELAY).await;
            for n in 0..2u16 {
                let cand = CandidateRecord {
                    candidate: format!(
                        "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
                        50_000 + n
                    ),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                    username_fragment: Some(name.into()),
                    ..Default::default()
                };
                let _ = tx.send(TransportEvent::IceCandidate(Some(cand)));
            }
            let _ = tx.send(TransportEvent::IceCandidate(None));
        });
        self.progress();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        // read the other side first so the two state locks are never nested
        let (kinds, offered, stream_id) = match self.other() {
            Some(other) => {
                let mut theirs = other.state.lock();
                let kinds: Vec<MediaKind> = theirs.senders.iter().map(|s| s.kind).collect();
                (kinds, theirs.pending_remote_channel.take(), format!("{}-stream", other.name))
            }
            None => (Vec::new(), None, String::new()),
        };
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::Closed);
            }
            st.remote = Some(desc);
            st.remote_sets += 1;
            for kind in kinds {
                let track = MediaTrack::local(kind, format!("remote {kind}"), &stream_id);
                let _ = self.tx.send(TransportEvent::Track(Arc::new(track)));
            }
            if let Some(channel) = offered {
                st.channels.push(channel.clone());
                let _ = self.tx.send(TransportEvent::DataChannel(channel));
            }
        }
        self.progress();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, _candidate: CandidateRecord) -> Result<(), TransportError> {
        {
            let mut st = self.state.lock();
            if st.remote.is_none() {
                return Err(TransportError::NoRemoteDescription);
            }
            st.remote_candidates += 1;
        }
        self.progress();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelTransport>, TransportError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(TransportError::Closed);
        }
        let (local, remote) = LoopbackChannel::pair(label);
        st.channels.push(local.clone());
        st.pending_remote_channel = Some(remote);
        self.arm_negotiation(&mut st);
        Ok(local)
    }

    fn connection_state(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        if std::mem::replace(&mut st.closed, true) {
            return Ok(());
        }
        for channel in &st.channels {
            channel.close();
        }
        self.set_status(&mut st, ConnectionStatus::Closed);
        Ok(())
    }
}

pub struct LoopbackSender {
    kind: MediaKind,
    track: Mutex<Option<Arc<MediaTrack>>>,
}

#[async_trait]
impl TrackSender for LoopbackSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Option<Arc<MediaTrack>> {
        self.track.lock().clone()
    }

    async fn replace_track(&self, track: Option<Arc<MediaTrack>>) -> Result<(), TransportError> {
        *self.track.lock() = track;
        Ok(())
    }
}

pub struct LoopbackChannel {
    label: String,
    open: AtomicBool,
    tx: mpsc::UnboundedSender<DataChannelEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DataChannelEvent>>>,
    remote: Mutex<Weak<LoopbackChannel>>,
}

impl LoopbackChannel {
    fn new(label: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_owned(),
            open: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
            remote: Mutex::new(Weak::new()),
        })
    }

    fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label);
        let b = Self::new(label);
        *a.remote.lock() = Arc::downgrade(&b);
        *b.remote.lock() = Arc::downgrade(&a);
        (a, b)
    }

    fn open(&self) {
        if !self.open.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(DataChannelEvent::Open);
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(DataChannelEvent::Close);
        }
    }
}

#[async_trait]
impl DataChannelTransport for LoopbackChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let remote = self.remote.lock().upgrade().ok_or(TransportError::Closed)?;
        remote
            .tx
            .send(DataChannelEvent::Message(text))
            .map_err(|_| TransportError::Closed)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>> {
        self.rx.lock().take()
    }
}

/// `MemoryChannel` that records every attempted record write and can be told
/// to reject writes and record creation.
#[derive(Default)]
pub struct CountingChannel {
    inner: MemoryChannel,
    writes: Mutex<Vec<&'static str>>,
    reject_updates: AtomicBool,
    reject_creates: AtomicBool,
}

impl CountingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes_of(&self, field: &str) -> usize {
        self.writes.lock().iter().filter(|f| **f == field).count()
    }

    pub fn reject_updates(&self, reject: bool) {
        self.reject_updates.store(reject, Ordering::Release);
    }

    pub fn reject_creates(&self, reject: bool) {
        self.reject_creates.store(reject, Ordering::Release);
    }

    pub fn memory(&self) -> &MemoryChannel {
        &self.inner
    }
}

#[async_trait]
impl SignalingChannel for CountingChannel {
    async fn create(&self, collection: &str) -> Result<String, ChannelError> {
        if self.reject_creates.load(Ordering::Acquire) {
            return Err(ChannelError::Backend("create rejected".into()));
        }
        self.inner.create(collection).await
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<SessionRecord>, ChannelError> {
        self.inner.read(collection, id).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: SessionUpdate,
    ) -> Result<(), ChannelError> {
        self.writes.lock().push(update.field());
        if self.reject_updates.load(Ordering::Acquire) {
            return Err(ChannelError::Backend("write rejected".into()));
        }
        self.inner.update(collection, id, update).await
    }

    async fn subscribe_to_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<RecordStream, ChannelError> {
        self.inner.subscribe_to_record(collection, id).await
    }

    async fn append_to_subcollection(
        &self,
        collection: &str,
        id: &str,
        subcollection: &str,
        item: CandidateRecord,
    ) -> Result<(), ChannelError> {
        self.inner
            .append_to_subcollection(collection, id, subcollection, item)
            .await
    }

    async fn subscribe_to_additions(
        &self,
        collection: &str,
        id: &str,
        subcollection: &str,
    ) -> Result<AdditionStream, ChannelError> {
        self.inner
            .subscribe_to_additions(collection, id, subcollection)
            .await
    }
}
