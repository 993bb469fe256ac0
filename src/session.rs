//! Negotiation state machine for one side of a two-peer session.
//!
//! A Caller creates the session record and publishes the offer; a Joiner
//! reads the record by id and publishes the answer. Both trickle candidates
//! through their own sub-collection and consume the other side's. All
//! transport callbacks are handled by reaction tasks owned as
//! [`Subscription`]s, which [`Session::close_connection`] disposes.

use crate::config::SignalingConfig;
use crate::error::{SignalError, SignalResult, TransportError};
use crate::logger;
use crate::peer::connection::RtcTransport;
use crate::peer::data_channel::{pump_inbound, AppChannel};
use crate::peer::ice::{consume_remote_candidates, publish_local_candidates, Outbox};
use crate::peer::media::{MediaConstraints, MediaSource, MediaStream, MediaTrack, PlaceholderMedia};
use crate::peer::state::{Action, CompletionCallback, ConnectionContext, ConnectionStore};
use crate::peer::transport::{DataChannelTransport, PeerTransport, Subscription, TransportEvent};
use crate::peer::types::{
    AppMessage, CandidateRecord, ConnectionStatus, MediaKind, NegotiationPhase, Role,
    SdpKind, SessionUpdate,
};
use crate::signaling::{RecordStream, SignalingChannel};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INBOUND_CAPACITY: usize = 64;

/// Counts negotiation-needed fires and lets the first `bound + 1` through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenegotiationGuard {
    fired: u32,
    bound: u32,
}

impl RenegotiationGuard {
    pub fn new(bound: u32) -> Self {
        Self { fired: 0, bound }
    }

    /// Records one fire. Returns its zero-based round number while the round
    /// may run, `None` once past the bound.
    pub fn next(&mut self) -> Option<u32> {
        let round = self.fired;
        self.fired = self.fired.saturating_add(1);
        (round <= self.bound).then_some(round)
    }

    pub fn fired(&self) -> u32 {
        self.fired
    }
}

#[derive(Debug)]
struct NegotiationState {
    role: Option<Role>,
    phase: NegotiationPhase,
    session_id: Option<String>,
    guard: RenegotiationGuard,
    offer_written: bool,
    answer_written: bool,
    inbox_subscribed: bool,
}

impl NegotiationState {
    fn new(bound: u32) -> Self {
        Self {
            role: None,
            phase: NegotiationPhase::Idle,
            session_id: None,
            guard: RenegotiationGuard::new(bound),
            offer_written: false,
            answer_written: false,
            inbox_subscribed: false,
        }
    }

    /// Moves forward only while the connection has not reported a status yet.
    fn advance(&mut self, next: NegotiationPhase) {
        if matches!(
            self.phase,
            NegotiationPhase::Created { .. } | NegotiationPhase::OfferSent
        ) {
            self.phase = next;
        }
    }
}

struct Shared {
    config: SignalingConfig,
    channel: Arc<dyn SignalingChannel>,
    store: Arc<ConnectionStore>,
    placeholder: PlaceholderMedia,
    negotiation: Mutex<NegotiationState>,
    inbound: broadcast::Sender<AppMessage>,
    subscriptions: Mutex<Vec<Subscription>>,
    disposed: Mutex<bool>,
}

impl Shared {
    fn register(&self, name: &'static str, handle: JoinHandle<()>) {
        let subscription = Subscription::new(name, handle);
        if *self.disposed.lock() {
            debug!(reaction = name, "session closed, reaction discarded");
            subscription.dispose();
            return;
        }
        self.subscriptions.lock().push(subscription);
    }

    fn dispose_all(&self) {
        *self.disposed.lock() = true;
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            debug!(reaction = subscription.name(), "disposing reaction");
            subscription.dispose();
        }
    }

    fn session_id(&self) -> Option<String> {
        self.negotiation.lock().session_id.clone()
    }

    /// The transport currently held by the store.
    fn peer(&self) -> Arc<dyn PeerTransport> {
        self.store.snapshot().peer
    }

    fn set_phase(&self, next: NegotiationPhase) {
        self.negotiation.lock().advance(next);
    }

    async fn offer_round(&self) -> SignalResult<()> {
        let session_id = {
            let st = self.negotiation.lock();
            if st.offer_written {
                debug!("offer already published, ignoring negotiation-needed");
                return Ok(());
            }
            st.session_id.clone()
        };
        let Some(session_id) = session_id else {
            warn!("negotiation-needed before the session record exists");
            return Ok(());
        };

        let peer = self.peer();
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        self.set_phase(NegotiationPhase::Created {
            has_local_description: true,
        });

        self.channel
            .update(
                &self.config.calls_collection,
                &session_id,
                SessionUpdate::Offer(offer),
            )
            .await?;
        let mut st = self.negotiation.lock();
        st.offer_written = true;
        st.advance(NegotiationPhase::OfferSent);
        info!(session = %session_id, "offer published");
        Ok(())
    }

    /// One Joiner round. The first published answer also starts consuming
    /// the Caller's candidates.
    async fn answer_round(self: &Arc<Self>) -> SignalResult<()> {
        let (round, session_id) = {
            let mut st = self.negotiation.lock();
            let Some(round) = st.guard.next() else {
                debug!(fired = st.guard.fired(), "renegotiation bound reached, ignoring");
                return Ok(());
            };
            if st.answer_written {
                debug!(round, "answer already published, ignoring negotiation-needed");
                return Ok(());
            }
            (round, st.session_id.clone())
        };
        let Some(session_id) = session_id else {
            warn!(round, "negotiation-needed before a session was joined");
            return Ok(());
        };

        let record = self
            .channel
            .read(&self.config.calls_collection, &session_id)
            .await?;
        let Some(offer) = record.and_then(|r| r.offer) else {
            warn!(session = %session_id, round, "protocol violation: record has no offer");
            return Ok(());
        };

        let peer = self.peer();
        let answer = match peer.local_description().await {
            // committed by an earlier round whose write failed
            Some(local) if local.kind == SdpKind::Answer => {
                debug!(round, "republishing the committed answer");
                local
            }
            _ => {
                if peer.remote_description().await.is_none() {
                    peer.set_remote_description(offer).await?;
                }
                let answer = peer.create_answer().await?;
                peer.set_local_description(answer.clone()).await?;
                answer
            }
        };
        self.set_phase(NegotiationPhase::Created {
            has_local_description: true,
        });

        self.channel
            .update(
                &self.config.calls_collection,
                &session_id,
                SessionUpdate::Answer(answer),
            )
            .await?;
        let subscribe = {
            let mut st = self.negotiation.lock();
            st.answer_written = true;
            st.advance(NegotiationPhase::Answered);
            !std::mem::replace(&mut st.inbox_subscribed, true)
        };
        info!(session = %session_id, round, "answer published");

        if subscribe {
            let inbox = self
                .channel
                .subscribe_to_additions(
                    &self.config.calls_collection,
                    &session_id,
                    &self.config.offer_candidates,
                )
                .await?;
            self.register(
                "remote-candidate-added",
                tokio::spawn(consume_remote_candidates(inbox, peer)),
            );
        }
        Ok(())
    }
}

/// One side of a peer-to-peer session.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(
        config: SignalingConfig,
        channel: Arc<dyn SignalingChannel>,
        peer: Arc<dyn PeerTransport>,
    ) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let shared = Shared {
            store: Arc::new(ConnectionStore::new(peer)),
            placeholder: PlaceholderMedia::new(config.placeholder.clone()),
            negotiation: Mutex::new(NegotiationState::new(config.renegotiation_bound)),
            config,
            channel,
            inbound,
            subscriptions: Mutex::new(Vec::new()),
            disposed: Mutex::new(false),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Builds a session over a fresh webrtc-rs peer connection.
    pub async fn with_rtc(
        config: SignalingConfig,
        channel: Arc<dyn SignalingChannel>,
    ) -> SignalResult<Self> {
        logger::init(&config.log);
        config.validate()?;
        let peer = RtcTransport::new(&config).await?;
        Ok(Self::new(config, channel, peer))
    }

    /// Starts a session as Caller and returns the new record's id. The offer
    /// is published later, once the transport asks for negotiation.
    pub async fn create_offer(&self) -> SignalResult<String> {
        self.ensure_idle()?;
        let peer = self.shared.peer();
        if peer.remote_description().await.is_some() {
            return Err(SignalError::AlreadyStarted(
                "transport already has a remote description".into(),
            ));
        }

        let cfg = &self.shared.config;
        let session_id = self.shared.channel.create(&cfg.calls_collection).await?;
        info!(session = %session_id, "session record created");

        self.attach_media().await?;
        let dc = peer.create_data_channel(&cfg.data_channel_label).await?;
        let snapshots = self
            .shared
            .channel
            .subscribe_to_record(&cfg.calls_collection, &session_id)
            .await?;
        let inbox = self
            .shared
            .channel
            .subscribe_to_additions(&cfg.calls_collection, &session_id, &cfg.answer_candidates)
            .await?;

        // role and events are claimed only once setup has succeeded
        let events = self.begin(Role::Caller, &session_id)?;
        let outbox = Outbox {
            collection: cfg.calls_collection.clone(),
            session_id: session_id.clone(),
            subcollection: cfg.offer_candidates.clone(),
        };
        let data_channels = self.start_reactions(Role::Caller, events, outbox);
        let _ = data_channels.send(dc);

        let shared = self.shared.clone();
        self.shared.register(
            "inbound-answer-observed",
            tokio::spawn(observe_answer(shared, snapshots)),
        );
        self.shared.register(
            "remote-candidate-added",
            tokio::spawn(consume_remote_candidates(inbox, peer)),
        );
        Ok(session_id)
    }

    /// Joins the session `session_id` as Joiner. The answer is published
    /// later, once the transport asks for negotiation.
    pub async fn answer_offer(&self, session_id: &str) -> SignalResult<()> {
        self.ensure_idle()?;
        let cfg = &self.shared.config;
        let record = self
            .shared
            .channel
            .read(&cfg.calls_collection, session_id)
            .await?
            .ok_or_else(|| SignalError::RecordNotFound {
                session_id: session_id.to_owned(),
            })?;
        if record.offer.is_none() {
            return Err(SignalError::MissingOffer {
                session_id: session_id.to_owned(),
            });
        }

        self.attach_media().await?;
        let events = self.begin(Role::Joiner, session_id)?;
        info!(session = %session_id, "joining session");
        let outbox = Outbox {
            collection: cfg.calls_collection.clone(),
            session_id: session_id.to_owned(),
            subcollection: cfg.answer_candidates.clone(),
        };
        self.start_reactions(Role::Joiner, events, outbox);
        Ok(())
    }

    /// Closes the transport, publishes `closed` and stops every reaction.
    pub async fn close_connection(&self) -> SignalResult<()> {
        let closed = self.shared.peer().close().await;
        self.shared.dispose_all();
        self.shared
            .store
            .dispatch(Action::SetConnectionState(Some(ConnectionStatus::Closed)));
        {
            let mut st = self.shared.negotiation.lock();
            st.phase = st.phase.on_status(ConnectionStatus::Closed);
        }
        info!(session = ?self.session_id(), "connection closed");
        closed?;
        Ok(())
    }

    /// Sends `message` over the data channel. A no-op until it is established.
    pub async fn send(&self, message: &AppMessage) -> SignalResult<()> {
        AppChannel::new(self.shared.store.snapshot().data_channel)
            .send(message)
            .await
    }

    /// Captures local media and swaps it in for whatever the senders carry.
    /// On a capture error the senders keep their current tracks.
    pub async fn open_local_media(
        &self,
        source: &dyn MediaSource,
        constraints: MediaConstraints,
        on_completed: Option<CompletionCallback>,
    ) -> SignalResult<Arc<MediaStream>> {
        let tracks = source.get_local_tracks(constraints).await.map_err(|e| {
            warn!(error = %e, "local media capture failed, keeping current tracks");
            e
        })?;
        let stream = Arc::new(MediaStream::with_tracks(tracks));
        debug!(stream = stream.id(), tracks = stream.len(), "local media captured");
        self.replace_local_stream(stream.clone(), on_completed);
        Ok(stream)
    }

    /// Switches every sender to `stream`. Once the transport carries the new
    /// tracks each one is announced to the peer, then `on_completed` runs.
    pub fn replace_local_stream(
        &self,
        stream: Arc<MediaStream>,
        on_completed: Option<CompletionCallback>,
    ) {
        let announce: CompletionCallback = Box::new(move |ctx: ConnectionContext| {
            let channel = AppChannel::new(ctx.data_channel.clone());
            let replaced: Vec<AppMessage> = ctx
                .local_stream
                .tracks()
                .iter()
                .map(|track| AppMessage::TrackReplaced {
                    kind: track.kind(),
                    track_id: track.id().to_owned(),
                })
                .collect();
            tokio::spawn(async move {
                for message in &replaced {
                    if let Err(e) = channel.send(message).await {
                        warn!(error = %e, "failed to announce replaced track");
                    }
                }
            });
            if let Some(on_completed) = on_completed {
                on_completed(ctx);
            }
        });
        self.shared.store.dispatch(Action::SetLocalStream {
            stream: Some(stream),
            on_completed: Some(announce),
        });
    }

    pub fn inbound_messages(&self) -> broadcast::Receiver<AppMessage> {
        self.shared.inbound.subscribe()
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.shared.negotiation.lock().phase
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.negotiation.lock().role
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    /// Negotiation-needed fires seen so far as Joiner.
    pub fn negotiation_rounds(&self) -> u32 {
        self.shared.negotiation.lock().guard.fired()
    }

    pub fn store(&self) -> Arc<ConnectionStore> {
        self.shared.store.clone()
    }

    pub fn peer(&self) -> Arc<dyn PeerTransport> {
        self.shared.peer()
    }

    /// Names of the reactions still registered.
    pub fn active_reactions(&self) -> Vec<&'static str> {
        self.shared
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.name())
            .collect()
    }

    fn ensure_idle(&self) -> SignalResult<()> {
        let st = self.shared.negotiation.lock();
        match (st.role, st.phase) {
            (None, NegotiationPhase::Idle) => Ok(()),
            (Some(role), _) => Err(SignalError::AlreadyStarted(role.to_string())),
            (None, phase) => Err(SignalError::AlreadyStarted(format!("{phase:?}"))),
        }
    }

    /// Claims the role and the transport's event queue in one step, once
    /// every fallible setup call has succeeded.
    fn begin(
        &self,
        role: Role,
        session_id: &str,
    ) -> SignalResult<mpsc::UnboundedReceiver<TransportEvent>> {
        let mut st = self.shared.negotiation.lock();
        if let Some(existing) = st.role {
            return Err(SignalError::AlreadyStarted(existing.to_string()));
        }
        let events = self
            .shared
            .peer()
            .take_events()
            .ok_or(TransportError::EventsTaken)?;
        st.role = Some(role);
        st.session_id = Some(session_id.to_owned());
        st.phase = NegotiationPhase::Created {
            has_local_description: false,
        };
        Ok(events)
    }

    /// One sender per media kind: the local stream's track when there is one,
    /// the placeholder otherwise. Senders left by an earlier failed start are
    /// reused.
    async fn attach_media(&self) -> SignalResult<()> {
        let peer = self.shared.peer();
        if !peer.senders().await.is_empty() {
            return Ok(());
        }
        let local = self.shared.store.snapshot().local_stream;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let track = local
                .track_of_kind(kind)
                .unwrap_or_else(|| self.shared.placeholder.track(kind, local.id()));
            debug!(%kind, track = track.id(), enabled = track.is_enabled(), "attaching track");
            peer.add_track(track).await?;
        }
        Ok(())
    }

    /// Spawns the fan-out pump and one task per reaction. Returns the queue
    /// of data channels to serve.
    fn start_reactions(
        &self,
        role: Role,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        outbox: Outbox,
    ) -> mpsc::UnboundedSender<Arc<dyn DataChannelTransport>> {
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let (dc_tx, dc_rx) = mpsc::unbounded_channel();
        let routes = Routes {
            negotiation: negotiation_tx,
            status: status_tx,
            track: track_tx,
            candidate: candidate_tx,
            data_channel: dc_tx.clone(),
        };

        let shared = &self.shared;
        shared.register(
            "negotiation-needed",
            tokio::spawn(negotiation_reaction(shared.clone(), role, negotiation_rx)),
        );
        shared.register(
            "connection-state-change",
            tokio::spawn(status_reaction(shared.clone(), status_rx)),
        );
        shared.register(
            "track-received",
            tokio::spawn(track_reaction(shared.clone(), track_rx)),
        );
        shared.register(
            "local-candidate-discovered",
            tokio::spawn(publish_local_candidates(
                candidate_rx,
                shared.channel.clone(),
                outbox,
            )),
        );
        shared.register(
            "data-channel-established",
            tokio::spawn(data_channel_reaction(shared.clone(), role, dc_rx)),
        );
        shared.register("transport-events", tokio::spawn(fan_out(events, routes)));
        dc_tx
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.dispose_all();
    }
}

struct Routes {
    negotiation: mpsc::UnboundedSender<()>,
    status: mpsc::UnboundedSender<ConnectionStatus>,
    track: mpsc::UnboundedSender<Arc<MediaTrack>>,
    candidate: mpsc::UnboundedSender<Option<CandidateRecord>>,
    data_channel: mpsc::UnboundedSender<Arc<dyn DataChannelTransport>>,
}

async fn fan_out(mut events: mpsc::UnboundedReceiver<TransportEvent>, routes: Routes) {
    while let Some(event) = events.recv().await {
        debug!(event = ?event, "transport event");
        let delivered = match event {
            TransportEvent::NegotiationNeeded => routes.negotiation.send(()).is_ok(),
            TransportEvent::ConnectionStateChange(status) => routes.status.send(status).is_ok(),
            TransportEvent::Track(track) => routes.track.send(track).is_ok(),
            TransportEvent::IceCandidate(cand) => routes.candidate.send(cand).is_ok(),
            TransportEvent::DataChannel(dc) => routes.data_channel.send(dc).is_ok(),
        };
        if !delivered {
            debug!("reaction already stopped, event dropped");
        }
    }
    debug!("transport event stream ended");
}

async fn negotiation_reaction(shared: Arc<Shared>, role: Role, mut fires: mpsc::UnboundedReceiver<()>) {
    while fires.recv().await.is_some() {
        let outcome = match role {
            Role::Caller => shared.offer_round().await,
            Role::Joiner => shared.answer_round().await,
        };
        if let Err(e) = outcome {
            warn!(%role, error = %e, "negotiation round failed");
        }
    }
}

async fn status_reaction(shared: Arc<Shared>, mut statuses: mpsc::UnboundedReceiver<ConnectionStatus>) {
    while let Some(status) = statuses.recv().await {
        let phase = {
            let mut st = shared.negotiation.lock();
            st.phase = st.phase.on_status(status);
            st.phase
        };
        shared
            .store
            .dispatch(Action::SetConnectionState(Some(status)));
        info!(?status, ?phase, "connection status changed");
    }
}

async fn track_reaction(shared: Arc<Shared>, mut tracks: mpsc::UnboundedReceiver<Arc<MediaTrack>>) {
    while let Some(track) = tracks.recv().await {
        debug!(track = track.id(), kind = %track.kind(), "adding remote track");
        let incoming = MediaStream::with_tracks(vec![track]);
        shared
            .store
            .dispatch(Action::SetRemoteStream(Some(Arc::new(incoming))));
    }
}

/// The Caller stores its own channel once it opens; the Joiner stores the
/// offered one immediately.
async fn data_channel_reaction(
    shared: Arc<Shared>,
    role: Role,
    mut channels: mpsc::UnboundedReceiver<Arc<dyn DataChannelTransport>>,
) {
    while let Some(dc) = channels.recv().await {
        let Some(events) = dc.take_events() else {
            warn!(label = %dc.label(), "data channel events already taken");
            continue;
        };
        let store = shared.store.clone();
        let inbound = shared.inbound.clone();
        match role {
            Role::Joiner => {
                store.dispatch(Action::SetDataChannel(Some(dc)));
                pump_inbound(events, inbound, || {}).await;
            }
            Role::Caller => {
                pump_inbound(events, inbound, move || {
                    store.dispatch(Action::SetDataChannel(Some(dc)));
                })
                .await;
            }
        }
    }
}

async fn observe_answer(shared: Arc<Shared>, mut snapshots: RecordStream) {
    while let Some(record) = snapshots.recv().await {
        let Some(answer) = record.answer else {
            continue;
        };
        let peer = shared.peer();
        if peer.remote_description().await.is_some() {
            debug!("remote description already set, ignoring answer snapshot");
            continue;
        }
        match peer.set_remote_description(answer).await {
            Ok(()) => {
                shared.set_phase(NegotiationPhase::Answered);
                info!(session = ?shared.session_id(), "answer committed");
            }
            Err(e) => warn!(error = %e, "failed to commit answer"),
        }
    }
}
