use crate::config::SignalingConfig;
use crate::error::TransportError;
use crate::peer::data_channel::RtcDataChannel;
use crate::peer::ice::{candidate_init, candidate_record};
use crate::peer::media::MediaTrack;
use crate::peer::transport::{DataChannelTransport, PeerTransport, TrackSender, TransportEvent};
use crate::peer::types::{CandidateRecord, ConnectionStatus, MediaKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// `PeerTransport` over a webrtc-rs peer connection.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    senders: Mutex<Vec<Arc<RtcSender>>>,
}

impl RtcTransport {
    pub async fn new(config: &SignalingConfig) -> Result<Arc<Self>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(config.rtc_configuration()).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        forward_events(&pc, tx);
        info!(ice_servers = config.ice_servers.len(), "peer connection created");

        Ok(Arc::new(Self {
            pc,
            events: Mutex::new(Some(rx)),
            senders: Mutex::new(Vec::new()),
        }))
    }
}

/// Registers the webrtc-rs handlers once and funnels them into one queue.
fn forward_events(pc: &Arc<RTCPeerConnection>, tx: mpsc::UnboundedSender<TransportEvent>) {
    let negotiation_tx = tx.clone();
    pc.on_negotiation_needed(Box::new(move || {
        debug!("negotiation needed");
        let _ = negotiation_tx.send(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!(state = ?st, "peer connection state changed");
        let _ = state_tx.send(TransportEvent::ConnectionStateChange(st.into()));
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        debug!(?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    let track_tx = tx.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _tr: Arc<RTCRtpTransceiver>| {
            match MediaTrack::remote(track) {
                Some(track) => {
                    debug!(track = track.id(), kind = %track.kind(), "remote track received");
                    let _ = track_tx.send(TransportEvent::Track(Arc::new(track)));
                }
                None => warn!("ignoring remote track of unspecified kind"),
            }
            Box::pin(async {})
        },
    ));

    let candidate_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match candidate_record(&c) {
                Ok(record) => {
                    let _ = candidate_tx.send(TransportEvent::IceCandidate(Some(record)));
                }
                Err(e) => warn!(error = %e, "cannot serialize local ICE candidate"),
            },
            None => {
                let _ = candidate_tx.send(TransportEvent::IceCandidate(None));
            }
        }
        Box::pin(async {})
    }));

    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        info!(label = dc.label(), "data channel offered by peer");
        let wrapped: Arc<dyn DataChannelTransport> = RtcDataChannel::wrap(dc);
        let _ = tx.send(TransportEvent::DataChannel(wrapped));
        Box::pin(async {})
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    RTCSessionDescription::try_from(desc)
}

#[async_trait]
impl PeerTransport for RtcTransport {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<Arc<dyn TrackSender>, TransportError> {
        let local = track
            .local_track()
            .ok_or_else(|| TransportError::RemoteTrack(track.id().to_owned()))?;
        let rtp_sender = self.pc.add_track(local).await?;

        // drain RTCP so the interceptors keep running
        let rtcp_sender = rtp_sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let sender = Arc::new(RtcSender {
            kind: track.kind(),
            sender: rtp_sender,
            track: Mutex::new(Some(track)),
        });
        self.senders.lock().push(sender.clone());
        Ok(sender)
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.senders
            .lock()
            .iter()
            .map(|s| s.clone() as Arc<dyn TrackSender>)
            .collect()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        SessionDescription::try_from(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        SessionDescription::try_from(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        SessionDescription::try_from(desc).ok()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.remote_description().await?;
        SessionDescription::try_from(desc).ok()
    }

    async fn add_ice_candidate(&self, candidate: CandidateRecord) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate_init(candidate)).await?;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelTransport>, TransportError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        Ok(RtcDataChannel::wrap(dc))
    }

    fn connection_state(&self) -> ConnectionStatus {
        self.pc.connection_state().into()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcSender {
    kind: MediaKind,
    sender: Arc<RTCRtpSender>,
    track: Mutex<Option<Arc<MediaTrack>>>,
}

#[async_trait]
impl TrackSender for RtcSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Option<Arc<MediaTrack>> {
        self.track.lock().clone()
    }

    async fn replace_track(&self, track: Option<Arc<MediaTrack>>) -> Result<(), TransportError> {
        let local = match &track {
            Some(t) => Some(
                t.local_track()
                    .ok_or_else(|| TransportError::RemoteTrack(t.id().to_owned()))?,
            ),
            None => None,
        };
        self.sender.replace_track(local).await?;
        *self.track.lock() = track;
        Ok(())
    }
}
