use crate::error::TransportError;
use crate::logger::dump_candidate;
use crate::peer::transport::PeerTransport;
use crate::peer::types::CandidateRecord;
use crate::signaling::{AdditionStream, SignalingChannel};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

/// Reads the `typ` attribute of the candidate line.
pub fn classify(cand: &CandidateRecord) -> CandidateType {
    let mut parts = cand.candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return match parts.next() {
                Some("host") => CandidateType::Host,
                Some("srflx") => CandidateType::ServerReflexive,
                Some("prflx") => CandidateType::PeerReflexive,
                Some("relay") => CandidateType::Relay,
                _ => CandidateType::Unknown,
            };
        }
    }
    CandidateType::Unknown
}

pub fn candidate_record(cand: &RTCIceCandidate) -> Result<CandidateRecord, TransportError> {
    let init = cand.to_json()?;
    Ok(CandidateRecord {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
        foundation: Some(cand.foundation.clone()),
        protocol: Some(cand.protocol.to_string()),
        address: Some(cand.address.clone()),
        port: Some(cand.port),
        priority: Some(cand.priority),
    })
}

pub fn candidate_init(cand: CandidateRecord) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: cand.candidate,
        sdp_mid: cand.sdp_mid,
        sdp_mline_index: cand.sdp_m_line_index,
        username_fragment: cand.username_fragment,
    }
}

/// Where this side trickles its candidates.
#[derive(Debug, Clone)]
pub struct Outbox {
    pub collection: String,
    pub session_id: String,
    pub subcollection: String,
}

/// Appends every locally gathered candidate to the outbox, in gathering
/// order. Append failures are logged and the candidate is lost.
pub async fn publish_local_candidates(
    mut candidates: mpsc::UnboundedReceiver<Option<CandidateRecord>>,
    channel: Arc<dyn SignalingChannel>,
    outbox: Outbox,
) {
    let mut published = 0usize;
    while let Some(next) = candidates.recv().await {
        let Some(cand) = next else {
            debug!(published, outbox = %outbox.subcollection, "ICE candidate gathering completed");
            continue;
        };
        dump_candidate("LOCAL", &cand);
        let kind = classify(&cand);
        match channel
            .append_to_subcollection(
                &outbox.collection,
                &outbox.session_id,
                &outbox.subcollection,
                cand,
            )
            .await
        {
            Ok(()) => {
                published += 1;
                debug!(?kind, published, "published local candidate");
            }
            Err(e) => warn!(error = %e, ?kind, "failed to publish local candidate"),
        }
    }
}

/// Feeds the peer's candidates into the transport in append order. A
/// rejected candidate (for example one that arrives before the remote
/// description) is logged and dropped.
pub async fn consume_remote_candidates(mut inbox: AdditionStream, peer: Arc<dyn PeerTransport>) {
    let mut applied = 0usize;
    let mut dropped = 0usize;
    while let Some(cand) = inbox.recv().await {
        dump_candidate("REMOTE", &cand);
        match peer.add_ice_candidate(cand).await {
            Ok(()) => {
                applied += 1;
                debug!(applied, "added remote ICE candidate");
            }
            Err(e) => {
                dropped += 1;
                warn!(error = %e, dropped, "failed to add remote ICE candidate");
            }
        }
    }
    debug!(applied, dropped, "remote candidate inbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::media::MediaTrack;
    use crate::peer::transport::{DataChannelTransport, TrackSender, TransportEvent};
    use crate::peer::types::{ConnectionStatus, SessionDescription};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every candidate it is handed and rejects the ones listed.
    #[derive(Default)]
    struct RecordingPeer {
        reject: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingPeer {
        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            None
        }

        async fn add_track(
            &self,
            _track: Arc<MediaTrack>,
        ) -> Result<Arc<dyn TrackSender>, TransportError> {
            Err(TransportError::Closed)
        }

        async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
            Vec::new()
        }

        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Err(TransportError::Closed)
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            Err(TransportError::Closed)
        }

        async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        async fn local_description(&self) -> Option<SessionDescription> {
            None
        }

        async fn remote_description(&self) -> Option<SessionDescription> {
            None
        }

        async fn add_ice_candidate(&self, candidate: CandidateRecord) -> Result<(), TransportError> {
            let rejected = self.reject.contains(&candidate.candidate);
            self.seen.lock().push(candidate.candidate);
            if rejected {
                return Err(TransportError::NoRemoteDescription);
            }
            Ok(())
        }

        async fn create_data_channel(
            &self,
            _label: &str,
        ) -> Result<Arc<dyn DataChannelTransport>, TransportError> {
            Err(TransportError::Closed)
        }

        fn connection_state(&self) -> ConnectionStatus {
            ConnectionStatus::New
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn line(candidate: &str) -> CandidateRecord {
        CandidateRecord {
            candidate: candidate.into(),
            ..Default::default()
        }
    }

    #[test]
    fn classifies_candidate_lines() {
        assert_eq!(
            classify(&line("candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host")),
            CandidateType::Host
        );
        assert_eq!(
            classify(&line(
                "candidate:2 1 udp 1694498815 198.51.100.7 61000 typ srflx raddr 0.0.0.0 rport 0"
            )),
            CandidateType::ServerReflexive
        );
        assert_eq!(
            classify(&line("candidate:3 1 udp 16777215 203.0.113.9 3478 typ relay")),
            CandidateType::Relay
        );
        assert_eq!(classify(&line("garbage")), CandidateType::Unknown);
    }

    #[test]
    fn init_keeps_line_and_mid() {
        let init = candidate_init(CandidateRecord {
            candidate: "candidate:1 1 udp 1 192.0.2.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            ..Default::default()
        });
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.username_fragment.is_none());
    }

    #[tokio::test]
    async fn remote_candidates_apply_in_order_and_rejected_ones_are_dropped() {
        let lines = [
            "candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host",
            "candidate:2 1 udp 2130706431 192.0.2.2 50001 typ host",
            "candidate:3 1 udp 16777215 203.0.113.9 3478 typ relay",
        ];
        let peer = Arc::new(RecordingPeer {
            reject: vec![lines[0].to_owned()],
            ..Default::default()
        });

        let (tx, rx) = mpsc::unbounded_channel();
        for l in lines {
            tx.send(line(l)).unwrap();
        }
        drop(tx);
        consume_remote_candidates(rx, peer.clone()).await;

        // the rejected first candidate is not retried and does not block the rest
        assert_eq!(*peer.seen.lock(), lines.map(String::from).to_vec());
    }
}
