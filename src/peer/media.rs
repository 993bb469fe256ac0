//! Local/remote media tracks, identity-stable streams and placeholder media.

use crate::config::PlaceholderConfig;
use crate::error::{CaptureError, TransportError};
use crate::peer::types::MediaKind;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub fn kind_of(codec_type: RTPCodecType) -> Option<MediaKind> {
    match codec_type {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        RTPCodecType::Unspecified => None,
    }
}

pub enum TrackSource {
    Local(Arc<TrackLocalStaticSample>),
    Remote(Arc<TrackRemote>),
}

pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    source: TrackSource,
}

impl MediaTrack {
    /// Sample-fed local track (Opus for audio, VP8 for video).
    pub fn local(kind: MediaKind, label: impl Into<String>, stream_id: &str) -> Self {
        let id = format!("{kind}-{}", random_id());
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let track = TrackLocalStaticSample::new(codec, id.clone(), stream_id.to_owned());
        Self {
            id,
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            source: TrackSource::Local(Arc::new(track)),
        }
    }

    /// Wraps an inbound webrtc-rs track. Returns `None` for tracks of unknown kind.
    pub fn remote(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = kind_of(track.kind())?;
        Some(Self {
            id: track.id(),
            kind,
            label: format!("remote {}", track.stream_id()),
            enabled: AtomicBool::new(true),
            source: TrackSource::Remote(track),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    /// The webrtc-rs handle to bind to a sender, for local tracks.
    pub fn local_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        match &self.source {
            TrackSource::Local(track) => Some(track.clone() as Arc<dyn TrackLocal + Send + Sync>),
            TrackSource::Remote(_) => None,
        }
    }

    /// Feeds one encoded frame. Disabled tracks swallow samples.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TransportError> {
        let TrackSource::Local(track) = &self.source else {
            return Err(TransportError::RemoteTrack(self.id.clone()));
        };
        if !self.is_enabled() {
            trace!(track = %self.id, "dropping sample on disabled track");
            return Ok(());
        }
        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A set of tracks whose identity never changes; only its contents do.
#[derive(Debug)]
pub struct MediaStream {
    id: String,
    tracks: RwLock<Vec<Arc<MediaTrack>>>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::with_tracks(Vec::new())
    }

    pub fn with_tracks(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: random_id(),
            tracks: RwLock::new(tracks),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a track unless one with the same id is already present.
    pub fn add_track(&self, track: Arc<MediaTrack>) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    pub fn track_of_kind(&self, kind: MediaKind) -> Option<Arc<MediaTrack>> {
        self.tracks.read().iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Inert tracks that pin one audio and one video transceiver before any
/// capture device is attached.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderMedia {
    config: PlaceholderConfig,
}

impl PlaceholderMedia {
    pub fn new(config: PlaceholderConfig) -> Self {
        Self { config }
    }

    /// Disabled Opus track standing in for a silent oscillator.
    pub fn silence(&self, stream_id: &str) -> Arc<MediaTrack> {
        let track = MediaTrack::local(MediaKind::Audio, "silence", stream_id);
        track.set_enabled(false);
        Arc::new(track)
    }

    /// Disabled VP8 track standing in for a flat-color canvas capture.
    pub fn blank(&self, stream_id: &str) -> Arc<MediaTrack> {
        let [r, g, b, a] = self.config.fill;
        let label = format!(
            "blank {}x{} #{}",
            self.config.width,
            self.config.height,
            hex::encode([r, g, b, a])
        );
        let track = MediaTrack::local(MediaKind::Video, label, stream_id);
        track.set_enabled(false);
        Arc::new(track)
    }

    pub fn track(&self, kind: MediaKind, stream_id: &str) -> Arc<MediaTrack> {
        match kind {
            MediaKind::Audio => self.silence(stream_id),
            MediaKind::Video => self.blank(stream_id),
        }
    }

    pub fn stream(&self) -> Arc<MediaStream> {
        let stream = MediaStream::new();
        let id = stream.id().to_owned();
        stream.add_track(self.blank(&id));
        stream.add_track(self.silence(&id));
        Arc::new(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Capture capability supplied by the host (camera/microphone access).
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn get_local_tracks(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, CaptureError>;
}
