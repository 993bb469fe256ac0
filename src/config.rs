//! Session configuration.
//!
//! Defaults mirror the public STUN pair and the collection layout used by the
//! browser client.

use crate::error::ConfigError;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

pub const DEFAULT_RENEGOTIATION_BOUND: u32 = 3;

/// ICE server entry as entered by the user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // "stun" or "turn"
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub directive: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(debug_assertions),
            directive: "peerlink=debug,webrtc=warn".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PlaceholderConfig {
    pub width: u32,
    pub height: u32,
    /// RGBA fill of the blank frame.
    pub fill: [u8; 4],
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fill: [255, 255, 255, 255],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SignalingConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    pub calls_collection: String,
    pub offer_candidates: String,
    pub answer_candidates: String,
    pub data_channel_label: String,
    pub renegotiation_bound: u32,
    pub placeholder: PlaceholderConfig,
    pub log: LogConfig,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 10,
            calls_collection: "calls".into(),
            offer_candidates: "offerCandidates".into(),
            answer_candidates: "answerCandidates".into(),
            data_channel_label: "channel".into(),
            renegotiation_bound: DEFAULT_RENEGOTIATION_BOUND,
            placeholder: PlaceholderConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-2".into(),
            r#type: "stun".into(),
            url: "stun:stun2.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

impl SignalingConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyUrl);
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        if self.renegotiation_bound == 0 {
            return Err(ConfigError::InvalidBound);
        }
        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![add_ice_url_scheme(server)],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Peer connection configuration for the webrtc-rs transport.
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.rtc_ice_servers(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}
