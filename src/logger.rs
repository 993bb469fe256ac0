use crate::config::LogConfig;
use crate::peer::types::CandidateRecord;
use once_cell::sync::OnceCell;
use tracing::debug;
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Installs the global subscriber once. Later calls are ignored, as is a
/// subscriber installed by the host application.
pub fn init(config: &LogConfig) {
    if !config.enabled {
        return;
    }
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.directive))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
            .with_target(true)
            .try_init();
    });
}

/// Trickle trace of a candidate as it is published or consumed.
pub fn dump_candidate(label: &str, cand: &CandidateRecord) {
    debug!(
        label,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_m_line_index,
        username_fragment = ?cand.username_fragment,
        "trickle candidate"
    );
}
