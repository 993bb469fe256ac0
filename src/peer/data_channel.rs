use crate::error::{SignalResult, TransportError};
use crate::peer::transport::{DataChannelEvent, DataChannelTransport};
use crate::peer::types::AppMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// `DataChannelTransport` over a webrtc-rs data channel.
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<DataChannelEvent>>>,
}

impl RtcDataChannel {
    /// Installs the open/message/close handlers. Events are queued until
    /// someone takes the receiver.
    pub fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        let label = dc.label().to_owned();
        dc.on_open(Box::new(move || {
            info!(label = %label, "data channel opened");
            let _ = open_tx.send(DataChannelEvent::Open);
            Box::pin(async {})
        }));

        let msg_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            debug!(len = msg.data.len(), is_string = msg.is_string, "data channel message");
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = msg_tx.send(DataChannelEvent::Message(text));
                }
                Err(_) => warn!(len = msg.data.len(), "dropping non-utf8 data channel payload"),
            }
            Box::pin(async {})
        }));

        dc.on_close(Box::new(move || {
            info!("data channel closed");
            let _ = tx.send(DataChannelEvent::Close);
            Box::pin(async {})
        }));

        Arc::new(Self {
            dc,
            events: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl DataChannelTransport for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_owned()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>> {
        self.events.lock().take()
    }
}

/// Sends and decodes application messages. Without an established channel
/// every send is a no-op.
#[derive(Clone, Default)]
pub struct AppChannel {
    channel: Option<Arc<dyn DataChannelTransport>>,
}

impl AppChannel {
    pub fn new(channel: Option<Arc<dyn DataChannelTransport>>) -> Self {
        Self { channel }
    }

    pub fn is_established(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn send(&self, message: &AppMessage) -> SignalResult<()> {
        let Some(dc) = &self.channel else {
            debug!(?message, "no data channel yet, message not sent");
            return Ok(());
        };
        let text = serde_json::to_string(message)?;
        dc.send_text(text).await?;
        Ok(())
    }

    pub fn decode(text: &str) -> Result<AppMessage, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Drains one channel's events: `on_open` runs once when it opens, decoded
/// messages go to `inbound`. Returns when the channel closes.
pub async fn pump_inbound<F>(
    mut events: mpsc::UnboundedReceiver<DataChannelEvent>,
    inbound: broadcast::Sender<AppMessage>,
    on_open: F,
) where
    F: FnOnce() + Send,
{
    let mut on_open = Some(on_open);
    while let Some(event) = events.recv().await {
        match event {
            DataChannelEvent::Open => {
                if let Some(f) = on_open.take() {
                    f();
                }
            }
            DataChannelEvent::Message(text) => match AppChannel::decode(&text) {
                Ok(message) => {
                    // no receivers is fine
                    let _ = inbound.send(message);
                }
                Err(e) => warn!(error = %e, "dropping undecodable application message"),
            },
            DataChannelEvent::Close => {
                debug!("data channel event stream finished");
                break;
            }
        }
    }
}
