//! Signaling channel: the remote document store both peers use to swap one
//! offer, one answer and their trickled candidates.

pub mod memory;

use crate::error::ChannelError;
use crate::peer::types::{CandidateRecord, SessionRecord, SessionUpdate};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryChannel;

/// Every snapshot of one record, starting with the current one.
pub type RecordStream = mpsc::UnboundedReceiver<SessionRecord>;

/// Every item of one sub-collection, once each, in append order. Items present
/// at subscribe time come first.
pub type AdditionStream = mpsc::UnboundedReceiver<CandidateRecord>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Creates an empty record and returns its identifier.
    async fn create(&self, collection: &str) -> Result<String, ChannelError>;

    async fn read(&self, collection: &str, id: &str) -> Result<Option<SessionRecord>, ChannelError>;

    /// Merges `update` into an existing record.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: SessionUpdate,
    ) -> Result<(), ChannelError>;

    async fn subscribe_to_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<RecordStream, ChannelError>;

    async fn append_to_subcollection(
        &self,
        collection: &str,
        id: &str,
        subcollection: &str,
        item: CandidateRecord,
    ) -> Result<(), ChannelError>;

    async fn subscribe_to_additions(
        &self,
        collection: &str,
        id: &str,
        subcollection: &str,
    ) -> Result<AdditionStream, ChannelError>;
}
