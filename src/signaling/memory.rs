use crate::error::ChannelError;
use crate::peer::types::{CandidateRecord, SessionRecord, SessionUpdate};
use crate::signaling::{AdditionStream, RecordStream, SignalingChannel};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Default)]
struct SubCollection {
    items: Vec<CandidateRecord>,
    watchers: Vec<mpsc::UnboundedSender<CandidateRecord>>,
}

#[derive(Default)]
struct Document {
    record: SessionRecord,
    watchers: Vec<mpsc::UnboundedSender<SessionRecord>>,
    subcollections: HashMap<String, SubCollection>,
}

/// In-process document store with change notifications. Both peers of a
/// session can share one instance.
#[derive(Default)]
pub struct MemoryChannel {
    documents: Mutex<HashMap<(String, String), Document>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items appended so far to one sub-collection.
    pub fn items(&self, collection: &str, id: &str, subcollection: &str) -> Vec<CandidateRecord> {
        self.documents
            .lock()
            .get(&key(collection, id))
            .and_then(|doc| doc.subcollections.get(subcollection))
            .map(|sub| sub.items.clone())
            .unwrap_or_default()
    }
}

fn key(collection: &str, id: &str) -> (String, String) {
    (collection.to_owned(), id.to_owned())
}

fn not_found(collection: &str, id: &str) -> ChannelError {
    ChannelError::NotFound {
        collection: collection.to_owned(),
        id: id.to_owned(),
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn create(&self, collection: &str) -> Result<String, ChannelError> {
        let mut docs = self.documents.lock();
        let mut id = random_id();
        while docs.contains_key(&key(collection, &id)) {
            id = random_id();
        }
        docs.insert(key(collection, &id), Document::default());
        debug!(collection, id = %id, "created record");
        Ok(id)
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<SessionRecord>, ChannelError> {
        Ok(self
            .documents
            .lock()
            .get(&key(collection, id))
            .map(|doc| doc.record.clone()))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: SessionUpdate,
    ) -> Result<(), ChannelError> {
        let mut docs = self.documents.lock();
        let doc = docs
            .get_mut(&key(collection, id))
            .ok_or_else(|| not_found(collection, id))?;
        debug!(collection, id, field = update.field(), "updating record");
        doc.record.apply(update);
        let snapshot = doc.record.clone();
        doc.watchers.retain(|w| w.send(snapshot.clone()).is_ok());
        Ok(())
    }

    async fn subscribe_to_record(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<RecordStream, ChannelError> {
        let mut docs = self.documents.lock();
        let doc = docs
            .get_mut(&key(collection, id))
            .ok_or_else(|| not_found(collection, id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(doc.record.clone()).is_ok() {
            doc.watchers.push(tx);
        }
        Ok(rx)
    }

    async fn append_to_subcollection(
        &self,
        collection: &str,
        id: &str,
        subcollection: &str,
        item: CandidateRecord,
    ) -> Result<(), ChannelError> {
        let mut docs = self.documents.lock();
        let doc = docs
            .get_mut(&key(collection, id))
            .ok_or_else(|| not_found(collection, id))?;
        let sub = doc.subcollections.entry(subcollection.to_owned()).or_default();
        sub.watchers.retain(|w| w.send(item.clone()).is_ok());
        sub.items.push(item);
        trace!(collection, id, subcollection, count = sub.items.len(), "appended item");
        Ok(())
    }

    async fn subscribe_to_additions(
        &self,
        collection: &str,
        id: &str,
        subcollection: &str,
    ) -> Result<AdditionStream, ChannelError> {
        let mut docs = self.documents.lock();
        let doc = docs
            .get_mut(&key(collection, id))
            .ok_or_else(|| not_found(collection, id))?;
        let sub = doc.subcollections.entry(subcollection.to_owned()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        for item in &sub.items {
            // receiver is still in hand, cannot fail
            let _ = tx.send(item.clone());
        }
        sub.watchers.push(tx);
        Ok(rx)
    }
}
