//! Collaborator interfaces consumed by the batch engine.
//!
//! All of these interfaces are synchronous. The engine always calls into them from blocking
//! tasks via `Database::spawn_blocking`, never directly from an async context.

use std::fmt;

use anyhow::Result;
use uuid::Uuid;

use crate::models::{BatchPersisted, Bytes32, Data, Event, IdAndSequence, Message, MessageState, Nonce, Transaction};

/// A bounded, ascending query over the message sequence index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageQuery {
    /// Only messages with a sequence strictly greater than this value are returned.
    pub after_sequence: u64,
    /// Only messages in this state are returned, if specified.
    pub state: Option<MessageState>,
    /// The maximum number of results to return.
    pub limit: usize,
}

/// A guarded filter over a set of messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageFilter {
    pub ids: Vec<Uuid>,
    pub state: MessageState,
}

impl MessageFilter {
    /// A filter matching the given messages only while they are in the `ready` state.
    pub fn ready(ids: Vec<Uuid>) -> Self {
        Self { ids, state: MessageState::Ready }
    }

    /// Check if the given message matches this filter.
    pub fn matches(&self, msg: &Message) -> bool {
        msg.state == self.state && self.ids.contains(&msg.header.id)
    }
}

impl fmt::Display for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.ids.iter().map(|id| format!("'{}'", id)).collect();
        write!(f, "( id IN [{}] ) && ( state == '{}' )", ids.join(","), self.state)
    }
}

/// A partial update of a message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageUpdate {
    pub batch: Option<Uuid>,
    pub state: Option<MessageState>,
    pub pins: Option<Vec<String>>,
}

impl MessageUpdate {
    /// Apply this update to the given message.
    pub fn apply(&self, msg: &mut Message) {
        if let Some(batch) = self.batch {
            msg.batch = Some(batch);
        }
        if let Some(state) = self.state {
            msg.state = state;
        }
        if let Some(pins) = &self.pins {
            msg.pins = pins.clone();
        }
    }
}

/// The persistence layer of the node.
pub trait Persistence: Send + Sync + 'static {
    /// Query message summaries in ascending sequence order.
    fn get_message_ids(&self, query: &MessageQuery) -> Result<Vec<IdAndSequence>>;

    /// Get a message by ID.
    fn get_message_by_id(&self, id: &Uuid) -> Result<Option<Message>>;

    /// Get a data item by ID.
    fn get_data_by_id(&self, id: &Uuid) -> Result<Option<Data>>;

    /// Get a batch by ID.
    fn get_batch_by_id(&self, id: &Uuid) -> Result<Option<BatchPersisted>>;

    /// Get the nonce of a private pinning context.
    fn get_nonce(&self, hash: &Bytes32) -> Result<Option<Nonce>>;

    /// Run the given unit of work atomically.
    ///
    /// Either every write performed through the given group becomes visible, or none of them
    /// do. An error returned from the unit of work aborts it.
    fn run_as_group(&self, work: &dyn Fn(&mut dyn StoreGroup) -> Result<()>) -> Result<()>;
}

/// The operations available within an atomic unit of work.
pub trait StoreGroup {
    /// Insert or replace a batch record.
    fn upsert_batch(&mut self, batch: &BatchPersisted) -> Result<()>;

    /// Apply the given update to every message matching the filter, returning the number of
    /// messages updated.
    fn update_messages(&mut self, filter: &MessageFilter, update: &MessageUpdate) -> Result<u64>;

    /// Apply the given update to a single message, returning `false` if it does not exist.
    fn update_message(&mut self, id: &Uuid, update: &MessageUpdate) -> Result<bool>;

    /// Insert a transaction record.
    fn insert_transaction(&mut self, tx: &Transaction) -> Result<()>;

    /// Insert an event, assigning its sequence.
    fn insert_event(&mut self, event: &Event) -> Result<u64>;

    /// Get the nonce of a private pinning context.
    fn get_nonce(&mut self, hash: &Bytes32) -> Result<Option<Nonce>>;

    /// Insert or replace the nonce of a private pinning context.
    fn upsert_nonce(&mut self, nonce: &Nonce) -> Result<()>;
}

/// A message along with its resolved data.
#[derive(Clone, Debug)]
pub struct MessageWithData {
    pub message: Message,
    /// The resolved data items, in the order of the message's data references.
    pub data: Vec<Data>,
    /// Whether every referenced data item was found.
    pub all_present: bool,
}

/// A caching data layer in front of persistence.
pub trait DataManager: Send + Sync + 'static {
    /// Get a message along with its data, serving from cache where possible.
    ///
    /// Returns `None` if the message does not exist.
    fn get_message_with_data_cached(&self, id: &Uuid) -> Result<Option<MessageWithData>>;

    /// Replace the cached copy of the given message, if one is cached.
    fn update_message_if_cached(&self, msg: &Message);
}

/// Identity information of the local node.
pub trait LocalNodeInfo: Send + Sync + 'static {
    /// The stable ID of this node.
    fn node_id(&self) -> Uuid;
}

/// Node identity taken from static configuration.
#[derive(Clone, Copy, Debug)]
pub struct StaticNodeInfo(pub Uuid);

impl LocalNodeInfo for StaticNodeInfo {
    fn node_id(&self) -> Uuid {
        self.0
    }
}
