use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Bytes32, Data, DataRef, Message, SignerRef, TransactionType};

/// The current version of the batch manifest format.
pub const MANIFEST_VERSION: u32 = 1;

/// The type of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Broadcast,
    Private,
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Private => f.write_str("private"),
        }
    }
}

/// A reference to the transaction which anchors a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

/// A message entry of a batch manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageManifestEntry {
    pub id: Uuid,
    pub hash: Bytes32,
    /// The number of topics, and therefore pins, of the message.
    pub topics: usize,
}

/// The manifest of a batch: its ordered message & data references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub version: u32,
    pub id: Uuid,
    pub tx: TransactionRef,
    pub messages: Vec<MessageManifestEntry>,
    pub data: Vec<DataRef>,
}

impl BatchManifest {
    /// Build the manifest of the given batch content.
    pub fn new(id: Uuid, tx: TransactionRef, messages: &[Message], data: &[Data]) -> Self {
        Self {
            version: MANIFEST_VERSION,
            id,
            tx,
            messages: messages
                .iter()
                .map(|msg| MessageManifestEntry { id: msg.header.id, hash: msg.hash, topics: msg.header.topics.len() })
                .collect(),
            data: data.iter().map(Data::data_ref).collect(),
        }
    }

    /// The SHA-256 hash of the canonical JSON encoding of this manifest.
    pub fn hash(&self) -> Result<Bytes32> {
        let encoded = serde_json::to_vec(self).context("error encoding batch manifest")?;
        Ok(Bytes32::sha256(&encoded))
    }
}

/// A batch, as persisted in storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchPersisted {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    pub namespace: String,
    /// The ID of the node which assembled this batch.
    pub node: Uuid,
    #[serde(flatten)]
    pub signer: SignerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Bytes32>,
    /// Creation time as a unix timestamp in milliseconds.
    pub created: i64,
    /// The hash of the manifest.
    pub hash: Bytes32,
    pub manifest: BatchManifest,
    pub tx: TransactionRef,
    /// Dispatch time as a unix timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched: Option<i64>,
}

/// A transaction record, representing the intent to anchor a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub namespace: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub created: i64,
}

/// The type of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TransactionSubmitted,
    BatchDispatched,
}

/// An event record, emitted as part of batch lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// The local sequence of this event, assigned when the event is stored.
    #[serde(default)]
    pub sequence: u64,
    pub namespace: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The ID of the record this event refers to.
    pub reference: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx: Option<Uuid>,
    pub created: i64,
}

impl Event {
    /// Create a new event which is yet to be sequenced.
    pub fn new(event_type: EventType, namespace: &str, reference: Uuid, tx: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            namespace: namespace.into(),
            event_type,
            reference,
            tx,
            created: crate::utils::now_millis(),
        }
    }
}

/// A persisted nonce of a private pinning context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    /// The context hash of the (topic, group, author) tuple.
    pub hash: Bytes32,
    pub nonce: u64,
}
