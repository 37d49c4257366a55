use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Bytes32;

/// The base size estimate of a message, before accounting for its variable length fields.
const MESSAGE_SIZE_ESTIMATE_BASE: u64 = 1024;
/// The base size estimate of a data item, before accounting for its value.
const DATA_SIZE_ESTIMATE_BASE: u64 = 256;

/// The type of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Definition,
    Broadcast,
    Private,
    GroupInit,
    TransferBroadcast,
    TransferPrivate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Definition => "definition",
            Self::Broadcast => "broadcast",
            Self::Private => "private",
            Self::GroupInit => "groupinit",
            Self::TransferBroadcast => "transfer_broadcast",
            Self::TransferPrivate => "transfer_private",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The type of the transaction used to anchor a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// No transaction is submitted for the batch.
    None,
    /// The batch is anchored by a pinning transaction.
    BatchPin,
    /// The batch is sent without any on-chain pinning.
    Unpinned,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BatchPin => "batch_pin",
            Self::Unpinned => "unpinned",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dispatch state of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Staged,
    Ready,
    Sent,
    Pending,
    Confirmed,
    Rejected,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Ready => "ready",
            Self::Sent => "sent",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to the identity which signed a message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignerRef {
    /// The DID of the author.
    pub author: String,
    /// The signing key of the author.
    pub key: String,
}

/// The header of a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: Uuid,
    pub namespace: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(rename = "txtype")]
    pub tx_type: TransactionType,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub tag: String,
    /// The hash of the privacy group of a private message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Bytes32>,
    #[serde(flatten)]
    pub signer: SignerRef,
    /// Creation time as a unix timestamp in milliseconds.
    pub created: i64,
}

/// A reference from a message to a data item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataRef {
    pub id: Uuid,
    pub hash: Bytes32,
}

/// An application message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    /// The hash of the message header & data references.
    pub hash: Bytes32,
    #[serde(default)]
    pub data: Vec<DataRef>,
    pub state: MessageState,
    /// The batch to which this message has been bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<Uuid>,
    /// The pins of this message, one per topic, rendered as hex.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pins: Vec<String>,
    /// The local sequence of this message, assigned when the message is stored.
    #[serde(default)]
    pub sequence: u64,
}

impl Message {
    /// An estimate of the number of bytes this message will occupy in a batch payload.
    pub fn estimate_size(&self, include_data_refs: bool) -> u64 {
        let header = &self.header;
        let mut size = MESSAGE_SIZE_ESTIMATE_BASE
            + header.namespace.len() as u64
            + header.tag.len() as u64
            + header.signer.author.len() as u64
            + header.signer.key.len() as u64
            + header.topics.iter().map(|topic| topic.len() as u64).sum::<u64>();
        if include_data_refs {
            size += self.data.len() as u64 * (16 + 32);
        }
        size
    }
}

/// A data item referenced by a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub id: Uuid,
    pub namespace: String,
    pub hash: Bytes32,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Creation time as a unix timestamp in milliseconds.
    pub created: i64,
}

impl Data {
    /// A reference to this data item.
    pub fn data_ref(&self) -> DataRef {
        DataRef { id: self.id, hash: self.hash }
    }

    /// An estimate of the number of bytes this data item will occupy in a batch payload.
    pub fn estimate_size(&self) -> u64 {
        DATA_SIZE_ESTIMATE_BASE + self.value.to_string().len() as u64
    }
}

/// A message summary, as returned by paged sequence queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAndSequence {
    pub id: Uuid,
    pub sequence: u64,
}
