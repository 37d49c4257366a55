//! Pin calculation.
//!
//! A pin is a content-addressed hash which is written on-chain in place of a message topic.
//! Broadcast pins are simply the hash of the topic. Private pins additionally mix in the group
//! and author of the message along with a per-context nonce, so that parties outside of the
//! group can neither correlate pins with topics nor reorder the messages of a context.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::models::{Bytes32, Message, Nonce, TransactionType};
use crate::plugins::StoreGroup;

/// The pin of a broadcast message topic.
pub fn broadcast_pin(topic: &str) -> Bytes32 {
    Bytes32::sha256(topic.as_bytes())
}

/// The context hash of a private (topic, group, author) tuple, which keys its nonce.
pub fn context_hash(topic: &str, group: &Bytes32, author: &str) -> Bytes32 {
    Bytes32::from_hasher(context_hasher(topic, group, author))
}

/// The pin of a private message topic at the given nonce.
pub fn private_pin(topic: &str, group: &Bytes32, author: &str, nonce: u64) -> Bytes32 {
    let mut hasher = context_hasher(topic, group, author);
    hasher.update(nonce.to_be_bytes());
    Bytes32::from_hasher(hasher)
}

fn context_hasher(topic: &str, group: &Bytes32, author: &str) -> Sha256 {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(group.as_bytes());
    hasher.update(author.as_bytes());
    hasher
}

/// Calculate the pins of the given batch messages, one list per message in topic order.
///
/// Private contexts have their nonce read & incremented through the given group, so this must
/// run inside the same unit of work which seals the batch.
pub fn calculate_pins(group: &mut dyn StoreGroup, tx_type: TransactionType, messages: &[Message]) -> Result<Vec<Vec<Bytes32>>> {
    if tx_type != TransactionType::BatchPin {
        return Ok(vec![vec![]; messages.len()]);
    }
    let mut pins = Vec::with_capacity(messages.len());
    for msg in messages {
        let header = &msg.header;
        let mut msg_pins = Vec::with_capacity(header.topics.len());
        for topic in header.topics.iter() {
            let pin = match &header.group {
                None => broadcast_pin(topic),
                Some(group_hash) => {
                    let author = header.signer.author.as_str();
                    let hash = context_hash(topic, group_hash, author);
                    let nonce = match group.get_nonce(&hash).context("error fetching nonce")? {
                        Some(stored) => stored.nonce + 1,
                        None => 0,
                    };
                    tracing::trace!(context = %hash, nonce, "assigned nonce to private context");
                    group.upsert_nonce(&Nonce { hash, nonce }).context("error updating nonce")?;
                    private_pin(topic, group_hash, author, nonce)
                }
            };
            msg_pins.push(pin);
        }
        pins.push(msg_pins);
    }
    Ok(pins)
}
