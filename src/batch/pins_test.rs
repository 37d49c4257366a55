use std::cell::RefCell;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::batch::pins::{broadcast_pin, calculate_pins, context_hash, private_pin};
use crate::config::Config;
use crate::database::Database;
use crate::fixtures;
use crate::models::{Bytes32, MessageType, Nonce, TransactionType};
use crate::plugins::{Persistence, StoreGroup};

#[test]
fn broadcast_pin_is_hash_of_topic() {
    let expected = Bytes32::from_hasher(Sha256::new().chain_update(b"topic1"));
    let pin = broadcast_pin("topic1");
    assert!(pin == expected, "expected pin {} got {}", expected, pin);
    // Well known SHA-256 of the empty string.
    let empty = broadcast_pin("").to_string();
    let expected_empty = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    assert!(empty == expected_empty, "expected pin {} got {}", expected_empty, empty);
}

#[test]
fn private_pin_hashes_context_then_nonce() {
    let group = Bytes32::sha256(b"group1");
    let author = fixtures::AUTHOR;

    let mut hasher = Sha256::new();
    hasher.update(b"topic1");
    hasher.update(group.as_bytes());
    hasher.update(author.as_bytes());
    let expected_context = Bytes32::from_hasher(hasher.clone());
    hasher.update(12345u64.to_be_bytes());
    let expected_pin = Bytes32::from_hasher(hasher);

    let context = context_hash("topic1", &group, author);
    let pin = private_pin("topic1", &group, author, 12345);
    assert!(context == expected_context, "expected context {} got {}", expected_context, context);
    assert!(pin == expected_pin, "expected pin {} got {}", expected_pin, pin);
}

#[test]
fn private_pin_is_sensitive_to_every_input() {
    let (group, other_group) = (Bytes32::sha256(b"group1"), Bytes32::sha256(b"group2"));
    let base = private_pin("topic1", &group, "author1", 1);

    let variants = [
        ("topic", private_pin("topic2", &group, "author1", 1)),
        ("group", private_pin("topic1", &other_group, "author1", 1)),
        ("author", private_pin("topic1", &group, "author2", 1)),
        ("nonce", private_pin("topic1", &group, "author1", 2)),
    ];
    for (input, pin) in variants.iter() {
        assert!(*pin != base, "expected pin to change when {} changes got {}", input, pin);
    }
}

#[tokio::test]
async fn calculate_pins_assigns_sequential_private_nonces() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let group = fixtures::new_group();
    let author = fixtures::AUTHOR;
    let existing = context_hash("topic1", &group, author);
    let fresh = context_hash("topic2", &group, author);
    db.run_as_group(&|tx: &mut dyn StoreGroup| tx.upsert_nonce(&Nonce { hash: existing, nonce: 12344 }))?;

    let msgs = vec![
        fixtures::new_message(MessageType::Private, TransactionType::BatchPin, &["topic1", "topic2"], Some(group)),
        fixtures::new_message(MessageType::Private, TransactionType::BatchPin, &["topic1"], Some(group)),
    ];
    let output = RefCell::new(vec![]);
    db.run_as_group(&|tx: &mut dyn StoreGroup| {
        *output.borrow_mut() = calculate_pins(tx, TransactionType::BatchPin, &msgs)?;
        Ok(())
    })?;
    let pins = output.into_inner();

    let expected = vec![
        vec![private_pin("topic1", &group, author, 12345), private_pin("topic2", &group, author, 0)],
        vec![private_pin("topic1", &group, author, 12346)],
    ];
    assert!(pins == expected, "expected pins {:?} got {:?}", expected, pins);
    let existing_nonce = db.get_nonce(&existing)?.map(|nonce| nonce.nonce);
    assert!(existing_nonce == Some(12346), "expected nonce 12346 got {:?}", existing_nonce);
    let fresh_nonce = db.get_nonce(&fresh)?.map(|nonce| nonce.nonce);
    assert!(fresh_nonce == Some(0), "expected nonce 0 got {:?}", fresh_nonce);

    Ok(())
}

#[tokio::test]
async fn calculate_pins_for_broadcast_uses_topic_hashes() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let msgs = vec![fixtures::new_message(MessageType::Broadcast, TransactionType::BatchPin, &["topic1", "topic2"], None)];

    let output = RefCell::new(vec![]);
    db.run_as_group(&|tx: &mut dyn StoreGroup| {
        *output.borrow_mut() = calculate_pins(tx, TransactionType::BatchPin, &msgs)?;
        Ok(())
    })?;
    let pins = output.into_inner();

    let expected = vec![vec![broadcast_pin("topic1"), broadcast_pin("topic2")]];
    assert!(pins == expected, "expected pins {:?} got {:?}", expected, pins);

    Ok(())
}

#[tokio::test]
async fn calculate_pins_is_empty_when_unpinned() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let group = fixtures::new_group();
    let msgs = vec![fixtures::new_message(MessageType::Private, TransactionType::Unpinned, &["topic1"], Some(group))];

    let output = RefCell::new(vec![]);
    db.run_as_group(&|tx: &mut dyn StoreGroup| {
        *output.borrow_mut() = calculate_pins(tx, TransactionType::Unpinned, &msgs)?;
        Ok(())
    })?;
    let pins = output.into_inner();

    assert!(pins == vec![Vec::<Bytes32>::new()], "expected one empty pin list got {:?}", pins);
    let nonce = db.get_nonce(&context_hash("topic1", &group, fixtures::AUTHOR))?;
    assert!(nonce.is_none(), "expected no nonce to be allocated got {:?}", nonce);

    Ok(())
}
