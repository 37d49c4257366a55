use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::batch::cursor::{read_page, Notifier, SequenceCursor};
use crate::config::Config;
use crate::database::Database;
use crate::fixtures;
use crate::models::{MessageState, MessageType, TransactionType};
use crate::plugins::Persistence;
use crate::shutdown::Shutdown;

#[test]
fn signals_ahead_of_cursor_do_not_rewind() {
    let cursor = SequenceCursor::new(10);

    let rewound = cursor.notify_new_message(11);

    assert!(!rewound, "expected no rewind for a sequence ahead of the cursor");
    assert!(cursor.rewind_offset().is_none(), "expected no rewind offset got {:?}", cursor.rewind_offset());
}

#[test]
fn out_of_order_signals_rewind_to_earliest() {
    let cursor = SequenceCursor::new(22222);

    for sequence in [12346, 12347, 12345] {
        assert!(cursor.notify_new_message(sequence), "expected rewind for sequence {}", sequence);
    }

    assert!(cursor.rewind_offset() == Some(12344), "expected rewind offset 12344 got {:?}", cursor.rewind_offset());
    assert!(cursor.read_offset() == 22222, "expected read offset to remain 22222 got {}", cursor.read_offset());
}

#[test]
fn successive_rewinds_only_ever_lower_the_offset() {
    let cursor = SequenceCursor::new(3000);

    cursor.notify_new_message(2000);
    assert!(cursor.rewind_offset() == Some(1999), "expected rewind offset 1999 got {:?}", cursor.rewind_offset());
    cursor.notify_new_message(1000);
    assert!(cursor.rewind_offset() == Some(999), "expected rewind offset 999 got {:?}", cursor.rewind_offset());
    cursor.notify_new_message(2500);
    assert!(cursor.rewind_offset() == Some(999), "expected rewind offset to remain 999 got {:?}", cursor.rewind_offset());
}

#[tokio::test]
async fn read_page_applies_pending_rewind() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    for sequence in 12344..=12347u64 {
        let mut msg = fixtures::new_message(MessageType::Broadcast, TransactionType::BatchPin, &["topic1"], None);
        msg.sequence = sequence;
        db.insert_message(&mut msg)?;
    }
    let store: Arc<dyn Persistence> = Arc::new(db);
    let cursor = SequenceCursor::new(22222);
    for sequence in [12346, 12347, 12345] {
        cursor.notify_new_message(sequence);
    }

    let page = read_page(store.clone(), &cursor, 100, true).await?;

    let sequences: Vec<_> = page.iter().map(|entry| entry.sequence).collect();
    assert!(sequences == vec![12345, 12346, 12347], "expected sequences [12345, 12346, 12347] got {:?}", sequences);
    assert!(cursor.read_offset() == 12347, "expected read offset 12347 got {}", cursor.read_offset());
    assert!(cursor.rewind_offset().is_none(), "expected rewind to be consumed got {:?}", cursor.rewind_offset());

    Ok(())
}

#[tokio::test]
async fn read_page_without_rewind_keeps_pending_rewind() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    fixtures::store_messages(&db, 3, MessageType::Broadcast, TransactionType::BatchPin, None)?;
    let store: Arc<dyn Persistence> = Arc::new(db);
    let cursor = SequenceCursor::new(0);
    let first = read_page(store.clone(), &cursor, 100, true).await?;
    cursor.notify_new_message(first[0].sequence);

    let page = read_page(store.clone(), &cursor, 100, false).await?;

    assert!(page.is_empty(), "expected empty page got {}", page.len());
    assert!(cursor.rewind_offset().is_some(), "expected rewind to remain pending");

    Ok(())
}

#[tokio::test]
async fn read_page_pages_ready_messages_in_order() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let msgs = fixtures::store_messages(&db, 3, MessageType::Broadcast, TransactionType::BatchPin, None)?;
    let mut sent = fixtures::new_message(MessageType::Broadcast, TransactionType::BatchPin, &["topic1"], None);
    sent.state = MessageState::Sent;
    db.insert_message(&mut sent)?;
    let store: Arc<dyn Persistence> = Arc::new(db);
    let cursor = SequenceCursor::new(0);

    let first = read_page(store.clone(), &cursor, 2, true).await?;
    let second = read_page(store.clone(), &cursor, 2, true).await?;

    assert!(first.len() == 2, "expected first page len 2 got {}", first.len());
    assert!(second.len() == 1, "expected second page len 1 got {}", second.len());
    assert!(second[0].id == msgs[2].header.id, "expected message {} got {}", msgs[2].header.id, second[0].id);
    assert!(
        cursor.read_offset() == msgs[2].sequence,
        "expected read offset {} got {}",
        msgs[2].sequence,
        cursor.read_offset()
    );

    Ok(())
}

#[tokio::test]
async fn read_page_empty_leaves_offset_unchanged() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store: Arc<dyn Persistence> = Arc::new(db);
    let cursor = SequenceCursor::new(5);

    let page = read_page(store, &cursor, 100, true).await?;

    assert!(page.is_empty(), "expected empty page got {}", page.len());
    assert!(cursor.read_offset() == 5, "expected read offset 5 got {}", cursor.read_offset());

    Ok(())
}

#[tokio::test]
async fn notifier_coalesces_signals_and_taps() -> Result<()> {
    let cursor = Arc::new(SequenceCursor::new(22222));
    let (tx, rx) = mpsc::channel(10);
    let (_rewinds_tx, rewinds_rx) = mpsc::channel(10);
    let tap = Arc::new(Notify::new());
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = Notifier::new(cursor.clone(), rx, rewinds_rx, tap.clone(), Shutdown::new(shutdown_tx.subscribe())).spawn();

    for sequence in [12346, 12347, 12345] {
        tx.send(sequence).await.context("error sending new message signal")?;
    }
    tokio::time::timeout(Duration::from_secs(5), tap.notified())
        .await
        .context("timeout waiting for notifier tap")?;
    fixtures::wait_for(Duration::from_secs(5), || Ok(cursor.rewind_offset() == Some(12344))).await?;

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .context("timeout waiting for notifier shutdown")?
        .context("error joining notifier")??;

    Ok(())
}

#[tokio::test]
async fn notifier_applies_rewind_triggers() -> Result<()> {
    let cursor = Arc::new(SequenceCursor::new(1000));
    let (_tx, rx) = mpsc::channel(10);
    let (rewinds_tx, rewinds_rx) = mpsc::channel(10);
    let tap = Arc::new(Notify::new());
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = Notifier::new(cursor.clone(), rx, rewinds_rx, tap.clone(), Shutdown::new(shutdown_tx.subscribe())).spawn();

    for sequence in [700, 500, 2000] {
        rewinds_tx.send(sequence).await.context("error sending rewind trigger")?;
    }
    tokio::time::timeout(Duration::from_secs(5), tap.notified())
        .await
        .context("timeout waiting for notifier tap")?;
    fixtures::wait_for(Duration::from_secs(5), || Ok(cursor.rewind_offset() == Some(499))).await?;

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .context("timeout waiting for notifier shutdown")?
        .context("error joining notifier")??;

    Ok(())
}
