use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::message::Message;

fn queue() -> TransactionalQueue {
    TransactionalQueue::in_memory(QueueOptions {
        default_isolation: IsolationLevel::ReadCommitted,
        lock_timeout: Duration::from_millis(50),
    })
}

fn msg(tag: &str) -> Arc<Message> {
    Arc::new(Message::event(tag, json!({"tag": tag})).outgoing())
}

#[tokio::test]
async fn test_empty_queue_counts_zero() {
    let queue = queue();
    assert_eq!(queue.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dequeue_beyond_available_returns_what_exists() {
    let queue = queue();
    let messages: Vec<_> = (0..3).map(|i| msg(&format!("m{i}"))).collect();
    assert_eq!(queue.enqueue(None, &messages).await.unwrap(), 3);

    let taken = queue.dequeue(None, 4).await.unwrap();
    assert_eq!(taken.len(), 3);
    assert_eq!(queue.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dequeue_is_fifo() {
    let queue = queue();
    queue.enqueue(None, &[msg("first")]).await.unwrap();
    queue.enqueue(None, &[msg("second"), msg("third")]).await.unwrap();

    let taken = queue.dequeue(None, 2).await.unwrap();
    let tags: Vec<_> = taken.iter().map(|m| m.content_type().to_string()).collect();
    assert_eq!(tags, vec!["first", "second"]);

    let rest = queue.dequeue(None, 10).await.unwrap();
    assert_eq!(rest[0].content_type(), "third");
}

#[tokio::test]
async fn test_batch_size_zero_is_rejected() {
    let queue = queue();
    let err = queue.dequeue(None, 0).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidBatchSize));
}

#[tokio::test]
async fn test_staged_enqueue_invisible_until_commit() {
    let queue = queue();
    let txn = queue.begin(IsolationLevel::ReadCommitted);
    queue.enqueue(Some(&txn), &[msg("staged")]).await.unwrap();

    // Not visible to an independent reader while uncommitted
    assert_eq!(queue.count(None).await.unwrap(), 0);
    // Visible to the transaction itself
    assert_eq!(queue.count(Some(&txn)).await.unwrap(), 1);

    txn.commit().unwrap();
    assert_eq!(queue.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_rolled_back_enqueue_leaves_count_unchanged() {
    let queue = queue();
    let mut changes = queue.changes();

    let txn = queue.begin(IsolationLevel::ReadCommitted);
    queue.enqueue(Some(&txn), &[msg("a"), msg("b")]).await.unwrap();
    txn.rollback();

    assert_eq!(queue.count(None).await.unwrap(), 0);
    // No notification for a rolled-back transaction
    assert!(matches!(
        changes.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_rolled_back_dequeue_restores_entries() {
    let queue = queue();
    queue.enqueue(None, &[msg("keep")]).await.unwrap();
    let mut changes = queue.changes();

    let txn = queue.begin(IsolationLevel::ReadCommitted);
    let taken = queue.dequeue(Some(&txn), 1).await.unwrap();
    assert_eq!(taken.len(), 1);
    txn.rollback();

    assert_eq!(queue.count(None).await.unwrap(), 1);
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let queue = queue();
    {
        let txn = queue.begin(IsolationLevel::ReadCommitted);
        queue.enqueue(Some(&txn), &[msg("orphan")]).await.unwrap();
        // Dropped without commit
    }
    assert_eq!(queue.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_changed_fires_once_with_net_counts() {
    let queue = queue();
    queue.enqueue(None, &[msg("old")]).await.unwrap();
    let mut changes = queue.changes();

    let txn = queue.begin(IsolationLevel::ReadCommitted);
    queue
        .enqueue(Some(&txn), &[msg("n1"), msg("n2"), msg("n3")])
        .await
        .unwrap();
    queue.dequeue(Some(&txn), 1).await.unwrap();
    txn.commit().unwrap();

    let change = changes.try_recv().unwrap();
    assert_eq!(
        change,
        QueueChange {
            enqueued: 3,
            dequeued: 1
        }
    );
    // Exactly once
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_changed_silent_for_count_only_transaction() {
    let queue = queue();
    queue.enqueue(None, &[msg("x")]).await.unwrap();
    let mut changes = queue.changes();

    let txn = queue.begin(IsolationLevel::ReadCommitted);
    queue.count(Some(&txn)).await.unwrap();
    txn.commit().unwrap();

    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_dequeue_of_own_staged_entry_nets_to_zero() {
    let queue = queue();
    let mut changes = queue.changes();

    let txn = queue.begin(IsolationLevel::ReadCommitted);
    queue.enqueue(Some(&txn), &[msg("fleeting")]).await.unwrap();
    let taken = queue.dequeue(Some(&txn), 1).await.unwrap();
    assert_eq!(taken[0].content_type(), "fleeting");
    txn.commit().unwrap();

    assert_eq!(queue.count(None).await.unwrap(), 0);
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_serializable_count_blocks_on_uncommitted_enqueue() {
    let queue = queue();

    let writer = queue.begin(IsolationLevel::Serializable);
    queue.enqueue(Some(&writer), &[msg("locked")]).await.unwrap();

    // A concurrent serializable reader waits on the writer's exclusive
    // locks until the configured timeout expires.
    let reader = queue.begin(IsolationLevel::Serializable);
    let err = queue.count(Some(&reader)).await.unwrap_err();
    assert!(matches!(err, QueueError::LockTimeout { .. }));

    // The same count under read-uncommitted succeeds immediately and
    // observes the dirty entry.
    let dirty = queue.begin(IsolationLevel::ReadUncommitted);
    assert_eq!(queue.count(Some(&dirty)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_waiter_proceeds_after_writer_commits() {
    let queue = queue();
    let writer = queue.begin(IsolationLevel::Serializable);
    queue.enqueue(Some(&writer), &[msg("pending")]).await.unwrap();

    let reader_queue = queue.clone();
    let reader = tokio::spawn(async move {
        let txn = reader_queue.begin(IsolationLevel::Serializable);
        reader_queue.count(Some(&txn)).await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    writer.commit().unwrap();

    assert_eq!(reader.await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_dequeue_takes_disjoint_entries() {
    let queue = queue();
    let messages: Vec<_> = (0..4).map(|i| msg(&format!("m{i}"))).collect();
    queue.enqueue(None, &messages).await.unwrap();

    let a = queue.begin(IsolationLevel::ReadCommitted);
    let b = queue.begin(IsolationLevel::ReadCommitted);
    let first = queue.dequeue(Some(&a), 2).await.unwrap();
    let second = queue.dequeue(Some(&b), 2).await.unwrap();

    a.commit().unwrap();
    b.commit().unwrap();

    let mut tags: Vec<_> = first
        .iter()
        .chain(second.iter())
        .map(|m| m.content_type().to_string())
        .collect();
    tags.sort();
    assert_eq!(tags, vec!["m0", "m1", "m2", "m3"]);
    assert_eq!(queue.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_journal_preserves_fifo_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbound.jsonl");
    let options = QueueOptions {
        default_isolation: IsolationLevel::ReadCommitted,
        lock_timeout: Duration::from_millis(50),
    };

    let original = msg("survivor");
    {
        let queue = TransactionalQueue::open(&path, options.clone()).unwrap();
        queue.enqueue(None, &[msg("gone"), original.clone()]).await.unwrap();
        queue.dequeue(None, 1).await.unwrap();
    }

    let reopened = TransactionalQueue::open(&path, options).unwrap();
    assert_eq!(reopened.count(None).await.unwrap(), 1);

    let restored = reopened.dequeue(None, 1).await.unwrap();
    assert_eq!(restored[0].id(), original.id());
    assert_eq!(restored[0].content_type(), "survivor");

    // Sequence numbering continues past the replayed entries
    reopened.enqueue(None, &[msg("later")]).await.unwrap();
    let later = reopened.dequeue(None, 1).await.unwrap();
    assert_eq!(later[0].content_type(), "later");
}

#[tokio::test]
async fn test_auto_commit_calls_are_independent_units() {
    let queue = queue();
    let mut changes = queue.changes();

    queue.enqueue(None, &[msg("one")]).await.unwrap();
    queue.enqueue(None, &[msg("two")]).await.unwrap();

    // One notification per call
    assert!(changes.try_recv().is_ok());
    assert!(changes.try_recv().is_ok());
    assert!(changes.try_recv().is_err());
    assert_eq!(queue.count(None).await.unwrap(), 2);
}
