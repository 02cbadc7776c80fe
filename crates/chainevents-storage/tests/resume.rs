//! Resuming listeners from a file checkpoint across sessions.

use std::sync::{Arc, Mutex};

use chainevents_core::{
    BlockEvent, Checkpoint, EventError, FanoutBlockSource, ListenOptions, NetworkBuilder, PeerRef,
    TransactionEvent, ValidationCode,
};
use chainevents_storage::FileCheckpoint;
use tempfile::TempDir;

fn block(number: u64) -> BlockEvent {
    BlockEvent::new(number, PeerRef::new("peer1"))
}

#[test]
fn block_listener_resumes_after_last_checkpointed_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blocks.json");
    let received = Arc::new(Mutex::new(vec![]));

    {
        let source = Arc::new(FanoutBlockSource::new());
        let session = NetworkBuilder::new().block_source(source.clone()).connect().unwrap();
        let checkpoint = Arc::new(FileCheckpoint::open(&path).unwrap());
        let sink = received.clone();
        session
            .add_checkpoint_listener(
                checkpoint.clone(),
                Arc::new(move |b: &BlockEvent| -> Result<(), EventError> {
                    sink.lock().unwrap().push(b.block_number);
                    Ok(())
                }),
            )
            .unwrap();

        for n in 1..=3 {
            source.send(&block(n));
        }
        session.close();
        checkpoint.close().unwrap();
    }
    assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);

    // The source replays history; only blocks after 3 are new.
    let source = Arc::new(FanoutBlockSource::new());
    let session = NetworkBuilder::new().block_source(source.clone()).connect().unwrap();
    let checkpoint = Arc::new(FileCheckpoint::open(&path).unwrap());
    assert_eq!(checkpoint.block_number(), Some(3));

    let resumed = Arc::new(Mutex::new(vec![]));
    let sink = resumed.clone();
    session
        .add_block_listener_with(
            ListenOptions::new().checkpoint(checkpoint.clone()).start_block(0),
            Arc::new(move |b: &BlockEvent| -> Result<(), EventError> {
                sink.lock().unwrap().push(b.block_number);
                Ok(())
            }),
        )
        .unwrap();
    for n in 1..=5 {
        source.send(&block(n));
    }

    assert_eq!(*resumed.lock().unwrap(), vec![4, 5]);
    assert_eq!(FileCheckpoint::load(&path).unwrap().block_number(), Some(5));
}

#[test]
fn transaction_listener_finishes_partially_processed_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("transactions.json");
    {
        let checkpoint = FileCheckpoint::open(&path).unwrap();
        checkpoint.set_block_number(10).unwrap();
        checkpoint.add_transaction_id("tx1").unwrap();
    }

    let source = Arc::new(FanoutBlockSource::new());
    let session = NetworkBuilder::new().block_source(source.clone()).connect().unwrap();
    let checkpoint = Arc::new(FileCheckpoint::open(&path).unwrap());
    let seen = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    session
        .add_transaction_listener(
            ListenOptions::new().checkpoint(checkpoint.clone()),
            Arc::new(move |tx: &TransactionEvent| -> Result<(), EventError> {
                sink.lock().unwrap().push(tx.transaction_id.clone());
                Ok(())
            }),
        )
        .unwrap();

    source.send(
        &block(10)
            .with_transaction("tx1", ValidationCode::Valid)
            .with_transaction("tx2", ValidationCode::Valid),
    );
    source.send(&block(11).with_transaction("tx3", ValidationCode::MvccReadConflict));

    assert_eq!(*seen.lock().unwrap(), vec!["tx2", "tx3"]);
    let state = FileCheckpoint::load(&path).unwrap();
    assert_eq!(state.block_number(), Some(11));
    assert!(state.transaction_ids().contains("tx3"));
}

#[test]
fn locked_checkpoint_cannot_be_shared_between_listeners() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.json");
    let _first = FileCheckpoint::open(&path).unwrap();

    let err = FileCheckpoint::open(&path).unwrap_err();
    let err: EventError = err.into();
    assert!(err.to_string().contains("File is already locked"));
}
