//! File queue behavior across restarts and on damaged directories.

use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use walqueue::filequeue::{DataHandle, FileQueue};
use walqueue::Error;

fn meta(entry: &str) -> HashMap<String, String> {
    HashMap::from([("entry".to_string(), entry.to_string())])
}

async fn next(rx: &mut mpsc::Receiver<DataHandle>) -> DataHandle {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a queue entry")
        .expect("queue output closed")
}

#[tokio::test]
async fn test_replays_in_order_after_restart() {
    let dir = TempDir::new().unwrap();

    {
        // Output channel large enough that nothing blocks while storing.
        let (tx, _rx) = mpsc::channel(16);
        let queue = FileQueue::new(dir.path(), tx).unwrap();
        queue.start();
        for i in 0..5 {
            queue
                .store(meta(&i.to_string()), format!("payload-{i}").into_bytes())
                .await
                .unwrap();
        }
        queue.stop();
        queue.join().await;
    }

    let (tx, mut rx) = mpsc::channel(1);
    let queue = FileQueue::new(dir.path(), tx).unwrap();
    queue.start();
    for i in 0..5 {
        let handle = next(&mut rx).await;
        assert_eq!(handle.id, i as u64 + 1);
        let (m, data) = handle.pop().await.unwrap();
        assert_eq!(m, meta(&i.to_string()));
        assert_eq!(data, format!("payload-{i}").into_bytes());
    }

    // New entries continue after the replayed ids.
    queue.store(meta("new"), b"fresh".to_vec()).await.unwrap();
    let handle = next(&mut rx).await;
    assert_eq!(handle.id, 6);
    let (_, data) = handle.pop().await.unwrap();
    assert_eq!(data, b"fresh");

    queue.stop();
    queue.join().await;
}

#[tokio::test]
async fn test_corrupt_entry_does_not_block_later_entries() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("1.committed"), b"bad").unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    let queue = FileQueue::new(dir.path(), tx).unwrap();
    queue.start();
    queue.store(meta("good"), b"ok".to_vec()).await.unwrap();

    let first = next(&mut rx).await;
    assert_eq!(first.id, 1);
    let path = first.path().to_path_buf();
    let err = first.pop().await.unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "unexpected error: {err}");
    assert!(!path.exists(), "corrupt entry should be deleted");

    let second = next(&mut rx).await;
    assert_eq!(second.id, 2);
    let (m, data) = second.pop().await.unwrap();
    assert_eq!(m, meta("good"));
    assert_eq!(data, b"ok");

    queue.stop();
    queue.join().await;
}

#[tokio::test]
async fn test_pop_of_deleted_entry_fails() {
    let dir = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    let queue = FileQueue::new(dir.path(), tx).unwrap();
    queue.start();
    queue.store(meta("gone"), b"x".to_vec()).await.unwrap();

    let handle = next(&mut rx).await;
    std::fs::remove_file(handle.path()).unwrap();
    let err = handle.pop().await.unwrap_err();
    assert!(matches!(err, Error::Io(_)), "unexpected error: {err}");

    queue.stop();
    queue.join().await;
}

#[tokio::test]
async fn test_unrelated_files_are_ignored() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
    std::fs::write(dir.path().join("abc.committed"), b"hello").unwrap();
    std::fs::write(dir.path().join("7.tmp"), b"partial").unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    let queue = FileQueue::new(dir.path(), tx).unwrap();
    assert!(!dir.path().join("7.tmp").exists());
    queue.start();
    queue.store(meta("only"), b"one".to_vec()).await.unwrap();

    let handle = next(&mut rx).await;
    assert_eq!(handle.id, 1);
    handle.pop().await.unwrap();
    assert!(dir.path().join("notes.txt").exists());
    assert!(dir.path().join("abc.committed").exists());

    queue.stop();
    queue.join().await;
}

#[tokio::test]
async fn test_ids_resume_from_highest_entry() {
    let dir = TempDir::new().unwrap();
    {
        let (tx, _rx) = mpsc::channel(16);
        let queue = FileQueue::new(dir.path(), tx).unwrap();
        queue.start();
        queue.store(meta("a"), b"a".to_vec()).await.unwrap();
        queue.store(meta("b"), b"b".to_vec()).await.unwrap();
        queue.stop();
        queue.join().await;
    }
    // Entry 1 was consumed in a previous run; only 2 remains.
    std::fs::remove_file(dir.path().join("1.committed")).unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    let queue = FileQueue::new(dir.path(), tx).unwrap();
    queue.start();
    queue.store(meta("c"), b"c".to_vec()).await.unwrap();

    let replayed = next(&mut rx).await;
    assert_eq!(replayed.id, 2);
    let fresh = next(&mut rx).await;
    assert_eq!(fresh.id, 3);
    let (m, _) = fresh.pop().await.unwrap();
    assert_eq!(m, meta("c"));

    queue.stop();
    queue.join().await;
}

#[tokio::test]
async fn test_store_after_stop_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (tx, _rx) = mpsc::channel(1);
    let queue = FileQueue::new(dir.path(), tx).unwrap();
    queue.start();
    queue.stop();
    queue.join().await;
    let err = queue.store(meta("late"), b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::Stopped));
}
