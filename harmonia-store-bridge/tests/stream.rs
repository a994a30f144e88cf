// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Streaming NARs out of a store.

mod common;

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{PermissionsExt, symlink};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::task::{Context, Poll};
use std::time::Duration;

use common::{FOO, HELLO, MISSING, TestStore};
use futures::StreamExt;
use harmonia_store_bridge::{
    EngineError, EngineResult, Error, PathInfo, StoreDir, StoreEngine, StoreHandle, StorePath,
};
use tokio::io::{AsyncReadExt, AsyncWrite};

fn hello_tree(store: &mut TestStore) {
    store.add_tree(HELLO, |root| {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("share/man/man1")).unwrap();
        let bin = root.join("bin/hello");
        // larger than one chunk so the stream has several
        fs::write(&bin, vec![0x7f; 200_000]).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o555)).unwrap();
        fs::write(root.join("share/man/man1/hello.1"), b".TH HELLO 1\n").unwrap();
        symlink("bin/hello", root.join("hello")).unwrap();
    });
}

#[test_log::test(tokio::test)]
async fn archive_matches_the_tree_on_disk() {
    let mut store = TestStore::new();
    hello_tree(&mut store);
    let handle = store.handle();

    let mut sink = Vec::new();
    handle
        .stream_archive(HELLO.as_bytes(), &mut sink)
        .await
        .unwrap();
    assert_eq!(sink, common::dump(&store.real_path(HELLO)));
}

#[test_log::test(tokio::test)]
async fn hashed_archive_matches_recorded_hash() {
    let mut store = TestStore::new();
    hello_tree(&mut store);
    let handle = store.handle();

    let mut sink = Vec::new();
    let digest = handle
        .stream_archive_hashed(HELLO.as_bytes(), &mut sink)
        .await
        .unwrap();

    let (recorded, size) = common::nar_of(&store.real_path(HELLO));
    assert_eq!(digest.size, size);
    assert_eq!(sink.len() as u64, size);
    assert!(digest.matches(&recorded));
    assert_eq!(format!("sha256:{}", digest.to_hex()), recorded);
    assert!(digest.to_nix_string().starts_with("sha256:"));
}

#[tokio::test]
async fn modified_path_fails_the_hash_check() {
    let mut store = TestStore::new();
    store.add(FOO, &[]);
    fs::write(store.real_path(FOO), b"tampered").unwrap();
    let handle = store.handle();

    let mut sink = RecordingSink::default();
    let err = handle
        .stream_archive_hashed(FOO.as_bytes(), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ArchiveStream { .. }), "{err}");
    assert_eq!(sink.flushes, 0, "a mismatching archive must not be flushed");

    // the plain transfer has nothing to check against
    let mut sink = Vec::new();
    handle
        .stream_archive(FOO.as_bytes(), &mut sink)
        .await
        .unwrap();
}

#[tokio::test]
async fn hashed_transfer_flushes_once_it_matches() {
    let mut store = TestStore::new();
    store.add(FOO, &[]);
    let handle = store.handle();

    let mut sink = RecordingSink::default();
    let digest = handle
        .stream_archive_hashed(FOO.as_bytes(), &mut sink)
        .await
        .unwrap();
    assert_eq!(sink.written as u64, digest.size);
    assert_eq!(sink.flushes, 1);
}

#[tokio::test]
async fn reader_yields_the_same_bytes() {
    let mut store = TestStore::new();
    hello_tree(&mut store);
    let handle = store.handle().with_chunk_size(1000);

    let mut reader = handle.nar_reader(HELLO.as_bytes()).unwrap();
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, common::dump(&store.real_path(HELLO)));
}

#[tokio::test]
async fn missing_path_is_not_found() {
    let store = TestStore::graph();
    let handle = store.handle();

    let mut sink = Vec::new();
    let err = handle
        .stream_archive(MISSING.as_bytes(), &mut sink)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(sink.is_empty());
}

#[tokio::test]
async fn concurrent_transfers() {
    let mut store = TestStore::new();
    hello_tree(&mut store);
    let handle = store.handle().with_chunk_size(4096);
    let expected = common::dump(&store.real_path(HELLO));

    let transfers: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut sink = Vec::new();
                handle
                    .stream_archive(HELLO.as_bytes(), &mut sink)
                    .await
                    .map(|()| sink)
            })
        })
        .collect();
    for transfer in transfers {
        assert_eq!(transfer.await.unwrap().unwrap(), expected);
    }
}

/// An engine whose serializer writes `chunks` blocks of 1 KiB, then fails if
/// `fail` is set. Each call reports on `finished` whether it succeeded.
struct FlakyEngine {
    store_dir: StoreDir,
    chunks: usize,
    fail: bool,
    calls: AtomicUsize,
    finished: Mutex<mpsc::Sender<bool>>,
}

impl FlakyEngine {
    fn new(chunks: usize, fail: bool) -> (Arc<Self>, mpsc::Receiver<bool>) {
        let (tx, rx) = mpsc::channel();
        let engine = Self {
            store_dir: StoreDir::default(),
            chunks,
            fail,
            calls: AtomicUsize::new(0),
            finished: Mutex::new(tx),
        };
        (Arc::new(engine), rx)
    }
}

impl StoreEngine for FlakyEngine {
    fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    fn query_path_info(&self, _: &StorePath) -> EngineResult<Option<PathInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn query_referrers(&self, _: &StorePath) -> EngineResult<Vec<StorePath>> {
        Ok(vec![])
    }

    fn query_derivation_outputs(&self, _: &StorePath) -> EngineResult<Vec<StorePath>> {
        Ok(vec![])
    }

    fn query_valid_derivers(&self, _: &StorePath) -> EngineResult<Vec<StorePath>> {
        Ok(vec![])
    }

    fn query_path_from_hash_part(&self, _: &str) -> EngineResult<Option<StorePath>> {
        Ok(None)
    }

    fn nar_from_path(&self, _: &StorePath, sink: &mut dyn Write) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = Ok(());
        for _ in 0..self.chunks {
            if let Err(e) = sink.write_all(&[1u8; 1024]) {
                result = Err(EngineError::io("writing archive", e));
                break;
            }
        }
        if result.is_ok() && self.fail {
            result = Err(EngineError::io(
                "reading /nix/store/foo",
                io::Error::other("input/output error"),
            ));
        }
        let _ = self.finished.lock().unwrap().send(result.is_ok());
        result
    }
}

#[test_log::test(tokio::test)]
async fn mid_stream_failure_is_one_terminal_error() {
    let (engine, _) = FlakyEngine::new(20, true);
    let handle = StoreHandle::from_engine(engine)
        .with_chunk_size(1024)
        .with_channel_capacity(32);

    let mut nar = handle.nar_stream(FOO.as_bytes()).unwrap();
    let mut items = Vec::new();
    while let Some(item) = nar.next().await {
        items.push(item);
    }

    let errors = items.iter().filter(|i| i.is_err()).count();
    assert_eq!(errors, 1);
    assert!(items.last().unwrap().is_err(), "error must be the last item");
    match items.pop() {
        Some(Err(Error::ArchiveStream { reason, .. })) => {
            assert!(reason.contains("input/output error"), "{reason}")
        }
        other => panic!("unexpected terminal item: {other:?}"),
    }
    assert!(nar.next().await.is_none());
}

#[tokio::test]
async fn failed_transfer_does_not_finish_the_sink() {
    let (engine, _) = FlakyEngine::new(3, true);
    let handle = StoreHandle::from_engine(engine);

    let mut sink = RecordingSink::default();
    let err = handle
        .stream_archive(FOO.as_bytes(), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ArchiveStream { .. }), "{err}");
    assert_eq!(sink.flushes, 0);
}

#[tokio::test]
async fn sink_errors_abort_the_transfer() {
    let (engine, finished) = FlakyEngine::new(10_000, false);
    let handle = StoreHandle::from_engine(engine)
        .with_chunk_size(1024)
        .with_channel_capacity(1);

    let mut sink = RecordingSink {
        fail_after: Some(2048),
        ..Default::default()
    };
    let err = handle
        .stream_archive(FOO.as_bytes(), &mut sink)
        .await
        .unwrap_err();
    match err {
        Error::ArchiveStream { reason, .. } => assert!(reason.contains("writing to sink")),
        other => panic!("unexpected error: {other}"),
    }

    let ran_to_completion = tokio::task::spawn_blocking(move || {
        finished.recv_timeout(Duration::from_secs(10))
    })
    .await
    .unwrap()
    .expect("producer never finished");
    assert!(!ran_to_completion);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn abandoned_stream_stops_the_producer() {
    let (engine, finished) = FlakyEngine::new(100_000, false);
    let handle = StoreHandle::from_engine(engine)
        .with_chunk_size(1024)
        .with_channel_capacity(2);

    let mut nar = handle.nar_stream(FOO.as_bytes()).unwrap();
    for _ in 0..3 {
        nar.next().await.unwrap().unwrap();
    }
    drop(nar);

    let ran_to_completion = tokio::task::spawn_blocking(move || {
        finished.recv_timeout(Duration::from_secs(10))
    })
    .await
    .unwrap()
    .expect("producer never finished");
    assert!(!ran_to_completion, "producer wrote the whole archive");
}

#[tokio::test]
async fn hashed_transfer_reads_the_record_first() {
    let (engine, finished) = FlakyEngine::new(4, false);
    let handle = StoreHandle::from_engine(engine.clone());

    let mut sink = RecordingSink::default();
    let err = handle
        .stream_archive_hashed(FOO.as_bytes(), &mut sink)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(sink.written, 0);
    // only the record was looked up; no archive was produced
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    assert!(finished.try_recv().is_err());
}

#[test]
fn streaming_outside_a_runtime_is_unavailable() {
    let (engine, _) = FlakyEngine::new(1, false);
    let handle = StoreHandle::from_engine(engine.clone());

    let err = handle.nar_stream(FOO.as_bytes()).unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable { .. }), "{err}");
    assert!(matches!(
        handle.nar_reader(FOO.as_bytes()),
        Err(Error::StoreUnavailable { .. })
    ));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_names_never_reach_the_engine() {
    let (engine, _) = FlakyEngine::new(1, false);
    let handle = StoreHandle::from_engine(engine.clone());

    for name in ["abc123-foo", "", "zzz000-missing", "../../etc/passwd"] {
        let err = handle.nar_stream(name.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::InvalidPathFormat(_)), "{name}: {err}");

        let mut sink = Vec::new();
        let err = handle
            .stream_archive(name.as_bytes(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPathFormat(_)), "{name}: {err}");

        let err = handle.query_path_info(name.as_bytes()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPathFormat(_)), "{name}: {err}");
    }
    assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
}

/// Counts flushes and optionally fails once `fail_after` bytes were written.
#[derive(Default)]
struct RecordingSink {
    written: usize,
    flushes: usize,
    fail_after: Option<usize>,
}

impl AsyncWrite for RecordingSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail_after.is_some_and(|limit| self.written >= limit) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer went away",
            )));
        }
        self.written += buf.len();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flushes += 1;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
