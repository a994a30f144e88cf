// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::any::TypeId;
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::closure::{self, ClosurePolicy};
use crate::config::Config;
use crate::engine::{EngineResult, StoreBackend, StoreEngine};
use crate::error::{Error, Result};
use crate::local::LocalStore;
use crate::path_info::PathMetadata;
use crate::store_path::{StoreDir, StorePath, validate_hash_part};
use crate::stream::{self, NarDigest, NarHasher, NarStream};

/// Runs process-wide setup at most once per key.
///
/// A failed attempt leaves its key unset, so the next opener tries again.
pub(crate) struct InitGuard {
    done: Mutex<BTreeSet<TypeId>>,
}

impl InitGuard {
    pub(crate) const fn new() -> Self {
        Self {
            done: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn run_once<E, F>(&self, key: TypeId, init: F) -> std::result::Result<(), E>
    where
        F: FnOnce() -> std::result::Result<(), E>,
    {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if done.contains(&key) {
            return Ok(());
        }
        init()?;
        done.insert(key);
        Ok(())
    }
}

static ENGINE_INIT: InitGuard = InitGuard::new();

/// A shared, cheaply clonable handle to an opened store.
///
/// All queries take the wire form of a path: the ASCII base name
/// (`<hash>-<name>`) without the store directory. Malformed names are
/// rejected with [`Error::InvalidPathFormat`] before the engine is touched.
#[derive(Clone)]
pub struct StoreHandle {
    engine: Arc<dyn StoreEngine>,
    chunk_size: usize,
    channel_capacity: usize,
}

impl StoreHandle {
    /// Open the local store described by [`Config::load`].
    pub fn open() -> Result<Self> {
        Self::open_with(Config::load()?)
    }

    pub fn open_with(config: Config) -> Result<Self> {
        Self::open_backend::<LocalStore>(&config)
    }

    /// Open a store with backend `B`, running `B::init_process` first if `B`
    /// has not been initialized in this process yet. Each backend type is
    /// initialized on its own.
    ///
    /// Opening blocks on the backend; call it before serving requests or from
    /// a blocking context.
    pub fn open_backend<B: StoreBackend>(config: &Config) -> Result<Self> {
        config.validate()?;
        ENGINE_INIT
            .run_once(TypeId::of::<B>(), B::init_process)
            .map_err(|e| Error::unavailable(format!("store initialization failed: {e}")))?;
        let engine = B::open(config).map_err(Error::unavailable)?;
        info!("store {} opened", engine.store_dir());
        Ok(Self {
            engine: Arc::new(engine),
            chunk_size: config.chunk_size,
            channel_capacity: config.channel_capacity,
        })
    }

    /// Wrap an engine that is already open. No process setup is run.
    pub fn from_engine(engine: Arc<dyn StoreEngine>) -> Self {
        let defaults = Config::default();
        Self {
            engine,
            chunk_size: defaults.chunk_size,
            channel_capacity: defaults.channel_capacity,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn store_dir(&self) -> &StoreDir {
        self.engine.store_dir()
    }

    /// Run `f` against the engine on the blocking pool.
    async fn engine_operation<T, F>(
        &self,
        operation: &'static str,
        path: &StorePath,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StoreEngine) -> EngineResult<T> + Send + 'static,
    {
        debug!("{operation} {path}");
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || f(engine.as_ref()))
            .await
            .map_err(|e| Error::StoreQuery {
                operation,
                path: path.to_string(),
                reason: format!("task failed: {e}"),
            })?
            .map_err(|e| Error::query(operation, path, e))
    }

    pub async fn query_path_info(&self, base_name: &[u8]) -> Result<PathMetadata> {
        let path = StorePath::from_bytes(base_name)?;
        let query = path.clone();
        let info = self
            .engine_operation("query path info", &path, move |engine| {
                engine.query_path_info(&query)
            })
            .await?;
        info.map(PathMetadata::new)
            .ok_or(Error::PathNotFound(path))
    }

    /// Base names of every path related to `base_name` under the given
    /// policy, including `base_name` itself, in sorted order.
    pub async fn compute_fs_closure(
        &self,
        base_name: &[u8],
        flip_direction: bool,
        include_outputs: bool,
        include_derivers: bool,
    ) -> Result<Vec<String>> {
        let policy = ClosurePolicy {
            flip_direction,
            include_outputs,
            include_derivers,
        };
        self.closure(base_name, policy).await
    }

    pub async fn closure(&self, base_name: &[u8], policy: ClosurePolicy) -> Result<Vec<String>> {
        let root = StorePath::from_bytes(base_name)?;
        let query = root.clone();
        let closure = self
            .engine_operation("compute closure of", &root, move |engine| {
                closure::compute_fs_closure(engine, &query, policy)
            })
            .await?;
        debug!("closure of {root} has {} paths", closure.len());
        Ok(closure.into_iter().map(String::from).collect())
    }

    pub async fn is_valid_path(&self, base_name: &[u8]) -> Result<bool> {
        let path = StorePath::from_bytes(base_name)?;
        let query = path.clone();
        self.engine_operation("check validity of", &path, move |engine| {
            engine.is_valid_path(&query)
        })
        .await
    }

    /// The valid path whose hash part is `hash_part`, if any.
    pub async fn query_path_from_hash_part(&self, hash_part: &[u8]) -> Result<Option<StorePath>> {
        validate_hash_part(hash_part)?;
        let hash = String::from_utf8_lossy(hash_part).into_owned();
        let engine = Arc::clone(&self.engine);
        debug!("look up hash part {hash}");
        let query = hash.clone();
        tokio::task::spawn_blocking(move || engine.query_path_from_hash_part(&query))
            .await
            .map_err(|e| Error::StoreQuery {
                operation: "look up hash part",
                path: hash.clone(),
                reason: format!("task failed: {e}"),
            })?
            .map_err(|e| Error::StoreQuery {
                operation: "look up hash part",
                path: hash,
                reason: e.to_string(),
            })
    }

    /// Start streaming the NAR of `base_name`.
    ///
    /// A path that is not valid surfaces as [`Error::PathNotFound`] from the
    /// first poll. The archive is produced on the current Tokio runtime's
    /// blocking pool; outside a runtime this returns
    /// [`Error::StoreUnavailable`].
    pub fn nar_stream(&self, base_name: &[u8]) -> Result<NarStream> {
        let path = StorePath::from_bytes(base_name)?;
        self.spawn_archive(path)
    }

    fn spawn_archive(&self, path: StorePath) -> Result<NarStream> {
        debug!("streaming NAR of {path}");
        stream::spawn_archive(
            Arc::clone(&self.engine),
            path,
            self.chunk_size,
            self.channel_capacity,
        )
    }

    /// The NAR of `base_name` as an [`AsyncRead`]. Failures surface as
    /// [`std::io::Error`]s wrapping the [`Error`]. Like
    /// [`nar_stream`](Self::nar_stream), this needs a Tokio runtime.
    pub fn nar_reader(&self, base_name: &[u8]) -> Result<impl AsyncRead + Send + Unpin + use<>> {
        let nar = self.nar_stream(base_name)?;
        Ok(StreamReader::new(stream::into_io_stream(nar)))
    }

    /// Write the NAR of `base_name` into `sink`, flushing it once the whole
    /// archive was written.
    ///
    /// On failure the sink is neither flushed nor shut down, and whatever was
    /// written to it is not a valid archive.
    pub async fn stream_archive<W>(&self, base_name: &[u8], sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let nar = self.nar_stream(base_name)?;
        let path = nar.path().clone();
        pump(nar, sink, |_| ()).await?;
        sink.flush().await.map_err(|e| sink_error(&path, e))
    }

    /// [`stream_archive`](Self::stream_archive), also returning the size and
    /// hash of what was written.
    ///
    /// The path's record is read before streaming starts. If it carries a NAR
    /// hash or size and the archive disagrees, the transfer fails before the
    /// sink is flushed.
    pub async fn stream_archive_hashed<W>(
        &self,
        base_name: &[u8],
        sink: &mut W,
    ) -> Result<NarDigest>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let path = StorePath::from_bytes(base_name)?;
        let query = path.clone();
        let info = self
            .engine_operation("query path info", &path, move |engine| {
                engine.query_path_info(&query)
            })
            .await?
            .ok_or_else(|| Error::PathNotFound(path.clone()))?;

        let nar = self.spawn_archive(path.clone())?;
        let mut hasher = NarHasher::default();
        pump(nar, sink, |chunk| hasher.update(chunk)).await?;
        let digest = hasher.finish();

        let hash_mismatch = !info.nar_hash.is_empty() && !digest.matches(&info.nar_hash);
        let size_mismatch = info.nar_size.is_some_and(|size| size != digest.size);
        if hash_mismatch || size_mismatch {
            warn!(
                "NAR of {path} does not match the store: recorded {} ({:?} bytes), streamed {} ({} bytes)",
                info.nar_hash,
                info.nar_size,
                digest.to_nix_string(),
                digest.size
            );
            return Err(Error::ArchiveStream {
                path,
                reason: format!(
                    "archive does not match recorded hash {}: got {} ({} bytes)",
                    info.nar_hash,
                    digest.to_nix_string(),
                    digest.size
                ),
            });
        }

        sink.flush().await.map_err(|e| sink_error(&path, e))?;
        Ok(digest)
    }
}

/// Copy every chunk of `nar` into `sink` without flushing it.
async fn pump<W>(mut nar: NarStream, sink: &mut W, mut inspect: impl FnMut(&[u8])) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0u64;
    while let Some(chunk) = nar.next().await {
        let chunk = chunk?;
        inspect(&chunk);
        sink.write_all(&chunk)
            .await
            .map_err(|e| sink_error(nar.path(), e))?;
        written += chunk.len() as u64;
    }
    debug!("streamed {written} bytes of {}", nar.path());
    Ok(())
}

fn sink_error(path: &StorePath, e: io::Error) -> Error {
    Error::ArchiveStream {
        path: path.clone(),
        reason: format!("writing to sink: {e}"),
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store_dir", self.engine.store_dir())
            .field("chunk_size", &self.chunk_size)
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}
