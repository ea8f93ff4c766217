//! Durable FIFO queue backed by a directory of committed files.
//!
//! Every [`FileQueue::store`] call becomes one file named `<id>.committed`.
//! Ids increase monotonically and resume from the highest id on disk after a
//! restart. The worker hands a [`DataHandle`] for each entry to the output
//! channel; because that channel is bounded, a slow consumer blocks the worker
//! and in turn every `store` caller.
//!
//! Entries already on disk at construction are replayed, oldest first, before
//! any new work is accepted. Reading an entry with [`DataHandle::pop`] deletes
//! its file, which is the acknowledgement.

use crate::{Error, Result};
use crc32fast::Hasher;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAGIC: &[u8; 4] = b"WQFQ";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 17;
const COMMITTED_SUFFIX: &str = ".committed";
const TMP_SUFFIX: &str = ".tmp";
const INBOX_CAPACITY: usize = 1;

/// A committed entry waiting to be read.
#[derive(Debug)]
pub struct DataHandle {
    pub id: u64,
    path: PathBuf,
}

impl DataHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the entry and deletes its file.
    ///
    /// The file is removed even when its contents fail validation, so a
    /// corrupt entry is reported once and never replayed.
    pub async fn pop(self) -> Result<(HashMap<String, String>, Vec<u8>)> {
        let raw = fs::read(&self.path).await?;
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(id = self.id, path = ?self.path, error = %e, "Failed to delete queue entry");
            }
        }
        decode_entry(&raw)
    }
}

struct StoreRequest {
    meta: HashMap<String, String>,
    data: Vec<u8>,
    done: oneshot::Sender<Result<()>>,
}

/// Directory-backed queue. See the module docs.
pub struct FileQueue {
    dir: PathBuf,
    inbox: mpsc::Sender<StoreRequest>,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
}

struct Worker {
    dir: PathBuf,
    next_id: u64,
    pending: Vec<DataHandle>,
    inbox: mpsc::Receiver<StoreRequest>,
    out: mpsc::Sender<DataHandle>,
}

impl FileQueue {
    /// Opens (creating if needed) the queue directory and indexes the
    /// committed entries already present.
    pub fn new(dir: impl Into<PathBuf>, out: mpsc::Sender<DataHandle>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let pending = list_committed(&dir)?;
        let next_id = pending.last().map(|h| h.id + 1).unwrap_or(1);
        if !pending.is_empty() {
            info!(
                dir = ?dir,
                entries = pending.len(),
                next_id,
                "Found committed queue entries to replay"
            );
        }

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        Ok(Self {
            dir: dir.clone(),
            inbox: tx,
            worker: Mutex::new(Some(Worker {
                dir,
                next_id,
                pending,
                inbox: rx,
                out,
            })),
            task: Mutex::new(None),
            token: CancellationToken::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Spawns the worker. Replay of existing entries happens first.
    pub fn start(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let token = self.token.clone();
        *self.task.lock() = Some(tokio::spawn(worker.run(token)));
    }

    /// Stops the worker. Idempotent and does not wait.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits for the worker task to exit after [`FileQueue::stop`].
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Persists one entry. Returns once the file is committed.
    pub async fn store(&self, meta: HashMap<String, String>, data: Vec<u8>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Stopped);
        }
        let (done, wait) = oneshot::channel();
        tokio::select! {
            sent = self.inbox.send(StoreRequest { meta, data, done }) => sent?,
            _ = self.token.cancelled() => return Err(Error::Stopped),
        }
        wait.await?
    }
}

impl Drop for FileQueue {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Worker {
    async fn run(mut self, token: CancellationToken) {
        for handle in std::mem::take(&mut self.pending) {
            if !self.emit(handle, &token).await {
                return;
            }
        }

        loop {
            let request = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                request = self.inbox.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let handle = match self.commit(&request.meta, &request.data).await {
                Ok(handle) => {
                    let _ = request.done.send(Ok(()));
                    handle
                }
                Err(e) => {
                    error!(dir = ?self.dir, error = %e, "Failed to store queue entry");
                    let _ = request.done.send(Err(e));
                    continue;
                }
            };
            if !self.emit(handle, &token).await {
                break;
            }
        }
        debug!(dir = ?self.dir, "File queue worker stopped");
    }

    /// Blocks until the consumer takes the handle. Returns false when the
    /// queue is stopping or the consumer is gone.
    async fn emit(&self, handle: DataHandle, token: &CancellationToken) -> bool {
        tokio::select! {
            sent = self.out.send(handle) => sent.is_ok(),
            _ = token.cancelled() => false,
        }
    }

    async fn commit(&mut self, meta: &HashMap<String, String>, data: &[u8]) -> Result<DataHandle> {
        let id = self.next_id;
        self.next_id += 1;

        let encoded = encode_entry(meta, data)?;
        let tmp = self.dir.join(format!("{}{}", id, TMP_SUFFIX));
        let committed = self.dir.join(committed_file_name(id));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&encoded).await?;
        file.sync_data().await?;
        drop(file);
        fs::rename(&tmp, &committed).await?;

        debug!(id, bytes = encoded.len(), "Committed queue entry");
        Ok(DataHandle {
            id,
            path: committed,
        })
    }
}

fn committed_file_name(id: u64) -> String {
    format!("{}{}", id, COMMITTED_SUFFIX)
}

fn parse_committed_id(name: &str) -> Option<u64> {
    name.strip_suffix(COMMITTED_SUFFIX)?.parse::<u64>().ok()
}

/// Committed entries in `dir`, oldest first. Unrelated files are ignored.
fn list_committed(dir: &Path) -> Result<Vec<DataHandle>> {
    let mut handles = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = parse_committed_id(&name) {
            handles.push(DataHandle {
                id,
                path: entry.path(),
            });
        } else if name.ends_with(TMP_SUFFIX) {
            // Crash between write and rename: the entry was never acknowledged.
            warn!(path = ?entry.path(), "Removing incomplete queue entry");
            let _ = std::fs::remove_file(entry.path());
        }
    }
    handles.sort_by_key(|h| h.id);
    Ok(handles)
}

fn encode_entry(meta: &HashMap<String, String>, data: &[u8]) -> Result<Vec<u8>> {
    let ordered: BTreeMap<&String, &String> = meta.iter().collect();
    let meta_bytes = serde_json::to_vec(&ordered)?;

    let mut hasher = Hasher::new();
    hasher.update(&meta_bytes);
    hasher.update(data);

    let mut out = Vec::with_capacity(HEADER_LEN + meta_bytes.len() + data.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&(meta_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(&meta_bytes);
    out.extend_from_slice(data);
    Ok(out)
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn decode_entry(raw: &[u8]) -> Result<(HashMap<String, String>, Vec<u8>)> {
    if raw.len() < HEADER_LEN {
        return Err(Error::Corrupt(format!(
            "entry is {} bytes, shorter than the header",
            raw.len()
        )));
    }
    if &raw[0..4] != MAGIC {
        return Err(Error::Corrupt("invalid magic".to_string()));
    }
    if raw[4] != VERSION {
        return Err(Error::Corrupt(format!("unsupported entry version {}", raw[4])));
    }
    let meta_len = read_u32(raw, 5) as usize;
    let data_len = read_u32(raw, 9) as usize;
    let expected_crc = read_u32(raw, 13);

    let body = &raw[HEADER_LEN..];
    if body.len() != meta_len + data_len {
        return Err(Error::Corrupt(format!(
            "expected {} body bytes, found {}",
            meta_len + data_len,
            body.len()
        )));
    }
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != expected_crc {
        return Err(Error::Corrupt("checksum mismatch".to_string()));
    }

    let meta: HashMap<String, String> = serde_json::from_slice(&body[..meta_len])?;
    Ok((meta, body[meta_len..].to_vec()))
}
