//! Delegator contracts: the seams between the kernel and its collaborators.
//!
//! The mesh transport, persistent storage and host call hook all live outside
//! this crate; the kernel only sees these traits. Chunk fetches stream into a
//! [`ChunkSink`] backed directly by the arena, so payload bytes never pass
//! through a host allocator.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use substrate::{Error, Resource, Result, SabBridge};

/// Incremental sink for streamed chunk bytes. Implementations bound their
/// staging to the declared limit; the mesh must not buffer past a bounded
/// staging window on its side either.
pub trait ChunkSink: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn bytes_written(&self) -> u64;
}

/// Mesh transport consumed by syscall dispatch.
#[async_trait]
pub trait MeshDelegator: Send + Sync {
    /// Stream a chunk's bytes into `sink`. Returns the byte count.
    async fn fetch_chunk_direct(&self, hash: &str, sink: &mut dyn ChunkSink) -> Result<u64>;

    /// Replicate a chunk across the mesh. Returns the replica count.
    async fn distribute_chunk(&self, hash: &str, data: &[u8]) -> Result<usize>;

    /// Deliver a message to a peer.
    async fn send_message(&self, target_id: &str, payload: &[u8]) -> Result<()>;
}

/// Content-addressed persistent storage behind the storage unit.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn store(&self, hash: &str, data: &[u8]) -> Result<()>;
    async fn fetch(&self, hash: &str) -> Result<Vec<u8>>;
    async fn has(&self, hash: &str) -> Result<bool>;
    fn max_chunk_size(&self) -> usize;
}

/// Optional host service hook for `hostCall` syscalls. The returned resource
/// may be inline bytes or an arena reference; references are revalidated by
/// the dispatcher before the response is written.
#[async_trait]
pub trait HostCallHandler: Send + Sync {
    async fn host_call(&self, service: &str, payload: Vec<u8>) -> Result<Resource>;
}

/// Arena-backed chunk sink: writes land at a caller-nominated offset, bounds
/// are enforced per write, and a running blake3 digest supports content
/// verification without a second pass.
pub struct ArenaWriter {
    bridge: SabBridge,
    offset: u64,
    limit: u32,
    written: u32,
    hasher: blake3::Hasher,
}

impl ArenaWriter {
    /// Validates the destination range up front; no delegator call should be
    /// made if the range is bad.
    pub fn new(bridge: SabBridge, offset: u64, limit: u32) -> Result<Self> {
        bridge.validate_arena_offset(offset, limit as u64)?;
        Ok(Self {
            bridge,
            offset,
            limit,
            written: 0,
            hasher: blake3::Hasher::new(),
        })
    }

    /// Hex digest of everything written so far.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.hasher.finalize().as_bytes())
    }
}

impl ChunkSink for ArenaWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let end = self.written as u64 + data.len() as u64;
        if end > self.limit as u64 {
            return Err(Error::OutOfBounds {
                offset: self.offset + self.written as u64,
                size: data.len() as u64,
                limit: self.offset + self.limit as u64,
            });
        }
        self.bridge
            .write_raw((self.offset + self.written as u64) as usize, data)?;
        self.hasher.update(data);
        self.written = end as u32;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written as u64
    }
}

// ========== IN-MEMORY COLLABORATORS ==========
// Reference implementations: good enough for single-node hosts and the
// integration tests; a real deployment swaps in the WebRTC mesh and a
// persistent store.

/// In-memory mesh holding chunks and delivered messages.
pub struct MemoryMesh {
    chunks: DashMap<String, Vec<u8>>,
    delivered: Mutex<Vec<(String, Vec<u8>)>>,
    replicas: usize,
    /// Number of leading calls that fail with `MeshTransient`, for retry
    /// path exercises.
    transient_failures: AtomicU32,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self {
            chunks: DashMap::new(),
            delivered: Mutex::new(Vec::new()),
            replicas: 3,
            transient_failures: AtomicU32::new(0),
        }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn fail_transiently(&self, times: u32) {
        self.transient_failures.store(times, Ordering::SeqCst);
    }

    pub fn seed_chunk(&self, hash: &str, data: Vec<u8>) {
        self.chunks.insert(hash.to_string(), data);
    }

    /// Seed a chunk under its own blake3 hex digest; returns the hash.
    pub fn seed_content(&self, data: Vec<u8>) -> String {
        let hash = hex::encode(blake3::hash(&data).as_bytes());
        self.chunks.insert(hash.clone(), data);
        hash
    }

    pub fn delivered_messages(&self) -> Vec<(String, Vec<u8>)> {
        self.delivered.lock().clone()
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(Error::MeshTransient("peer churn, retry".into()));
        }
        Ok(())
    }
}

impl Default for MemoryMesh {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshDelegator for MemoryMesh {
    async fn fetch_chunk_direct(&self, hash: &str, sink: &mut dyn ChunkSink) -> Result<u64> {
        self.maybe_fail()?;
        let chunk = self
            .chunks
            .get(hash)
            .ok_or_else(|| Error::NotFound(format!("chunk {}", hash)))?;
        // Stream in bounded windows, the way a real transport would.
        for window in chunk.chunks(16 * 1024) {
            sink.write(window)?;
        }
        Ok(chunk.len() as u64)
    }

    async fn distribute_chunk(&self, hash: &str, data: &[u8]) -> Result<usize> {
        self.maybe_fail()?;
        self.chunks.insert(hash.to_string(), data.to_vec());
        Ok(self.replicas)
    }

    async fn send_message(&self, target_id: &str, payload: &[u8]) -> Result<()> {
        self.maybe_fail()?;
        self.delivered
            .lock()
            .push((target_id.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// In-memory content-addressed store. Store calls verify the declared hash
/// against the blake3 digest of the payload.
pub struct MemoryStore {
    blobs: DashMap<String, Vec<u8>>,
    max_chunk_size: usize,
}

impl MemoryStore {
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            blobs: DashMap::new(),
            max_chunk_size,
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryStore {
    async fn store(&self, hash: &str, data: &[u8]) -> Result<()> {
        if data.len() > self.max_chunk_size {
            return Err(Error::InvalidParams(format!(
                "chunk of {} bytes exceeds max {}",
                data.len(),
                self.max_chunk_size
            )));
        }
        let digest = hex::encode(blake3::hash(data).as_bytes());
        if digest != hash {
            return Err(Error::InvalidParams(format!(
                "content hash mismatch: declared {}, computed {}",
                hash, digest
            )));
        }
        self.blobs.insert(hash.to_string(), data.to_vec());
        Ok(())
    }

    async fn fetch(&self, hash: &str) -> Result<Vec<u8>> {
        self.blobs
            .get(hash)
            .map(|v| v.clone())
            .ok_or_else(|| Error::NotFound(format!("blob {}", hash)))
    }

    async fn has(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(hash))
    }

    fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }
}
