//! Module-side syscall client.
//!
//! This is the API a module links against to fulfil the init contract:
//! attach to the substrate, claim a registry slot, publish capabilities, then
//! trade envelopes through its ring pair. Requests go out through the
//! module's outbox; the client parks on its inbox dirty flag and resolves
//! responses by `call_id`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::arena;
use crate::bridge::SabBridge;
use crate::codec::{
    decode_response, encode_envelope, Envelope, Resource, Response, SyscallBody, SyscallResult,
};
use crate::error::{Error, Result};
use crate::layout::{inbox_dirty_index, IDX_KERNEL_READY};
use crate::registry::{self, ModuleRegistration};
use crate::rings::FRAME_KIND_SYSCALL_REQUEST;

/// Default per-call timeout; the kernel's own dispatch deadline sits below it.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ModuleClient {
    bridge: SabBridge,
    slot: u16,
    id: String,
    call_id: AtomicU64,
    call_timeout: Duration,
    /// Responses drained while looking for a different call id.
    stashed: Mutex<Vec<Response>>,
}

impl ModuleClient {
    /// Attach and register in one step (§ module init contract). On failure
    /// the slot is cleared so discovery never sees a half-registered module.
    pub fn register(bridge: SabBridge, reg: ModuleRegistration) -> Result<Self> {
        let id = reg.id.clone();
        let slot = registry::register_module(&bridge, &reg)?;
        Ok(Self {
            bridge,
            slot,
            id,
            call_id: AtomicU64::new(1),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            stashed: Mutex::new(Vec::new()),
        })
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn module_id(&self) -> &str {
        &self.id
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Graceful shutdown: flip the active bit off; discovery deregisters the
    /// module on its next scan.
    pub fn deregister(self) -> Result<()> {
        registry::deactivate_module(&self.bridge, self.slot)
    }

    /// Stage a payload region in the arena (for `sabRef` resources).
    pub fn alloc_staging(&self, size: usize) -> Result<u64> {
        arena::alloc(&self.bridge, size)
    }

    pub fn write_staging(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.bridge.validate_arena_offset(offset, data.len() as u64)?;
        self.bridge.write_raw(offset as usize, data)
    }

    pub fn read_staging(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.bridge.validate_arena_offset(offset, size as u64)?;
        self.bridge.read_raw(offset as usize, size)
    }

    pub fn report_memory_pages(&self, pages: u16) -> Result<()> {
        registry::report_memory_pages(&self.bridge, self.slot, pages)
    }

    /// Park until the kernel has signalled readiness at least once.
    pub async fn wait_kernel_ready(&self) {
        if self.bridge.read_atomic_i32(IDX_KERNEL_READY) > 0 {
            return;
        }
        self.bridge.wait_for_epoch_async(IDX_KERNEL_READY, 0).await;
    }

    // ========== SYSCALLS ==========

    /// Ask the mesh to stream a chunk directly into the arena. Returns
    /// (bytes_transferred, hash_verified).
    pub async fn fetch_chunk(
        &self,
        hash: &str,
        dest_offset: u64,
        dest_size: u32,
    ) -> Result<(u64, bool)> {
        let result = self
            .call(SyscallBody::FetchChunk {
                hash: hash.to_string(),
                dest_offset,
                dest_size,
            })
            .await?;
        match result {
            SyscallResult::FetchChunk {
                bytes_transferred,
                hash_verified,
            } => Ok((bytes_transferred, hash_verified)),
            other => Err(Error::Internal(format!(
                "mismatched result union for fetchChunk: {:?}",
                other
            ))),
        }
    }

    /// Distribute an arena region as a content-addressed chunk. Returns the
    /// replica count reported by the mesh.
    pub async fn store_chunk(&self, hash: &str, src_offset: u64, size: u32) -> Result<u16> {
        let result = self
            .call(SyscallBody::StoreChunk {
                hash: hash.to_string(),
                src_offset,
                size,
            })
            .await?;
        match result {
            SyscallResult::StoreChunk { replicas } => Ok(replicas),
            other => Err(Error::Internal(format!(
                "mismatched result union for storeChunk: {:?}",
                other
            ))),
        }
    }

    pub async fn send_message(&self, target_id: &str, payload: Resource) -> Result<bool> {
        let result = self
            .call(SyscallBody::SendMessage {
                target_id: target_id.to_string(),
                payload,
            })
            .await?;
        match result {
            SyscallResult::SendMessage { delivered } => Ok(delivered),
            other => Err(Error::Internal(format!(
                "mismatched result union for sendMessage: {:?}",
                other
            ))),
        }
    }

    pub async fn host_call(&self, service: &str, payload: Resource) -> Result<Resource> {
        let result = self
            .call(SyscallBody::HostCall {
                service: service.to_string(),
                payload,
            })
            .await?;
        match result {
            SyscallResult::HostCall { payload } => Ok(payload),
            other => Err(Error::Internal(format!(
                "mismatched result union for hostCall: {:?}",
                other
            ))),
        }
    }

    /// Issue a syscall and await its response envelope.
    pub async fn call(&self, body: SyscallBody) -> Result<SyscallResult> {
        let response = self.call_raw(body).await?;
        match response.outcome {
            Ok(result) => Ok(result),
            Err(wire) => Err(Error::Syscall {
                code: wire.code,
                message: wire.message,
            }),
        }
    }

    /// Issue a syscall and return the raw response, typed errors included.
    pub async fn call_raw(&self, body: SyscallBody) -> Result<Response> {
        let call_id = self.call_id.fetch_add(1, Ordering::Relaxed);
        let env = Envelope::new(call_id, self.slot as u32, timestamp_ns(), body);
        let bytes = encode_envelope(&env)?;
        self.bridge
            .outbox_push(self.slot, FRAME_KIND_SYSCALL_REQUEST, 0, &bytes)?;

        tokio::time::timeout(self.call_timeout, self.await_response(call_id))
            .await
            .map_err(|_| Error::Timeout(self.call_timeout.as_millis() as u64))?
    }

    async fn await_response(&self, call_id: u64) -> Result<Response> {
        let dirty = inbox_dirty_index(self.slot);
        let mut last = self.bridge.read_atomic_i32(dirty);
        loop {
            // The stash lock doubles as the single-consumer guard for the
            // inbox ring: concurrent callers drain under it, responses for
            // other call ids are parked for their owners.
            {
                let mut stash = self.stashed.lock();
                while let Some(frame) = self.bridge.inbox_pop(self.slot)? {
                    match decode_response(&frame.payload) {
                        Ok(resp) => stash.push(resp),
                        Err(e) => {
                            log::warn!("module {} dropping undecodable inbox frame: {}", self.id, e)
                        }
                    }
                }
                if let Some(idx) = stash.iter().position(|r| r.call_id == call_id) {
                    return Ok(stash.swap_remove(idx));
                }
            }
            last = self.bridge.wait_for_epoch_async(dirty, last).await;
        }
    }
}

fn timestamp_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_envelope, encode_response};
    use crate::layout::SUBSTRATE_SIZE_MIN;
    use crate::rings::FRAME_KIND_SYSCALL_RESPONSE;

    fn client() -> (SabBridge, ModuleClient) {
        let b = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        let c = ModuleClient::register(
            b.clone(),
            ModuleRegistration::new("testmod", (1, 0, 0)).capability("echo"),
        )
        .unwrap();
        (b, c)
    }

    #[tokio::test]
    async fn test_call_roundtrip_through_rings() {
        let (b, c) = client();

        // Fake kernel: answer the next outbox request on the inbox.
        let kernel = tokio::spawn({
            let b = b.clone();
            async move {
                loop {
                    if let Some((from, frame)) = b.outbox_read_one().unwrap() {
                        let env = decode_envelope(&frame.payload).unwrap();
                        let resp = Response::success(
                            env.header.call_id,
                            SyscallResult::SendMessage { delivered: true },
                        );
                        let bytes = encode_response(&resp).unwrap();
                        b.inbox_push(from, FRAME_KIND_SYSCALL_RESPONSE, 0, &bytes).unwrap();
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        });

        let delivered = c
            .send_message("peer-1", Resource::Inline(b"hi".to_vec()))
            .await
            .unwrap();
        assert!(delivered);
        kernel.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_times_out_without_kernel() {
        let (_b, c) = client();
        let c = c.with_call_timeout(Duration::from_millis(50));
        let err = c
            .send_message("nobody", Resource::Inline(vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wire_error_surfaces_as_syscall_error() {
        let (b, c) = client();
        let b2 = b.clone();
        tokio::spawn(async move {
            loop {
                if let Some((from, frame)) = b2.outbox_read_one().unwrap() {
                    let env = decode_envelope(&frame.payload).unwrap();
                    let resp = Response::failure(env.header.call_id, &Error::DeadlineExceeded);
                    let bytes = encode_response(&resp).unwrap();
                    b2.inbox_push(from, FRAME_KIND_SYSCALL_RESPONSE, 0, &bytes).unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let err = c
            .fetch_chunk("abcd", 0x150200, 64)
            .await
            .unwrap_err();
        match err {
            Error::Syscall { code, .. } => {
                assert_eq!(code, crate::error::code::DEADLINE_EXCEEDED)
            }
            other => panic!("expected syscall error, got {:?}", other),
        }
    }

    #[test]
    fn test_staging_respects_arena_bounds() {
        let (_b, c) = client();
        let off = c.alloc_staging(128).unwrap();
        c.write_staging(off, b"staged").unwrap();
        assert_eq!(c.read_staging(off, 6).unwrap(), b"staged");
        assert!(c.write_staging(0x1000, b"no").is_err());
    }
}
