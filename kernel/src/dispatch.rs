//! Syscall dispatch: envelope in, typed response out.
//!
//! Every handler validates caller-nominated arena references before touching
//! a delegator, retries transient delegator failures inside its own task, and
//! always produces a response — timeout, cancellation and internal failures
//! included. Chunk bytes stream straight between the arena and the mesh.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use substrate::{
    Envelope, Error, Resource, Response, Result, SabBridge, SyscallBody, SyscallResult,
};
use tokio_util::sync::CancellationToken;

use crate::config::KernelConfig;
use crate::delegate::{ArenaWriter, ChunkSink, HostCallHandler, MeshDelegator};

pub struct Dispatcher {
    bridge: SabBridge,
    mesh: Arc<dyn MeshDelegator>,
    host: Option<Arc<dyn HostCallHandler>>,
    config: KernelConfig,
}

impl Dispatcher {
    pub fn new(
        bridge: SabBridge,
        mesh: Arc<dyn MeshDelegator>,
        host: Option<Arc<dyn HostCallHandler>>,
        config: KernelConfig,
    ) -> Self {
        Self {
            bridge,
            mesh,
            host,
            config,
        }
    }

    /// Dispatch under the per-call deadline and the shared cancellation
    /// token. Never fails: the caller always gets a response to write back.
    pub async fn dispatch_bounded(&self, env: &Envelope, cancel: &CancellationToken) -> Response {
        let call_id = env.header.call_id;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Response::failure(call_id, &Error::Cancelled),
            outcome = tokio::time::timeout(self.config.dispatch_timeout(), self.handle(env)) => {
                match outcome {
                    Ok(Ok(result)) => Response::success(call_id, result),
                    Ok(Err(e)) => {
                        log::warn!("syscall {} from module {} failed: {}", call_id, env.header.origin_module_id, e);
                        Response::failure(call_id, &e)
                    }
                    Err(_) => Response::failure(call_id, &Error::Timeout(self.config.dispatch_timeout_ms)),
                }
            }
        }
    }

    async fn handle(&self, env: &Envelope) -> Result<SyscallResult> {
        match &env.body {
            SyscallBody::FetchChunk {
                hash,
                dest_offset,
                dest_size,
            } => self.fetch_chunk(hash, *dest_offset, *dest_size).await,
            SyscallBody::StoreChunk {
                hash,
                src_offset,
                size,
            } => self.store_chunk(hash, *src_offset, *size).await,
            SyscallBody::SendMessage { target_id, payload } => {
                self.send_message(target_id, payload).await
            }
            SyscallBody::HostCall { service, payload } => self.host_call(service, payload).await,
        }
    }

    /// Stream a chunk from the mesh directly into the arena (one copy, never
    /// via the host heap) and verify its content hash on the way through.
    async fn fetch_chunk(&self, hash: &str, dest_offset: u64, dest_size: u32) -> Result<SyscallResult> {
        let mut attempt = 0u32;
        loop {
            // Offset validation happens before any delegator call; a fresh
            // writer per attempt keeps retries from appending to a torn copy.
            let mut writer = ArenaWriter::new(self.bridge.clone(), dest_offset, dest_size)?;
            match self.mesh.fetch_chunk_direct(hash, &mut writer).await {
                Ok(_) => {
                    let bytes_transferred = writer.bytes_written();
                    let hash_verified = match expected_digest(hash) {
                        Some(expected) => {
                            if writer.digest_hex() != expected {
                                return Err(Error::MeshDeliveryFailed(format!(
                                    "chunk {} content hash mismatch",
                                    hash
                                )));
                            }
                            true
                        }
                        None => false,
                    };
                    return Ok(SyscallResult::FetchChunk {
                        bytes_transferred,
                        hash_verified,
                    });
                }
                Err(e) if e.is_transient() && attempt < self.config.retry_budget => {
                    attempt += 1;
                    backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the source region once, hand it to the mesh, clamp the replica
    /// count to the 16-bit wire width.
    async fn store_chunk(&self, hash: &str, src_offset: u64, size: u32) -> Result<SyscallResult> {
        self.bridge.validate_arena_offset(src_offset, size as u64)?;
        let data = self.bridge.read_raw(src_offset as usize, size as usize)?;

        let replicas = self
            .with_retries(|| self.mesh.distribute_chunk(hash, &data))
            .await?;
        let clamped = if replicas > u16::MAX as usize {
            log::warn!(
                "chunk {} replica count {} clamped to wire width {}",
                hash,
                replicas,
                u16::MAX
            );
            u16::MAX
        } else {
            replicas as u16
        };
        Ok(SyscallResult::StoreChunk { replicas: clamped })
    }

    async fn send_message(&self, target_id: &str, payload: &Resource) -> Result<SyscallResult> {
        let bytes = self.resolve_resource(payload)?;
        self.with_retries(|| self.mesh.send_message(target_id, &bytes))
            .await
            .map_err(|e| match e {
                e if e.is_transient() => Error::MeshDeliveryFailed(e.to_string()),
                e => e,
            })?;
        Ok(SyscallResult::SendMessage { delivered: true })
    }

    async fn host_call(&self, service: &str, payload: &Resource) -> Result<SyscallResult> {
        let handler = self
            .host
            .as_ref()
            .ok_or_else(|| Error::NotFound("no host call handler configured".into()))?;
        let bytes = self.resolve_resource(payload)?;
        let response = handler.host_call(service, bytes).await?;
        // A host-returned reference is revalidated like any caller offset.
        match &response {
            Resource::SabRef { offset, size } => {
                self.bridge.validate_arena_offset(*offset, *size as u64)?;
            }
            Resource::Shards => {
                return Err(Error::Internal(
                    "host returned the reserved shards resource shape".into(),
                ));
            }
            Resource::Inline(_) => {}
        }
        Ok(SyscallResult::HostCall { payload: response })
    }

    /// Materialize a request resource: inline bytes verbatim, references
    /// copied out of the arena after validation.
    fn resolve_resource(&self, resource: &Resource) -> Result<Vec<u8>> {
        match resource {
            Resource::Inline(data) => Ok(data.clone()),
            Resource::SabRef { offset, size } => {
                self.bridge.validate_arena_offset(*offset, *size as u64)?;
                self.bridge.read_raw(*offset as usize, *size as usize)
            }
            Resource::Shards => Err(Error::InvalidParams(
                "shards resources are reserved and not accepted".into(),
            )),
        }
    }

    async fn with_retries<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.config.retry_budget => {
                    attempt += 1;
                    backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn expected_digest(hash: &str) -> Option<String> {
    let lower = hash.to_ascii_lowercase();
    if lower.len() == 64 && lower.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(lower)
    } else {
        None
    }
}

async fn backoff(attempt: u32) {
    let base = 25u64 << attempt.min(4);
    let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use substrate::error::code;
    use substrate::layout::{ARENA_BASE, SUBSTRATE_SIZE_MIN};
    use substrate::Status;

    use crate::delegate::MemoryMesh;

    fn setup(host: Option<Arc<dyn HostCallHandler>>) -> (SabBridge, Arc<MemoryMesh>, Dispatcher) {
        // 4 MiB so the 0x200000-range source offsets stay in bounds.
        let bridge = SabBridge::create_owned(4 * 1024 * 1024).unwrap();
        let mesh = Arc::new(MemoryMesh::new());
        let dispatcher = Dispatcher::new(
            bridge.clone(),
            mesh.clone(),
            host,
            KernelConfig::default(),
        );
        (bridge, mesh, dispatcher)
    }

    fn envelope(body: SyscallBody) -> Envelope {
        Envelope::new(99, 3, 0, body)
    }

    #[tokio::test]
    async fn test_fetch_chunk_streams_into_arena() {
        let (bridge, mesh, dispatcher) = setup(None);
        let data = vec![0x5Au8; 4096];
        let hash = mesh.seed_content(data.clone());

        let cancel = CancellationToken::new();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::FetchChunk {
                    hash,
                    dest_offset: 0x150200,
                    dest_size: 4096,
                }),
                &cancel,
            )
            .await;

        assert_eq!(resp.status, Status::Success);
        assert_eq!(
            resp.outcome.unwrap(),
            SyscallResult::FetchChunk {
                bytes_transferred: 4096,
                hash_verified: true,
            }
        );
        assert_eq!(bridge.read_raw(0x150200, 4096).unwrap(), data);
    }

    #[tokio::test]
    async fn test_fetch_chunk_invalid_offset_skips_mesh() {
        let (_bridge, mesh, dispatcher) = setup(None);
        // No chunk seeded: if the mesh were consulted this would be NotFound
        // instead of the offset rejection.
        let cancel = CancellationToken::new();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::FetchChunk {
                    hash: "abcd".into(),
                    dest_offset: 0x1000,
                    dest_size: 4096,
                }),
                &cancel,
            )
            .await;

        assert_eq!(resp.status, Status::InvalidRequest);
        assert_eq!(resp.outcome.unwrap_err().code, code::OUT_OF_BOUNDS);
        let _ = mesh;
    }

    #[tokio::test]
    async fn test_store_chunk_reads_arena_once() {
        let (bridge, _mesh, dispatcher) = setup(None);
        let body = vec![0x11u8; 65536];
        bridge.write_raw(0x200000, &body).unwrap();

        let cancel = CancellationToken::new();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::StoreChunk {
                    hash: "ef01".into(),
                    src_offset: 0x200000,
                    size: 65536,
                }),
                &cancel,
            )
            .await;
        assert_eq!(
            resp.outcome.unwrap(),
            SyscallResult::StoreChunk { replicas: 3 }
        );
    }

    #[tokio::test]
    async fn test_store_chunk_clamps_replica_count() {
        let bridge = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        let mesh = Arc::new(MemoryMesh::new().with_replicas(100_000));
        let dispatcher = Dispatcher::new(bridge, mesh, None, KernelConfig::default());

        let cancel = CancellationToken::new();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::StoreChunk {
                    hash: "ef01".into(),
                    src_offset: ARENA_BASE as u64,
                    size: 16,
                }),
                &cancel,
            )
            .await;
        assert_eq!(
            resp.outcome.unwrap(),
            SyscallResult::StoreChunk { replicas: u16::MAX }
        );
    }

    #[tokio::test]
    async fn test_send_message_retries_transients() {
        let (_bridge, mesh, dispatcher) = setup(None);
        mesh.fail_transiently(2);

        let cancel = CancellationToken::new();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::SendMessage {
                    target_id: "peer-7".into(),
                    payload: Resource::Inline(b"hello".to_vec()),
                }),
                &cancel,
            )
            .await;
        assert_eq!(
            resp.outcome.unwrap(),
            SyscallResult::SendMessage { delivered: true }
        );
        assert_eq!(mesh.delivered_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_shards_resource_rejected() {
        let (_bridge, _mesh, dispatcher) = setup(None);
        let cancel = CancellationToken::new();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::SendMessage {
                    target_id: "peer".into(),
                    payload: Resource::Shards,
                }),
                &cancel,
            )
            .await;
        assert_eq!(resp.status, Status::InvalidRequest);
        assert_eq!(resp.outcome.unwrap_err().code, code::INVALID_PARAMS);
    }

    struct EchoHost;

    #[async_trait]
    impl HostCallHandler for EchoHost {
        async fn host_call(&self, service: &str, payload: Vec<u8>) -> Result<Resource> {
            match service {
                "echo" => Ok(Resource::Inline(payload)),
                "bad-ref" => Ok(Resource::SabRef {
                    offset: 0x10,
                    size: 4,
                }),
                _ => Err(Error::NotFound(format!("service {}", service))),
            }
        }
    }

    #[tokio::test]
    async fn test_host_call_roundtrip_and_revalidation() {
        let (_bridge, _mesh, dispatcher) = setup(Some(Arc::new(EchoHost)));
        let cancel = CancellationToken::new();

        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::HostCall {
                    service: "echo".into(),
                    payload: Resource::Inline(b"ping".to_vec()),
                }),
                &cancel,
            )
            .await;
        assert_eq!(
            resp.outcome.unwrap(),
            SyscallResult::HostCall {
                payload: Resource::Inline(b"ping".to_vec())
            }
        );

        // A host handing back a non-arena reference is caught before the
        // response is written.
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::HostCall {
                    service: "bad-ref".into(),
                    payload: Resource::Inline(vec![]),
                }),
                &cancel,
            )
            .await;
        assert_eq!(resp.outcome.unwrap_err().code, code::OUT_OF_BOUNDS);
    }

    #[tokio::test]
    async fn test_no_host_handler_is_typed_error() {
        let (_bridge, _mesh, dispatcher) = setup(None);
        let cancel = CancellationToken::new();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::HostCall {
                    service: "anything".into(),
                    payload: Resource::Inline(vec![]),
                }),
                &cancel,
            )
            .await;
        assert_eq!(resp.outcome.unwrap_err().code, code::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancellation_yields_cancelled_response() {
        let (_bridge, _mesh, dispatcher) = setup(None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let resp = dispatcher
            .dispatch_bounded(
                &envelope(SyscallBody::SendMessage {
                    target_id: "peer".into(),
                    payload: Resource::Inline(vec![1]),
                }),
                &cancel,
            )
            .await;
        assert_eq!(resp.status, Status::Cancelled);
    }
}
