//! Shared arena substrate: the memory side of the system.
//!
//! A fixed layout over one shared linear buffer carries the flag table,
//! module registry, identity/social/economy regions, per-module ring pairs
//! and the payload arena. Everything here is usable from both sides of the
//! fence: the kernel attaches through [`bridge::SabBridge`], modules register
//! through [`client::ModuleClient`], and observers scan read-only through
//! [`observer::Observer`].

pub mod arena;
pub mod bridge;
pub mod client;
pub mod codec;
pub mod error;
pub mod layout;
pub mod observer;
pub mod registry;
pub mod rings;

pub use bridge::{BridgeMetrics, MetricsSnapshot, SabBridge, WaitOutcome};
pub use client::ModuleClient;
pub use codec::{
    decode_envelope, decode_job_result, decode_response, encode_envelope, encode_job_result,
    encode_response, Envelope, JobResultWire, Resource, Response, SyscallBody, SyscallResult,
    WireError, ENVELOPE_MAGIC, MAX_INLINE_PAYLOAD,
};
pub use error::{Error, Result, Status};
pub use layout::Layout;
pub use observer::{ModuleRecord, Observer};
pub use registry::{
    crc32c_hash, register_module, Capability, ModuleInfo, ModuleRegistration, ModuleRegistry,
};
pub use rings::{
    Frame, FRAME_KIND_JOB_RESULT, FRAME_KIND_SYSCALL_REQUEST, FRAME_KIND_SYSCALL_RESPONSE,
    MAX_FRAME_PAYLOAD,
};
