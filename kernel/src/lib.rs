//! INOS kernel core: the supervisor side of the shared arena substrate.
//!
//! The root supervisor discovers modules through the registry, parks on the
//! outbox dirty flag, dispatches syscalls against the mesh/storage/host
//! delegators, routes jobs to unit supervisors and settles the credit ledger
//! on economy epochs. The substrate itself — layout, bridge, rings, codec —
//! lives in the `substrate` crate.

pub mod config;
pub mod delegate;
pub mod dispatch;
pub mod economy;
pub mod identity;
pub mod job;
pub mod logging;
pub mod social;
pub mod supervisor;
pub mod units;


pub use config::KernelConfig;
pub use delegate::{
    ArenaWriter, ChunkSink, HostCallHandler, MemoryMesh, MemoryStore, MeshDelegator,
    StorageProvider,
};
pub use dispatch::Dispatcher;
pub use economy::CreditSupervisor;
pub use identity::IdentitySupervisor;
pub use job::{Job, JobMetrics, JobPriority, JobResult};
pub use social::{EdgeKind, SocialGraphSupervisor};
pub use supervisor::{JobPhase, RootSupervisor, SupervisorState, SupervisorStats};
pub use units::{
    ProxyExecutor, ProxyUnitLoader, StorageUnit, UnitExecutor, UnitKind, UnitLoader,
    UnitSupervisor,
};

use std::sync::Arc;
use substrate::{Result, SabBridge};

/// Host entry point: attach to a substrate the host runtime created and bring
/// the kernel up. Must be called from within a tokio runtime.
///
/// # Safety
/// `substrate_ptr..substrate_ptr+size` must be a live, 8-byte-aligned shared
/// mapping that outlives the returned supervisor, accessed elsewhere only by
/// parties honoring the substrate protocol.
pub unsafe fn initialize_compute(
    substrate_ptr: *mut u8,
    size: usize,
    mesh: Arc<dyn MeshDelegator>,
    storage: Arc<dyn StorageProvider>,
) -> Result<RootSupervisor> {
    let bridge = SabBridge::attach_raw(substrate_ptr, size, 0, size)?;
    bridge.ensure_magic()?;
    let root = RootSupervisor::new(bridge, mesh, storage, KernelConfig::default());
    root.start()?;
    Ok(root)
}
