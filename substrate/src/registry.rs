//! Module registry: fixed-slot table modules publish themselves into.
//!
//! A slot is claimed by CAS on the `id_hash` word, probed linearly from
//! `crc32c(id) mod 64`. Writers publish the entry body first and flip the
//! active bit last (release); scanners load the flag byte first (acquire), so
//! an active slot always shows a fully written body.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::arena;
use crate::bridge::SabBridge;
use crate::error::{Error, Result};
use crate::layout::{
    IDX_REGISTRY_EPOCH, MAX_MODULES_INLINE, MODULE_ENTRY_SIZE, OFFSET_MODULE_REGISTRY,
};

/// Magic at the head of every occupied registry slot.
pub const MODULE_SIGNATURE: [u8; 8] = *b"INOSMODL";

pub const MODULE_ID_MAX: usize = 12;
pub const CAPABILITY_ID_MAX: usize = 32;
pub const CAPABILITY_ENTRY_SIZE: usize = 36;

/// Module entry flags (byte at offset 15)
pub const FLAG_OCCUPIED: u8 = 0b0001;
pub const FLAG_ACTIVE: u8 = 0b0010;
pub const FLAG_TRUSTED: u8 = 0b0100;

/// Registry slot image (96 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModuleEntry {
    pub signature: [u8; 8],
    pub id_hash: u32,
    pub version: [u8; 3],
    pub flags: u8,
    pub reserved0: [u8; 16],
    pub memory_usage_pages: u16,
    pub reserved1: [u8; 22],
    pub cap_table_offset: u32,
    pub cap_count: u16,
    pub reserved2: [u8; 2],
    pub module_id: [u8; MODULE_ID_MAX],
    pub reserved3: [u8; 20],
}

const _: [(); MODULE_ENTRY_SIZE] = [(); std::mem::size_of::<ModuleEntry>()];

impl ModuleEntry {
    fn empty() -> Self {
        // SAFETY: ModuleEntry is plain-old-data; all-zero is a valid image.
        unsafe { std::mem::zeroed() }
    }

    pub fn is_valid(&self) -> bool {
        self.signature == MODULE_SIGNATURE && self.id_hash != 0
    }

    pub fn is_active(&self) -> bool {
        (self.flags & FLAG_ACTIVE) != 0
    }

    pub fn module_id(&self) -> String {
        let end = self
            .module_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MODULE_ID_MAX);
        String::from_utf8_lossy(&self.module_id[..end]).into_owned()
    }
}

/// Capability entry stored in the arena (36 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CapabilityEntry {
    pub id: [u8; CAPABILITY_ID_MAX],
    pub min_memory_mb: u16,
    pub flags: u8,
    pub reserved: u8,
}

const _: [(); CAPABILITY_ENTRY_SIZE] = [(); std::mem::size_of::<CapabilityEntry>()];

impl CapabilityEntry {
    pub fn id(&self) -> String {
        let end = self
            .id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CAPABILITY_ID_MAX);
        String::from_utf8_lossy(&self.id[..end]).into_owned()
    }
}

/// A declared capability, before it is packed into the arena table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub id: String,
    pub min_memory_mb: u16,
    pub flags: u8,
}

impl Capability {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            min_memory_mb: 0,
            flags: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.len() > CAPABILITY_ID_MAX {
            return Err(Error::InvalidParams(format!(
                "capability id '{}' must be 1..={} bytes",
                self.id, CAPABILITY_ID_MAX
            )));
        }
        if !self.id.bytes().all(|b| (0x21..=0x7E).contains(&b)) {
            return Err(Error::InvalidParams(format!(
                "capability id '{}' must be printable ASCII",
                self.id
            )));
        }
        Ok(())
    }
}

/// Everything a module declares when it registers.
#[derive(Debug, Clone)]
pub struct ModuleRegistration {
    pub id: String,
    pub version: (u8, u8, u8),
    pub capabilities: Vec<Capability>,
    pub trusted: bool,
    pub memory_usage_pages: u16,
}

impl ModuleRegistration {
    pub fn new(id: &str, version: (u8, u8, u8)) -> Self {
        Self {
            id: id.to_string(),
            version,
            capabilities: Vec::new(),
            trusted: false,
            memory_usage_pages: 0,
        }
    }

    pub fn capability(mut self, id: &str) -> Self {
        self.capabilities.push(Capability::new(id));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.len() > MODULE_ID_MAX {
            return Err(Error::InvalidParams(format!(
                "module id '{}' must be 1..={} bytes",
                self.id, MODULE_ID_MAX
            )));
        }
        if !self.id.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::InvalidParams(format!(
                "module id '{}' must be printable ASCII",
                self.id
            )));
        }
        for cap in &self.capabilities {
            cap.validate()?;
        }
        Ok(())
    }
}

/// Decoded view of an active registry slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub slot: u16,
    pub id: String,
    pub id_hash: u32,
    pub version: (u8, u8, u8),
    pub trusted: bool,
    pub memory_usage_pages: u16,
    pub cap_table_offset: u32,
    pub cap_count: u16,
}

impl ModuleInfo {
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.version.0, self.version.1, self.version.2)
    }
}

// ========== CRC-32C (Castagnoli) ==========

const fn generate_crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x82F63B78; // Castagnoli polynomial
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC32C_TABLE: [u32; 256] = generate_crc32c_table();

/// CRC-32C hash used for registry and ledger slot indexing.
pub fn crc32c_hash(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

// ========== SLOT I/O ==========

const fn slot_offset(slot: u16) -> usize {
    OFFSET_MODULE_REGISTRY + slot as usize * MODULE_ENTRY_SIZE
}

/// Offset of the `id_hash` word inside a slot; the CAS claim target.
const ID_HASH_OFFSET: usize = 8;
/// Offset of the flags byte inside a slot; the publish target.
const FLAGS_OFFSET: usize = 15;

fn read_entry(bridge: &SabBridge, slot: u16) -> Result<ModuleEntry> {
    let bytes = bridge.read_raw(slot_offset(slot), MODULE_ENTRY_SIZE)?;
    // SAFETY: ModuleEntry is POD and exactly MODULE_ENTRY_SIZE bytes;
    // read_unaligned tolerates the Vec's alignment.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const ModuleEntry) })
}

fn write_entry_body(bridge: &SabBridge, slot: u16, entry: &ModuleEntry) -> Result<()> {
    // SAFETY: POD view of the entry for the raw copy.
    let bytes = unsafe {
        std::slice::from_raw_parts(entry as *const _ as *const u8, MODULE_ENTRY_SIZE)
    };
    bridge.write_raw(slot_offset(slot), bytes)
}

/// Pack and publish a capability table into the arena. Returns (offset, count).
fn write_capability_table(bridge: &SabBridge, caps: &[Capability]) -> Result<(u32, u16)> {
    if caps.is_empty() {
        return Ok((0, 0));
    }
    let size = caps.len() * CAPABILITY_ENTRY_SIZE;
    let offset = arena::alloc(bridge, size)?;
    let mut packed = Vec::with_capacity(size);
    for cap in caps {
        let mut entry = CapabilityEntry {
            id: [0; CAPABILITY_ID_MAX],
            min_memory_mb: cap.min_memory_mb,
            flags: cap.flags,
            reserved: 0,
        };
        entry.id[..cap.id.len()].copy_from_slice(cap.id.as_bytes());
        // SAFETY: POD view for packing.
        let bytes = unsafe {
            std::slice::from_raw_parts(&entry as *const _ as *const u8, CAPABILITY_ENTRY_SIZE)
        };
        packed.extend_from_slice(bytes);
    }
    bridge.write_raw(offset as usize, &packed)?;
    Ok((offset as u32, caps.len() as u16))
}

/// Register (or re-register) a module. Returns the claimed slot index, which
/// is also the module's numeric id for ring addressing.
pub fn register_module(bridge: &SabBridge, reg: &ModuleRegistration) -> Result<u16> {
    reg.validate()?;
    let id_hash = crc32c_hash(reg.id.as_bytes());
    let start = (id_hash as usize) % MAX_MODULES_INLINE;

    for probe in 0..MAX_MODULES_INLINE {
        let slot = ((start + probe) % MAX_MODULES_INLINE) as u16;
        let hash_word = bridge.atomic_u32_at(slot_offset(slot) + ID_HASH_OFFSET);

        let current = hash_word.load(Ordering::Acquire);
        if current == 0 {
            if hash_word
                .compare_exchange(0, id_hash, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Lost the race for this slot; re-examine it on the next
                // loop iteration before moving on.
                let now = hash_word.load(Ordering::Acquire);
                if now != id_hash {
                    continue;
                }
            }
        } else if current == id_hash {
            let entry = read_entry(bridge, slot)?;
            if entry.is_valid() && entry.module_id() != reg.id {
                continue; // hash collision with a different module
            }
            // Re-registration: take the slot down before rewriting it.
            let flags_byte = bridge.atomic_u8_at(slot_offset(slot) + FLAGS_OFFSET);
            flags_byte.store(FLAG_OCCUPIED, Ordering::Release);
        } else {
            continue;
        }

        // A failed publish (arena exhaustion, write fault) must not leave a
        // half-claimed slot behind; discovery would skip it forever.
        return match publish_slot(bridge, slot, id_hash, reg) {
            Ok(slot) => Ok(slot),
            Err(e) => {
                let _ = clear_slot(bridge, slot);
                Err(e)
            }
        };
    }
    Err(Error::RegistryFull)
}

fn publish_slot(
    bridge: &SabBridge,
    slot: u16,
    id_hash: u32,
    reg: &ModuleRegistration,
) -> Result<u16> {
    let (cap_table_offset, cap_count) = write_capability_table(bridge, &reg.capabilities)?;

    let mut entry = ModuleEntry::empty();
    entry.signature = MODULE_SIGNATURE;
    entry.id_hash = id_hash;
    entry.version = [reg.version.0, reg.version.1, reg.version.2];
    entry.flags = FLAG_OCCUPIED;
    entry.memory_usage_pages = reg.memory_usage_pages;
    entry.cap_table_offset = cap_table_offset;
    entry.cap_count = cap_count;
    entry.module_id[..reg.id.len()].copy_from_slice(reg.id.as_bytes());
    write_entry_body(bridge, slot, &entry)?;

    // Publish: active goes last so scanners never observe a torn body.
    let mut flags = FLAG_OCCUPIED | FLAG_ACTIVE;
    if reg.trusted {
        flags |= FLAG_TRUSTED;
    }
    bridge
        .atomic_u8_at(slot_offset(slot) + FLAGS_OFFSET)
        .store(flags, Ordering::Release);
    bridge.bump_epoch(IDX_REGISTRY_EPOCH);
    Ok(slot)
}

/// Graceful shutdown: clear the active bit, leave the body for diagnostics.
pub fn deactivate_module(bridge: &SabBridge, slot: u16) -> Result<()> {
    let flags_byte = bridge.atomic_u8_at(slot_offset(slot) + FLAGS_OFFSET);
    let flags = flags_byte.load(Ordering::Acquire);
    flags_byte.store(flags & !FLAG_ACTIVE, Ordering::Release);
    bridge.bump_epoch(IDX_REGISTRY_EPOCH);
    Ok(())
}

/// Failed init: take the slot down entirely so it can be reclaimed.
pub fn clear_slot(bridge: &SabBridge, slot: u16) -> Result<()> {
    bridge
        .atomic_u8_at(slot_offset(slot) + FLAGS_OFFSET)
        .store(0, Ordering::Release);
    bridge
        .atomic_u32_at(slot_offset(slot) + ID_HASH_OFFSET)
        .store(0, Ordering::Release);
    bridge.bump_epoch(IDX_REGISTRY_EPOCH);
    Ok(())
}

/// Update the self-reported memory footprint of a registered module.
pub fn report_memory_pages(bridge: &SabBridge, slot: u16, pages: u16) -> Result<()> {
    bridge.write_raw(slot_offset(slot) + 32, &pages.to_le_bytes())?;
    bridge.bump_epoch(IDX_REGISTRY_EPOCH);
    Ok(())
}

/// In-memory mirror of the registry plus the scan/observe API.
pub struct ModuleRegistry {
    bridge: SabBridge,
    mirror: HashMap<String, u16>,
}

impl ModuleRegistry {
    pub fn new(bridge: SabBridge) -> Self {
        Self {
            bridge,
            mirror: HashMap::new(),
        }
    }

    /// Walk all 64 slots and decode the ones satisfying the visibility
    /// invariants (signature, non-zero hash matching the id, active bit).
    pub fn scan(&self) -> Result<Vec<ModuleInfo>> {
        let mut out = Vec::new();
        for slot in 0..MAX_MODULES_INLINE as u16 {
            // The flag byte is loaded first (acquire): an active slot is
            // guaranteed to show its fully published body.
            let flags = self
                .bridge
                .atomic_u8_at(slot_offset(slot) + FLAGS_OFFSET)
                .load(Ordering::Acquire);
            if flags & FLAG_ACTIVE == 0 {
                continue;
            }
            let entry = read_entry(&self.bridge, slot)?;
            if !entry.is_valid() {
                continue;
            }
            let id = entry.module_id();
            if crc32c_hash(id.as_bytes()) != entry.id_hash {
                continue; // torn or stale slot; skip
            }
            out.push(ModuleInfo {
                slot,
                id,
                id_hash: entry.id_hash,
                version: (entry.version[0], entry.version[1], entry.version[2]),
                trusted: flags & FLAG_TRUSTED != 0,
                memory_usage_pages: entry.memory_usage_pages,
                cap_table_offset: entry.cap_table_offset,
                cap_count: entry.cap_count,
            });
        }
        Ok(out)
    }

    /// Read and validate the capability table a registry slot points at.
    /// A table reaching outside the arena marks the module malformed.
    pub fn read_capabilities(&self, info: &ModuleInfo) -> Result<Vec<Capability>> {
        if info.cap_count == 0 {
            return Ok(Vec::new());
        }
        let size = info.cap_count as u64 * CAPABILITY_ENTRY_SIZE as u64;
        self.bridge
            .validate_arena_offset(info.cap_table_offset as u64, size)?;
        let bytes = self
            .bridge
            .read_raw(info.cap_table_offset as usize, size as usize)?;
        let mut caps = Vec::with_capacity(info.cap_count as usize);
        for chunk in bytes.chunks_exact(CAPABILITY_ENTRY_SIZE) {
            // SAFETY: POD, exact size, unaligned read.
            let entry =
                unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const CapabilityEntry) };
            let cap = Capability {
                id: entry.id(),
                min_memory_mb: entry.min_memory_mb,
                flags: entry.flags,
            };
            cap.validate().map_err(|_| {
                Error::InvalidParams(format!(
                    "module {} capability table entry is not printable ASCII",
                    info.id
                ))
            })?;
            caps.push(cap);
        }
        Ok(caps)
    }

    /// Fold a scanned module into the mirror. Returns true when the module is
    /// new or moved slots, which is the discovery loop's delta signal.
    pub fn observe(&mut self, info: &ModuleInfo) -> bool {
        match self.mirror.insert(info.id.clone(), info.slot) {
            Some(prev) => prev != info.slot,
            None => true,
        }
    }

    /// Drop a module from the mirror (deregistered or slot cleared).
    pub fn forget(&mut self, id: &str) {
        self.mirror.remove(id);
    }

    pub fn mirror(&self) -> &HashMap<String, u16> {
        &self.mirror
    }

    pub fn bridge(&self) -> &SabBridge {
        &self.bridge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SUBSTRATE_SIZE_MIN;

    fn bridge() -> SabBridge {
        SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap()
    }

    #[test]
    fn test_entry_sizes() {
        assert_eq!(std::mem::size_of::<ModuleEntry>(), 96);
        assert_eq!(std::mem::size_of::<CapabilityEntry>(), 36);
    }

    #[test]
    fn test_crc32c_compute_vector() {
        // Known vector: the "compute" module probes from slot 40.
        assert_eq!(crc32c_hash(b"compute"), 0xEC77DD28);
        assert_eq!((crc32c_hash(b"compute") as usize) % MAX_MODULES_INLINE, 40);
    }

    #[test]
    fn test_register_and_scan() {
        let b = bridge();
        let reg = ModuleRegistration::new("compute", (0, 0, 0))
            .capability("gemm")
            .capability("gemv");
        let slot = register_module(&b, &reg).unwrap();
        assert_eq!(slot, 40);

        let registry = ModuleRegistry::new(b.clone());
        let scanned = registry.scan().unwrap();
        assert_eq!(scanned.len(), 1);
        let info = &scanned[0];
        assert_eq!(info.id, "compute");
        assert_eq!(info.slot, 40);
        assert_eq!(info.version_string(), "0.0.0");
        assert_eq!(info.memory_usage_pages, 0);

        let caps = registry.read_capabilities(info).unwrap();
        let ids: Vec<_> = caps.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["gemm", "gemv"]);
    }

    #[test]
    fn test_registration_bumps_registry_epoch() {
        let b = bridge();
        let before = b.read_atomic_i32(IDX_REGISTRY_EPOCH);
        register_module(&b, &ModuleRegistration::new("mod-a", (1, 0, 0))).unwrap();
        assert!(b.read_atomic_i32(IDX_REGISTRY_EPOCH) > before);
    }

    #[test]
    fn test_collision_probes_to_next_slot() {
        let b = bridge();
        // Occupy compute's primary slot (40) with a foreign hash; probing
        // must walk to 41.
        b.atomic_u32_at(slot_offset(40) + ID_HASH_OFFSET)
            .store(0xDEAD_BEEF, Ordering::Release);
        let slot = register_module(&b, &ModuleRegistration::new("compute", (1, 0, 0))).unwrap();
        assert_eq!(slot, 41);
    }

    #[test]
    fn test_reregistration_keeps_slot_and_updates_version() {
        let b = bridge();
        let first = register_module(&b, &ModuleRegistration::new("ml", (1, 0, 0))).unwrap();
        let second = register_module(
            &b,
            &ModuleRegistration::new("ml", (1, 2, 3)).capability("train"),
        )
        .unwrap();
        assert_eq!(first, second);

        let registry = ModuleRegistry::new(b);
        let info = registry
            .scan()
            .unwrap()
            .into_iter()
            .find(|m| m.id == "ml")
            .unwrap();
        assert_eq!(info.version, (1, 2, 3));
        assert_eq!(info.cap_count, 1);
    }

    #[test]
    fn test_registry_full_on_65th() {
        let b = bridge();
        for i in 0..MAX_MODULES_INLINE {
            let id = format!("m{:02}", i);
            register_module(&b, &ModuleRegistration::new(&id, (1, 0, 0))).unwrap();
        }
        assert!(matches!(
            register_module(&b, &ModuleRegistration::new("straggler", (1, 0, 0))),
            Err(Error::RegistryFull)
        ));
    }

    #[test]
    fn test_deactivated_module_omitted_from_scan() {
        let b = bridge();
        let slot = register_module(&b, &ModuleRegistration::new("gone", (1, 0, 0))).unwrap();
        let registry = ModuleRegistry::new(b.clone());
        assert_eq!(registry.scan().unwrap().len(), 1);
        deactivate_module(&b, slot).unwrap();
        assert!(registry.scan().unwrap().is_empty());
    }

    #[test]
    fn test_cleared_slot_is_reclaimable() {
        let b = bridge();
        let slot = register_module(&b, &ModuleRegistration::new("flaky", (1, 0, 0))).unwrap();
        clear_slot(&b, slot).unwrap();
        let again = register_module(&b, &ModuleRegistration::new("flaky", (1, 0, 1))).unwrap();
        assert_eq!(slot, again);
    }

    #[test]
    fn test_observe_reports_deltas() {
        let b = bridge();
        register_module(&b, &ModuleRegistration::new("delta", (1, 0, 0))).unwrap();
        let mut registry = ModuleRegistry::new(b);
        let info = registry.scan().unwrap().pop().unwrap();
        assert!(registry.observe(&info));
        assert!(!registry.observe(&info));
        registry.forget("delta");
        assert!(registry.observe(&info));
    }

    #[test]
    fn test_malformed_cap_table_rejected() {
        let b = bridge();
        register_module(&b, &ModuleRegistration::new("broken", (1, 0, 0))).unwrap();
        let registry = ModuleRegistry::new(b);
        let mut info = registry.scan().unwrap().pop().unwrap();
        info.cap_table_offset = 0x1000; // registry region, not arena
        info.cap_count = 2;
        assert!(registry.read_capabilities(&info).is_err());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let b = bridge();
        assert!(register_module(&b, &ModuleRegistration::new("", (1, 0, 0))).is_err());
        assert!(register_module(
            &b,
            &ModuleRegistration::new("way-too-long-name", (1, 0, 0))
        )
        .is_err());
        assert!(register_module(
            &b,
            &ModuleRegistration::new("ok", (1, 0, 0)).capability("bad id")
        )
        .is_err());
    }
}
