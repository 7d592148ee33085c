//! DID registry over the identity region.
//!
//! Record (128 bytes):
//!
//! ```text
//! 0   [u8;64] did (NUL-padded)   100 u32 did_hash (CAS claim word)
//! 64  [u8;32] pubkey             104 u64 registered_at_ms
//! 96  u8 status  97 u8 flags     112 reserved
//! ```
//!
//! Slot allocation is the registry algorithm: probe linearly from
//! `crc32c(did) mod capacity`, claim by CAS on the hash word, publish the
//! status byte last.

use std::sync::atomic::Ordering;

use chrono::Utc;
use dashmap::DashMap;
use substrate::layout::{
    IDENTITY_ENTRY_SIZE, IDX_SYSTEM_EPOCH, MAX_IDENTITIES, OFFSET_IDENTITY_REGISTRY,
};
use substrate::{crc32c_hash, Error, Result, SabBridge};

use crate::economy::validate_did;

const STATUS_ACTIVE: u8 = 1;

const DID_FIELD: usize = 64;
const PUBKEY_FIELD: usize = 32;
const STATUS_OFFSET: usize = 96;
const HASH_OFFSET: usize = 100;
const REGISTERED_AT_OFFSET: usize = 104;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub slot: u16,
    pub did: String,
    pub pubkey: Option<[u8; 32]>,
    pub registered_at_ms: u64,
}

pub struct IdentitySupervisor {
    bridge: SabBridge,
    index: DashMap<String, u16>,
}

const fn record_offset(slot: u16) -> usize {
    OFFSET_IDENTITY_REGISTRY + slot as usize * IDENTITY_ENTRY_SIZE
}

impl IdentitySupervisor {
    pub fn new(bridge: SabBridge) -> Self {
        Self {
            bridge,
            index: DashMap::new(),
        }
    }

    /// Register a DID, optionally binding a public key. Re-registration of
    /// the same DID updates the key in place and keeps the slot.
    pub fn register_did(&self, did: &str, pubkey: Option<[u8; 32]>) -> Result<u16> {
        validate_did(did)?;
        let hash = crc32c_hash(did.as_bytes());
        let start = hash as usize % MAX_IDENTITIES;

        for probe in 0..MAX_IDENTITIES {
            let slot = ((start + probe) % MAX_IDENTITIES) as u16;
            let word = self.bridge.atomic_u32_at(record_offset(slot) + HASH_OFFSET);
            let current = word.load(Ordering::Acquire);

            let claimed = if current == 0 {
                word.compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            } else if current == hash {
                match self.read_record(slot)? {
                    Some(existing) if existing.did != did => false, // hash collision
                    _ => true,                                      // ours (or mid-write)
                }
            } else {
                false
            };

            if !claimed {
                continue;
            }

            self.write_record(slot, did, pubkey)?;
            self.index.insert(did.to_string(), slot);
            self.bridge.bump_epoch(IDX_SYSTEM_EPOCH);
            return Ok(slot);
        }
        Err(Error::RegistryFull)
    }

    pub fn lookup(&self, did: &str) -> Result<Option<IdentityRecord>> {
        validate_did(did)?;
        if let Some(slot) = self.index.get(did) {
            return self.read_record(*slot);
        }
        let hash = crc32c_hash(did.as_bytes());
        let start = hash as usize % MAX_IDENTITIES;
        for probe in 0..MAX_IDENTITIES {
            let slot = ((start + probe) % MAX_IDENTITIES) as u16;
            let current = self
                .bridge
                .atomic_u32_at(record_offset(slot) + HASH_OFFSET)
                .load(Ordering::Acquire);
            if current == 0 {
                return Ok(None);
            }
            if current == hash {
                if let Some(rec) = self.read_record(slot)? {
                    if rec.did == did {
                        self.index.insert(did.to_string(), slot);
                        return Ok(Some(rec));
                    }
                }
            }
        }
        Ok(None)
    }

    fn write_record(&self, slot: u16, did: &str, pubkey: Option<[u8; 32]>) -> Result<()> {
        let base = record_offset(slot);
        let mut body = [0u8; IDENTITY_ENTRY_SIZE];
        body[..did.len()].copy_from_slice(did.as_bytes());
        if let Some(key) = pubkey {
            body[DID_FIELD..DID_FIELD + PUBKEY_FIELD].copy_from_slice(&key);
        }
        body[REGISTERED_AT_OFFSET..REGISTERED_AT_OFFSET + 8]
            .copy_from_slice(&(Utc::now().timestamp_millis() as u64).to_le_bytes());
        // Body except the claim word and status, which are written atomically.
        self.bridge.write_raw(base, &body[..STATUS_OFFSET])?;
        self.bridge
            .write_raw(base + REGISTERED_AT_OFFSET, &body[REGISTERED_AT_OFFSET..])?;
        // Publish last.
        self.bridge
            .atomic_u8_at(base + STATUS_OFFSET)
            .store(STATUS_ACTIVE, Ordering::Release);
        Ok(())
    }

    fn read_record(&self, slot: u16) -> Result<Option<IdentityRecord>> {
        let base = record_offset(slot);
        let status = self.bridge.atomic_u8_at(base + STATUS_OFFSET).load(Ordering::Acquire);
        if status != STATUS_ACTIVE {
            return Ok(None);
        }
        let bytes = self.bridge.read_raw(base, IDENTITY_ENTRY_SIZE)?;
        let end = bytes[..DID_FIELD]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DID_FIELD);
        let did = String::from_utf8_lossy(&bytes[..end]).into_owned();
        let key_bytes: [u8; 32] = bytes[DID_FIELD..DID_FIELD + PUBKEY_FIELD]
            .try_into()
            .unwrap();
        let pubkey = if key_bytes.iter().all(|&b| b == 0) {
            None
        } else {
            Some(key_bytes)
        };
        Ok(Some(IdentityRecord {
            slot,
            did,
            pubkey,
            registered_at_ms: u64::from_le_bytes(
                bytes[REGISTERED_AT_OFFSET..REGISTERED_AT_OFFSET + 8]
                    .try_into()
                    .unwrap(),
            ),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate::layout::SUBSTRATE_SIZE_MIN;

    fn supervisor() -> IdentitySupervisor {
        IdentitySupervisor::new(SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap())
    }

    #[test]
    fn test_register_and_lookup() {
        let ids = supervisor();
        let slot = ids.register_did("did:inos:alice", Some([7u8; 32])).unwrap();
        let rec = ids.lookup("did:inos:alice").unwrap().unwrap();
        assert_eq!(rec.slot, slot);
        assert_eq!(rec.did, "did:inos:alice");
        assert_eq!(rec.pubkey, Some([7u8; 32]));
        assert!(rec.registered_at_ms > 0);
    }

    #[test]
    fn test_unknown_did_is_none() {
        let ids = supervisor();
        assert!(ids.lookup("did:inos:nobody").unwrap().is_none());
    }

    #[test]
    fn test_reregistration_updates_key_in_place() {
        let ids = supervisor();
        let slot = ids.register_did("did:inos:bob", None).unwrap();
        assert_eq!(ids.lookup("did:inos:bob").unwrap().unwrap().pubkey, None);

        let again = ids.register_did("did:inos:bob", Some([9u8; 32])).unwrap();
        assert_eq!(slot, again);
        assert_eq!(
            ids.lookup("did:inos:bob").unwrap().unwrap().pubkey,
            Some([9u8; 32])
        );
    }

    #[test]
    fn test_registration_bumps_system_epoch() {
        let bridge = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        let ids = IdentitySupervisor::new(bridge.clone());
        let before = bridge.read_atomic_i32(IDX_SYSTEM_EPOCH);
        ids.register_did("did:inos:carol", None).unwrap();
        assert!(bridge.read_atomic_i32(IDX_SYSTEM_EPOCH) > before);
    }

    #[test]
    fn test_lookup_survives_fresh_instance() {
        let bridge = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        IdentitySupervisor::new(bridge.clone())
            .register_did("did:inos:eve", None)
            .unwrap();
        let fresh = IdentitySupervisor::new(bridge);
        assert!(fresh.lookup("did:inos:eve").unwrap().is_some());
    }
}
