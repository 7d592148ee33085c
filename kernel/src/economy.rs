//! Credit ledger and epoch-indexed settlement.
//!
//! Balances live in the economics region of the substrate; the supervisor
//! holds nothing off-substrate except a did -> slot index and the queue of
//! accruals awaiting the next settlement epoch. Settlement is idempotent per
//! epoch and every fold is journaled.
//!
//! Account record (64 bytes):
//!
//! ```text
//! 0  u32 did_hash      24 i64 spent_total
//! 4  u32 flags         32 u64 last_epoch
//! 8  i64 balance       40 u64 updated_at_ms
//! 16 i64 accrued_total 48 reserved
//! ```
//!
//! Journal record (64 bytes): magic, epoch, did_hash, delta, balance_after,
//! timestamp. The journal is a ring: a u32 count in the region header, then
//! records indexed by `count % MAX_JOURNAL_RECORDS`.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use substrate::layout::{
    JOURNAL_HEADER_SIZE, JOURNAL_RECORD_SIZE, MAX_ECONOMY_ACCOUNTS, MAX_JOURNAL_RECORDS,
    OFFSET_ECONOMY_ACCOUNTS, OFFSET_ECONOMY_JOURNAL, ECONOMY_ACCOUNT_SIZE,
};
use substrate::{crc32c_hash, Error, Result, SabBridge};

pub const JOURNAL_MAGIC: u64 = u64::from_le_bytes(*b"INOSJRNL");

const ACCOUNT_FLAG_OCCUPIED: u32 = 1;

/// Longest DID accepted anywhere in the identity/economy/social regions.
pub const DID_MAX: usize = 63;

pub(crate) fn validate_did(did: &str) -> Result<()> {
    if did.is_empty() || did.len() > DID_MAX {
        return Err(Error::InvalidParams(format!(
            "did '{}' must be 1..={} bytes",
            did, DID_MAX
        )));
    }
    if !did.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::InvalidParams(format!(
            "did '{}' must be printable ASCII",
            did
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountState {
    pub balance: i64,
    pub accrued_total: i64,
    pub spent_total: i64,
    pub last_epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub epoch: u64,
    pub did_hash: u32,
    pub delta: i64,
    pub balance_after: i64,
    pub timestamp_ms: u64,
}

struct Accrual {
    did: String,
    delta: i64,
}

pub struct CreditSupervisor {
    bridge: SabBridge,
    pending: Mutex<Vec<Accrual>>,
    index: DashMap<String, u16>,
    last_settled: AtomicI64,
}

const fn account_offset(slot: u16) -> usize {
    OFFSET_ECONOMY_ACCOUNTS + slot as usize * ECONOMY_ACCOUNT_SIZE
}

impl CreditSupervisor {
    pub fn new(bridge: SabBridge) -> Self {
        Self {
            bridge,
            pending: Mutex::new(Vec::new()),
            index: DashMap::new(),
            last_settled: AtomicI64::new(0),
        }
    }

    /// Queue a balance change for the next settlement epoch. Positive deltas
    /// are earnings, negative are spends.
    pub fn accrue(&self, did: &str, delta: i64) -> Result<()> {
        validate_did(did)?;
        self.pending.lock().push(Accrual {
            did: did.to_string(),
            delta,
        });
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Current settled balance; unknown DIDs read as zero.
    pub fn balance(&self, did: &str) -> Result<i64> {
        validate_did(did)?;
        match self.find_slot(did)? {
            Some(slot) => Ok(self.read_account(slot)?.balance),
            None => Ok(0),
        }
    }

    pub fn account(&self, did: &str) -> Result<Option<AccountState>> {
        validate_did(did)?;
        match self.find_slot(did)? {
            Some(slot) => Ok(Some(self.read_account(slot)?)),
            None => Ok(None),
        }
    }

    /// Fold pending accruals into balances for epoch `e`. Re-invocations with
    /// the same (or an older) epoch are no-ops, so a restarted economy loop
    /// can replay wakes safely.
    pub fn on_epoch(&self, e: i64) -> Result<usize> {
        let last = self.last_settled.load(Ordering::Acquire);
        if e <= last {
            return Ok(0);
        }

        let drained: Vec<Accrual> = std::mem::take(&mut *self.pending.lock());
        let mut folded = 0usize;
        for accrual in &drained {
            match self.fold(accrual, e as u64) {
                Ok(()) => folded += 1,
                Err(err) => {
                    log::warn!(
                        "settlement for {} dropped {} credits: {}",
                        accrual.did,
                        accrual.delta,
                        err
                    );
                }
            }
        }
        self.last_settled.store(e, Ordering::Release);
        if folded > 0 {
            log::info!("settled {} accruals at economy epoch {}", folded, e);
        }
        Ok(folded)
    }

    pub fn last_settled_epoch(&self) -> i64 {
        self.last_settled.load(Ordering::Acquire)
    }

    fn fold(&self, accrual: &Accrual, epoch: u64) -> Result<()> {
        let slot = self.find_or_claim_slot(&accrual.did)?;
        let mut state = self.read_account(slot)?;
        state.balance += accrual.delta;
        if accrual.delta >= 0 {
            state.accrued_total += accrual.delta;
        } else {
            state.spent_total += -accrual.delta;
        }
        state.last_epoch = epoch;
        self.write_account(slot, &state)?;
        self.append_journal(&JournalRecord {
            epoch,
            did_hash: crc32c_hash(accrual.did.as_bytes()),
            delta: accrual.delta,
            balance_after: state.balance,
            timestamp_ms: Utc::now().timestamp_millis() as u64,
        })
    }

    // ---- account slots ----

    fn find_slot(&self, did: &str) -> Result<Option<u16>> {
        if let Some(slot) = self.index.get(did) {
            return Ok(Some(*slot));
        }
        let hash = crc32c_hash(did.as_bytes());
        let start = hash as usize % MAX_ECONOMY_ACCOUNTS;
        for probe in 0..MAX_ECONOMY_ACCOUNTS {
            let slot = ((start + probe) % MAX_ECONOMY_ACCOUNTS) as u16;
            let word = self.bridge.atomic_u32_at(account_offset(slot)).load(Ordering::Acquire);
            if word == 0 {
                return Ok(None);
            }
            if word == hash {
                self.index.insert(did.to_string(), slot);
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn find_or_claim_slot(&self, did: &str) -> Result<u16> {
        if let Some(slot) = self.find_slot(did)? {
            return Ok(slot);
        }
        let hash = crc32c_hash(did.as_bytes());
        let start = hash as usize % MAX_ECONOMY_ACCOUNTS;
        for probe in 0..MAX_ECONOMY_ACCOUNTS {
            let slot = ((start + probe) % MAX_ECONOMY_ACCOUNTS) as u16;
            let word = self.bridge.atomic_u32_at(account_offset(slot));
            let current = word.load(Ordering::Acquire);
            if current == hash {
                self.index.insert(did.to_string(), slot);
                return Ok(slot);
            }
            if current == 0
                && word
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                let state = AccountState {
                    balance: 0,
                    accrued_total: 0,
                    spent_total: 0,
                    last_epoch: 0,
                };
                self.write_account(slot, &state)?;
                self.index.insert(did.to_string(), slot);
                return Ok(slot);
            }
        }
        Err(Error::RegistryFull)
    }

    fn read_account(&self, slot: u16) -> Result<AccountState> {
        let bytes = self.bridge.read_raw(account_offset(slot), ECONOMY_ACCOUNT_SIZE)?;
        Ok(AccountState {
            balance: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            accrued_total: i64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            spent_total: i64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            last_epoch: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
        })
    }

    fn write_account(&self, slot: u16, state: &AccountState) -> Result<()> {
        let base = account_offset(slot);
        let mut body = [0u8; ECONOMY_ACCOUNT_SIZE - 8];
        body[0..8].copy_from_slice(&state.balance.to_le_bytes());
        body[8..16].copy_from_slice(&state.accrued_total.to_le_bytes());
        body[16..24].copy_from_slice(&state.spent_total.to_le_bytes());
        body[24..32].copy_from_slice(&state.last_epoch.to_le_bytes());
        body[32..40].copy_from_slice(&(Utc::now().timestamp_millis() as u64).to_le_bytes());
        // The did_hash word stays untouched; flags mark the slot live.
        self.bridge.write_raw(base + 8, &body)?;
        self.bridge
            .atomic_u32_at(base + 4)
            .store(ACCOUNT_FLAG_OCCUPIED, Ordering::Release);
        Ok(())
    }

    // ---- journal ----

    fn append_journal(&self, rec: &JournalRecord) -> Result<()> {
        let count_word = self.bridge.atomic_u32_at(OFFSET_ECONOMY_JOURNAL);
        let idx = count_word.load(Ordering::Acquire);
        let pos = OFFSET_ECONOMY_JOURNAL
            + JOURNAL_HEADER_SIZE
            + (idx as usize % MAX_JOURNAL_RECORDS) * JOURNAL_RECORD_SIZE;

        let mut bytes = [0u8; JOURNAL_RECORD_SIZE];
        bytes[0..8].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        bytes[8..16].copy_from_slice(&rec.epoch.to_le_bytes());
        bytes[16..20].copy_from_slice(&rec.did_hash.to_le_bytes());
        bytes[24..32].copy_from_slice(&rec.delta.to_le_bytes());
        bytes[32..40].copy_from_slice(&rec.balance_after.to_le_bytes());
        bytes[40..48].copy_from_slice(&rec.timestamp_ms.to_le_bytes());
        self.bridge.write_raw(pos, &bytes)?;
        count_word.store(idx.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Read back the most recent `n` journal records, newest last.
    pub fn journal_tail(&self, n: usize) -> Result<Vec<JournalRecord>> {
        let count = self
            .bridge
            .atomic_u32_at(OFFSET_ECONOMY_JOURNAL)
            .load(Ordering::Acquire) as usize;
        let available = count.min(MAX_JOURNAL_RECORDS).min(n);
        let mut out = Vec::with_capacity(available);
        for i in (0..available).rev() {
            let idx = (count - 1 - i) % MAX_JOURNAL_RECORDS;
            let pos = OFFSET_ECONOMY_JOURNAL + JOURNAL_HEADER_SIZE + idx * JOURNAL_RECORD_SIZE;
            let bytes = self.bridge.read_raw(pos, JOURNAL_RECORD_SIZE)?;
            if u64::from_le_bytes(bytes[0..8].try_into().unwrap()) != JOURNAL_MAGIC {
                continue;
            }
            out.push(JournalRecord {
                epoch: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
                did_hash: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
                delta: i64::from_le_bytes(bytes[24..32].try_into().unwrap()),
                balance_after: i64::from_le_bytes(bytes[32..40].try_into().unwrap()),
                timestamp_ms: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate::layout::SUBSTRATE_SIZE_MIN;

    fn supervisor() -> CreditSupervisor {
        CreditSupervisor::new(SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap())
    }

    #[test]
    fn test_accrue_then_settle() {
        let credits = supervisor();
        credits.accrue("did:inos:alice", 100).unwrap();
        credits.accrue("did:inos:alice", 20).unwrap();
        credits.accrue("did:inos:bob", 7).unwrap();
        assert_eq!(credits.balance("did:inos:alice").unwrap(), 0);

        assert_eq!(credits.on_epoch(1).unwrap(), 3);
        assert_eq!(credits.balance("did:inos:alice").unwrap(), 120);
        assert_eq!(credits.balance("did:inos:bob").unwrap(), 7);
        assert_eq!(credits.pending_count(), 0);
    }

    #[test]
    fn test_settlement_idempotent_per_epoch() {
        let credits = supervisor();
        credits.accrue("did:inos:alice", 50).unwrap();
        assert_eq!(credits.on_epoch(3).unwrap(), 1);

        // Replayed or stale epochs fold nothing, even with queued accruals.
        credits.accrue("did:inos:alice", 50).unwrap();
        assert_eq!(credits.on_epoch(3).unwrap(), 0);
        assert_eq!(credits.on_epoch(2).unwrap(), 0);
        assert_eq!(credits.balance("did:inos:alice").unwrap(), 50);

        // The queued accrual lands on the next fresh epoch.
        assert_eq!(credits.on_epoch(4).unwrap(), 1);
        assert_eq!(credits.balance("did:inos:alice").unwrap(), 100);
    }

    #[test]
    fn test_spend_tracks_totals() {
        let credits = supervisor();
        credits.accrue("did:inos:carol", 30).unwrap();
        credits.accrue("did:inos:carol", -12).unwrap();
        credits.on_epoch(1).unwrap();

        let account = credits.account("did:inos:carol").unwrap().unwrap();
        assert_eq!(account.balance, 18);
        assert_eq!(account.accrued_total, 30);
        assert_eq!(account.spent_total, 12);
        assert_eq!(account.last_epoch, 1);
    }

    #[test]
    fn test_journal_records_every_fold() {
        let credits = supervisor();
        credits.accrue("did:inos:alice", 5).unwrap();
        credits.accrue("did:inos:bob", 9).unwrap();
        credits.on_epoch(2).unwrap();

        let tail = credits.journal_tail(10).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail.iter().all(|r| r.epoch == 2));
        let alice_hash = crc32c_hash(b"did:inos:alice");
        assert!(tail.iter().any(|r| r.did_hash == alice_hash && r.delta == 5));
    }

    #[test]
    fn test_balances_survive_new_supervisor_instance() {
        let bridge = SabBridge::create_owned(SUBSTRATE_SIZE_MIN).unwrap();
        let credits = CreditSupervisor::new(bridge.clone());
        credits.accrue("did:inos:dan", 42).unwrap();
        credits.on_epoch(1).unwrap();
        drop(credits);

        // The substrate is the source of truth; a fresh instance re-finds
        // the account by probing.
        let reborn = CreditSupervisor::new(bridge);
        assert_eq!(reborn.balance("did:inos:dan").unwrap(), 42);
    }

    #[test]
    fn test_did_validation() {
        let credits = supervisor();
        assert!(credits.accrue("", 1).is_err());
        assert!(credits.accrue("has space", 1).is_err());
        assert!(credits.accrue(&"x".repeat(64), 1).is_err());
    }
}
