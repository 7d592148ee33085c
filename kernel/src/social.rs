//! Social graph: typed, append-only adjacency over DIDs.
//!
//! The region holds a u32 committed-edge counter in its header followed by
//! fixed 144-byte edge records. The supervisor is the region's designated
//! (single) writer; readers load the counter with acquire ordering and only
//! trust records below it.

use std::sync::atomic::Ordering;

use chrono::Utc;
use serde::Serialize;
use substrate::layout::{
    MAX_SOCIAL_EDGES, OFFSET_SOCIAL_GRAPH, SOCIAL_EDGE_SIZE, SOCIAL_HEADER_SIZE,
};
use substrate::{Error, Result, SabBridge};

use crate::economy::validate_did;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Follow,
    Referral,
    Collaboration,
    Endorsement,
}

impl EdgeKind {
    fn as_u8(self) -> u8 {
        match self {
            EdgeKind::Follow => 0,
            EdgeKind::Referral => 1,
            EdgeKind::Collaboration => 2,
            EdgeKind::Endorsement => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EdgeKind::Follow),
            1 => Some(EdgeKind::Referral),
            2 => Some(EdgeKind::Collaboration),
            3 => Some(EdgeKind::Endorsement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocialEdge {
    pub from_did: String,
    pub to_did: String,
    pub kind: EdgeKind,
    pub timestamp_ms: u64,
}

pub struct SocialGraphSupervisor {
    bridge: SabBridge,
}

const DID_FIELD: usize = 64;
const KIND_OFFSET: usize = 128;
const TIMESTAMP_OFFSET: usize = 136;

const fn edge_offset(index: u32) -> usize {
    OFFSET_SOCIAL_GRAPH + SOCIAL_HEADER_SIZE + index as usize * SOCIAL_EDGE_SIZE
}

impl SocialGraphSupervisor {
    pub fn new(bridge: SabBridge) -> Self {
        Self { bridge }
    }

    pub fn edge_count(&self) -> u32 {
        self.bridge
            .atomic_u32_at(OFFSET_SOCIAL_GRAPH)
            .load(Ordering::Acquire)
    }

    /// Append an edge. Edges are immutable once committed; there is no
    /// removal, matching the append-only contract.
    pub fn add_edge(&self, from_did: &str, to_did: &str, kind: EdgeKind) -> Result<u32> {
        validate_did(from_did)?;
        validate_did(to_did)?;
        if from_did == to_did {
            return Err(Error::InvalidParams("self-edges are not allowed".into()));
        }

        let count_word = self.bridge.atomic_u32_at(OFFSET_SOCIAL_GRAPH);
        let index = count_word.load(Ordering::Acquire);
        if index as usize >= MAX_SOCIAL_EDGES {
            return Err(Error::ArenaExhausted {
                requested: SOCIAL_EDGE_SIZE as u64,
                available: 0,
            });
        }

        let mut record = [0u8; SOCIAL_EDGE_SIZE];
        record[..from_did.len()].copy_from_slice(from_did.as_bytes());
        record[DID_FIELD..DID_FIELD + to_did.len()].copy_from_slice(to_did.as_bytes());
        record[KIND_OFFSET] = kind.as_u8();
        record[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
            .copy_from_slice(&(Utc::now().timestamp_millis() as u64).to_le_bytes());
        self.bridge.write_raw(edge_offset(index), &record)?;

        // Publish after the record bytes are down.
        count_word.store(index + 1, Ordering::Release);
        Ok(index)
    }

    pub fn edge_at(&self, index: u32) -> Result<Option<SocialEdge>> {
        if index >= self.edge_count() {
            return Ok(None);
        }
        let bytes = self.bridge.read_raw(edge_offset(index), SOCIAL_EDGE_SIZE)?;
        let from_did = read_did(&bytes[..DID_FIELD]);
        let to_did = read_did(&bytes[DID_FIELD..2 * DID_FIELD]);
        let Some(kind) = EdgeKind::from_u8(bytes[KIND_OFFSET]) else {
            return Ok(None); // unknown kind from a newer writer; skip
        };
        Ok(Some(SocialEdge {
            from_did,
            to_did,
            kind,
            timestamp_ms: u64::from_le_bytes(
                bytes[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8].try_into().unwrap(),
            ),
        }))
    }

    /// All committed edges leaving `did`, in append order.
    pub fn edges_from(&self, did: &str) -> Result<Vec<SocialEdge>> {
        validate_did(did)?;
        let mut out = Vec::new();
        for index in 0..self.edge_count() {
            if let Some(edge) = self.edge_at(index)? {
                if edge.from_did == did {
                    out.push(edge);
                }
            }
        }
        Ok(out)
    }
}

fn read_did(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
