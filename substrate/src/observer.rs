//! Read-only external observer.
//!
//! A UI or telemetry process attaches to the same substrate and scans the
//! registry without ever bumping an epoch. All strings are copied out of the
//! shared buffer — a publisher may rewrite its slot mid-read, and a slot
//! whose signature, hash and flags disagree is simply skipped.

use std::collections::HashMap;

use serde::Serialize;

use crate::bridge::SabBridge;
use crate::error::Result;
use crate::registry::{ModuleInfo, ModuleRegistry};

/// Record shape surfaced to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRecord {
    pub id: String,
    pub active: bool,
    pub version: String,
    pub capabilities: Vec<String>,
    #[serde(rename = "memoryUsagePages")]
    pub memory_usage_pages: u16,
}

pub struct Observer {
    registry: ModuleRegistry,
}

impl Observer {
    pub fn attach(bridge: SabBridge) -> Self {
        Self {
            registry: ModuleRegistry::new(bridge),
        }
    }

    /// Scan active modules. Inactive or malformed modules are surfaced by
    /// omission; there is no error record.
    pub fn scan(&self) -> Result<HashMap<String, ModuleRecord>> {
        let mut out = HashMap::new();
        for info in self.registry.scan()? {
            let capabilities = match self.registry.read_capabilities(&info) {
                Ok(caps) => caps.into_iter().map(|c| c.id).collect(),
                Err(e) => {
                    log::debug!("observer skipping module {}: {}", info.id, e);
                    continue;
                }
            };
            out.insert(info.id.clone(), record(&info, capabilities));
        }
        Ok(out)
    }
}

fn record(info: &ModuleInfo, capabilities: Vec<String>) -> ModuleRecord {
    ModuleRecord {
        id: info.id.clone(),
        active: true,
        version: info.version_string(),
        capabilities,
        memory_usage_pages: info.memory_usage_pages,
    }
}
