//! Storage unit: content-addressed put/get/has over the configured provider.

use async_trait::async_trait;
use std::sync::Arc;
use substrate::{Error, Result};

use crate::delegate::StorageProvider;
use crate::job::Job;
use crate::units::{UnitExecutor, UnitKind};

pub struct StorageUnit {
    provider: Arc<dyn StorageProvider>,
}

impl StorageUnit {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self { provider }
    }

    fn hash_param(job: &Job) -> Result<&str> {
        job.parameters
            .get("hash")
            .and_then(|v| v.as_str())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidParams("storage job needs a 'hash' parameter".into()))
    }
}

#[async_trait]
impl UnitExecutor for StorageUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::Storage
    }

    async fn execute(&self, job: &Job) -> Result<Vec<u8>> {
        let hash = Self::hash_param(job)?;
        match job.operation.as_str() {
            "store" => {
                if job.data.len() > self.provider.max_chunk_size() {
                    return Err(Error::InvalidParams(format!(
                        "chunk of {} bytes exceeds max {}",
                        job.data.len(),
                        self.provider.max_chunk_size()
                    )));
                }
                self.provider.store(hash, &job.data).await?;
                Ok(Vec::new())
            }
            "fetch" => self.provider.fetch(hash).await,
            "has" => Ok(vec![self.provider.has(hash).await? as u8]),
            other => Err(Error::InvalidParams(format!(
                "unknown storage operation '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::MemoryStore;
    use serde_json::json;

    fn store_job(op: &str, hash: &str, data: &[u8]) -> Job {
        let mut j = Job::new("storage", op)
            .with_data(data.to_vec())
            .with_param("hash", json!(hash));
        j.id = "s".into();
        j
    }

    #[tokio::test]
    async fn test_store_fetch_has_cycle() {
        let unit = StorageUnit::new(Arc::new(MemoryStore::new(1024)));
        let data = b"chunk body".to_vec();
        let hash = hex::encode(blake3::hash(&data).as_bytes());

        assert_eq!(
            unit.execute(&store_job("has", &hash, &[])).await.unwrap(),
            vec![0]
        );
        unit.execute(&store_job("store", &hash, &data)).await.unwrap();
        assert_eq!(
            unit.execute(&store_job("has", &hash, &[])).await.unwrap(),
            vec![1]
        );
        assert_eq!(
            unit.execute(&store_job("fetch", &hash, &[])).await.unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_oversized_store_rejected() {
        let unit = StorageUnit::new(Arc::new(MemoryStore::new(8)));
        let data = vec![0u8; 64];
        let hash = hex::encode(blake3::hash(&data).as_bytes());
        assert!(matches!(
            unit.execute(&store_job("store", &hash, &data)).await,
            Err(Error::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_hash_param() {
        let unit = StorageUnit::new(Arc::new(MemoryStore::new(1024)));
        let mut j = Job::new("storage", "fetch");
        j.id = "s".into();
        assert!(matches!(
            unit.execute(&j).await,
            Err(Error::InvalidParams(_))
        ));
    }
}
