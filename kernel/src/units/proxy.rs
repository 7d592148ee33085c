//! Library proxy executor: operation string + JSON parameters resolved to a
//! concrete handler. Input size and parameter shape are validated before the
//! handler runs; anything else is `InvalidParams`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use substrate::{crc32c_hash, Capability, Error, Result};

use crate::job::Job;
use crate::units::{UnitExecutor, UnitKind};

type OpHandler = Box<dyn Fn(&Map<String, Value>, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

const DEFAULT_MAX_INPUT: usize = 64 * 1024 * 1024;

pub struct ProxyExecutor {
    kind: UnitKind,
    ops: HashMap<String, OpHandler>,
    max_input: usize,
}

impl ProxyExecutor {
    pub fn new(kind: UnitKind) -> Self {
        Self {
            kind,
            ops: HashMap::new(),
            max_input: DEFAULT_MAX_INPUT,
        }
    }

    /// The baseline operation set every proxy carries.
    pub fn with_builtin_ops(kind: UnitKind) -> Self {
        let mut proxy = Self::new(kind);
        proxy.register("echo", |_params, data| Ok(data.to_vec()));
        proxy.register("hash.blake3", |_params, data| {
            Ok(hex::encode(blake3::hash(data).as_bytes()).into_bytes())
        });
        proxy.register("checksum.crc32c", |_params, data| {
            Ok(crc32c_hash(data).to_le_bytes().to_vec())
        });
        proxy.register("json.validate", |_params, data| {
            serde_json::from_slice::<Value>(data)
                .map(|_| vec![1u8])
                .map_err(|e| Error::InvalidParams(format!("payload is not valid JSON: {}", e)))
        });
        proxy
    }

    /// Proxy for a discovered module: builtin ops plus the module's
    /// advertised capabilities as named stubs. A capability with no concrete
    /// library behind it is answered with `InvalidParams` at call time rather
    /// than unknown-operation, so callers can tell the difference.
    pub fn for_capabilities(kind: UnitKind, caps: &[Capability]) -> Self {
        let mut proxy = Self::with_builtin_ops(kind);
        for cap in caps {
            let name = cap.id.clone();
            if proxy.ops.contains_key(&name) {
                continue;
            }
            let label = name.clone();
            proxy.register(&name, move |_params, _data| {
                Err(Error::InvalidParams(format!(
                    "capability {} has no kernel-side library binding",
                    label
                )))
            });
        }
        proxy
    }

    pub fn with_max_input(mut self, max_input: usize) -> Self {
        self.max_input = max_input;
        self
    }

    pub fn register<F>(&mut self, op: &str, handler: F)
    where
        F: Fn(&Map<String, Value>, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.ops.insert(op.to_string(), Box::new(handler));
    }

    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<_> = self.ops.keys().cloned().collect();
        ops.sort();
        ops
    }
}

#[async_trait]
impl UnitExecutor for ProxyExecutor {
    fn kind(&self) -> UnitKind {
        self.kind
    }

    async fn execute(&self, job: &Job) -> Result<Vec<u8>> {
        if job.data.len() > self.max_input {
            return Err(Error::InvalidParams(format!(
                "input of {} bytes exceeds unit limit {}",
                job.data.len(),
                self.max_input
            )));
        }
        let handler = self.ops.get(&job.operation).ok_or_else(|| {
            Error::InvalidParams(format!(
                "unknown operation '{}' for {} unit",
                job.operation,
                self.kind.as_str()
            ))
        })?;
        handler(&job.parameters, &job.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(op: &str, data: &[u8]) -> Job {
        let mut j = Job::new("data", op).with_data(data.to_vec());
        j.id = "t".into();
        j
    }

    #[tokio::test]
    async fn test_builtin_ops() {
        let proxy = ProxyExecutor::with_builtin_ops(UnitKind::Data);

        assert_eq!(
            proxy.execute(&job("echo", b"payload")).await.unwrap(),
            b"payload"
        );

        let digest = proxy.execute(&job("hash.blake3", b"abc")).await.unwrap();
        assert_eq!(
            String::from_utf8(digest).unwrap(),
            hex::encode(blake3::hash(b"abc").as_bytes())
        );

        let crc = proxy
            .execute(&job("checksum.crc32c", b"compute"))
            .await
            .unwrap();
        assert_eq!(crc, 0xEC77DD28u32.to_le_bytes().to_vec());

        assert!(proxy.execute(&job("json.validate", b"{\"k\":1}")).await.is_ok());
        assert!(matches!(
            proxy.execute(&job("json.validate", b"{nope")).await,
            Err(Error::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let proxy = ProxyExecutor::with_builtin_ops(UnitKind::Data);
        assert!(matches!(
            proxy.execute(&job("fft.forward", b"x")).await,
            Err(Error::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_input_size_limit() {
        let proxy = ProxyExecutor::with_builtin_ops(UnitKind::Data).with_max_input(16);
        assert!(matches!(
            proxy.execute(&job("echo", &[0u8; 32])).await,
            Err(Error::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_capability_stub_answers_typed() {
        let caps = vec![Capability::new("gemm")];
        let proxy = ProxyExecutor::for_capabilities(UnitKind::Compute, &caps);
        assert!(proxy.operations().contains(&"gemm".to_string()));
        assert!(matches!(
            proxy.execute(&job("gemm", b"matrix")).await,
            Err(Error::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_registration() {
        let mut proxy = ProxyExecutor::new(UnitKind::Generic);
        proxy.register("sum.u8", |_p, data| {
            Ok(vec![data.iter().fold(0u8, |a, b| a.wrapping_add(*b))])
        });
        assert_eq!(
            proxy.execute(&job("sum.u8", &[1, 2, 3])).await.unwrap(),
            vec![6]
        );
    }
}
