//! Syscall envelope codec.
//!
//! A closed, length-delimited little-endian schema with forward-compatible
//! discriminators. The codec is pure: no I/O, no substrate access, and
//! deterministic byte-for-byte. `sabRef` offsets decoded here are *always*
//! revalidated against the live substrate by the dispatcher.

use crate::error::{Error, Result, Status};

/// "SBAB" little-endian.
pub const ENVELOPE_MAGIC: u32 = 0x53424142;

/// Largest payload an `inline` resource may embed.
pub const MAX_INLINE_PAYLOAD: usize = 1024 * 1024;

const MAX_HASH_LEN: usize = 128;
const MAX_STRING_LEN: usize = 256;

/// Body discriminators
const BODY_FETCH_CHUNK: u16 = 0;
const BODY_STORE_CHUNK: u16 = 1;
const BODY_SEND_MESSAGE: u16 = 2;
const BODY_HOST_CALL: u16 = 3;

/// Resource discriminators
const RESOURCE_INLINE: u8 = 0;
const RESOURCE_SAB_REF: u8 = 1;
const RESOURCE_SHARDS: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub call_id: u64,
    pub origin_module_id: u32,
    pub timestamp_ns: i64,
}

/// Payload carrier with three shapes. `Shards` is reserved; the dispatcher
/// rejects it with `InvalidParams`, but the codec round-trips it so newer
/// peers are not mistaken for garbage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Inline(Vec<u8>),
    SabRef { offset: u64, size: u32 },
    Shards,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallBody {
    FetchChunk {
        hash: String,
        dest_offset: u64,
        dest_size: u32,
    },
    StoreChunk {
        hash: String,
        src_offset: u64,
        size: u32,
    },
    SendMessage {
        target_id: String,
        payload: Resource,
    },
    HostCall {
        service: String,
        payload: Resource,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    pub body: SyscallBody,
}

impl Envelope {
    pub fn new(call_id: u64, origin_module_id: u32, timestamp_ns: i64, body: SyscallBody) -> Self {
        Self {
            header: Header {
                magic: ENVELOPE_MAGIC,
                call_id,
                origin_module_id,
                timestamp_ns,
            },
            body,
        }
    }
}

/// Result union mirroring `SyscallBody`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallResult {
    FetchChunk {
        bytes_transferred: u64,
        hash_verified: bool,
    },
    StoreChunk {
        replicas: u16,
    },
    SendMessage {
        delivered: bool,
    },
    HostCall {
        payload: Resource,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub call_id: u64,
    pub status: Status,
    pub outcome: std::result::Result<SyscallResult, WireError>,
}

impl Response {
    pub fn success(call_id: u64, result: SyscallResult) -> Self {
        Self {
            call_id,
            status: Status::Success,
            outcome: Ok(result),
        }
    }

    pub fn failure(call_id: u64, err: &Error) -> Self {
        Self {
            call_id,
            status: err.status(),
            outcome: Err(WireError::from(err)),
        }
    }
}

/// Job result envelope pushed through an outbox by an executing module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResultWire {
    pub job_id: String,
    pub success: bool,
    pub data: Vec<u8>,
    pub error: Option<String>,
    pub duration_us: u64,
    pub cost: u64,
}

// ========== WRITER ==========

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn str16(&mut self, s: &str, max: usize) -> Result<()> {
        if s.len() > max {
            return Err(Error::InvalidParams(format!(
                "string of {} bytes exceeds limit {}",
                s.len(),
                max
            )));
        }
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn bytes32(&mut self, b: &[u8], max: usize) -> Result<()> {
        if b.len() > max {
            return Err(Error::InvalidParams(format!(
                "payload of {} bytes exceeds limit {}",
                b.len(),
                max
            )));
        }
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
        Ok(())
    }

    fn resource(&mut self, r: &Resource) -> Result<()> {
        match r {
            Resource::Inline(data) => {
                self.u8(RESOURCE_INLINE);
                self.bytes32(data, MAX_INLINE_PAYLOAD)?;
            }
            Resource::SabRef { offset, size } => {
                self.u8(RESOURCE_SAB_REF);
                self.u64(*offset);
                self.u32(*size);
            }
            Resource::Shards => {
                self.u8(RESOURCE_SHARDS);
            }
        }
        Ok(())
    }
}

// ========== READER ==========

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn fail<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(Error::SchemaError {
            position: self.pos,
            message: message.into(),
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return self.fail(format!(
                "truncated: need {} bytes, {} remain",
                n,
                self.buf.len() - self.pos
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn str16(&mut self, max: usize) -> Result<String> {
        let len = self.u16()? as usize;
        if len > max {
            return self.fail(format!("string of {} bytes exceeds limit {}", len, max));
        }
        let bytes = self.take(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => self.fail("string is not valid UTF-8"),
        }
    }

    fn bytes32(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > max {
            return self.fail(format!("payload of {} bytes exceeds limit {}", len, max));
        }
        Ok(self.take(len)?.to_vec())
    }

    fn resource(&mut self) -> Result<Resource> {
        match self.u8()? {
            RESOURCE_INLINE => Ok(Resource::Inline(self.bytes32(MAX_INLINE_PAYLOAD)?)),
            RESOURCE_SAB_REF => Ok(Resource::SabRef {
                offset: self.u64()?,
                size: self.u32()?,
            }),
            RESOURCE_SHARDS => Ok(Resource::Shards),
            other => self.fail(format!("unknown resource discriminator {}", other)),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return self.fail(format!(
                "{} trailing bytes after message",
                self.buf.len() - self.pos
            ));
        }
        Ok(())
    }
}

// ========== ENVELOPE ==========

pub fn encode_envelope(env: &Envelope) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    w.u32(env.header.magic);
    w.u64(env.header.call_id);
    w.u32(env.header.origin_module_id);
    w.i64(env.header.timestamp_ns);
    match &env.body {
        SyscallBody::FetchChunk {
            hash,
            dest_offset,
            dest_size,
        } => {
            w.u16(BODY_FETCH_CHUNK);
            w.str16(hash, MAX_HASH_LEN)?;
            w.u64(*dest_offset);
            w.u32(*dest_size);
        }
        SyscallBody::StoreChunk {
            hash,
            src_offset,
            size,
        } => {
            w.u16(BODY_STORE_CHUNK);
            w.str16(hash, MAX_HASH_LEN)?;
            w.u64(*src_offset);
            w.u32(*size);
        }
        SyscallBody::SendMessage { target_id, payload } => {
            w.u16(BODY_SEND_MESSAGE);
            w.str16(target_id, MAX_STRING_LEN)?;
            w.resource(payload)?;
        }
        SyscallBody::HostCall { service, payload } => {
            w.u16(BODY_HOST_CALL);
            w.str16(service, MAX_STRING_LEN)?;
            w.resource(payload)?;
        }
    }
    Ok(w.buf)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let mut r = Reader::new(bytes);
    let magic = r.u32()?;
    let call_id = r.u64()?;
    let origin_module_id = r.u32()?;
    let timestamp_ns = r.i64()?;
    let body = match r.u16()? {
        BODY_FETCH_CHUNK => SyscallBody::FetchChunk {
            hash: r.str16(MAX_HASH_LEN)?,
            dest_offset: r.u64()?,
            dest_size: r.u32()?,
        },
        BODY_STORE_CHUNK => SyscallBody::StoreChunk {
            hash: r.str16(MAX_HASH_LEN)?,
            src_offset: r.u64()?,
            size: r.u32()?,
        },
        BODY_SEND_MESSAGE => SyscallBody::SendMessage {
            target_id: r.str16(MAX_STRING_LEN)?,
            payload: r.resource()?,
        },
        BODY_HOST_CALL => SyscallBody::HostCall {
            service: r.str16(MAX_STRING_LEN)?,
            payload: r.resource()?,
        },
        other => return r.fail(format!("unknown body discriminator {}", other)),
    };
    r.finish()?;
    Ok(Envelope {
        header: Header {
            magic,
            call_id,
            origin_module_id,
            timestamp_ns,
        },
        body,
    })
}

// ========== RESPONSE ==========

const RESULT_TAGS: [u16; 4] = [
    BODY_FETCH_CHUNK,
    BODY_STORE_CHUNK,
    BODY_SEND_MESSAGE,
    BODY_HOST_CALL,
];

pub fn encode_response(resp: &Response) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    w.u32(ENVELOPE_MAGIC);
    w.u64(resp.call_id);
    w.u8(resp.status as u8);
    match &resp.outcome {
        Ok(result) => {
            w.u8(1);
            match result {
                SyscallResult::FetchChunk {
                    bytes_transferred,
                    hash_verified,
                } => {
                    w.u16(RESULT_TAGS[0]);
                    w.u64(*bytes_transferred);
                    w.u8(*hash_verified as u8);
                }
                SyscallResult::StoreChunk { replicas } => {
                    w.u16(RESULT_TAGS[1]);
                    w.u16(*replicas);
                }
                SyscallResult::SendMessage { delivered } => {
                    w.u16(RESULT_TAGS[2]);
                    w.u8(*delivered as u8);
                }
                SyscallResult::HostCall { payload } => {
                    w.u16(RESULT_TAGS[3]);
                    w.resource(payload)?;
                }
            }
        }
        Err(err) => {
            w.u8(0);
            w.u16(err.code);
            w.str16(&err.message, MAX_STRING_LEN)?;
        }
    }
    Ok(w.buf)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let mut r = Reader::new(bytes);
    let magic = r.u32()?;
    if magic != ENVELOPE_MAGIC {
        return r.fail(format!("response magic {:#010x}", magic));
    }
    let call_id = r.u64()?;
    let status_byte = r.u8()?;
    let status = match Status::from_u8(status_byte) {
        Some(s) => s,
        None => return r.fail(format!("unknown status byte {}", status_byte)),
    };
    let outcome = match r.u8()? {
        1 => {
            let result = match r.u16()? {
                BODY_FETCH_CHUNK => SyscallResult::FetchChunk {
                    bytes_transferred: r.u64()?,
                    hash_verified: r.u8()? != 0,
                },
                BODY_STORE_CHUNK => SyscallResult::StoreChunk { replicas: r.u16()? },
                BODY_SEND_MESSAGE => SyscallResult::SendMessage {
                    delivered: r.u8()? != 0,
                },
                BODY_HOST_CALL => SyscallResult::HostCall {
                    payload: r.resource()?,
                },
                other => return r.fail(format!("unknown result discriminator {}", other)),
            };
            Ok(result)
        }
        0 => Err(WireError {
            code: r.u16()?,
            message: r.str16(MAX_STRING_LEN)?,
        }),
        other => return r.fail(format!("unknown outcome marker {}", other)),
    };
    r.finish()?;
    Ok(Response {
        call_id,
        status,
        outcome,
    })
}

// ========== JOB RESULT ==========

pub fn encode_job_result(res: &JobResultWire) -> Result<Vec<u8>> {
    let mut w = Writer::new();
    w.u32(ENVELOPE_MAGIC);
    w.str16(&res.job_id, MAX_STRING_LEN)?;
    w.u8(res.success as u8);
    w.bytes32(&res.data, MAX_INLINE_PAYLOAD)?;
    w.str16(res.error.as_deref().unwrap_or(""), MAX_STRING_LEN)?;
    w.u64(res.duration_us);
    w.u64(res.cost);
    Ok(w.buf)
}

pub fn decode_job_result(bytes: &[u8]) -> Result<JobResultWire> {
    let mut r = Reader::new(bytes);
    let magic = r.u32()?;
    if magic != ENVELOPE_MAGIC {
        return r.fail(format!("job result magic {:#010x}", magic));
    }
    let job_id = r.str16(MAX_STRING_LEN)?;
    let success = r.u8()? != 0;
    let data = r.bytes32(MAX_INLINE_PAYLOAD)?;
    let error = r.str16(MAX_STRING_LEN)?;
    let duration_us = r.u64()?;
    let cost = r.u64()?;
    r.finish()?;
    Ok(JobResultWire {
        job_id,
        success,
        data,
        error: if error.is_empty() { None } else { Some(error) },
        duration_us,
        cost,
    })
}
