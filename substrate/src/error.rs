use thiserror::Error;

/// Wire status byte carried on every syscall response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    InvalidRequest = 1,
    InternalError = 2,
    Timeout = 3,
    Cancelled = 4,
    OutOfBounds = 5,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Status::Success),
            1 => Some(Status::InvalidRequest),
            2 => Some(Status::InternalError),
            3 => Some(Status::Timeout),
            4 => Some(Status::Cancelled),
            5 => Some(Status::OutOfBounds),
            _ => None,
        }
    }
}

/// Stable numeric error codes for `Response.error.code`.
///
/// `NonArena` and `Misaligned` share the `OUT_OF_BOUNDS` wire code: callers
/// only need to know the offset was rejected, the message carries the detail.
pub mod code {
    pub const INVALID_PARAMS: u16 = 1;
    pub const QUEUE_FULL: u16 = 2;
    pub const DEADLINE_EXCEEDED: u16 = 3;
    pub const UNIT_NOT_FOUND: u16 = 4;
    pub const OUT_OF_BOUNDS: u16 = 5;
    pub const SCHEMA_ERROR: u16 = 6;
    pub const REGISTRY_FULL: u16 = 7;
    pub const BACK_PRESSURE: u16 = 8;
    pub const TIMEOUT: u16 = 9;
    pub const MESH_TRANSIENT: u16 = 10;
    pub const MESH_DELIVERY_FAILED: u16 = 11;
    pub const NOT_FOUND: u16 = 12;
    pub const CANCELLED: u16 = 13;
    pub const LAYOUT_INVALID: u16 = 14;
    pub const SUBSTRATE_CORRUPT: u16 = 15;
    pub const CODEC_ALLOC_FAILED: u16 = 16;
    pub const INTERNAL: u16 = 17;
    pub const ARENA_EXHAUSTED: u16 = 18;
}

/// The error taxonomy shared by every component in the system.
///
/// Variants group into four classes: structural (the bytes or the layout are
/// wrong), admission (the request was understood and refused), transient
/// (retry may succeed) and fatal (the substrate must be condemned).
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ---- Structural ----
    #[error("layout invalid: {0}")]
    LayoutInvalid(String),

    #[error("schema error at byte {position}: {message}")]
    SchemaError { position: usize, message: String },

    #[error("out of bounds: offset {offset} + size {size} exceeds {limit}")]
    OutOfBounds { offset: u64, size: u64, limit: u64 },

    #[error("offset {offset} is below the arena base {arena_base}")]
    NonArena { offset: u64, arena_base: u64 },

    #[error("offset {offset} violates {align}-byte alignment")]
    Misaligned { offset: u64, align: u64 },

    #[error("magic mismatch: expected {expected:#010x}, found {found:#010x}")]
    MagicMismatch { expected: u32, found: u32 },

    // ---- Admission ----
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("queue full for unit {0}")]
    QueueFull(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("no unit registered for job type {0}")]
    UnitNotFound(String),

    #[error("module registry full")]
    RegistryFull,

    // ---- Transient ----
    #[error("back pressure on ring slot {0}")]
    BackPressure(u16),

    #[error("transient mesh failure: {0}")]
    MeshTransient(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("arena exhausted: {requested} bytes requested, {available} available")]
    ArenaExhausted { requested: u64, available: u64 },

    // ---- Terminal (reported) ----
    #[error("mesh delivery failed: {0}")]
    MeshDeliveryFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A remote party answered a syscall with a typed error envelope.
    #[error("syscall failed with code {code}: {message}")]
    Syscall { code: u16, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    // ---- Fatal ----
    #[error("substrate corrupt: {0}")]
    SubstrateCorrupt(String),

    #[error("codec could not allocate a response buffer of {0} bytes")]
    CodecAllocFailed(usize),
}

impl Error {
    /// Retry inside a dispatch task may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackPressure(_) | Error::MeshTransient(_) | Error::Timeout(_)
        )
    }

    /// The substrate must be condemned; the root supervisor stops.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::SubstrateCorrupt(_) | Error::CodecAllocFailed(_))
    }

    /// Wire status byte for a response envelope carrying this error.
    pub fn status(&self) -> Status {
        match self {
            Error::Timeout(_) => Status::Timeout,
            Error::Cancelled => Status::Cancelled,
            Error::MeshTransient(_)
            | Error::MeshDeliveryFailed(_)
            | Error::Internal(_)
            | Error::SubstrateCorrupt(_)
            | Error::CodecAllocFailed(_) => Status::InternalError,
            _ => Status::InvalidRequest,
        }
    }

    /// Bare kind name, used as the stable error string on job results.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::LayoutInvalid(_) => "LayoutInvalid",
            Error::SchemaError { .. } => "SchemaError",
            Error::OutOfBounds { .. } => "OutOfBounds",
            Error::NonArena { .. } => "NonArena",
            Error::Misaligned { .. } => "Misaligned",
            Error::MagicMismatch { .. } => "MagicMismatch",
            Error::InvalidParams(_) => "InvalidParams",
            Error::QueueFull(_) => "QueueFull",
            Error::DeadlineExceeded => "DeadlineExceeded",
            Error::UnitNotFound(_) => "UnitNotFound",
            Error::RegistryFull => "RegistryFull",
            Error::BackPressure(_) => "BackPressure",
            Error::MeshTransient(_) => "MeshTransient",
            Error::Timeout(_) => "Timeout",
            Error::ArenaExhausted { .. } => "ArenaExhausted",
            Error::MeshDeliveryFailed(_) => "MeshDeliveryFailed",
            Error::NotFound(_) => "NotFound",
            Error::Syscall { .. } => "Syscall",
            Error::Cancelled => "Cancelled",
            Error::Internal(_) => "Internal",
            Error::SubstrateCorrupt(_) => "SubstrateCorrupt",
            Error::CodecAllocFailed(_) => "CodecAllocFailed",
        }
    }

    /// Stable numeric code for `Response.error.code`.
    pub fn code(&self) -> u16 {
        match self {
            Error::LayoutInvalid(_) => code::LAYOUT_INVALID,
            Error::SchemaError { .. } => code::SCHEMA_ERROR,
            Error::OutOfBounds { .. } | Error::NonArena { .. } | Error::Misaligned { .. } => {
                code::OUT_OF_BOUNDS
            }
            Error::MagicMismatch { .. } => code::SUBSTRATE_CORRUPT,
            Error::InvalidParams(_) => code::INVALID_PARAMS,
            Error::QueueFull(_) => code::QUEUE_FULL,
            Error::DeadlineExceeded => code::DEADLINE_EXCEEDED,
            Error::UnitNotFound(_) => code::UNIT_NOT_FOUND,
            Error::RegistryFull => code::REGISTRY_FULL,
            Error::BackPressure(_) => code::BACK_PRESSURE,
            Error::MeshTransient(_) => code::MESH_TRANSIENT,
            Error::Timeout(_) => code::TIMEOUT,
            Error::ArenaExhausted { .. } => code::ARENA_EXHAUSTED,
            Error::MeshDeliveryFailed(_) => code::MESH_DELIVERY_FAILED,
            Error::NotFound(_) => code::NOT_FOUND,
            Error::Syscall { code, .. } => *code,
            Error::Cancelled => code::CANCELLED,
            Error::Internal(_) => code::INTERNAL,
            Error::SubstrateCorrupt(_) => code::SUBSTRATE_CORRUPT,
            Error::CodecAllocFailed(_) => code::CODEC_ALLOC_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            Status::Success,
            Status::InvalidRequest,
            Status::InternalError,
            Status::Timeout,
            Status::Cancelled,
            Status::OutOfBounds,
        ] {
            assert_eq!(Status::from_u8(s as u8), Some(s));
        }
        assert_eq!(Status::from_u8(6), None);
    }

    #[test]
    fn test_classification() {
        assert!(Error::BackPressure(3).is_transient());
        assert!(Error::MeshTransient("peer flapping".into()).is_transient());
        assert!(!Error::QueueFull("ml".into()).is_transient());

        assert!(Error::SubstrateCorrupt("magic".into()).is_fatal());
        assert!(!Error::DeadlineExceeded.is_fatal());
    }

    #[test]
    fn test_wire_mapping() {
        // Offset rejections collapse onto one wire code.
        let non_arena = Error::NonArena { offset: 0x1000, arena_base: 0x150000 };
        assert_eq!(non_arena.code(), code::OUT_OF_BOUNDS);
        assert_eq!(non_arena.status(), Status::InvalidRequest);

        assert_eq!(Error::Cancelled.status(), Status::Cancelled);
        assert_eq!(Error::Timeout(5000).status(), Status::Timeout);
    }
}
