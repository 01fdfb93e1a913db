use thiserror::Error;

use crate::name::Name;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for the embedding scheduler.
///
/// - `UserError`: the executing contract did something invalid; the
///   action fails and the transaction is discarded.
/// - `ResourceLimit`: an account or the block ran out of a metered
///   resource; the scheduler MAY defer and retry the transaction in a
///   later block instead of discarding it.
/// - `Logic`: the caller violated an API contract (read-only mode,
///   missing shard); programming error in the embedding code.
/// - `InternalBug`: a defensive invariant tripped; should never happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    ResourceLimit,
    Logic,
    InternalBug,
}

/// Top-level error type all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Versioned-store layer errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot {0} while the store is in read-only mode")]
    ReadOnly(&'static str),

    #[error("undo session resolved out of LIFO order: expected revision {expected}, got {got}")]
    SessionOrderViolation { expected: u64, got: u64 },

    #[error("no undo session is active")]
    NoActiveSession,

    #[error("table already exists")]
    DuplicateTable,

    #[error("table not found in store")]
    TableNotFound,

    #[error("row already exists for {0}")]
    DuplicateRow(&'static str),

    #[error("row not found for {0}")]
    RowNotFound(&'static str),

    #[error("missing singleton row: {0}")]
    MissingSingleton(&'static str),
}

/// Contract-facing table engine errors.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("cannot {0} a db record when executing a read-only transaction")]
    ReadOnlyViolation(&'static str),

    #[error("must specify a valid account to pay for new record")]
    InvalidPayer,

    #[error("db access violation: table owned by {owner} accessed from {receiver}")]
    AccessViolation { owner: Name, receiver: Name },

    #[error("invalid table iterator: {0}")]
    InvalidIterator(&'static str),

    #[error("an invariant was broken, table should be in cache")]
    TableNotInCache,
}

/// Resource metering errors.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error(
        "account {account} has insufficient cpu resources; \
         used {used} in window, allowed {allowed}"
    )]
    CpuUsageExceeded { account: Name, used: u128, allowed: u128 },

    #[error(
        "account {account} has insufficient net resources; \
         used {used} in window, allowed {allowed}"
    )]
    NetUsageExceeded { account: Name, used: u128, allowed: u128 },

    #[error("account {account} has insufficient ram; needs {needs} bytes, has {available} bytes")]
    RamUsageExceeded { account: Name, needs: u64, available: i64 },

    #[error("block has insufficient {resource} resources")]
    BlockResourceExhausted { resource: &'static str },

    #[error("rate limiting state inconsistent: {0}")]
    RateLimitingStateInconsistent(String),

    #[error("resource usage arithmetic overflow: {0}")]
    UsageOverflow(&'static str),

    #[error("invalid elastic limit parameters: {0}")]
    InvalidLimitParameters(&'static str),

    #[error("resource limits state object not found on shard")]
    MissingStateObject,

    #[error("account {0} has no resource usage object")]
    MissingUsageObject(Name),

    #[error("account {0} has no resource limits object")]
    MissingLimitsObject(Name),
}

/// Multi-store coordination errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("shard database not found: {0}")]
    ShardNotFound(Name),

    #[error("attempting to {0} in read-only mode")]
    ReadOnlyMode(&'static str),
}

/// Shard catalog / snapshot glue errors.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("bad shard catalog magic: expected {expected:#010x}, got {got:#010x}")]
    BadMagic { expected: u32, got: u32 },

    #[error("unsupported shard catalog version: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u32, got: u32 },

    #[error("shard catalog file is truncated")]
    Truncated,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KestrelError {
    /// Classify this error for defer/discard decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Table(TableError::ReadOnlyViolation(_)) => ErrorKind::UserError,
            KestrelError::Table(TableError::InvalidPayer) => ErrorKind::UserError,
            KestrelError::Table(TableError::AccessViolation { .. }) => ErrorKind::UserError,
            KestrelError::Table(TableError::InvalidIterator(_)) => ErrorKind::UserError,
            KestrelError::Table(TableError::TableNotInCache) => ErrorKind::InternalBug,

            KestrelError::Resource(ResourceError::CpuUsageExceeded { .. })
            | KestrelError::Resource(ResourceError::NetUsageExceeded { .. })
            | KestrelError::Resource(ResourceError::RamUsageExceeded { .. })
            | KestrelError::Resource(ResourceError::BlockResourceExhausted { .. }) => {
                ErrorKind::ResourceLimit
            }
            KestrelError::Resource(ResourceError::RateLimitingStateInconsistent(_)) => {
                ErrorKind::InternalBug
            }
            KestrelError::Resource(ResourceError::InvalidLimitParameters(_)) => ErrorKind::Logic,
            KestrelError::Resource(_) => ErrorKind::InternalBug,

            KestrelError::Store(StoreError::ReadOnly(_)) => ErrorKind::Logic,
            KestrelError::Store(StoreError::DuplicateTable)
            | KestrelError::Store(StoreError::DuplicateRow(_)) => ErrorKind::UserError,
            KestrelError::Store(_) => ErrorKind::InternalBug,

            KestrelError::Db(_) => ErrorKind::Logic,
            KestrelError::Snapshot(_) => ErrorKind::Logic,
        }
    }

    /// True when the embedding scheduler may defer the transaction to a
    /// later block instead of discarding it.
    pub fn is_deferrable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ResourceLimit)
    }

    /// True when a defensive invariant tripped.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }
}
