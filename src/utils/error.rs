//! Unified error type covering every failure kind the engine reports.

use std::io;

use thiserror::Error;

/// Errors surfaced to users of the consensus engine, either as synchronous
/// return values or through client request completions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkiffError {
    #[error("out of memory")]
    NoMem,

    #[error("server ID is not valid")]
    BadId,

    #[error("server ID already in use")]
    DuplicateId,

    #[error("server address already in use")]
    DuplicateAddress,

    #[error("server role is not valid")]
    BadRole,

    #[error("encoded data is malformed: {0}")]
    Malformed(String),

    #[error("server is not the leader")]
    NotLeader,

    #[error("server has lost leadership")]
    LeadershipLost,

    #[error("server is shutting down")]
    Shutdown,

    #[error("bootstrap only works on new clusters")]
    CantBootstrap,

    #[error("a configuration change is already in progress")]
    CantChange,

    #[error("persisted data is corrupted: {0}")]
    Corrupt(String),

    #[error("operation canceled")]
    Canceled,

    #[error("resource name too long")]
    NameTooLong,

    #[error("data is too big")]
    TooBig,

    #[error("no connection to remote server available")]
    NoConnection,

    #[error("operation can't be performed at this time")]
    Busy,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("resource not found")]
    NotFound,

    #[error("invalid parameter: {0}")]
    Invalid(String),

    #[error("no access to resource")]
    Unauthorized,

    #[error("not enough space")]
    NoSpace,

    #[error("system or raft limit hit")]
    TooMany,
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SkiffError>;

impl From<io::Error> for SkiffError {
    fn from(e: io::Error) -> Self {
        SkiffError::Io(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SkiffError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SkiffError::Malformed(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SkiffError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SkiffError::Malformed(e.to_string())
    }
}

impl From<toml::de::Error> for SkiffError {
    fn from(e: toml::de::Error) -> Self {
        SkiffError::Invalid(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            format!("{}", SkiffError::NotLeader),
            "server is not the leader"
        );
        assert_eq!(
            format!("{}", SkiffError::Malformed("bad tag".into())),
            "encoded data is malformed: bad tag"
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = SkiffError::from(io_error);
        assert!(matches!(e, SkiffError::Io(ref msg) if msg.contains("oh no!")));
    }
}
