//! Error types for chunk ownership, migration and orphan cleanup.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::replication::OpTime;
use crate::types::{Namespace, ShardId};

/// Result type alias for shard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed request argument, e.g. a `startingFromKey` that does not
    /// match the shard key pattern.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The command was sent to a node that is not the replica-set primary.
    #[error("not primary: shard {shard} is running as {role}")]
    NotPrimary { shard: ShardId, role: String },

    /// The command does not exist on this tier (e.g. a routing node).
    #[error("no such command: '{0}'")]
    CommandNotFound(String),

    /// The command may only be run against the admin database.
    #[error("{command} may only be run against the admin database, got '{db}'")]
    AdminOnly { command: String, db: String },

    /// Namespace is not sharded (or unknown) on this shard.
    #[error("namespace {0} is not sharded")]
    Unsharded(Namespace),

    /// The authoritative metadata collaborator could not be reached.
    #[error("config service unreachable: {0}")]
    ConfigUnreachable(String),

    /// Another migration already holds the namespace lock.
    #[error("migration lock for {ns} is held by {holder} ({why})")]
    LockContention {
        ns: Namespace,
        holder: String,
        why: String,
    },

    /// A destructive write was applied locally but a majority of replica-set
    /// members did not acknowledge it in time.
    #[error("waiting for replication timed out after {waited:?} (op {op_time}, {acked}/{required} members)")]
    ReplicationTimeout {
        waited: Duration,
        op_time: OpTime,
        acked: usize,
        required: usize,
    },

    /// A migration or receive is already in progress.
    #[error("migration already in progress: {0}")]
    MigrationInProgress(String),

    /// The migration was aborted before its commit point.
    #[error("migration aborted: {0}")]
    MigrationAborted(String),

    /// The write targets a range that is in a migration critical section or
    /// no longer owned by this shard.
    #[error("stale shard version for {ns}: {reason}")]
    StaleShardVersion { ns: Namespace, reason: String },

    /// Failure after the point of no return. Ownership is not rolled back.
    #[error("migration commit failed: {0}")]
    CommitFailed(String),

    /// Unknown shard id.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Peer shard could not be contacted.
    #[error("shard {0} unreachable")]
    ShardUnreachable(ShardId),

    /// A bounded wait expired.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Message encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Error reported by a peer shard, carried across the network by code.
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },
}

impl Error {
    /// Stable code reported in command replies.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::NotPrimary { .. } => ErrorCode::NotPrimary,
            Error::CommandNotFound(_) => ErrorCode::CommandNotFound,
            Error::AdminOnly { .. } => ErrorCode::Unauthorized,
            Error::Unsharded(_) => ErrorCode::Unsharded,
            Error::ConfigUnreachable(_) => ErrorCode::ConfigUnreachable,
            Error::LockContention { .. } => ErrorCode::LockContention,
            Error::ReplicationTimeout { .. } => ErrorCode::ReplicationTimeout,
            Error::MigrationInProgress(_) => ErrorCode::ConflictingOperationInProgress,
            Error::MigrationAborted(_) => ErrorCode::MigrationAborted,
            Error::StaleShardVersion { .. } => ErrorCode::StaleShardVersion,
            Error::CommitFailed(_) => ErrorCode::CommitFailed,
            Error::ShardNotFound(_) => ErrorCode::ShardNotFound,
            Error::ShardUnreachable(_) => ErrorCode::HostUnreachable,
            Error::Timeout(_) => ErrorCode::ExceededTimeLimit,
            Error::Codec(_) | Error::Internal(_) => ErrorCode::InternalError,
            Error::Remote { code, .. } => *code,
        }
    }

    /// Whether this error is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ReplicationTimeout | ErrorCode::ExceededTimeLimit
        )
    }
}

/// Error codes carried in command replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidArgument,
    NotPrimary,
    CommandNotFound,
    Unauthorized,
    Unsharded,
    ConfigUnreachable,
    LockContention,
    ReplicationTimeout,
    ConflictingOperationInProgress,
    MigrationAborted,
    StaleShardVersion,
    CommitFailed,
    ShardNotFound,
    HostUnreachable,
    ExceededTimeLimit,
    InternalError,
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        e.code()
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_timeout_message_mentions_timed_out() {
        let err = Error::ReplicationTimeout {
            waited: Duration::from_secs(1),
            op_time: OpTime::new(1, 7),
            acked: 1,
            required: 2,
        };
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_timeout());
        assert_eq!(err.code(), ErrorCode::ReplicationTimeout);
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err = Error::Remote {
            code: ErrorCode::ReplicationTimeout,
            message: "waiting for replication timed out".to_string(),
        };
        assert!(err.is_timeout());
        assert_eq!(ErrorCode::from(&err), ErrorCode::ReplicationTimeout);
        assert_eq!(err.to_string(), "waiting for replication timed out");
    }

    #[test]
    fn test_lock_contention_names_holder() {
        let err = Error::LockContention {
            ns: Namespace::new("foo.bar"),
            holder: "shard0000".to_string(),
            why: "migrating chunk".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("shard0000"));
        assert!(msg.contains("foo.bar"));
    }
}
