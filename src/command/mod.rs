//! Command dispatch boundary.
//!
//! Commands arrive addressed to a database, are checked against the node's
//! role and run against the node. Every reply carries `ok`, and on failure an
//! `errmsg` and a stable [`ErrorCode`].
//!
//! | Command              | Shard primary | Shard secondary | Router           |
//! |----------------------|---------------|-----------------|------------------|
//! | `moveChunk`          | runs          | `NotPrimary`    | `CommandNotFound`|
//! | `cleanupOrphaned`    | runs          | `NotPrimary`    | `CommandNotFound`|
//! | `getShardVersion`    | runs          | `NotPrimary`    | `CommandNotFound`|
//! | `_recvChunk*`        | runs          | `NotPrimary`    | `CommandNotFound`|
//! | `configureFailPoint` | runs          | runs            | runs             |
//!
//! All commands must target the `admin` database.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorCode, Result};
use crate::failpoint::FailpointMode;
use crate::keys::{ChunkRange, Document};
use crate::metadata::ChunkVersion;
use crate::rpc::{RecvChunkStartRequest, RecvChunkStatus};
use crate::sharding::MoveChunkRequest;
use crate::types::Namespace;

mod router;
mod shard;

pub use router::RouterNode;

/// The only database commands may be addressed to.
pub const ADMIN_DB: &str = "admin";

/// A command and its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    MoveChunk(MoveChunkRequest),
    CleanupOrphaned {
        ns: Namespace,
        starting_from_key: Option<Document>,
        secondary_throttle: bool,
    },
    GetShardVersion {
        ns: Namespace,
        full_metadata: bool,
    },
    RecvChunkStart(RecvChunkStartRequest),
    RecvChunkStatus,
    RecvChunkCommit {
        session_id: Uuid,
    },
    RecvChunkAbort {
        session_id: Uuid,
    },
    ConfigureFailPoint {
        name: String,
        mode: FailpointMode,
        data: Document,
    },
}

impl Command {
    pub fn cleanup_orphaned(ns: impl Into<Namespace>) -> Self {
        Command::CleanupOrphaned {
            ns: ns.into(),
            starting_from_key: None,
            secondary_throttle: false,
        }
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::MoveChunk(_) => "moveChunk",
            Command::CleanupOrphaned { .. } => "cleanupOrphaned",
            Command::GetShardVersion { .. } => "getShardVersion",
            Command::RecvChunkStart(_) => "_recvChunkStart",
            Command::RecvChunkStatus => "_recvChunkStatus",
            Command::RecvChunkCommit { .. } => "_recvChunkCommit",
            Command::RecvChunkAbort { .. } => "_recvChunkAbort",
            Command::ConfigureFailPoint { .. } => "configureFailPoint",
        }
    }

    /// Whether only a shard primary may run the command.
    pub fn requires_primary(&self) -> bool {
        !matches!(self, Command::ConfigureFailPoint { .. })
    }
}

/// Shard and collection versions as reported by `getShardVersion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardVersionInfo {
    pub shard_version: ChunkVersion,
    pub coll_version: ChunkVersion,
    /// Owned chunk ranges, with `fullMetadata` only.
    pub chunks: Option<Vec<ChunkRange>>,
    /// Pending ranges, with `fullMetadata` only.
    pub pending: Option<Vec<ChunkRange>>,
}

/// Command-specific part of a successful reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum ReplyBody {
    #[default]
    Empty,
    Cleanup {
        stopped_at_key: Option<Document>,
    },
    ShardVersion(ShardVersionInfo),
    RecvChunkStatus(RecvChunkStatus),
}

/// Reply to a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub ok: bool,
    pub errmsg: Option<String>,
    pub code: Option<ErrorCode>,
    pub body: ReplyBody,
}

impl CommandReply {
    pub fn success(body: ReplyBody) -> Self {
        Self {
            ok: true,
            errmsg: None,
            code: None,
            body,
        }
    }

    pub fn failure(error: &Error) -> Self {
        Self {
            ok: false,
            errmsg: Some(error.to_string()),
            code: Some(error.code()),
            body: ReplyBody::Empty,
        }
    }

    pub fn from_result(result: Result<ReplyBody>) -> Self {
        match result {
            Ok(body) => Self::success(body),
            Err(e) => Self::failure(&e),
        }
    }

    /// Turn a failed reply back into an error.
    pub fn into_result(self) -> Result<ReplyBody> {
        if self.ok {
            return Ok(self.body);
        }
        Err(Error::Remote {
            code: self.code.unwrap_or(ErrorCode::InternalError),
            message: self.errmsg.unwrap_or_default(),
        })
    }
}

/// Runs commands addressed to a node.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn run_command(&self, db: &str, command: Command) -> CommandReply;
}

fn check_admin_db(db: &str, command: &Command) -> Result<()> {
    if db != ADMIN_DB {
        return Err(Error::AdminOnly {
            command: command.name().to_string(),
            db: db.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_reply_round_trips_code() {
        let reply = CommandReply::failure(&Error::CommandNotFound("cleanupOrphaned".into()));
        assert!(!reply.ok);
        assert_eq!(reply.code, Some(ErrorCode::CommandNotFound));

        let err = reply.into_result().unwrap_err();
        assert_eq!(err.code(), ErrorCode::CommandNotFound);
        assert!(err.to_string().contains("cleanupOrphaned"));
    }

    #[test]
    fn test_admin_db_required() {
        let cmd = Command::cleanup_orphaned("foo.bar");
        assert!(check_admin_db(ADMIN_DB, &cmd).is_ok());
        let err = check_admin_db("foo", &cmd).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert!(!Command::ConfigureFailPoint {
            name: "rsSyncApplyStop".into(),
            mode: FailpointMode::Off,
            data: Document::new(),
        }
        .requires_primary());
    }
}
