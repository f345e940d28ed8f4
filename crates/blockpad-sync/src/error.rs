//! Error types for block persistence.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

use crate::types::{BlockId, Version};

/// The persistence operation an error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Fetch,
    Patch,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Fetch => "fetch",
            Operation::Patch => "patch",
        })
    }
}

/// Errors returned by a [`BlockService`](crate::BlockService).
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum BlockError {
    /// Block creation was rejected.
    #[error("failed to create block: HTTP {status}")]
    #[diagnostic(code(block::create))]
    Create { status: u16, body: String },

    /// Reading a block was rejected.
    #[error("failed to fetch block {id}: HTTP {status}")]
    #[diagnostic(code(block::fetch))]
    Fetch { id: BlockId, status: u16, body: String },

    /// Writing a block was rejected. On a version conflict the server's
    /// current version is carried when the response included it.
    #[error("failed to patch block {id}: HTTP {status}")]
    #[diagnostic(code(block::patch))]
    Patch {
        id: BlockId,
        status: u16,
        current_version: Option<Version>,
        body: String,
    },

    /// The request never produced a response.
    #[error("{op} request failed: {message}")]
    #[diagnostic(code(block::transport))]
    Transport { op: Operation, message: String },

    /// A success response could not be understood.
    #[error("malformed {op} response: {message}")]
    #[diagnostic(code(block::decode))]
    Decode { op: Operation, message: String },

    /// The configured API base cannot address blocks.
    #[error("invalid block API endpoint: {0}")]
    #[diagnostic(code(block::endpoint))]
    InvalidEndpoint(String),
}

/// HTTP statuses that signal an optimistic-concurrency mismatch.
pub const CONFLICT_STATUSES: [u16; 2] = [409, 412];

impl BlockError {
    /// Whether this is a version conflict on patch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BlockError::Patch { status, .. } if CONFLICT_STATUSES.contains(status))
    }

    /// Server version carried by a patch failure, if the server sent one.
    pub fn current_version(&self) -> Option<Version> {
        match self {
            BlockError::Patch {
                current_version, ..
            } => *current_version,
            _ => None,
        }
    }

    /// HTTP status of a rejected request.
    pub fn status(&self) -> Option<u16> {
        match self {
            BlockError::Create { status, .. }
            | BlockError::Fetch { status, .. }
            | BlockError::Patch { status, .. } => Some(*status),
            _ => None,
        }
    }
}
