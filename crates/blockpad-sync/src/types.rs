//! Identifiers and values shared across the autosave pipeline.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use smol_str::{SmolStr, ToSmolStr};

/// Server-assigned block version used for optimistic concurrency.
pub type Version = u64;

/// Server id of a persisted block.
///
/// Servers hand these out as either JSON numbers or strings; both are kept
/// in their string form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BlockId(SmolStr);

impl BlockId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for BlockId {
    fn from(id: u64) -> Self {
        Self(id.to_smolstr())
    }
}

impl From<&str> for BlockId {
    fn from(id: &str) -> Self {
        Self(SmolStr::new(id))
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(SmolStr),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::from(n)),
            Raw::Text(s) if !s.is_empty() => Ok(Self(s)),
            Raw::Text(_) => Err(serde::de::Error::custom("empty block id")),
        }
    }
}

/// Numeric container a block is created in. Always positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MeetingId(NonZeroU64);

impl MeetingId {
    /// Returns None for zero and negative ids.
    pub fn new(id: i64) -> Option<Self> {
        u64::try_from(id).ok().and_then(NonZeroU64::new).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable capture of document content at the moment a save was scheduled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Snapshot(Arc<str>);

impl Snapshot {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    pub fn text(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Snapshot {
    fn from(text: String) -> Self {
        Self(text.into())
    }
}

impl From<&str> for Snapshot {
    fn from(text: &str) -> Self {
        Self(text.into())
    }
}

/// Opaque document identifier supplied by the hosting navigation context.
///
/// `block:<id>` and all-digit ids name a block that already exists on the
/// server; anything else (by convention `new:<token>`) is a draft whose block
/// is created on first save.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentId(SmolStr);

/// Prefix marking a document id that refers to an existing block.
pub const BLOCK_PREFIX: &str = "block:";
/// Prefix for documents that have never been saved.
pub const DRAFT_PREFIX: &str = "new:";

impl DocumentId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    /// A fresh draft id from a caller-supplied token.
    pub fn draft(token: &str) -> Self {
        Self(smol_str::format_smolstr!("{DRAFT_PREFIX}{token}"))
    }

    /// Document id for an existing block.
    pub fn for_block(id: &BlockId) -> Self {
        Self(smol_str::format_smolstr!("{BLOCK_PREFIX}{id}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The existing block this document maps to, if any.
    pub fn existing_block(&self) -> Option<BlockId> {
        if let Some(id) = self.0.strip_prefix(BLOCK_PREFIX) {
            return (!id.is_empty()).then(|| BlockId::from(id));
        }
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            return Some(BlockId::new(self.0.clone()));
        }
        None
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
