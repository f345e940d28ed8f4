//! In-memory block service for tests and host prototyping.
//!
//! Behaves like the block API: versions start at 1, a patch succeeds only
//! against the stored version and bumps it, conflicts answer 409 with the
//! current version in the body. Every call is logged, and failures, latency
//! and missing response versions can be scripted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;

use crate::client::{
    BlockService, CreatedBlock, NewBlock, PatchedBlock, StoredBlock, conflict_version,
};
use crate::error::BlockError;
use crate::types::{BlockId, Version};

/// One request seen by [`MemoryBlockService`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Create { meeting: u64, text: String },
    Get { id: BlockId },
    Patch { id: BlockId, text: String, version: Version },
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<BlockId, (Version, String)>,
    next_id: u64,
    calls: Vec<Call>,
    latency: Duration,
    patch_delays: VecDeque<Duration>,
    fail_creates: VecDeque<u16>,
    fail_gets: VecDeque<u16>,
    fail_patches: VecDeque<u16>,
    omit_patch_version: bool,
    omit_conflict_version: bool,
    writes_after_get: usize,
}

#[derive(Default)]
pub struct MemoryBlockService {
    inner: Mutex<Inner>,
}

impl MemoryBlockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a block directly, as if created elsewhere.
    pub fn insert(&self, text: &str, version: Version) -> BlockId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = BlockId::from(inner.next_id);
        inner.blocks.insert(id.clone(), (version, text.to_owned()));
        id
    }

    /// Advance a block's version, as if another writer saved.
    pub fn bump(&self, id: &BlockId, version: Version) {
        if let Some(block) = self.lock().blocks.get_mut(id) {
            block.0 = version;
        }
    }

    pub fn version(&self, id: &BlockId) -> Option<Version> {
        self.lock().blocks.get(id).map(|(v, _)| *v)
    }

    pub fn text(&self, id: &BlockId) -> Option<String> {
        self.lock().blocks.get(id).map(|(_, t)| t.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Delay every response.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Delay the next patch response by `delay` instead of the base latency.
    pub fn delay_next_patch(&self, delay: Duration) {
        self.lock().patch_delays.push_back(delay);
    }

    /// Fail the next `n` creates with `status`.
    pub fn fail_creates(&self, n: usize, status: u16) {
        self.lock().fail_creates.extend(std::iter::repeat_n(status, n));
    }

    /// Fail the next `n` gets with `status`.
    pub fn fail_gets(&self, n: usize, status: u16) {
        self.lock().fail_gets.extend(std::iter::repeat_n(status, n));
    }

    /// Fail the next `n` patches with `status`, before any version check.
    pub fn fail_patches(&self, n: usize, status: u16) {
        self.lock().fail_patches.extend(std::iter::repeat_n(status, n));
    }

    /// After each of the next `n` successful gets, advance the block's
    /// version as if another writer saved right after the read.
    pub fn write_after_next_gets(&self, n: usize) {
        self.lock().writes_after_get += n;
    }

    /// Answer successful patches without a version field.
    pub fn omit_patch_version(&self, omit: bool) {
        self.lock().omit_patch_version = omit;
    }

    /// Answer conflicts without the current version in the body.
    pub fn omit_conflict_version(&self, omit: bool) {
        self.lock().omit_conflict_version = omit;
    }

    async fn respond<T>(delay: Duration, result: Result<T, BlockError>) -> Result<T, BlockError> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

impl BlockService for MemoryBlockService {
    async fn create(&self, block: &NewBlock) -> Result<CreatedBlock, BlockError> {
        let (delay, result) = {
            let mut inner = self.lock();
            inner.calls.push(Call::Create {
                meeting: block.meeting.get(),
                text: block.text.clone(),
            });
            let result = match inner.fail_creates.pop_front() {
                Some(status) => Err(BlockError::Create {
                    status,
                    body: json!({"detail": "create rejected"}).to_string(),
                }),
                None => {
                    inner.next_id += 1;
                    let id = BlockId::from(inner.next_id);
                    inner.blocks.insert(id.clone(), (1, block.text.clone()));
                    Ok(CreatedBlock {
                        id,
                        version: 1,
                        estimated: false,
                    })
                }
            };
            (inner.latency, result)
        };
        Self::respond(delay, result).await
    }

    async fn get(&self, id: &BlockId) -> Result<StoredBlock, BlockError> {
        let (delay, result) = {
            let mut inner = self.lock();
            inner.calls.push(Call::Get { id: id.clone() });
            let result = match inner.fail_gets.pop_front() {
                Some(status) => Err(BlockError::Fetch {
                    id: id.clone(),
                    status,
                    body: String::new(),
                }),
                None => match inner.blocks.get(id).cloned() {
                    Some((version, text)) => {
                        if inner.writes_after_get > 0 {
                            inner.writes_after_get -= 1;
                            if let Some(block) = inner.blocks.get_mut(id) {
                                block.0 += 1;
                            }
                        }
                        Ok(StoredBlock { version, text })
                    }
                    None => Err(BlockError::Fetch {
                        id: id.clone(),
                        status: 404,
                        body: json!({"detail": "not found"}).to_string(),
                    }),
                },
            };
            (inner.latency, result)
        };
        Self::respond(delay, result).await
    }

    async fn patch(
        &self,
        id: &BlockId,
        text: &str,
        expected: Version,
    ) -> Result<PatchedBlock, BlockError> {
        let (delay, result) = {
            let mut inner = self.lock();
            inner.calls.push(Call::Patch {
                id: id.clone(),
                text: text.to_owned(),
                version: expected,
            });
            let delay = inner.patch_delays.pop_front().unwrap_or(inner.latency);
            let omit_version = inner.omit_patch_version;
            let omit_conflict = inner.omit_conflict_version;
            let result = if let Some(status) = inner.fail_patches.pop_front() {
                Err(BlockError::Patch {
                    id: id.clone(),
                    status,
                    current_version: None,
                    body: String::new(),
                })
            } else {
                match inner.blocks.get_mut(id) {
                    None => Err(BlockError::Patch {
                        id: id.clone(),
                        status: 404,
                        current_version: None,
                        body: String::new(),
                    }),
                    Some((version, _)) if *version != expected => {
                        let body = if omit_conflict {
                            json!({"detail": "version mismatch"})
                        } else {
                            json!({"detail": "version mismatch", "current": {"version": *version}})
                        };
                        Err(BlockError::Patch {
                            id: id.clone(),
                            status: 409,
                            current_version: conflict_version(&body),
                            body: body.to_string(),
                        })
                    }
                    Some((version, stored)) => {
                        *version += 1;
                        *stored = text.to_owned();
                        Ok(PatchedBlock {
                            // the estimate matches the real bump here
                            version: *version,
                            estimated: omit_version,
                        })
                    }
                }
            };
            (delay, result)
        };
        Self::respond(delay, result).await
    }
}
