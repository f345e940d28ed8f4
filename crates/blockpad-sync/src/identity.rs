//! Block identity for one open document.
//!
//! Decides whether a document already has a server block, creates it lazily
//! on first save, and owns the `(id, version)` pair every attempt reads.

use std::sync::{Arc, Mutex, PoisonError};

use crate::client::{BlockService, NewBlock, StoredBlock};
use crate::error::BlockError;
use crate::types::{BlockId, DocumentId, MeetingId, Snapshot, Version};

/// The document's server identity. `id == None` means never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockIdentity {
    id: Option<BlockId>,
    version: Option<Version>,
    /// The stored version is a fallback, not a server value.
    estimated: bool,
}

/// A fully resolved identity, as used by one save attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub id: BlockId,
    pub version: Version,
}

impl BlockIdentity {
    pub fn unsaved() -> Self {
        Self::default()
    }

    /// An existing block whose version is not known yet.
    pub fn existing(id: BlockId) -> Self {
        Self {
            id: Some(id),
            version: None,
            estimated: false,
        }
    }

    pub fn id(&self) -> Option<&BlockId> {
        self.id.as_ref()
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn is_estimated(&self) -> bool {
        self.estimated
    }

    pub fn resolved(&self) -> Option<BlockRef> {
        match (&self.id, self.version) {
            (Some(id), Some(version)) => Some(BlockRef {
                id: id.clone(),
                version,
            }),
            _ => None,
        }
    }

    fn set_created(&mut self, id: BlockId, version: Version, estimated: bool) {
        self.id = Some(id);
        self.version = Some(version);
        self.estimated = estimated;
    }

    /// Record a version learned from the server.
    ///
    /// An estimate never lowers a known version. An explicit server value
    /// always replaces the stored one, so the next patch uses the server's
    /// baseline. Returns whether the stored version changed.
    pub fn record(&mut self, version: Version, authoritative: bool) -> bool {
        match self.version {
            Some(current) if !authoritative && current >= version => false,
            Some(current) if current == version => {
                self.estimated &= !authoritative;
                false
            }
            current => {
                if let Some(current) = current.filter(|&c| c > version) {
                    tracing::warn!(current, version, "server reported an older block version");
                }
                self.version = Some(version);
                self.estimated = !authoritative;
                true
            }
        }
    }
}

/// Why a save attempt could not get a block identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No meeting id yet, so no block can be created.
    IdentityUnavailable,
    /// Creating the block failed.
    CreateFailed { status: Option<u16> },
    /// The existing block's version could not be read.
    VersionUnknown { status: Option<u16> },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::IdentityUnavailable => f.write_str("no meeting id yet"),
            SkipReason::CreateFailed { status } => match status {
                Some(status) => write!(f, "block creation failed (HTTP {status})"),
                None => f.write_str("block creation failed"),
            },
            SkipReason::VersionUnknown { status } => match status {
                Some(status) => write!(f, "block version unavailable (HTTP {status})"),
                None => f.write_str("block version unavailable"),
            },
        }
    }
}

/// Resolves and tracks the block behind one document.
pub struct IdentityResolver<S> {
    service: Arc<S>,
    document: DocumentId,
    meeting: Mutex<Option<MeetingId>>,
    state: Arc<tokio::sync::Mutex<BlockIdentity>>,
}

impl<S> IdentityResolver<S>
where
    S: BlockService + Send + Sync + 'static,
{
    pub fn new(service: Arc<S>, document: DocumentId, meeting: Option<MeetingId>) -> Self {
        let identity = match document.existing_block() {
            Some(id) => BlockIdentity::existing(id),
            None => BlockIdentity::unsaved(),
        };
        Self {
            service,
            document,
            meeting: Mutex::new(meeting),
            state: Arc::new(tokio::sync::Mutex::new(identity)),
        }
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn meeting(&self) -> Option<MeetingId> {
        *self.meeting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Supply (or clear) the meeting a new block is created in.
    pub fn set_meeting(&self, meeting: Option<MeetingId>) {
        *self.meeting.lock().unwrap_or_else(PoisonError::into_inner) = meeting;
    }

    /// Current identity, as known locally.
    pub async fn identity(&self) -> BlockIdentity {
        self.state.lock().await.clone()
    }

    /// Record a version reported by the server.
    pub async fn record(&self, version: Version, authoritative: bool) -> bool {
        self.state.lock().await.record(version, authoritative)
    }

    /// Record a version only if `still_current` holds once the identity is
    /// locked. Returns the stored version afterwards, or `None` when the
    /// check failed.
    pub async fn record_if(
        &self,
        version: Version,
        authoritative: bool,
        still_current: impl FnOnce() -> bool,
    ) -> Option<Version> {
        let mut state = self.state.lock().await;
        if !still_current() {
            return None;
        }
        state.record(version, authoritative);
        state.version()
    }

    /// Resolve the block this snapshot should be written to.
    ///
    /// Already resolved identities return without a network call. A draft
    /// without a meeting returns [`SkipReason::IdentityUnavailable`] without
    /// contacting the server. Otherwise the block is created with `snapshot`
    /// as its initial text. Failures are logged and reported as a skip.
    pub async fn ensure(&self, snapshot: &Snapshot) -> Result<BlockRef, SkipReason> {
        let mut guard = Arc::clone(&self.state).lock_owned().await;
        if let Some(block) = guard.resolved() {
            return Ok(block);
        }

        if let Some(id) = guard.id().cloned() {
            return match self.service.get(&id).await {
                Ok(stored) => {
                    guard.record(stored.version, true);
                    tracing::debug!(block = %id, version = stored.version, "learned block version");
                    Ok(BlockRef {
                        id,
                        version: stored.version,
                    })
                }
                Err(e) => {
                    tracing::warn!(block = %id, error = %e, "failed to read block version");
                    Err(SkipReason::VersionUnknown { status: e.status() })
                }
            };
        }

        let Some(meeting) = self.meeting() else {
            tracing::debug!(document = %self.document, "no meeting id, not creating block");
            return Err(SkipReason::IdentityUnavailable);
        };

        // Runs detached and keeps the identity lock, so the result is recorded
        // even if the attempt that started it is aborted, and nobody else can
        // start a second create meanwhile.
        let service = Arc::clone(&self.service);
        let draft = NewBlock::paragraph(meeting, snapshot.text());
        let document = self.document.clone();
        let create = tokio::spawn(async move {
            let created = service.create(&draft).await;
            if let Ok(created) = &created {
                guard.set_created(created.id.clone(), created.version, created.estimated);
                tracing::info!(
                    document = %document,
                    block = %created.id,
                    version = created.version,
                    estimated = created.estimated,
                    %meeting,
                    "created block"
                );
            }
            created
        });

        match create.await {
            Ok(Ok(created)) => Ok(BlockRef {
                id: created.id,
                version: created.version,
            }),
            Ok(Err(e)) => {
                tracing::warn!(document = %self.document, error = %e, "failed to create block");
                Err(SkipReason::CreateFailed { status: e.status() })
            }
            Err(e) => {
                tracing::error!(
                    document = %self.document,
                    error = %e,
                    "block creation task failed"
                );
                Err(SkipReason::CreateFailed { status: None })
            }
        }
    }

    /// Authoritative content of an existing block, for seeding the host.
    ///
    /// Drafts have nothing to load and return `Ok(None)` without a request.
    pub async fn hydrate(&self) -> Result<Option<StoredBlock>, BlockError> {
        let Some(id) = self.identity().await.id().cloned() else {
            return Ok(None);
        };
        let stored = self.service.get(&id).await?;
        self.record(stored.version, true).await;
        Ok(Some(stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, MemoryBlockService};

    fn resolver(
        service: &Arc<MemoryBlockService>,
        document: &str,
        meeting: Option<i64>,
    ) -> IdentityResolver<MemoryBlockService> {
        IdentityResolver::new(
            Arc::clone(service),
            DocumentId::new(document),
            meeting.and_then(MeetingId::new),
        )
    }

    #[test]
    fn test_estimate_never_lowers_version() {
        let mut identity = BlockIdentity::existing(BlockId::from(1));
        assert!(identity.record(5, true));
        assert!(!identity.record(4, false));
        assert!(!identity.record(5, false));
        assert_eq!(identity.version(), Some(5));
        assert!(!identity.is_estimated());

        assert!(identity.record(6, false));
        assert!(identity.is_estimated());
        // the server confirms the estimate
        assert!(!identity.record(6, true));
        assert!(!identity.is_estimated());
    }

    #[test]
    fn test_server_version_replaces_stored_one() {
        let mut identity = BlockIdentity::existing(BlockId::from(1));
        identity.record(5, true);
        assert!(identity.record(3, true));
        assert_eq!(identity.version(), Some(3));

        identity.record(4, false);
        assert!(identity.record(2, true));
        assert_eq!(identity.version(), Some(2));
        assert!(!identity.is_estimated());
    }

    #[tokio::test]
    async fn test_ensure_without_meeting_makes_no_calls() {
        let service = Arc::new(MemoryBlockService::new());
        let identity = resolver(&service, "new:abc", None);

        let result = identity.ensure(&Snapshot::from("hello")).await;
        assert_eq!(result, Err(SkipReason::IdentityUnavailable));
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let service = Arc::new(MemoryBlockService::new());
        let identity = resolver(&service, "new:abc", Some(4));

        let first = identity.ensure(&Snapshot::from("hello")).await.unwrap();
        let second = identity.ensure(&Snapshot::from("hello again")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.count(|c| matches!(c, Call::Create { .. })), 1);
        assert_eq!(service.text(&first.id).as_deref(), Some("hello"));
        assert_eq!(
            service.calls()[0],
            Call::Create {
                meeting: 4,
                text: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn test_ensure_create_failure_is_skip_and_retryable() {
        let service = Arc::new(MemoryBlockService::new());
        service.fail_creates(1, 503);
        let identity = resolver(&service, "new:abc", Some(4));

        let failed = identity.ensure(&Snapshot::from("x")).await;
        assert_eq!(failed, Err(SkipReason::CreateFailed { status: Some(503) }));
        assert_eq!(identity.identity().await, BlockIdentity::unsaved());

        assert!(identity.ensure(&Snapshot::from("x")).await.is_ok());
        assert_eq!(service.count(|c| matches!(c, Call::Create { .. })), 2);
    }

    #[tokio::test]
    async fn test_existing_block_learns_version_without_create() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("from server", 9);
        let identity = resolver(&service, &format!("block:{id}"), None);

        let block = identity.ensure(&Snapshot::from("edit")).await.unwrap();
        assert_eq!(block, BlockRef { id: id.clone(), version: 9 });
        identity.ensure(&Snapshot::from("edit")).await.unwrap();

        assert_eq!(service.calls(), vec![Call::Get { id }]);
    }

    #[tokio::test]
    async fn test_hydrate_existing_and_draft() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("agenda", 2);

        let existing = resolver(&service, id.as_str(), None);
        let stored = existing.hydrate().await.unwrap().unwrap();
        assert_eq!(stored.text, "agenda");
        assert_eq!(existing.identity().await.version(), Some(2));

        let draft = resolver(&service, "new:zz", Some(1));
        assert_eq!(draft.hydrate().await.unwrap(), None);
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_create_still_records_identity() {
        let service = Arc::new(MemoryBlockService::new());
        service.set_latency(std::time::Duration::from_millis(200));
        let identity = Arc::new(resolver(&service, "new:abc", Some(4)));

        let first = {
            let identity = Arc::clone(&identity);
            tokio::spawn(async move { identity.ensure(&Snapshot::from("one")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        first.abort();

        let block = identity.ensure(&Snapshot::from("two")).await.unwrap();
        assert_eq!(service.count(|c| matches!(c, Call::Create { .. })), 1);
        assert_eq!(service.text(&block.id).as_deref(), Some("one"));
    }
}
