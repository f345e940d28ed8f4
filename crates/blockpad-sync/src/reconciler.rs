//! The autosave state machine.
//!
//! One attempt per debounced snapshot: resolve the block, patch against the
//! last known version, and on a version conflict refresh from the server and
//! retry exactly once. Nothing here propagates to the host; failures are
//! logged and the next edit tries again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use blockpad_common::perf::TimingGuard;
use smol_str::{SmolStr, ToSmolStr};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use web_time::SystemTime;

use crate::client::{BlockService, PatchedBlock};
use crate::error::BlockError;
use crate::identity::{IdentityResolver, SkipReason};
use crate::types::{BlockId, Snapshot, Version};

/// A snapshot the server accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedBlock {
    pub id: BlockId,
    pub version: Version,
    /// The server omitted the version; it was assumed.
    pub estimated: bool,
    /// Saved by the retry after a version conflict.
    pub retried: bool,
    pub saved_at: SystemTime,
}

/// What one save attempt ended with.
#[derive(Debug)]
pub enum SaveOutcome {
    Saved(SavedBlock),
    /// No block identity, so nothing was sent.
    Skipped(SkipReason),
    /// The save failed after any retry. The version has been resynchronized
    /// where possible.
    Failed(BlockError),
    /// A later attempt started before this one finished.
    Superseded,
}

impl SaveOutcome {
    pub fn saved(&self) -> Option<&SavedBlock> {
        match self {
            SaveOutcome::Saved(block) => Some(block),
            _ => None,
        }
    }
}

/// Save state published to the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving {
        generation: u64,
    },
    Saved(SavedBlock),
    Skipped(SkipReason),
    Failed {
        message: SmolStr,
        status: Option<u16>,
    },
}

impl SaveStatus {
    pub fn is_saving(&self) -> bool {
        matches!(self, SaveStatus::Saving { .. })
    }
}

/// Called with every snapshot the server accepted.
pub type SaveCallback = Box<dyn Fn(&SavedBlock) + Send + Sync>;

/// Reconciles local snapshots with the server block for one document.
pub struct Reconciler<S> {
    service: Arc<S>,
    identity: IdentityResolver<S>,
    generation: AtomicU64,
    in_flight: Mutex<Option<AbortHandle>>,
    status: watch::Sender<SaveStatus>,
    on_saved: Option<SaveCallback>,
}

impl<S> Reconciler<S>
where
    S: BlockService + Send + Sync + 'static,
{
    pub fn new(service: Arc<S>, identity: IdentityResolver<S>) -> Self {
        let (status, _) = watch::channel(SaveStatus::Idle);
        Self {
            service,
            identity,
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            status,
            on_saved: None,
        }
    }

    /// Register the save-completion callback.
    pub fn with_callback(mut self, callback: impl Fn(&SavedBlock) + Send + Sync + 'static) -> Self {
        self.on_saved = Some(Box::new(callback));
        self
    }

    pub fn identity(&self) -> &IdentityResolver<S> {
        &self.identity
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SaveStatus {
        self.status.borrow().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Start a save attempt for `snapshot`, aborting any attempt still in
    /// flight. The returned handle may be awaited or dropped.
    pub fn begin(self: &Arc<Self>, snapshot: Snapshot) -> JoinHandle<SaveOutcome> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = in_flight.take() {
            if !previous.is_finished() {
                previous.abort();
                tracing::debug!(generation, "aborted superseded save attempt");
            }
        }
        self.status.send_replace(SaveStatus::Saving { generation });

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(generation, snapshot).await });
        *in_flight = Some(handle.abort_handle());
        handle
    }

    /// Wait until no attempt is in flight.
    pub async fn settle(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| !s.is_saving()).await;
    }

    async fn run(&self, generation: u64, snapshot: Snapshot) -> SaveOutcome {
        metrics::counter!("blockpad_autosave_attempts_total").increment(1);
        let outcome = {
            let _timing = TimingGuard::new("autosave attempt");
            self.attempt(generation, &snapshot).await
        };
        self.finish(generation, &outcome);
        outcome
    }

    async fn attempt(&self, generation: u64, snapshot: &Snapshot) -> SaveOutcome {
        let block = match self.identity.ensure(snapshot).await {
            Ok(block) => block,
            Err(reason) => {
                metrics::counter!("blockpad_autosave_skipped_total").increment(1);
                tracing::debug!(document = %self.identity.document(), %reason, "save skipped");
                return SaveOutcome::Skipped(reason);
            }
        };

        tracing::debug!(
            block = %block.id,
            version = block.version,
            generation,
            bytes = snapshot.len(),
            "saving"
        );
        match self
            .service
            .patch(&block.id, snapshot.text(), block.version)
            .await
        {
            Ok(patched) => self.saved(generation, &block.id, patched, false).await,
            Err(e) if e.is_conflict() => {
                self.retry_conflict(generation, &block.id, snapshot, e).await
            }
            Err(e) => self.fail(generation, &block.id, e).await,
        }
    }

    /// Refresh the version and retry the patch once.
    async fn retry_conflict(
        &self,
        generation: u64,
        id: &BlockId,
        snapshot: &Snapshot,
        conflict: BlockError,
    ) -> SaveOutcome {
        metrics::counter!("blockpad_autosave_conflicts_total").increment(1);
        tracing::info!(
            block = %id,
            server_version = ?conflict.current_version(),
            "version conflict, refreshing"
        );

        let version = match self.service.get(id).await {
            Ok(stored) => Some(stored.version),
            Err(e) => {
                tracing::warn!(block = %id, error = %e, "refresh after conflict failed");
                conflict.current_version()
            }
        };
        let Some(version) = version else {
            return self.fail(generation, id, conflict).await;
        };
        self.record(generation, version, true).await;

        metrics::counter!("blockpad_autosave_conflict_retries_total").increment(1);
        match self.service.patch(id, snapshot.text(), version).await {
            Ok(patched) => self.saved(generation, id, patched, true).await,
            Err(e) => self.fail(generation, id, e).await,
        }
    }

    async fn saved(
        &self,
        generation: u64,
        id: &BlockId,
        patched: PatchedBlock,
        retried: bool,
    ) -> SaveOutcome {
        let Some(version) = self
            .record(generation, patched.version, !patched.estimated)
            .await
        else {
            return SaveOutcome::Superseded;
        };
        metrics::counter!("blockpad_autosave_saved_total").increment(1);
        tracing::debug!(block = %id, version, retried, "saved");
        SaveOutcome::Saved(SavedBlock {
            id: id.clone(),
            version,
            estimated: patched.estimated,
            retried,
            saved_at: SystemTime::now(),
        })
    }

    /// Log the failure and resynchronize the local version so the next
    /// attempt starts from the server's baseline.
    async fn fail(&self, generation: u64, id: &BlockId, error: BlockError) -> SaveOutcome {
        metrics::counter!("blockpad_autosave_failures_total").increment(1);
        tracing::warn!(block = %id, status = ?error.status(), error = %error, "save failed");

        match self.service.get(id).await {
            Ok(stored) => {
                self.record(generation, stored.version, true).await;
            }
            Err(e) => {
                tracing::warn!(block = %id, error = %e, "version resync failed");
                if let Some(version) = error.current_version() {
                    self.record(generation, version, true).await;
                }
            }
        }
        SaveOutcome::Failed(error)
    }

    /// Record a version unless a newer attempt has started. Returns the
    /// stored version, or `None` when superseded.
    async fn record(
        &self,
        generation: u64,
        version: Version,
        authoritative: bool,
    ) -> Option<Version> {
        self.identity
            .record_if(version, authoritative, || self.is_current(generation))
            .await
    }

    /// Publish the outcome, then run the callback with no lock held so it may
    /// start another save.
    fn finish(&self, generation: u64, outcome: &SaveOutcome) {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_current(generation) {
                tracing::debug!(generation, "save attempt superseded");
                return;
            }
            in_flight.take();
            // under the lock, so a concurrent begin's Saving is never overwritten
            self.status.send_replace(Self::status_for(outcome));
        }

        if let (SaveOutcome::Saved(block), Some(callback)) = (outcome, &self.on_saved) {
            callback(block);
        }
    }

    fn status_for(outcome: &SaveOutcome) -> SaveStatus {
        match outcome {
            SaveOutcome::Saved(block) => SaveStatus::Saved(block.clone()),
            SaveOutcome::Skipped(reason) => SaveStatus::Skipped(reason.clone()),
            SaveOutcome::Failed(error) => SaveStatus::Failed {
                message: error.to_smolstr(),
                status: error.status(),
            },
            SaveOutcome::Superseded => SaveStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, MemoryBlockService};
    use crate::types::{DocumentId, MeetingId};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;

    fn reconciler(
        service: &Arc<MemoryBlockService>,
        document: &str,
        meeting: Option<i64>,
    ) -> Arc<Reconciler<MemoryBlockService>> {
        let identity = IdentityResolver::new(
            Arc::clone(service),
            DocumentId::new(document),
            meeting.and_then(MeetingId::new),
        );
        Arc::new(Reconciler::new(Arc::clone(service), identity))
    }

    fn patches(service: &MemoryBlockService) -> Vec<(String, Version)> {
        service
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Patch { text, version, .. } => Some((text, version)),
                _ => None,
            })
            .collect()
    }

    fn gets(service: &MemoryBlockService) -> usize {
        service.count(|c| matches!(c, Call::Get { .. }))
    }

    #[tokio::test]
    async fn test_first_save_creates_then_patches() {
        let service = Arc::new(MemoryBlockService::new());
        let reconciler = reconciler(&service, "new:a", Some(1));

        let outcome = reconciler.begin("hello".into()).await.unwrap();
        let saved = outcome.saved().unwrap();
        assert_eq!(saved.version, 2);
        assert!(!saved.retried);

        let outcome = reconciler.begin("hello world".into()).await.unwrap();
        assert_eq!(outcome.saved().unwrap().version, 3);

        assert_eq!(service.count(|c| matches!(c, Call::Create { .. })), 1);
        assert_eq!(
            patches(&service),
            vec![("hello".into(), 1), ("hello world".into(), 2)]
        );
        assert_eq!(service.text(&saved.id).as_deref(), Some("hello world"));
        assert!(matches!(reconciler.current_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test]
    async fn test_skips_without_meeting() {
        let service = Arc::new(MemoryBlockService::new());
        let reconciler = reconciler(&service, "new:a", None);

        for text in ["a", "ab", "abc"] {
            let outcome = reconciler.begin(text.into()).await.unwrap();
            assert!(matches!(
                outcome,
                SaveOutcome::Skipped(SkipReason::IdentityUnavailable)
            ));
        }
        assert!(service.calls().is_empty());
        assert_eq!(
            reconciler.current_status(),
            SaveStatus::Skipped(SkipReason::IdentityUnavailable)
        );
    }

    #[tokio::test]
    async fn test_conflict_refreshes_and_retries_once() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 3);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.begin("first".into()).await.unwrap();
        // another device saved twice
        service.bump(&id, 7);

        let outcome = reconciler.begin("second".into()).await.unwrap();
        let saved = outcome.saved().unwrap();
        assert!(saved.retried);
        assert_eq!(saved.version, 8);
        assert_eq!(
            patches(&service),
            vec![("first".into(), 3), ("second".into(), 4), ("second".into(), 7)]
        );
        // one to learn the initial version, one after the conflict
        assert_eq!(gets(&service), 2);
    }

    #[tokio::test]
    async fn test_second_conflict_is_not_retried() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 7);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.identity().record(5, true).await;
        // another writer lands right after our refresh
        service.write_after_next_gets(1);

        let outcome = reconciler.begin("mine".into()).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Failed(ref e) if e.is_conflict()));
        assert_eq!(patches(&service), vec![("mine".into(), 5), ("mine".into(), 7)]);
        // refresh after the conflict, then the resync after the failure
        assert_eq!(gets(&service), 2);
        assert_eq!(reconciler.identity().identity().await.version(), Some(8));
        assert_eq!(service.text(&id).as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_conflict_without_any_version_fails() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 7);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.identity().record(5, true).await;
        // every refresh reports a version the server then rejects
        service.fail_gets(2, 503);
        service.omit_conflict_version(true);

        let outcome = reconciler.begin("mine".into()).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Failed(ref e) if e.is_conflict()));
        // no version to retry with, so the only patch is the first one
        assert_eq!(patches(&service), vec![("mine".into(), 5)]);
        assert!(matches!(
            reconciler.current_status(),
            SaveStatus::Failed { status: Some(409), .. }
        ));
    }

    #[tokio::test]
    async fn test_conflict_uses_body_version_when_refresh_fails() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 7);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.identity().record(5, true).await;
        service.fail_gets(1, 503);

        let outcome = reconciler.begin("mine".into()).await.unwrap();
        let saved = outcome.saved().unwrap();
        assert!(saved.retried);
        assert_eq!(saved.version, 8);
        assert_eq!(patches(&service), vec![("mine".into(), 5), ("mine".into(), 7)]);
    }

    #[tokio::test]
    async fn test_non_conflict_failure_resyncs_version() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 4);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.identity().record(2, true).await;
        service.fail_patches(1, 500);

        let outcome = reconciler.begin("mine".into()).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Failed(BlockError::Patch { status: 500, .. })));
        assert_eq!(patches(&service).len(), 1);
        assert_eq!(reconciler.identity().identity().await.version(), Some(4));

        // next edit is attempted against the refreshed baseline
        let outcome = reconciler.begin("mine again".into()).await.unwrap();
        assert_eq!(outcome.saved().unwrap().version, 5);
        assert_eq!(service.text(&id).as_deref(), Some("mine again"));
    }

    #[tokio::test]
    async fn test_estimated_version_from_patch() {
        let service = Arc::new(MemoryBlockService::new());
        service.omit_patch_version(true);
        let reconciler = reconciler(&service, "new:a", Some(1));

        let outcome = reconciler.begin("x".into()).await.unwrap();
        let saved = outcome.saved().unwrap();
        assert!(saved.estimated);
        assert_eq!(saved.version, 2);
    }

    #[tokio::test]
    async fn test_callback_receives_saved_blocks() {
        let service = Arc::new(MemoryBlockService::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let identity = IdentityResolver::new(
            Arc::clone(&service),
            DocumentId::draft("cb"),
            MeetingId::new(2),
        );
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&service), identity).with_callback({
            let seen = Arc::clone(&seen);
            move |block: &SavedBlock| {
                assert!(block.version >= 2);
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        reconciler.begin("one".into()).await.unwrap();
        service.fail_patches(1, 500);
        reconciler.begin("two".into()).await.unwrap();
        reconciler.begin("three".into()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_callback_can_start_next_save() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 1);
        let identity =
            IdentityResolver::new(Arc::clone(&service), DocumentId::new(id.as_str()), None);
        let slot: Arc<OnceLock<Weak<Reconciler<MemoryBlockService>>>> = Arc::new(OnceLock::new());
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&service), identity).with_callback({
            let slot = Arc::clone(&slot);
            let fired = AtomicBool::new(false);
            move |_: &SavedBlock| {
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(reconciler) = slot.get().and_then(Weak::upgrade) {
                    drop(reconciler.begin("again".into()));
                }
            }
        }));
        slot.set(Arc::downgrade(&reconciler)).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), reconciler.begin("first".into()))
            .await
            .expect("save with a re-entrant callback never finished")
            .unwrap();
        assert_eq!(first.saved().unwrap().version, 2);

        reconciler.settle().await;
        assert_eq!(
            patches(&service),
            vec![("first".into(), 1), ("again".into(), 2)]
        );
        assert_eq!(service.text(&id).as_deref(), Some("again"));
        match reconciler.current_status() {
            SaveStatus::Saved(block) => assert_eq!(block.version, 3),
            other => panic!("expected saved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_is_published_before_callback_runs() {
        let service = Arc::new(MemoryBlockService::new());
        let identity = IdentityResolver::new(
            Arc::clone(&service),
            DocumentId::draft("cb"),
            MeetingId::new(1),
        );
        let reconciler = Arc::new(
            Reconciler::new(Arc::clone(&service), identity)
                .with_callback(|_: &SavedBlock| panic!("callback failed")),
        );

        let result = reconciler.begin("x".into()).await;
        assert!(result.unwrap_err().is_panic());
        tokio::time::timeout(Duration::from_secs(5), reconciler.settle())
            .await
            .expect("status stuck at saving");
        assert!(matches!(reconciler.current_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test]
    async fn test_conflict_adopts_older_server_version() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 3);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.identity().record(5, true).await;

        let outcome = reconciler.begin("a".into()).await.unwrap();
        let saved = outcome.saved().unwrap();
        assert_eq!(saved.version, 4);
        assert_eq!(reconciler.identity().identity().await.version(), Some(4));

        // the next save starts from the server's baseline, no second conflict
        reconciler.begin("b".into()).await.unwrap();
        assert_eq!(
            patches(&service),
            vec![("a".into(), 5), ("a".into(), 3), ("b".into(), 4)]
        );
        assert_eq!(reconciler.identity().identity().await.version(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_of_superseded_attempt_writes_no_version() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 1);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.begin("warmup".into()).await.unwrap();
        assert_eq!(reconciler.identity().identity().await.version(), Some(2));

        service.delay_next_patch(Duration::from_secs(5));
        let late = reconciler.begin("late".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        // a newer generation starts while the patch is pending, without an abort
        reconciler.generation.fetch_add(1, Ordering::SeqCst);

        let outcome = late.await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Superseded));
        assert_eq!(service.version(&id), Some(3));
        assert_eq!(reconciler.identity().identity().await.version(), Some(2));
        // only the current generation publishes
        assert_eq!(
            reconciler.current_status(),
            SaveStatus::Saving { generation: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_attempt_aborts_in_flight_one() {
        let service = Arc::new(MemoryBlockService::new());
        let id = service.insert("old", 1);
        let reconciler = reconciler(&service, id.as_str(), None);
        reconciler.begin("warmup".into()).await.unwrap();

        // A's write lands on the server but its response is slow
        service.delay_next_patch(Duration::from_secs(5));
        let a = reconciler.begin("a".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = reconciler.begin("b".into());

        assert!(a.await.unwrap_err().is_cancelled());
        let saved = b.await.unwrap();
        let saved = saved.saved().unwrap();
        // B conflicted with A's write and recovered
        assert!(saved.retried);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let server_version = service.version(&id).unwrap();
        assert_eq!(saved.version, server_version);
        assert_eq!(
            reconciler.identity().identity().await.version(),
            Some(server_version)
        );
        assert_eq!(service.text(&id).as_deref(), Some("b"));
        assert!(matches!(reconciler.current_status(), SaveStatus::Saved(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_for_in_flight_attempt() {
        let service = Arc::new(MemoryBlockService::new());
        service.set_latency(Duration::from_millis(300));
        let reconciler = reconciler(&service, "new:a", Some(1));

        let _handle = reconciler.begin("x".into());
        assert!(reconciler.current_status().is_saving());
        reconciler.settle().await;
        assert!(matches!(reconciler.current_status(), SaveStatus::Saved(_)));
    }
}
