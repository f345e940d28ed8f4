//! One autosave session per open document.

use std::sync::Arc;
use std::time::Duration;

use blockpad_common::Config;
use tokio::sync::watch;

use crate::client::{BlockService, StoredBlock};
use crate::error::BlockError;
use crate::identity::{BlockIdentity, IdentityResolver};
use crate::reconciler::{Reconciler, SaveStatus};
use crate::scheduler::{Debounced, debounce};
use crate::types::{DocumentId, MeetingId, Snapshot};

/// Timing knobs for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AutosaveOptions {
    /// Quiet period after the last change before a save starts.
    pub debounce: Duration,
    /// Minimum spacing between preview updates.
    pub preview_throttle: Duration,
}

impl Default for AutosaveOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(Config::DEFAULT_DEBOUNCE_MS),
            preview_throttle: Duration::from_millis(Config::DEFAULT_PREVIEW_THROTTLE_MS),
        }
    }
}

impl From<&Config> for AutosaveOptions {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
            preview_throttle: config.preview_throttle(),
        }
    }
}

/// Debounces content changes into save attempts for one document.
///
/// Constructed when the document is opened and shut down when it closes.
/// Must be created inside a tokio runtime.
pub struct AutosaveSession<S> {
    reconciler: Arc<Reconciler<S>>,
    pending: Debounced<Snapshot>,
    options: AutosaveOptions,
}

impl<S> AutosaveSession<S>
where
    S: BlockService + Send + Sync + 'static,
{
    pub fn new(
        service: Arc<S>,
        document: DocumentId,
        meeting: Option<MeetingId>,
        options: AutosaveOptions,
    ) -> Self {
        let identity = IdentityResolver::new(Arc::clone(&service), document, meeting);
        Self::from_reconciler(Reconciler::new(service, identity), options)
    }

    /// Wrap a preconfigured reconciler, e.g. one with a save callback.
    pub fn from_reconciler(reconciler: Reconciler<S>, options: AutosaveOptions) -> Self {
        let reconciler = Arc::new(reconciler);
        let target = Arc::clone(&reconciler);
        let pending = debounce(
            move |snapshot: Snapshot| {
                // the handle is only needed by callers of begin itself
                drop(target.begin(snapshot));
            },
            options.debounce,
        );
        tracing::debug!(
            document = %reconciler.identity().document(),
            debounce_ms = options.debounce.as_millis() as u64,
            "autosave session started"
        );
        Self {
            reconciler,
            pending,
            options,
        }
    }

    /// The host's content changed. Cheap; the save happens after the
    /// debounce window.
    pub fn content_changed(&self, snapshot: impl Into<Snapshot>) {
        self.pending.call(snapshot.into());
    }

    /// Save any pending change now and wait for the attempt to settle.
    ///
    /// Without a pending change this only waits for an attempt already in
    /// flight and issues no request. Returns whether a save was started.
    pub async fn flush(&self) -> bool {
        let fired = self.pending.flush().await;
        self.reconciler.settle().await;
        fired
    }

    pub fn set_meeting(&self, meeting: Option<MeetingId>) {
        self.reconciler.identity().set_meeting(meeting);
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.reconciler.status()
    }

    pub fn current_status(&self) -> SaveStatus {
        self.reconciler.current_status()
    }

    pub fn document(&self) -> &DocumentId {
        self.reconciler.identity().document()
    }

    pub async fn identity(&self) -> BlockIdentity {
        self.reconciler.identity().identity().await
    }

    pub fn options(&self) -> AutosaveOptions {
        self.options
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<S>> {
        &self.reconciler
    }

    /// Server content of an existing block, for seeding the host buffer.
    pub async fn hydrate(&self) -> Result<Option<StoredBlock>, BlockError> {
        self.reconciler.identity().hydrate().await
    }

    /// Flush, then stop the debounce driver.
    pub async fn shutdown(self) {
        self.flush().await;
        tracing::debug!(document = %self.document(), "autosave session closed");
    }
}
