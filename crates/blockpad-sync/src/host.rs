//! The live content buffer a host edits.
//!
//! Every mutation is handed to the autosave session and to a throttled
//! preview channel. The buffer itself is the source of truth: a failed save
//! never touches it, and the next mutation retries.

use tokio::sync::watch;

use crate::client::BlockService;
use crate::error::BlockError;
use crate::scheduler::{Throttled, throttle};
use crate::session::AutosaveSession;
use crate::types::Snapshot;

pub struct DocumentBuffer<S> {
    content: String,
    session: AutosaveSession<S>,
    preview: Throttled<Snapshot>,
    preview_rx: watch::Receiver<Snapshot>,
}

impl<S> DocumentBuffer<S>
where
    S: BlockService + Send + Sync + 'static,
{
    /// A buffer seeded with `initial`. Seeding is not a change and schedules
    /// no save.
    pub fn new(session: AutosaveSession<S>, initial: impl Into<String>) -> Self {
        let content = initial.into();
        let (tx, preview_rx) = watch::channel(Snapshot::from(content.as_str()));
        let preview = throttle(
            move |snapshot: Snapshot| {
                tx.send_replace(snapshot);
            },
            session.options().preview_throttle,
        );
        Self {
            content,
            session,
            preview,
            preview_rx,
        }
    }

    /// Open a document, loading the server text for an existing block.
    /// Drafts start empty.
    pub async fn open(session: AutosaveSession<S>) -> Result<Self, BlockError> {
        let initial = session
            .hydrate()
            .await?
            .map(|stored| stored.text)
            .unwrap_or_default();
        tracing::debug!(document = %session.document(), bytes = initial.len(), "opened document");
        Ok(Self::new(session, initial))
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn session(&self) -> &AutosaveSession<S> {
        &self.session
    }

    /// Preview updates, at most one per throttle window. The final state is
    /// always delivered.
    pub fn subscribe_preview(&self) -> watch::Receiver<Snapshot> {
        self.preview_rx.clone()
    }

    pub fn replace(&mut self, text: impl Into<String>) {
        self.content = text.into();
        self.changed();
    }

    pub fn edit(&mut self, f: impl FnOnce(&mut String)) {
        f(&mut self.content);
        self.changed();
    }

    fn changed(&self) {
        let snapshot = Snapshot::from(self.content.as_str());
        self.session.content_changed(snapshot.clone());
        self.preview.call(snapshot);
    }

    /// Save pending changes now. See [`AutosaveSession::flush`].
    pub async fn flush(&self) -> bool {
        self.session.flush().await
    }

    /// Flush and tear down, returning the final content.
    pub async fn close(self) -> String {
        let DocumentBuffer {
            content, session, ..
        } = self;
        session.shutdown().await;
        content
    }
}
