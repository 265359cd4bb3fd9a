//! Keeps a [`LinkStore`] durable in a [`ReplicaStore`].
//!
//! ```text
//! init:    snapshot ──► apply(Persistence) ──► updates[seq..] ──► apply(Persistence) ──► ready
//! running: DocUpdate ──► append_update ──(every N)──► save_snapshot + compact_updates
//! ```
//! Storage failures are logged and swallowed: the in-memory replica keeps
//! working and the next snapshot rewrites the full state anyway.

use linkdrop_core::{DocUpdate, LinkStore, UpdateOrigin};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::rocks::ReplicaStore;

enum Command {
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Handle to the background flusher of one replica.
pub struct Persistence {
    replica: Uuid,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Persistence {
    /// Replay stored state into `doc`, then start persisting its updates.
    ///
    /// Returns once replay has finished.
    pub async fn init(
        doc: Arc<LinkStore>,
        store: Arc<ReplicaStore>,
        device: &str,
        compaction_threshold: usize,
    ) -> Self {
        let replica = ReplicaStore::replica_key(device);
        // Subscribe first so nothing committed after replay is missed.
        let updates = doc.subscribe_updates();

        let replayed = replay(&doc, &store, replica);
        log::info!(
            "Restored replica {device} ({replica}): {replayed} stored updates, {} links",
            doc.link_count()
        );

        let (commands, command_rx) = mpsc::channel(8);
        let flusher = Flusher {
            doc,
            store,
            replica,
            threshold: compaction_threshold.max(1),
            pending: 0,
        };
        let task = tokio::spawn(flusher.run(updates, command_rx));

        Self {
            replica,
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn replica(&self) -> Uuid {
        self.replica
    }

    /// Write a full snapshot now and wait for it.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Write a final snapshot and stop the flusher.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).await.is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Apply the stored snapshot and update log. Returns the number of updates
/// replayed on top of the snapshot.
fn replay(doc: &LinkStore, store: &ReplicaStore, replica: Uuid) -> usize {
    match store.load_snapshot(replica) {
        Ok(Some(snapshot)) => {
            if let Err(e) = doc.apply_update(&snapshot, UpdateOrigin::Persistence) {
                log::warn!("Stored snapshot for {replica} is unreadable: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => log::warn!("Failed to load snapshot for {replica}: {e}"),
    }

    let updates = match store.load_updates(replica) {
        Ok(updates) => updates,
        Err(e) => {
            log::warn!("Failed to load update log for {replica}: {e}");
            return 0;
        }
    };

    let mut applied = 0;
    for (seq, update) in updates {
        match doc.apply_update(&update, UpdateOrigin::Persistence) {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("Skipping stored update {seq} for {replica}: {e}"),
        }
    }
    applied
}

struct Flusher {
    doc: Arc<LinkStore>,
    store: Arc<ReplicaStore>,
    replica: Uuid,
    threshold: usize,
    pending: usize,
}

impl Flusher {
    async fn run(
        mut self,
        mut updates: broadcast::Receiver<DocUpdate>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            tokio::select! {
                // Drain queued updates before acting on a command.
                biased;

                update = updates.recv() => match update {
                    Ok(update) => self.persist(update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Persistence fell behind by {n} updates, writing snapshot");
                        self.snapshot();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                command = commands.recv() => match command {
                    Some(Command::Flush(ack)) => {
                        self.snapshot();
                        let _ = ack.send(());
                    }
                    Some(Command::Close(ack)) => {
                        self.snapshot();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.snapshot();
                        break;
                    }
                },
            }
        }
        log::debug!("Persistence for {} stopped", self.replica);
    }

    fn persist(&mut self, update: DocUpdate) {
        if update.origin == UpdateOrigin::Persistence {
            return;
        }
        match self.store.append_update(self.replica, &update.update) {
            Ok(seq) => {
                log::trace!("Persisted update {seq} ({} bytes)", update.update.len());
                self.pending += 1;
                if self.pending >= self.threshold {
                    self.snapshot();
                }
            }
            Err(e) => log::warn!("Failed to persist update: {e}"),
        }
    }

    /// Store the full state and drop the updates it covers.
    fn snapshot(&mut self) {
        let state = self.doc.encode_state();
        match self.store.save_snapshot(self.replica, &state) {
            Ok(meta) => {
                self.pending = 0;
                if meta.next_seq > 0 {
                    match self.store.compact_updates(self.replica, meta.next_seq - 1) {
                        Ok(removed) => log::debug!(
                            "Snapshot {} bytes, compacted {removed} updates",
                            meta.snapshot_size
                        ),
                        Err(e) => log::warn!("Failed to compact update log: {e}"),
                    }
                }
            }
            Err(e) => log::warn!("Failed to write snapshot: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use linkdrop_core::LinkPatch;

    fn open(dir: &tempfile::TempDir) -> Arc<ReplicaStore> {
        Arc::new(ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap())
    }

    #[tokio::test]
    async fn test_updates_are_appended_then_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let rocks = open(&dir);
        let doc = Arc::new(LinkStore::new().unwrap());
        let persistence = Persistence::init(doc.clone(), rocks.clone(), "dev", 3).await;
        let replica = persistence.replica();

        doc.add_link("https://a.io", LinkPatch::default()).unwrap();
        doc.add_link("https://b.io", LinkPatch::default()).unwrap();
        persistence.flush().await;
        // The flush snapshot covers both updates.
        assert!(rocks.load_updates(replica).unwrap().is_empty());
        assert!(rocks.load_snapshot(replica).unwrap().is_some());

        doc.add_link("https://c.io", LinkPatch::default()).unwrap();
        persistence.close().await;
        assert_eq!(rocks.load_metadata(replica).unwrap().next_seq, 3);
    }

    #[tokio::test]
    async fn test_replay_restores_links() {
        let dir = tempfile::tempdir().unwrap();
        let rocks = open(&dir);
        {
            let doc = Arc::new(LinkStore::new().unwrap());
            let persistence = Persistence::init(doc.clone(), rocks.clone(), "dev", 100).await;
            doc.add_link("https://a.io", LinkPatch::default().title("A")).unwrap();
            persistence.close().await;
        }

        let doc = Arc::new(LinkStore::new().unwrap());
        let persistence = Persistence::init(doc.clone(), rocks, "dev", 100).await;
        assert_eq!(doc.link_count(), 1);
        assert_eq!(doc.links()[0].title.as_deref(), Some("A"));
        persistence.close().await;
    }

    #[tokio::test]
    async fn test_replay_is_not_persisted_again() {
        let dir = tempfile::tempdir().unwrap();
        let rocks = open(&dir);
        let replica = ReplicaStore::replica_key("dev");

        let source = LinkStore::new().unwrap();
        source.add_link("https://a.io", LinkPatch::default()).unwrap();
        rocks.append_update(replica, &source.encode_state()).unwrap();

        let doc = Arc::new(LinkStore::new().unwrap());
        let persistence = Persistence::init(doc.clone(), rocks.clone(), "dev", 100).await;
        assert_eq!(doc.link_count(), 1);

        // Only the replayed entry is in the log; close snapshots and compacts it.
        assert_eq!(rocks.load_updates(replica).unwrap().len(), 1);
        persistence.close().await;
        assert!(rocks.load_updates(replica).unwrap().is_empty());
        assert_eq!(rocks.load_metadata(replica).unwrap().next_seq, 1);
    }

    #[tokio::test]
    async fn test_corrupt_log_entry_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let rocks = open(&dir);
        let replica = ReplicaStore::replica_key("dev");

        let source = LinkStore::new().unwrap();
        source.add_link("https://a.io", LinkPatch::default()).unwrap();
        rocks.append_update(replica, &[0xff, 0xff, 0xff]).unwrap();
        rocks.append_update(replica, &source.encode_state()).unwrap();

        let doc = Arc::new(LinkStore::new().unwrap());
        let persistence = Persistence::init(doc.clone(), rocks, "dev", 100).await;
        assert_eq!(doc.link_count(), 1);
        persistence.close().await;
    }

    #[tokio::test]
    async fn test_lagging_flusher_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let rocks = open(&dir);
        let doc = Arc::new(LinkStore::with_capacity(2).unwrap());
        let persistence = Persistence::init(doc.clone(), rocks.clone(), "dev", 100).await;
        let replica = persistence.replica();

        // The flusher has not run yet, so five commits overflow its channel.
        for i in 0..5 {
            doc.add_link(&format!("https://site{i}.io"), LinkPatch::default())
                .unwrap();
        }

        let written = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let Some(snapshot) = rocks.load_snapshot(replica).unwrap() {
                    return snapshot;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no snapshot after the flusher lagged");

        let restored = LinkStore::new().unwrap();
        restored
            .apply_update(&written, UpdateOrigin::Persistence)
            .unwrap();
        assert_eq!(restored.link_count(), 5);
        assert!(rocks.load_updates(replica).unwrap().len() <= 2);
        persistence.close().await;
    }
}
