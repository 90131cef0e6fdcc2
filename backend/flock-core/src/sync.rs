// src/sync.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::attendance_book::{AttendanceBook, BookCounts, ChangeEvent};
use crate::backend_client::{AttendanceSource, BackendError};
use crate::snapshot::{BookSnapshot, SnapshotStore};

/// Keeps the in-memory book aligned with the backend: local changes wait in
/// the book's outbox until the backend acknowledges them, and timed pulls
/// are merged under whatever is still waiting.
#[derive(Clone)]
pub struct Synchronizer {
    book: AttendanceBook,
    source: Arc<dyn AttendanceSource>,
    store: Option<SnapshotStore>,
    /// Serializes pushes and pulls so a pull never races an in-flight push.
    gate: Arc<Mutex<()>>,
}

impl Synchronizer {
    pub fn new(book: AttendanceBook, source: Arc<dyn AttendanceSource>) -> Self {
        book.track_unpushed_changes();
        Self {
            book,
            source,
            store: None,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Persist a snapshot after each successful pull.
    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Pushes what is still queued, then pulls. Changes the backend refused
    /// stay queued and are replayed over the pulled copy.
    pub async fn sync_all(&self) -> Result<BookCounts, BackendError> {
        let _gate = self.gate.lock().await;
        if let Err(e) = self.push_pending().await {
            warn!(
                "{} local changes are still unpushed before pulling: {}",
                self.book.unpushed_changes(),
                e
            );
        }

        info!("Pulling attendance tables from backend...");
        let snapshot = self.source.fetch_all().await?;
        self.book.merge_pulled(snapshot);
        let counts = self.book.counts();
        info!(
            "Backend pull applied: {} members, {} records, {} reports",
            counts.members, counts.records, counts.reports
        );
        if let Some(store) = &self.store {
            save_snapshot(store, self.book.snapshot()).await;
        }
        Ok(counts)
    }

    pub async fn run_periodic(self, interval: Duration) {
        info!("Starting periodic backend sync every {:?}", interval);
        loop {
            sleep(interval).await;
            if let Err(e) = self.sync_all().await {
                error!("Periodic backend sync failed: {}", e);
            }
        }
    }

    /// Pushes queued changes oldest first and returns how many the backend
    /// took. Stops at the first failure; the rest stay queued.
    pub async fn flush_pending(&self) -> Result<usize, BackendError> {
        let _gate = self.gate.lock().await;
        self.push_pending().await
    }

    async fn push_pending(&self) -> Result<usize, BackendError> {
        let mut pushed = 0;
        while let Some(event) = self.book.next_unpushed() {
            self.source.push_change(&event).await?;
            self.book.mark_pushed(&event);
            pushed += 1;
        }
        if pushed > 0 {
            debug!("Pushed {} local changes to backend", pushed);
        }
        Ok(pushed)
    }

    /// Subscribes before spawning so no event published after this call
    /// is missed. Events only wake the forwarder; the outbox is what gets
    /// pushed, so a lagged receiver loses nothing.
    pub fn spawn_change_forwarder(&self) -> JoinHandle<()> {
        let mut events = self.book.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            info!("Change forwarder started");
            loop {
                match events.recv().await {
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "Change forwarder lagged by {} events, pushing the outbox",
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
                drain(&mut events);
                if let Err(e) = this.flush_pending().await {
                    error!(
                        "Failed to push change to backend, {} changes queued for retry: {}",
                        this.book.unpushed_changes(),
                        e
                    );
                }
            }
            info!("Change forwarder stopped");
        })
    }
}

async fn save_snapshot(store: &SnapshotStore, snapshot: BookSnapshot) {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Failed to save snapshot: {}", e),
        Err(e) => error!("Snapshot save task failed: {}", e),
    }
}

/// Saves a snapshot whenever the book changes. Bursts of events are
/// coalesced into one write.
pub fn spawn_snapshot_writer(book: AttendanceBook, store: SnapshotStore) -> JoinHandle<()> {
    let mut events = book.subscribe();
    tokio::spawn(async move {
        info!("Snapshot writer started for {:?}", store.path());
        loop {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    drain(&mut events);
                    save_snapshot(&store, book.snapshot()).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn drain(events: &mut broadcast::Receiver<ChangeEvent>) {
    use broadcast::error::TryRecvError;
    loop {
        match events.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}
