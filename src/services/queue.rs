use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::events::{Notification, NotificationSender};
use crate::models::track::{EntryOverview, ResolvedTrack};
use crate::services::preparer::Prepare;
use crate::utils::probe::Loudness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed,
}

/// Result of a successful preparation.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub path: PathBuf,
    pub duration: u64,
    pub loudness: Loudness,
}

/// A queued track and its preparation lifecycle.
pub struct QueueEntry {
    pub id: Uuid,
    pub track: ResolvedTrack,
    prepared: Mutex<Option<Prepared>>,
    started: AtomicBool,
    readiness: watch::Sender<Readiness>,
}

impl QueueEntry {
    pub fn new(track: ResolvedTrack) -> Arc<Self> {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Arc::new(Self {
            id: Uuid::new_v4(),
            track,
            prepared: Mutex::new(None),
            started: AtomicBool::new(false),
            readiness,
        })
    }

    /// Claim the single preparation attempt. Only the first caller gets `true`.
    pub fn try_start(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self, prepared: Prepared) {
        *self.prepared.lock() = Some(prepared);
        self.readiness.send_replace(Readiness::Ready);
    }

    pub fn mark_failed(&self) {
        self.readiness.send_replace(Readiness::Failed);
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    // Pending on timeout
    pub async fn wait_settled(&self, timeout: Duration) -> Readiness {
        let mut rx = self.readiness.subscribe();
        let settled =
            tokio::time::timeout(timeout, rx.wait_for(|r| *r != Readiness::Pending)).await;
        match settled {
            Ok(Ok(readiness)) => *readiness,
            _ => Readiness::Pending,
        }
    }

    pub fn prepared(&self) -> Option<Prepared> {
        self.prepared.lock().clone()
    }

    pub fn overview(&self) -> EntryOverview {
        EntryOverview {
            track: self.track.clone(),
            duration: self.prepared.lock().as_ref().map(|p| p.duration).unwrap_or(0),
        }
    }
}

struct QueueInner {
    entries: VecDeque<Arc<QueueEntry>>,
    // Head entry that already had its preparation scheduled
    prepared_head: Option<Uuid>,
}

/// Ordered playback queue with head prefetch.
///
/// Every structural change happens under one mutex; notifications go out after
/// it is released.
pub struct PlaybackQueue {
    inner: tokio::sync::Mutex<QueueInner>,
    preparer: Arc<dyn Prepare>,
    notifier: NotificationSender,
    dequeue_wait: Duration,
}

impl PlaybackQueue {
    pub fn new(
        preparer: Arc<dyn Prepare>,
        notifier: NotificationSender,
        dequeue_wait: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: tokio::sync::Mutex::new(QueueInner {
                entries: VecDeque::new(),
                prepared_head: None,
            }),
            preparer,
            notifier,
            dequeue_wait,
        })
    }

    fn notify(&self, notification: Notification) {
        if self.notifier.send(notification).is_err() {
            debug!("Notification dropped, dispatcher is gone");
        }
    }

    fn spawn_prepare(self: &Arc<Self>, entry: Arc<QueueEntry>, evict_on_failure: bool) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let readiness = queue.preparer.prepare(&entry).await;
            if readiness == Readiness::Failed && evict_on_failure {
                queue.evict(&entry).await;
            }
        });
    }

    // Schedule preparation for the head if it is a new, untouched entry
    fn schedule_head(self: &Arc<Self>, inner: &mut QueueInner) {
        let head = match inner.entries.front() {
            Some(head) => Arc::clone(head),
            None => {
                inner.prepared_head = None;
                return;
            }
        };

        if inner.prepared_head == Some(head.id) || head.is_started() {
            return;
        }

        debug!("Scheduling preparation for head {} ({})", head.id, head.track.uri);
        inner.prepared_head = Some(head.id);
        self.spawn_prepare(head, true);
    }

    async fn evict(self: &Arc<Self>, entry: &QueueEntry) {
        if self.remove(entry.id).await {
            warn!("Evicted {} after failed preparation", entry.track.uri);
        }
    }

    /// Insert entries at the tail, or at the head keeping their order. Entries
    /// already queued are skipped. Returns how many were inserted.
    pub async fn enqueue(self: &Arc<Self>, entries: Vec<Arc<QueueEntry>>, at_head: bool) -> usize {
        let added = {
            let mut inner = self.inner.lock().await;
            let mut seen: HashSet<Uuid> = inner.entries.iter().map(|e| e.id).collect();
            let fresh: Vec<Arc<QueueEntry>> =
                entries.into_iter().filter(|e| seen.insert(e.id)).collect();
            let added = fresh.len();

            if at_head {
                for entry in fresh.into_iter().rev() {
                    inner.entries.push_front(entry);
                }
            } else {
                inner.entries.extend(fresh);
            }

            self.schedule_head(&mut inner);
            added
        };

        if added > 0 {
            info!("Enqueued {} entries{}", added, if at_head { " at head" } else { "" });
            self.notify(Notification::QueueChanged);
        }
        added
    }

    /// Pop the next playable entry, waiting on each one up to the dequeue wait.
    /// Entries that fail or starve are discarded. Signals `QueueEmpty` once when
    /// nothing playable is left.
    pub async fn dequeue_next(self: &Arc<Self>) -> Option<Arc<QueueEntry>> {
        let mut discarded = false;

        loop {
            let popped = {
                let mut inner = self.inner.lock().await;
                let popped = inner.entries.pop_front();
                self.schedule_head(&mut inner);
                popped
            };

            let entry = match popped {
                Some(entry) => entry,
                None => {
                    if discarded {
                        self.notify(Notification::QueueChanged);
                    }
                    info!("Queue is empty");
                    self.notify(Notification::QueueEmpty);
                    return None;
                }
            };

            // Popped before its own turn as head came around
            if !entry.is_started() {
                self.spawn_prepare(Arc::clone(&entry), false);
            }

            match entry.wait_settled(self.dequeue_wait).await {
                Readiness::Ready => {
                    info!("Dequeued {} ({})", entry.track.title, entry.track.uri);
                    self.notify(Notification::QueueChanged);
                    return Some(entry);
                }
                Readiness::Failed => {
                    warn!("Discarding {}: preparation failed", entry.track.uri);
                    discarded = true;
                }
                Readiness::Pending => {
                    warn!(
                        "Discarding {}: not ready after {}s",
                        entry.track.uri,
                        self.dequeue_wait.as_secs()
                    );
                    discarded = true;
                }
            }
        }
    }

    /// Remove one entry by identity, preparing the new head if it changed.
    pub async fn remove(self: &Arc<Self>, id: Uuid) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            match inner.entries.iter().position(|e| e.id == id) {
                Some(pos) => {
                    inner.entries.remove(pos);
                    self.schedule_head(&mut inner);
                    true
                }
                None => false,
            }
        };

        if removed {
            self.notify(Notification::QueueChanged);
        }
        removed
    }

    /// Remove the entry at `index` if its URI is still `uri`.
    pub async fn remove_at(self: &Arc<Self>, uri: &str, index: usize) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            let matches = inner.entries.get(index).map(|e| e.track.uri == uri).unwrap_or(false);
            if matches {
                inner.entries.remove(index);
                self.schedule_head(&mut inner);
            }
            matches
        };

        if removed {
            self.notify(Notification::QueueChanged);
        } else {
            warn!("remove_at rejected: {} is not at {}", uri, index);
        }
        removed
    }

    /// Drop everything before `index` if the entry there is still `uri`.
    /// No notification; the following dequeue announces the change.
    pub async fn seek(self: &Arc<Self>, uri: &str, index: usize) -> bool {
        let mut inner = self.inner.lock().await;
        let matches = inner.entries.get(index).map(|e| e.track.uri == uri).unwrap_or(false);
        if !matches {
            warn!("seek rejected: {} is not at {}", uri, index);
            return false;
        }

        inner.entries.drain(..index);
        self.schedule_head(&mut inner);
        true
    }

    /// Accept a new URI ordering only when it swaps exactly two entries.
    pub async fn reassign(self: &Arc<Self>, order: &[String]) -> bool {
        let accepted = {
            let mut inner = self.inner.lock().await;
            match single_swap(&inner.entries, order) {
                Some((a, b)) => {
                    inner.entries.swap(a, b);
                    self.schedule_head(&mut inner);
                    true
                }
                None => false,
            }
        };

        if accepted {
            self.notify(Notification::QueueChanged);
        } else {
            warn!("Rejected queue edit that is not a single transposition");
        }
        accepted
    }

    pub async fn clear(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.entries.clear();
            inner.prepared_head = None;
        }
        info!("Queue cleared");
        self.notify(Notification::QueueChanged);
    }

    pub async fn shuffle(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.entries.make_contiguous().shuffle(&mut rand::thread_rng());
            self.schedule_head(&mut inner);
        }
        self.notify(Notification::QueueChanged);
    }

    pub async fn list(&self) -> Vec<EntryOverview> {
        let inner = self.inner.lock().await;
        inner.entries.iter().map(|e| e.overview()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// Indices of the two swapped positions, if `order` is exactly one transposition
// of the current queue.
fn single_swap(entries: &VecDeque<Arc<QueueEntry>>, order: &[String]) -> Option<(usize, usize)> {
    if entries.len() != order.len() {
        return None;
    }

    let diffs: Vec<usize> = entries
        .iter()
        .zip(order)
        .enumerate()
        .filter(|(_, (entry, uri))| entry.track.uri != **uri)
        .map(|(i, _)| i)
        .collect();

    match diffs.as_slice() {
        [a, b] if entries[*a].track.uri == order[*b] && entries[*b].track.uri == order[*a] => {
            Some((*a, *b))
        }
        _ => None,
    }
}
