//! Path locks and the scheduler that serializes colliding operations.
//!
//! Every store operation declares the [`Lock`]s it needs. The
//! [`LockRegistry`] registers them immediately, so anything requested later
//! queues behind them, and then waits for every earlier lock they collide
//! with. Locks are released by dropping their [`HeldLock`] handles, which
//! covers success, error and cancellation alike.
//!
//! ## Collision matrix
//!
//! | Pair                          | Collide iff                      |
//! |-------------------------------|----------------------------------|
//! | read × read                   | never                            |
//! | read × write                  | same path                        |
//! | read × subtree                | read path inside the subtree     |
//! | write × write                 | same path                        |
//! | write × subtree               | write path inside the subtree    |
//! | subtree × subtree             | one contains the other           |

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::filepath::Filepath;

/// Scope of a lock, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Observes one path's value.
    NodeRead,
    /// Mutates one path's value.
    NodeWrite,
    /// Mutates or restructures a whole subtree.
    SubtreeWrite,
}

/// A lock request: a kind and the path it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub kind: LockKind,
    pub path: Filepath,
}

impl Lock {
    pub fn new(kind: LockKind, path: Filepath) -> Self {
        Self { kind, path }
    }

    pub fn node_read(path: Filepath) -> Self {
        Self::new(LockKind::NodeRead, path)
    }

    pub fn node_write(path: Filepath) -> Self {
        Self::new(LockKind::NodeWrite, path)
    }

    pub fn subtree_write(path: Filepath) -> Self {
        Self::new(LockKind::SubtreeWrite, path)
    }

    /// Symmetric collision predicate.
    pub fn collides(&self, other: &Lock) -> bool {
        use LockKind::*;

        match (self.kind, other.kind) {
            (NodeRead, NodeRead) => false,
            (NodeRead, NodeWrite) | (NodeWrite, NodeRead) | (NodeWrite, NodeWrite) => {
                self.path == other.path
            }
            (NodeRead | NodeWrite, SubtreeWrite) => other.path.contains(&self.path),
            (SubtreeWrite, NodeRead | NodeWrite) => self.path.contains(&other.path),
            (SubtreeWrite, SubtreeWrite) => {
                self.path.contains(&other.path) || other.path.contains(&self.path)
            }
        }
    }
}

struct LiveLock {
    lock: Lock,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct Live {
    next_id: u64,
    /// Keyed by registration order.
    locks: BTreeMap<u64, LiveLock>,
    /// Lock in an enclosing registry that lives as long as this one, or as
    /// long as any handle registered here.
    anchor: Option<HeldLock>,
}

impl Live {
    /// Completion signals of every registered lock that collides with any
    /// of `want`.
    fn collisions<'a>(&self, want: impl Iterator<Item = &'a Lock>) -> Vec<watch::Receiver<bool>> {
        let want: Vec<&Lock> = want.collect();
        let waits: Vec<_> = self
            .locks
            .values()
            .filter(|held| want.iter().any(|w| w.collides(&held.lock)))
            .map(|held| held.done.clone())
            .collect();
        if !waits.is_empty() {
            tracing::trace!(collisions = waits.len(), "lock request queued");
        }
        waits
    }

    fn insert(&mut self, lock: Lock, shared: &Arc<Mutex<Live>>) -> HeldLock {
        let id = self.next_id;
        self.next_id += 1;

        let (done_tx, done_rx) = watch::channel(false);
        tracing::trace!(id, kind = ?lock.kind, path = %lock.path, "register lock");
        self.locks.insert(
            id,
            LiveLock {
                lock: lock.clone(),
                done: done_rx,
            },
        );
        HeldLock {
            id,
            lock,
            live: Arc::clone(shared),
            done: done_tx,
        }
    }
}

async fn wait_all(waits: Vec<watch::Receiver<bool>>) {
    for mut rx in waits {
        // A dropped sender means the lock is gone as well.
        let _ = rx.wait_for(|done| *done).await;
    }
}

/// The live lock set of one transaction.
///
/// Cloning shares the same set.
#[derive(Clone, Default)]
pub struct LockRegistry {
    live: Arc<Mutex<Live>>,
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.live.lock();
        f.debug_struct("LockRegistry")
            .field("live", &live.locks.len())
            .field("anchor", &live.anchor)
            .finish()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that keeps `anchor` held until it and every [`HeldLock`]
    /// it handed out are gone, or until [`release_anchor`](Self::release_anchor).
    pub(crate) fn anchored(anchor: HeldLock) -> Self {
        let registry = Self::new();
        registry.live.lock().anchor = Some(anchor);
        registry
    }

    /// Detach the anchor so the caller can drop it.
    pub(crate) fn release_anchor(&self) -> Option<HeldLock> {
        self.live.lock().anchor.take()
    }

    /// Number of currently registered locks, waiting or held.
    pub fn live_count(&self) -> usize {
        self.live.lock().locks.len()
    }

    /// Snapshot of the registered locks in registration order.
    pub fn live_locks(&self) -> Vec<Lock> {
        self.live
            .lock()
            .locks
            .values()
            .map(|l| l.lock.clone())
            .collect()
    }

    /// Register `locks` now and collect the earlier locks they must wait for.
    ///
    /// The returned handles are live from this point on, even before
    /// [`PendingLocks::ready`] resolves.
    pub fn register(&self, locks: Vec<Lock>) -> PendingLocks {
        let mut live = self.live.lock();
        let waits = live.collisions(locks.iter());
        let held = locks
            .into_iter()
            .map(|lock| live.insert(lock, &self.live))
            .collect();
        PendingLocks { held, waits }
    }

    /// Register `locks` and wait until none of the earlier colliding locks
    /// remain. Handles come back in request order.
    pub async fn acquire(&self, locks: Vec<Lock>) -> Vec<HeldLock> {
        self.register(locks).ready().await
    }

    /// Acquire a single lock.
    pub async fn acquire_one(&self, lock: Lock) -> HeldLock {
        self.acquire_split(lock, Vec::new()).await.0
    }

    /// Acquire `primary` together with `companions` as one request, handing
    /// the primary lock back separately.
    pub async fn acquire_split(
        &self,
        primary: Lock,
        companions: Vec<Lock>,
    ) -> (HeldLock, Vec<HeldLock>) {
        let (primary, companions, waits) = {
            let mut live = self.live.lock();
            let waits = live.collisions(companions.iter().chain(std::iter::once(&primary)));
            let companions: Vec<HeldLock> = companions
                .into_iter()
                .map(|lock| live.insert(lock, &self.live))
                .collect();
            let primary = live.insert(primary, &self.live);
            (primary, companions, waits)
        };
        wait_all(waits).await;
        (primary, companions)
    }

    /// Run `f` while holding `locks`, releasing them on every exit path.
    pub async fn do_locked<F, Fut, T>(&self, locks: Vec<Lock>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _held = self.acquire(locks).await;
        f().await
    }
}

/// Locks that are registered but may still be waiting on earlier collisions.
#[must_use = "registered locks are released when dropped"]
pub struct PendingLocks {
    held: Vec<HeldLock>,
    waits: Vec<watch::Receiver<bool>>,
}

impl fmt::Debug for PendingLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLocks")
            .field("held", &self.held)
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

impl PendingLocks {
    /// Whether any earlier colliding lock is still held.
    pub fn is_blocked(&self) -> bool {
        self.waits.iter().any(|rx| !*rx.borrow())
    }

    /// Wait for every collected collision to complete.
    pub async fn ready(self) -> Vec<HeldLock> {
        wait_all(self.waits).await;
        self.held
    }
}

/// A registered lock. Dropping it signals completion and deregisters it.
#[must_use = "the lock is released when dropped"]
pub struct HeldLock {
    id: u64,
    lock: Lock,
    live: Arc<Mutex<Live>>,
    done: watch::Sender<bool>,
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock")
            .field("id", &self.id)
            .field("kind", &self.lock.kind)
            .field("path", &self.lock.path)
            .finish()
    }
}

impl HeldLock {
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// A handle that resolves once this lock is released.
    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.done.subscribe(),
        }
    }

    /// Release now. Same as dropping.
    pub fn release(self) {}
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.live.lock().locks.remove(&self.id);
        self.done.send_replace(true);
        tracing::trace!(id = self.id, kind = ?self.lock.kind, path = %self.lock.path, "release lock");
    }
}

/// Resolves when the lock it was taken from is released.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}
