//! Transactions: the public face of the store.
//!
//! A [`Transaction`] owns a root path (its jurisdiction) and a
//! [`LockRegistry`]. Every operation validates its target, registers the
//! locks the target implies, waits out earlier collisions, touches the real
//! filesystem, and releases.
//!
//! ## Leaf/node reconciliation
//!
//! Real filesystems make a path either a file or a directory. The store lets
//! a path be both: a path that holds a value and gains children becomes a
//! directory, and its value moves into the reserved child `~`. Every write
//! first walks the target's lineage and makes each ancestor a directory,
//! swapping leaves to nodes on the way.
//!
//! ## Nesting
//!
//! [`Transaction::kid`] and [`Transaction::transact`] open a nested
//! transaction over a descendant. The nested transaction holds a subtree
//! write lock in its parent's registry, so overlapping nested transactions
//! serialize against each other and against the parent, and it coordinates
//! its own operations in a fresh registry of its own. That registry anchors
//! the subtree lock: it stays held until the transaction ends, or until the
//! last handle and the last stream or iterator opened through it are gone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FilestoreError, FilestoreResult};
use crate::filepath::{Filepath, RESERVED_COMPONENT};
use crate::lock::{HeldLock, Lock, LockRegistry};
use crate::realfs;
use crate::stream::{HeadStream, NodeIter, TailStream};
use crate::types::EntityType;

/// Handle to a transaction. Clones share the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

struct TxnInner {
    root: Filepath,
    locks: LockRegistry,
    ended: AtomicBool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("root", &self.inner.root)
            .field("locks", &self.inner.locks)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Transaction {
    /// Open a top-level transaction over `root`.
    pub fn new(root: Filepath) -> Self {
        Self::with_scope(root, None)
    }

    fn with_scope(root: Filepath, scope: Option<HeldLock>) -> Self {
        let locks = match scope {
            Some(scope) => LockRegistry::anchored(scope),
            None => LockRegistry::new(),
        };
        Self {
            inner: Arc::new(TxnInner {
                root,
                locks,
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// The jurisdiction of this transaction.
    pub fn root(&self) -> &Filepath {
        &self.inner.root
    }

    /// A path under the root.
    pub fn path<I, S>(&self, parts: I) -> FilestoreResult<Filepath>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.root.kid(parts)
    }

    /// The live lock set, for instrumentation.
    pub fn lock_registry(&self) -> &LockRegistry {
        &self.inner.locks
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> FilestoreResult<()> {
        if self.is_ended() {
            return Err(FilestoreError::transaction_ended(self.inner.root.to_string()));
        }
        Ok(())
    }

    /// Validate a target before touching anything.
    fn check(&self, path: &Filepath) -> FilestoreResult<()> {
        self.ensure_live()?;
        if !self.inner.root.contains(path) {
            return Err(FilestoreError::out_of_jurisdiction(
                path.to_string(),
                self.inner.root.to_string(),
            ));
        }
        // The root itself may sit under a directory named `~`.
        let below_root = &path.components()[self.inner.root.depth()..];
        if path.has_reserved() && below_root.iter().any(|c| c == RESERVED_COMPONENT) {
            return Err(FilestoreError::reserved_component(path.to_string()));
        }
        Ok(())
    }

    /// Run `f` under `locks` as one scheduled unit.
    async fn locked<F, Fut, T>(&self, locks: Vec<Lock>, f: F) -> FilestoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FilestoreResult<T>>,
    {
        self.inner
            .locks
            .do_locked(locks, move || async move {
                self.ensure_live()?;
                f().await
            })
            .await
    }

    /// The root directory is created outside the lock protocol: a missing
    /// root can only be a top-level store opened without `create_root`, and
    /// concurrent creation is idempotent.
    async fn ensure_root(&self) -> FilestoreResult<()> {
        let real = self.inner.root.resolve();
        if !realfs::entity_type(real).await?.exists() {
            realfs::mkdir_all(real).await?;
        }
        Ok(())
    }

    /// Make `path` a directory. The caller holds a write lock covering it.
    async fn ensure_node(path: &Filepath) -> FilestoreResult<()> {
        let real = path.resolve();
        match realfs::entity_type(real).await? {
            EntityType::None => realfs::mkdir(real).await,
            EntityType::Leaf => realfs::swap_leaf_to_node(real).await,
            EntityType::Node => Ok(()),
        }
    }

    /// Make every lineage entry a directory, in order.
    ///
    /// Each lineage lock is handed over: it is released once the next entry
    /// down is a directory, so a listing of the parent never sees a swap in
    /// progress.
    async fn ensure_lineage(
        &self,
        steps: impl IntoIterator<Item = (Filepath, HeldLock)>,
    ) -> FilestoreResult<()> {
        let mut parent: Option<HeldLock> = None;
        for (path, lock) in steps {
            Self::ensure_node(&path).await?;
            drop(parent.replace(lock));
        }
        drop(parent);
        Ok(())
    }

    /// Acquire write locks on the ancestors strictly between the root and
    /// `path`, plus `target`, then ensure the lineage. Returns the target's
    /// lock.
    async fn lock_for_write(&self, path: &Filepath, target: Lock) -> FilestoreResult<HeldLock> {
        let lineage: Vec<Filepath> = self.inner.root.lineage(path).collect();
        let lineage_locks = lineage.iter().cloned().map(Lock::node_write).collect();
        let (target, held) = self.inner.locks.acquire_split(target, lineage_locks).await;
        self.ensure_live()?;
        self.ensure_root().await?;
        self.ensure_lineage(lineage.into_iter().zip(held)).await?;
        Ok(target)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// What `path` holds.
    pub async fn get_type(&self, path: &Filepath) -> FilestoreResult<EntityType> {
        self.check(path)?;
        self.locked(vec![Lock::node_read(path.clone())], move || async move {
            realfs::entity_type(path.resolve()).await
        })
        .await
    }

    /// The value at `path`. Missing data reads as empty.
    pub async fn get_data(&self, path: &Filepath) -> FilestoreResult<Vec<u8>> {
        self.check(path)?;
        self.locked(vec![Lock::node_read(path.clone())], move || async move {
            match realfs::value_location(path.resolve()).await? {
                Some(loc) => Ok(realfs::read_opt(&loc).await?.unwrap_or_default()),
                None => Ok(Vec::new()),
            }
        })
        .await
    }

    /// The value at `path` as UTF-8 text. Missing data reads as `""`.
    pub async fn get_string(&self, path: &Filepath) -> FilestoreResult<String> {
        let data = self.get_data(path).await?;
        String::from_utf8(data).map_err(|source| FilestoreError::InvalidUtf8 {
            path: path.to_string(),
            source,
        })
    }

    /// Length of the value at `path`, 0 when absent.
    pub async fn get_data_bytes(&self, path: &Filepath) -> FilestoreResult<u64> {
        self.check(path)?;
        self.locked(vec![Lock::node_read(path.clone())], move || async move {
            match realfs::value_location(path.resolve()).await? {
                Some(loc) => realfs::len_opt(&loc).await,
                None => Ok(0),
            }
        })
        .await
    }

    /// Sorted child names of `path`. Empty unless `path` is a node.
    pub async fn get_kid_names(&self, path: &Filepath) -> FilestoreResult<Vec<String>> {
        self.check(path)?;
        self.locked(vec![Lock::node_read(path.clone())], move || async move {
            realfs::list_kids(path.resolve()).await
        })
        .await
    }

    /// Lazily iterate the children of `path`, mapping each name.
    ///
    /// The read lock is held until the iterator is exhausted, closed, or
    /// dropped. Children appear in directory order.
    pub async fn iterate_node<T, F>(&self, path: &Filepath, map: F) -> FilestoreResult<NodeIter<T>>
    where
        F: FnMut(String) -> T + Send + 'static,
    {
        self.check(path)?;
        let lock = self
            .inner
            .locks
            .acquire_one(Lock::node_read(path.clone()))
            .await;
        self.ensure_live()?;
        let dir = realfs::read_dir_opt(path.resolve()).await?;
        Ok(NodeIter::new(path.clone(), dir, Box::new(map), lock))
    }

    /// Read stream out of `path`.
    ///
    /// A leaf streams its bytes and keeps the read lock until the stream
    /// ends. A node streams the JSON array of its child names. A missing
    /// path streams nothing.
    pub async fn get_data_tail_stream(&self, path: &Filepath) -> FilestoreResult<TailStream> {
        self.check(path)?;
        let lock = self
            .inner
            .locks
            .acquire_one(Lock::node_read(path.clone()))
            .await;
        self.ensure_live()?;

        let real = path.resolve();
        match realfs::entity_type(real).await? {
            EntityType::Leaf => match realfs::open_opt(real).await? {
                Some(file) => Ok(TailStream::file(path.clone(), file, lock)),
                None => Ok(TailStream::empty(path.clone())),
            },
            EntityType::Node => {
                let names = realfs::list_kids(real).await?;
                let json = serde_json::to_vec(&names)
                    .map_err(|e| FilestoreError::io("encode listing", real, e.into()))?;
                Ok(TailStream::listing(path.clone(), json))
            }
            EntityType::None => Ok(TailStream::empty(path.clone())),
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Store `data` at `path`, creating or converting ancestors as needed.
    ///
    /// Empty data deletes the value (see [`clear_data`](Self::clear_data)).
    pub async fn set_data(&self, path: &Filepath, data: impl AsRef<[u8]>) -> FilestoreResult<()> {
        let data = data.as_ref();
        if data.is_empty() {
            return self.clear_data(path).await;
        }
        self.check(path)?;

        let target = self.lock_for_write(path, Lock::node_write(path.clone())).await?;
        let loc = realfs::write_location(path.resolve()).await?;
        realfs::write(&loc, data).await?;
        drop(target);
        Ok(())
    }

    /// Delete the value at `path`, keeping any children. A no-op when there
    /// is no value.
    pub async fn clear_data(&self, path: &Filepath) -> FilestoreResult<()> {
        self.check(path)?;
        self.locked(vec![Lock::node_write(path.clone())], move || async move {
            if let Some(loc) = realfs::value_location(path.resolve()).await? {
                realfs::unlink_opt(&loc).await?;
            }
            Ok(())
        })
        .await
    }

    /// Remove `path` and everything below it.
    pub async fn rem_subtree(&self, path: &Filepath) -> FilestoreResult<()> {
        self.check(path)?;
        self.locked(vec![Lock::subtree_write(path.clone())], move || async move {
            realfs::remove_tree(path.resolve()).await
        })
        .await
    }

    /// Write stream into `path`.
    ///
    /// The write lock stays with the returned stream until it finishes,
    /// breaks, or is dropped.
    pub async fn get_data_head_stream(&self, path: &Filepath) -> FilestoreResult<HeadStream> {
        self.check(path)?;
        let target = self.lock_for_write(path, Lock::node_write(path.clone())).await?;
        let loc = realfs::write_location(path.resolve()).await?;
        let file = realfs::create(&loc).await?;
        Ok(HeadStream::new(path.clone(), file, target))
    }

    // ========================================================================
    // Nesting
    // ========================================================================

    /// Open a nested transaction scoped to `path`.
    ///
    /// The scope is made a node, swapping a leaf if needed. Until the nested
    /// transaction ends (or every handle to it and every stream or iterator
    /// it opened is dropped), operations here that touch its subtree wait.
    pub async fn kid(&self, path: &Filepath) -> FilestoreResult<Transaction> {
        self.check(path)?;
        let scope = self
            .lock_for_write(path, Lock::subtree_write(path.clone()))
            .await?;
        Self::ensure_node(path).await?;
        tracing::debug!(root = %path, "nested transaction begins");
        Ok(Self::with_scope(path.clone(), Some(scope)))
    }

    /// Run `f` in a nested transaction scoped to `path`, ending it when `f`
    /// resolves, whether or not `f` succeeded.
    pub async fn transact<F, Fut, T>(&self, path: &Filepath, f: F) -> FilestoreResult<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = FilestoreResult<T>>,
    {
        let nested = self.kid(path).await?;
        let result = f(nested.clone()).await;
        nested.end().await;
        result
    }

    /// End this transaction.
    ///
    /// Waits for operations already in flight (including open streams and
    /// iterators) to finish, then refuses any further operation and releases
    /// the subtree held in the parent. Files are left untouched.
    pub async fn end(&self) {
        let drain = self
            .inner
            .locks
            .acquire(vec![Lock::subtree_write(self.inner.root.clone())])
            .await;
        let was_ended = self.inner.ended.swap(true, Ordering::AcqRel);
        drop(drain);

        let scope = self.inner.locks.release_anchor();
        if !was_ended {
            tracing::debug!(root = %self.inner.root, "transaction ended");
        }
        drop(scope);
    }
}
