//! # tildefs
//!
//! A hierarchical key/value store over a real directory tree, where any path
//! can hold a value and have children at the same time.
//!
//! Key components:
//!
//! - [`Filepath`] - Normalized, sanitized store path
//! - [`Lock`] / [`LockRegistry`] - Three-level path locks and their scheduler
//! - [`Transaction`] - Jurisdiction-scoped read/write/stream/enumerate API
//! - [`HeadStream`] / [`TailStream`] / [`NodeIter`] - Streams that hold their
//!   lock until they close
//! - [`Filestore`] - Opens a store from a [`StoreConfig`]
//!
//! ## Design Decisions
//!
//! - **Value holder child**: a path that has both a value and children is a
//!   directory whose child `~` holds the value. `~` can never be addressed
//!   from outside.
//! - **In-process locking only**: the lock matrix serializes operations
//!   within one process. Nothing protects against another process touching
//!   the same tree.
//! - **Absence is not an error**: reading something that is not there gives
//!   empty data, zero length, or an empty listing.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use tildefs::{Filestore, StoreConfig};
//!
//! let store = Filestore::open(&StoreConfig::new("/srv/store")).await?;
//! let txn = store.transaction();
//!
//! let user = txn.path(["users", "amy"])?;
//! txn.set_data(&user, "profile").await?;
//! txn.set_data(&user.kid(["avatar"])?, b"...").await?;
//! assert_eq!(txn.get_string(&user).await?, "profile");
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
pub mod filepath;
pub mod lock;
mod realfs;
mod store;
pub mod stream;
mod transaction;
mod types;

pub use config::{ConfigError, StoreConfig};
pub use error::{FilestoreError, FilestoreResult};
pub use filepath::{Filepath, Lineage, RESERVED_COMPONENT};
pub use lock::{Completion, HeldLock, Lock, LockKind, LockRegistry, PendingLocks};
pub use store::Filestore;
pub use stream::{HeadStream, NodeIter, StreamCompletion, TailStream};
pub use transaction::Transaction;
pub use types::EntityType;
